use tracing::{debug, error, info, warn};

use crate::hal::{TX_EMITTING, TX_SCHEDULED};

use super::jitqueue::JitPktType;
use super::{wait_ms, Gateway};

const JIT_POLL_MS: u64 = 10;

/**
@brief JIT dispatcher: peek each RF chain queue against the concentrator
counter and hand due packets to the radio.
*/
pub fn thread_jit(gw: &Gateway) {
    while gw.running() {
        wait_ms(JIT_POLL_MS);

        for i in 0..gw.jit_queue.len() {
            /* transfer data and metadata to the concentrator, and schedule TX */
            let current_concentrator_time = {
                let mut concentrator = gw.concentrator.lock().unwrap();
                match concentrator.lgw_get_instcnt() {
                    Ok(cnt) => cnt,
                    Err(e) => {
                        error!("ERROR: [jit] failed to read concentrator counter ({})", e);
                        continue;
                    }
                }
            };

            /* peek and dequeue under one lock, an enqueue must not shift the index */
            let dequeued = {
                let mut queue = gw.jit_queue[i].lock().unwrap();
                match queue.peek(current_concentrator_time) {
                    Some(idx) => match queue.dequeue(idx) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            error!("ERROR: jit_dequeue failed on rf_chain {} with {:?}", i, e);
                            None
                        }
                    },
                    None => None, /* nothing due on that chain, it can happen */
                }
            };
            let (mut pkt, pkt_type) = match dequeued {
                Some(entry) => entry,
                None => continue,
            };

            /* a target already passed cannot be programmed, drop the entry */
            if (pkt.count_us.wrapping_sub(current_concentrator_time) as i32) < 0 {
                warn!(
                    "WARNING: [jit] packet on rf_chain {} missed its TX window (count_us={})",
                    i, pkt.count_us
                );
                gw.meas_dw.lock().unwrap().nb_tx_fail += 1;
                continue;
            }

            if pkt_type == JitPktType::Beacon {
                /* Compensate beacon frequency with xtal error */
                {
                    let xtal = gw.xtal.lock().unwrap();
                    pkt.freq_hz = (xtal.xtal_correct * pkt.freq_hz as f64) as u32;
                    debug!(
                        "beacon_pkt.freq_hz={} (xtal_correct={:.15})",
                        pkt.freq_hz, xtal.xtal_correct
                    );
                }
                gw.meas_dw.lock().unwrap().nb_beacon_sent += 1;
                info!("INFO: Beacon dequeued (count_us={})", pkt.count_us);
            }

            /* check if concentrator is free for sending new packet */
            let tx_status = {
                let mut concentrator = gw.concentrator.lock().unwrap();
                concentrator.lgw_status(pkt.rf_chain)
            };
            match tx_status {
                Err(_) => warn!("WARNING: [jit{}] lgw_status failed", i),
                Ok(TX_EMITTING) => {
                    error!("ERROR: concentrator is currently emitting on rf_chain {}", i);
                    gw.meas_dw.lock().unwrap().nb_tx_fail += 1;
                    continue;
                }
                Ok(TX_SCHEDULED) => {
                    warn!(
                        "WARNING: a downlink was already scheduled on rf_chain {}, overwriting it...",
                        i
                    );
                }
                Ok(_) => { /* Nothing to do */ }
            }

            /* send packet to concentrator */
            let send_result = {
                let mut concentrator = gw.concentrator.lock().unwrap();
                if gw.cfg.spectral_scan.enable {
                    /* an in-progress scan must yield to a real TX */
                    if let Err(e) = concentrator.lgw_spectral_scan_abort() {
                        warn!("WARNING: [jit{}] lgw_spectral_scan_abort failed ({})", i, e);
                    }
                }
                concentrator.lgw_send(&pkt)
            };
            match send_result {
                Err(e) => {
                    gw.meas_dw.lock().unwrap().nb_tx_fail += 1;
                    warn!("WARNING: [jit] lgw_send failed on rf_chain {} ({})", i, e);
                }
                Ok(()) => {
                    gw.meas_dw.lock().unwrap().nb_tx_ok += 1;
                    debug!("lgw_send done on rf_chain {}: count_us={}", i, pkt.count_us);
                }
            }
        }
    }
    info!("INFO: End of JIT thread");
}
