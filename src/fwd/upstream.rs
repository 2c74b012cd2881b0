use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::hal::{STAT_CRC_BAD, STAT_CRC_OK, STAT_NO_CRC};

use super::protocol::{append_rxpk, datagram_header, is_ack, PKT_PUSH_ACK, PKT_PUSH_DATA};
use super::{wait_ms, Gateway, FETCH_SLEEP_MS, NB_PKT_MAX};

/**
@brief Upstream pipeline: fetch radio packets, serialize them as PUSH_DATA
datagrams and wait for the server acknowledge.
*/
pub fn thread_up(gw: &Gateway) {
    /* wait for acknowledge (in 2 times, to catch extra packets) */
    let push_timeout_half = Duration::from_millis(gw.cfg.gw.push_timeout_ms / 2).max(Duration::from_millis(1));
    if let Err(e) = gw.sock_up.set_read_timeout(Some(push_timeout_half)) {
        error!("ERROR: [up] failed to set socket timeout ({})", e);
        gw.quit_sig.store(true, Ordering::Relaxed);
        return;
    }

    let mut ack_buf = [0u8; 32];

    while gw.running() {
        /* fetch packets */
        let fetch = {
            let mut concentrator = gw.concentrator.lock().unwrap();
            concentrator.lgw_receive(NB_PKT_MAX)
        };
        let rxpkt = match fetch {
            Ok(pkts) => pkts,
            Err(e) => {
                error!("ERROR: [up] failed packet fetch, exiting ({})", e);
                gw.exit_sig.store(true, Ordering::Relaxed);
                gw.quit_sig.store(true, Ordering::Relaxed);
                return;
            }
        };

        /* check if there are status report to send */
        let send_report = gw.report.lock().unwrap().ready;

        /* wait a short time if no packets, nor status report */
        if rxpkt.is_empty() && !send_report {
            wait_ms(FETCH_SLEEP_MS);
            continue;
        }

        /* get a copy of GPS time reference (avoid 1 mutex per packet) */
        let local_ref = if !rxpkt.is_empty() { gw.timeref_snapshot() } else { None };

        /* serialize Lora packets metadata and payload */
        let mut pkt_jsons: Vec<String> = Vec::with_capacity(rxpkt.len());
        for p in &rxpkt {
            /* Get mote information from current packet (addr, fcnt) */
            /* FHDR - DevAddr / FCnt */
            let (mote_addr, mote_fcnt) = if p.size >= 8 {
                (
                    u32::from_le_bytes([p.payload[1], p.payload[2], p.payload[3], p.payload[4]]),
                    u16::from_le_bytes([p.payload[6], p.payload[7]]),
                )
            } else {
                (0, 0)
            };

            /* basic packet filtering */
            {
                let mut meas_up = gw.meas_up.lock().unwrap();
                meas_up.nb_rx_rcv += 1;
                match p.status {
                    STAT_CRC_OK => {
                        meas_up.nb_rx_ok += 1;
                        if !gw.cfg.gw.fwd_valid_pkt {
                            continue;
                        }
                    }
                    STAT_CRC_BAD => {
                        meas_up.nb_rx_bad += 1;
                        if !gw.cfg.gw.fwd_error_pkt {
                            continue;
                        }
                    }
                    STAT_NO_CRC => {
                        meas_up.nb_rx_nocrc += 1;
                        if !gw.cfg.gw.fwd_nocrc_pkt {
                            continue;
                        }
                    }
                    status => {
                        warn!(
                            "WARNING: [up] received packet with unknown status {} (size {}, modulation {})",
                            status, p.size, p.modulation
                        );
                        continue;
                    }
                }
                meas_up.up_pkt_fwd += 1;
                meas_up.up_payload_byte += p.size as u32;
            }
            debug!("INFO: Received pkt from mote: {:08X} (fcnt={})", mote_addr, mote_fcnt);

            let mut json = String::with_capacity(400);
            if append_rxpk(&mut json, p, local_ref.as_ref()).is_err() {
                error!("ERROR: [up] failed to serialize rxpk");
                continue;
            }
            pkt_jsons.push(json);
        }

        /* restart fetch sequence without sending empty JSON if all packets have been filtered out */
        if pkt_jsons.is_empty() && !send_report {
            continue;
        }

        /* start composing datagram with the header */
        let mut rng = rand::thread_rng();
        let token_h: u8 = rng.gen();
        let token_l: u8 = rng.gen();
        let mut buff_up =
            datagram_header(PKT_PUSH_DATA, token_h, token_l, gw.cfg.gw.gateway_id).to_vec();

        let mut body = String::with_capacity(512);
        body.push('{');
        if !pkt_jsons.is_empty() {
            body.push_str("\"rxpk\":[");
            body.push_str(&pkt_jsons.join(","));
            body.push(']');
        }
        /* add status report if a new one is available */
        if send_report {
            let mut report = gw.report.lock().unwrap();
            report.ready = false;
            if !pkt_jsons.is_empty() {
                body.push(',');
            }
            body.push_str(&report.json);
        }
        body.push('}');
        buff_up.extend_from_slice(body.as_bytes());

        debug!("JSON up: {}", body);

        /* send datagram to server */
        if let Err(e) = gw.sock_up.send(&buff_up) {
            warn!("WARNING: [up] failed to send PUSH_DATA ({})", e);
            continue;
        }
        let send_time = Instant::now();
        {
            let mut meas_up = gw.meas_up.lock().unwrap();
            meas_up.up_dgram_sent += 1;
            meas_up.up_network_byte += buff_up.len() as u32;
        }

        /* wait for acknowledge (in 2 times, to catch extra packets) */
        for _ in 0..2 {
            match gw.sock_up.recv(&mut ack_buf) {
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue; /* timeout */
                }
                Err(_) => break, /* server connection error */
                Ok(n) => {
                    if !is_ack(&ack_buf[..n], PKT_PUSH_ACK, token_h, token_l) {
                        continue; /* invalid or out-of-sync ACK */
                    }
                    info!(
                        "INFO: [up] PUSH_ACK received in {} ms",
                        send_time.elapsed().as_millis()
                    );
                    gw.meas_up.lock().unwrap().up_ack_rcv += 1;
                    break;
                }
            }
        }
    }
    info!("INFO: End of upstream thread");
}
