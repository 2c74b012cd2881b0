use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::hal::gps::lgw_gps2cnt;
use crate::hal::{LgwPktTx, LgwTxGainLut, Modulation, TxMode};

use super::beacon::BeaconBuilder;
use super::jitqueue::{JitError, JitPktType, JIT_NUM_BEACON_IN_QUEUE};
use super::protocol::{
    datagram_header, decode_payload, is_ack, parse_codr, parse_lora_datr, parse_pull_resp,
    tmms_to_gps_time, tx_ack_datagram, TxAck, PKT_PULL_ACK, PKT_PULL_DATA, PKT_PULL_RESP,
    PROTOCOL_VERSION,
};
use super::{Gateway, MIN_FSK_PREAMB, MIN_LORA_PREAMB, STD_FSK_PREAMB, STD_LORA_PREAMB};

pub const PULL_TIMEOUT_MS: u64 = 200; /* non critical for throughput */

/**
@brief Index of the highest gain-LUT entry whose power does not exceed the
request.
*/
pub fn get_tx_gain_lut_index(lut: &LgwTxGainLut, rf_power: i8) -> Option<usize> {
    let mut best: Option<(usize, i16)> = None;
    for (idx, entry) in lut.lut[..lut.size].iter().enumerate() {
        let diff = rf_power as i16 - entry.rf_power as i16;
        if diff < 0 {
            /* The selected power must be lower or equal to requested one */
            continue;
        }
        match best {
            Some((_, best_diff)) if best_diff <= diff => {}
            _ => best = Some((idx, diff)),
        }
    }
    best.map(|(idx, _)| idx)
}

/**
@brief Validate one PULL_RESP body, enqueue the TX request, and produce the
TX_ACK content. The queue is only touched when every check passes.
*/
pub fn process_pull_resp(gw: &Gateway, json_body: &[u8]) -> TxAck {
    let resp = match parse_pull_resp(json_body) {
        Some(r) => r,
        None => return TxAck::Error(JitError::Invalid),
    };
    let txpk = resp.txpk;

    let mut pkt = LgwPktTx::default();
    let downlink_type;

    /* Parse "immediate" tag, or target timestamp, or GPS time (mandatory) */
    if txpk.imme {
        /* TX procedure: send immediately */
        pkt.tx_mode = TxMode::IMMEDIATE;
        downlink_type = JitPktType::DownlinkClassC;
        info!("INFO: [down] a packet will be sent in \"immediate\" mode");
    } else if let Some(tmst) = txpk.tmst {
        /* TX procedure: send on timestamp value */
        pkt.tx_mode = TxMode::TIMESTAMPED;
        pkt.count_us = tmst;
        /* Concentrator timestamp is given, we consider it is a Class A downlink */
        downlink_type = JitPktType::DownlinkClassA;
    } else if let Some(tmms) = txpk.tmms {
        /* TX procedure: send on GPS time (converted to timestamp value) */
        let tref = match gw.timeref_snapshot() {
            Some(tref) => tref,
            None => {
                warn!("WARNING: [down] no valid GPS time reference yet, impossible to send packet on specific GPS time, TX aborted");
                return TxAck::Error(JitError::GpsUnlocked);
            }
        };
        match lgw_gps2cnt(&tref, tmms_to_gps_time(tmms)) {
            Ok(count_us) => {
                pkt.tx_mode = TxMode::TIMESTAMPED;
                pkt.count_us = count_us;
                info!(
                    "INFO: [down] a packet will be sent on timestamp value {} (calculated from GPS time)",
                    count_us
                );
            }
            Err(_) => {
                warn!("WARNING: [down] could not convert GPS time to timestamp, TX aborted");
                return TxAck::Error(JitError::GpsUnlocked);
            }
        }
        /* GPS timestamp is given, we consider it is a Class B downlink */
        downlink_type = JitPktType::DownlinkClassB;
    } else {
        warn!("WARNING: [down] no mandatory \"txpk.tmst\" or \"txpk.tmms\" objects in JSON, TX aborted");
        return TxAck::Error(JitError::Invalid);
    };

    pkt.no_crc = txpk.ncrc;
    pkt.no_header = txpk.nhdr;

    /* target frequency and RF chain */
    pkt.freq_hz = (1.0e6 * txpk.freq) as u32;
    pkt.rf_chain = txpk.rfch;
    if pkt.rf_chain as usize >= gw.jit_queue.len() || !gw.cfg.tx.tx_enable[pkt.rf_chain as usize] {
        warn!("WARNING: [down] TX is not enabled on RF chain {}, TX aborted", pkt.rf_chain);
        return TxAck::Error(JitError::TxFreq);
    }

    /* TX power, gateway antenna gain subtracted. The value is server
       controlled, widen and clamp so an extreme request cannot overflow i8
       and lands on the gain LUT check instead */
    if let Some(powe) = txpk.powe {
        let rf_power = powe as i16 - gw.cfg.gw.antenna_gain as i16;
        pkt.rf_power = rf_power.clamp(i8::MIN as i16, i8::MAX as i16) as i8;
    }

    /* modulation and its parameters */
    match txpk.modu.as_str() {
        "LORA" => {
            pkt.modulation = Modulation::LORA;

            let datr = match txpk.datr.as_str() {
                Some(s) => s,
                None => {
                    warn!("WARNING: [down] format error in \"txpk.datr\", TX aborted");
                    return TxAck::Error(JitError::Invalid);
                }
            };
            match parse_lora_datr(datr) {
                Some((sf, bw)) => {
                    pkt.datarate = sf;
                    pkt.bandwidth = bw;
                }
                None => {
                    warn!("WARNING: [down] format error in \"txpk.datr\", TX aborted");
                    return TxAck::Error(JitError::Invalid);
                }
            }
            let codr = match txpk.codr.as_deref() {
                Some(s) => s,
                None => {
                    warn!("WARNING: [down] no mandatory \"txpk.codr\" object in json, TX aborted");
                    return TxAck::Error(JitError::Invalid);
                }
            };
            match parse_codr(codr) {
                Some(cr) => pkt.coderate = cr,
                None => {
                    warn!("WARNING: [down] format error in \"txpk.codr\", TX aborted");
                    return TxAck::Error(JitError::Invalid);
                }
            }
            pkt.invert_pol = txpk.ipol;
            /* optional preamble length, optimum min value enforced */
            pkt.preamble = match txpk.prea {
                Some(prea) => prea.max(MIN_LORA_PREAMB),
                None => STD_LORA_PREAMB,
            };
        }
        "FSK" => {
            pkt.modulation = Modulation::FSK;
            pkt.datarate = match txpk.datr.as_u64() {
                Some(bps) => bps as u32,
                None => {
                    warn!("WARNING: [down] format error in \"txpk.datr\", TX aborted");
                    return TxAck::Error(JitError::Invalid);
                }
            };
            match txpk.fdev {
                /* JSON value in Hz, pkt.f_dev in kHz */
                Some(fdev) => pkt.f_dev = (fdev / 1000.0) as u8,
                None => {
                    warn!("WARNING: [down] no mandatory \"txpk.fdev\" object in JSON, TX aborted");
                    return TxAck::Error(JitError::Invalid);
                }
            }
            pkt.preamble = match txpk.prea {
                Some(prea) => prea.max(MIN_FSK_PREAMB),
                None => STD_FSK_PREAMB,
            };
        }
        _ => {
            warn!("WARNING: [down] invalid modulation in \"txpk.modu\", TX aborted");
            return TxAck::Error(JitError::Invalid);
        }
    }

    /* payload */
    pkt.size = txpk.size;
    match decode_payload(&txpk.data, txpk.size) {
        Some(payload) => pkt.payload = payload,
        None => {
            warn!("WARNING: [down] no usable \"txpk.data\" payload, TX aborted");
            return TxAck::Error(JitError::Invalid);
        }
    }

    /* record measurement data, count only datagrams with no JSON errors */
    {
        let mut meas_dw = gw.meas_dw.lock().unwrap();
        meas_dw.dw_dgram_rcv += 1;
        meas_dw.dw_network_byte += json_body.len() as u32;
        meas_dw.dw_payload_byte += pkt.size as u32;
    }

    /* check TX frequency before trying to queue packet */
    let chain = pkt.rf_chain as usize;
    if pkt.freq_hz < gw.cfg.tx.tx_freq_min[chain] || pkt.freq_hz > gw.cfg.tx.tx_freq_max[chain] {
        warn!(
            "ERROR: Packet REJECTED, unsupported frequency - {} (min:{},max:{})",
            pkt.freq_hz, gw.cfg.tx.tx_freq_min[chain], gw.cfg.tx.tx_freq_max[chain]
        );
        return TxAck::Error(JitError::TxFreq);
    }

    /* check TX power before trying to queue packet, send a warning if not supported */
    let mut warning: Option<(JitError, i32)> = None;
    let lut = &gw.cfg.tx.txlut[chain];
    match get_tx_gain_lut_index(lut, pkt.rf_power) {
        Some(idx) if lut.lut[idx].rf_power == pkt.rf_power => {}
        Some(idx) => {
            /* this RF power is not supported, use the closest lower power supported */
            let used = lut.lut[idx].rf_power;
            warn!(
                "WARNING: Requested TX power is not supported ({}dBm), actual power used: {}dBm",
                pkt.rf_power, used
            );
            warning = Some((JitError::TxPower, used as i32));
            pkt.rf_power = used;
        }
        None => {
            warn!("ERROR: Packet REJECTED, no suitable TX power in gain LUT");
            return TxAck::Error(JitError::TxPower);
        }
    }

    /* insert packet to be sent into JIT queue */
    let current_concentrator_time = {
        let mut concentrator = gw.concentrator.lock().unwrap();
        match concentrator.lgw_get_instcnt() {
            Ok(cnt) => cnt,
            Err(_) => return TxAck::Error(JitError::Invalid),
        }
    };
    let jit_result = gw.jit_queue[chain].lock().unwrap().enqueue(
        current_concentrator_time,
        &pkt,
        downlink_type,
    );
    {
        let mut meas_dw = gw.meas_dw.lock().unwrap();
        meas_dw.nb_tx_requested += 1;
        match jit_result {
            Err(JitError::Full) | Err(JitError::CollisionPacket) => {
                meas_dw.nb_tx_rejected_collision_packet += 1
            }
            Err(JitError::CollisionBeacon) => meas_dw.nb_tx_rejected_collision_beacon += 1,
            Err(JitError::TooLate) => meas_dw.nb_tx_rejected_too_late += 1,
            Err(JitError::TooEarly) => meas_dw.nb_tx_rejected_too_early += 1,
            _ => {}
        }
    }
    match jit_result {
        Ok(()) => match warning {
            /* In case of a warning having been raised before, we notify it */
            Some((err, value)) => TxAck::Warn(err, value),
            None => TxAck::Ok,
        },
        Err(err) => {
            warn!("ERROR: Packet REJECTED (jit error={:?})", err);
            TxAck::Error(err)
        }
    }
}

/**
@brief Keep up to JIT_NUM_BEACON_IN_QUEUE future beacons reserved in the
queue of RF chain 0. Needs a valid GPS reference and a stable XTAL
correction; a refused slot is retried one period later.
last_beacon_gps_sec tracks the GPS time of the last beacon queued.
*/
pub fn refill_beacon_queue(
    gw: &Gateway,
    builder: &mut BeaconBuilder,
    last_beacon_gps_sec: &mut u64,
) {
    let beacon_period = gw.cfg.gw.beacon.period as u64;
    if beacon_period == 0 {
        return;
    }

    let mut beacon_loop = JIT_NUM_BEACON_IN_QUEUE - gw.jit_queue[0].lock().unwrap().num_beacon();
    let mut retry: u64 = 0;

    while beacon_loop > 0 && gw.running() {
        /* Wait for GPS to be ready before inserting beacons in JiT queue */
        let tref = match gw.timeref_snapshot() {
            Some(tref) if gw.xtal.lock().unwrap().xtal_correct_ok => tref,
            _ => return,
        };

        /* compute GPS time for next beacon to come      */
        /*   LoRaWAN: T = k*beacon_period + TBeaconDelay */
        let next_beacon_gps_sec = if *last_beacon_gps_sec == 0 {
            /* if no beacon has been queued, get next slot from current GPS time */
            let now_gps_sec = tref.gps.as_secs();
            now_gps_sec + (beacon_period - now_gps_sec % beacon_period) + retry * beacon_period
        } else {
            /* if there is already a beacon, take it as reference */
            *last_beacon_gps_sec + (1 + retry) * beacon_period
        };

        /* convert GPS time to concentrator time, and set packet counter for JiT trigger */
        let count_us =
            match lgw_gps2cnt(&tref, Duration::from_secs(next_beacon_gps_sec)) {
                Ok(cnt) => cnt,
                Err(_) => return,
            };
        let beacon_pkt = builder.build(next_beacon_gps_sec, count_us);

        /* Insert beacon packet in JiT queue */
        let current_concentrator_time = {
            let mut concentrator = gw.concentrator.lock().unwrap();
            match concentrator.lgw_get_instcnt() {
                Ok(cnt) => cnt,
                Err(_) => return,
            }
        };
        let jit_result = gw.jit_queue[0].lock().unwrap().enqueue(
            current_concentrator_time,
            &beacon_pkt,
            JitPktType::Beacon,
        );
        match jit_result {
            Ok(()) => {
                gw.meas_dw.lock().unwrap().nb_beacon_queued += 1;
                beacon_loop -= 1;
                retry = 0;
                /* keep this beacon time as reference for next one to be programmed */
                *last_beacon_gps_sec = next_beacon_gps_sec;
                info!(
                    "INFO: Beacon queued (count_us={}, freq_hz={}, size={})",
                    beacon_pkt.count_us, beacon_pkt.freq_hz, beacon_pkt.size
                );
            }
            Err(err) => {
                debug!("--> beacon queuing failed with {:?}", err);
                if err != JitError::CollisionBeacon {
                    gw.meas_dw.lock().unwrap().nb_beacon_rejected += 1;
                }
                /* In case previous enqueue failed, we retry one period later until it succeeds */
                /* Note: In case the GPS has been unlocked for a while, there can be lots of retries */
                /*       to be done from last beacon time to a new valid one */
                retry += 1;
                if retry > JIT_NUM_BEACON_IN_QUEUE as u64 * 4 {
                    return;
                }
            }
        }
    }
}

/**
@brief Downstream pipeline: PULL_DATA heartbeats, beacon scheduling, and
PULL_RESP to TX_ACK handling.
*/
pub fn thread_down(gw: &Gateway) {
    if let Err(e) = gw
        .sock_down
        .set_read_timeout(Some(Duration::from_millis(PULL_TIMEOUT_MS)))
    {
        tracing::error!("ERROR: [down] failed to set socket timeout ({})", e);
        gw.quit_sig.store(true, Ordering::Relaxed);
        return;
    }

    /* pre-assemble the fixed part of the beacon packet */
    let mut beacon_builder = match BeaconBuilder::new(&gw.cfg.gw.beacon, &gw.cfg.gw.ref_coord) {
        Ok(b) => Some(b),
        Err(e) => {
            if gw.cfg.gw.beacon.period > 0 {
                tracing::error!("ERROR: invalid beacon parameters ({}), beaconing disabled", e);
            }
            None
        }
    };
    let mut last_beacon_gps_sec: u64 = 0;

    /* auto-quit variable: count the number of PULL_DATA sent since the latest PULL_ACK */
    let mut autoquit_cnt: u32 = 0;

    let mut buff_down = [0u8; 1000];

    while gw.running() {
        /* auto-quit if the threshold is crossed */
        if gw.cfg.gw.autoquit_threshold > 0 && autoquit_cnt >= gw.cfg.gw.autoquit_threshold {
            gw.exit_sig.store(true, Ordering::Relaxed);
            info!(
                "INFO: [down] the last {} PULL_DATA were not ACKed, exiting application",
                gw.cfg.gw.autoquit_threshold
            );
            break;
        }

        /* generate random token for request */
        let mut rng = rand::thread_rng();
        let token_h: u8 = rng.gen();
        let token_l: u8 = rng.gen();
        let buff_req = datagram_header(PKT_PULL_DATA, token_h, token_l, gw.cfg.gw.gateway_id);

        /* send PULL request and record time */
        if let Err(e) = gw.sock_down.send(&buff_req) {
            warn!("WARNING: [down] failed to send PULL_DATA ({})", e);
        } else {
            gw.meas_dw.lock().unwrap().dw_pull_sent += 1;
        }
        let send_time = Instant::now();
        let mut req_ack = false;
        autoquit_cnt += 1;

        /* listen to packets and process them until a new PULL request must be sent */
        while send_time.elapsed().as_secs() < gw.cfg.gw.keepalive_time.max(1) as u64
            && gw.running()
        {
            /* try to receive a datagram */
            let recv_result = gw.sock_down.recv(&mut buff_down);

            /* Pre-allocate beacon slots in JiT queue, to check downlink collisions */
            if let Some(ref mut builder) = beacon_builder {
                refill_beacon_queue(gw, builder, &mut last_beacon_gps_sec);
            }

            let msg_len = match recv_result {
                Ok(n) => n,
                Err(_) => continue, /* timeout, go back to listening */
            };

            /* if the datagram does not respect protocol, just ignore it */
            if msg_len < 4
                || buff_down[0] != PROTOCOL_VERSION
                || (buff_down[3] != PKT_PULL_RESP && buff_down[3] != PKT_PULL_ACK)
            {
                warn!(
                    "WARNING: [down] ignoring invalid packet len={}, protocol_version={}, id={}",
                    msg_len, buff_down[0], buff_down[3]
                );
                continue;
            }

            /* if the datagram is an ACK, check token */
            if buff_down[3] == PKT_PULL_ACK {
                if is_ack(&buff_down[..msg_len], PKT_PULL_ACK, token_h, token_l) {
                    if req_ack {
                        info!("INFO: [down] duplicate ACK received :)");
                    } else {
                        /* if that packet was not already acknowledged */
                        req_ack = true;
                        autoquit_cnt = 0;
                        gw.meas_dw.lock().unwrap().dw_ack_rcv += 1;
                        info!(
                            "INFO: [down] PULL_ACK received in {} ms",
                            send_time.elapsed().as_millis()
                        );
                    }
                } else {
                    /* out-of-sync token */
                    info!("INFO: [down] received out-of-sync ACK");
                }
                continue;
            }

            /* the datagram is a PULL_RESP */
            debug!(
                "INFO: [down] PULL_RESP received  - token[{}:{}] :)",
                buff_down[1], buff_down[2]
            );
            let ack = process_pull_resp(gw, &buff_down[4..msg_len]);
            /* a request too malformed to ack keeps the server out of the loop */
            if ack == TxAck::Error(JitError::Invalid) {
                continue;
            }
            /* send acknowledge datagram to server */
            let ack_dgram =
                tx_ack_datagram(buff_down[1], buff_down[2], gw.cfg.gw.gateway_id, &ack);
            if let Err(e) = gw.sock_down.send(&ack_dgram) {
                warn!("WARNING: [down] failed to send TX_ACK ({})", e);
            }
        }
    }
    info!("INFO: End of downstream thread");
}
