//! End-to-end downlink scenarios: PULL_RESP handling, JIT scheduling and
//! dispatch to the (simulated) concentrator.

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use serde_json::json;

use lora_pkt_fwd::fwd::beacon::BeaconBuilder;
use lora_pkt_fwd::fwd::downstream::{process_pull_resp, refill_beacon_queue};
use lora_pkt_fwd::fwd::jitqueue::JitError;
use lora_pkt_fwd::fwd::protocol::TxAck;
use lora_pkt_fwd::fwd::{config, jit, Gateway};
use lora_pkt_fwd::hal::gps::{lgw_gps_sync, Gps};
use lora_pkt_fwd::hal::sim::SimConcentrator;
use lora_pkt_fwd::hal::LgwHal;

fn test_config() -> config::Config {
    let root = json!({
        "SX130x_conf": {
            "com_type": "SIM",
            "com_path": "",
            "lorawan_public": true,
            "clksrc": 0,
            "radio_0": {
                "enable": true,
                "type": "SX1250",
                "freq": 867500000,
                "rssi_offset": -215.4,
                "tx_enable": true,
                "tx_freq_min": 863000000,
                "tx_freq_max": 870000000,
                "tx_gain_lut": [
                    {"rf_power": 12, "pwr_idx": 15},
                    {"rf_power": 14, "pwr_idx": 1},
                    {"rf_power": 27, "pwr_idx": 14}
                ]
            },
            "radio_1": {
                "enable": true,
                "type": "SX1250",
                "freq": 868500000,
                "rssi_offset": -215.4,
                "tx_enable": false
            }
        },
        "gateway_conf": {
            "gateway_ID": "AA555A0000000101",
            "beacon_period": 128,
            "beacon_freq_hz": 869525000u32,
            "beacon_freq_nb": 8,
            "beacon_freq_step": 200000,
            "beacon_datarate": 9,
            "beacon_bw_hz": 125000,
            "beacon_power": 14
        }
    });
    config::from_json(&root).unwrap()
}

/* a gateway wired to the software concentrator, plus a handle on it */
fn test_gateway(with_gps: bool) -> (Arc<Gateway>, SimConcentrator) {
    let cfg = test_config();
    let sim = SimConcentrator::new(cfg.lgw.clone());
    let handle = sim.clone();
    let mut boxed: Box<dyn LgwHal> = Box::new(sim);
    boxed.lgw_start().unwrap();

    let sock_up = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock_up.connect("127.0.0.1:9").unwrap();
    let sock_down = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock_down.connect("127.0.0.1:9").unwrap();

    let gps = if with_gps { Some(Gps::new_unbound()) } else { None };
    (Arc::new(Gateway::new(cfg, boxed, gps, sock_up, sock_down)), handle)
}

fn now_us(gw: &Gateway) -> u32 {
    gw.concentrator.lock().unwrap().lgw_get_instcnt().unwrap()
}

fn pull_resp_body(tmst: u32) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "txpk": {
            "imme": false,
            "tmst": tmst,
            "freq": 868.5,
            "rfch": 0,
            "powe": 14,
            "modu": "LORA",
            "datr": "SF9BW125",
            "codr": "4/5",
            "ipol": true,
            "size": 1,
            "data": "AA=="
        }
    }))
    .unwrap()
}

#[test]
fn class_a_downlink_is_acked_and_dispatched() {
    let (gw, sim) = test_gateway(false);
    let target = now_us(&gw).wrapping_add(1_000_000);

    let ack = process_pull_resp(&gw, &pull_resp_body(target));
    assert_eq!(ack, TxAck::Ok);
    assert_eq!(ack.body(), "");
    assert_eq!(gw.jit_queue[0].lock().unwrap().len(), 1);

    /* let the dispatcher hand it to the radio at target - dispatch lead */
    let gw_jit = gw.clone();
    let dispatcher = std::thread::spawn(move || jit::thread_jit(&gw_jit));
    let deadline = Instant::now() + Duration::from_secs(3);
    while sim.tx_log().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    gw.exit_sig.store(true, Ordering::Relaxed);
    dispatcher.join().unwrap();

    let log = sim.tx_log();
    assert_eq!(log.len(), 1, "downlink was not dispatched");
    assert_eq!(log[0].count_us, target);
    assert_eq!(log[0].freq_hz, 868_500_000);
    assert_eq!(log[0].rf_power, 14);
    assert!(log[0].invert_pol);
    assert_eq!(gw.meas_dw.lock().unwrap().nb_tx_ok, 1);
}

#[test]
fn too_late_downlink_is_rejected() {
    let (gw, sim) = test_gateway(false);
    let target = now_us(&gw).wrapping_add(500);

    let ack = process_pull_resp(&gw, &pull_resp_body(target));
    assert_eq!(ack, TxAck::Error(JitError::TooLate));
    assert_eq!(ack.body(), "{\"txpk_ack\":{\"error\":\"TOO_LATE\"}}");
    assert!(gw.jit_queue[0].lock().unwrap().is_empty());
    assert!(sim.tx_log().is_empty());
    assert_eq!(gw.meas_dw.lock().unwrap().nb_tx_rejected_too_late, 1);
}

#[test]
fn colliding_downlinks_second_rejected_first_kept() {
    let (gw, _sim) = test_gateway(false);
    let base = now_us(&gw).wrapping_add(2_000_000);

    assert_eq!(process_pull_resp(&gw, &pull_resp_body(base)), TxAck::Ok);
    /* second window overlaps the first (SF9 1-byte frame is ~103 ms on air) */
    let ack = process_pull_resp(&gw, &pull_resp_body(base.wrapping_add(50_000)));
    assert_eq!(ack, TxAck::Error(JitError::CollisionPacket));

    let queue = gw.jit_queue[0].lock().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(gw.meas_dw.lock().unwrap().nb_tx_rejected_collision_packet, 1);
}

#[test]
fn class_b_without_gps_lock_is_rejected() {
    let (gw, _sim) = test_gateway(true);
    let body = serde_json::to_vec(&json!({
        "txpk": {
            "tmms": 1_300_000_000_000u64,
            "freq": 868.5,
            "rfch": 0,
            "powe": 14,
            "modu": "LORA",
            "datr": "SF9BW125",
            "codr": "4/5",
            "size": 1,
            "data": "AA=="
        }
    }))
    .unwrap();

    let ack = process_pull_resp(&gw, &body);
    assert_eq!(ack, TxAck::Error(JitError::GpsUnlocked));
    assert_eq!(ack.body(), "{\"txpk_ack\":{\"error\":\"GPS_UNLOCKED\"}}");
}

#[test]
fn unsupported_power_warns_with_substitute() {
    let (gw, _sim) = test_gateway(false);
    let target = now_us(&gw).wrapping_add(1_000_000);
    let body = serde_json::to_vec(&json!({
        "txpk": {
            "tmst": target,
            "freq": 868.5,
            "rfch": 0,
            "powe": 13, /* LUT has 12, 14, 27 */
            "modu": "LORA",
            "datr": "SF9BW125",
            "codr": "4/5",
            "size": 1,
            "data": "AA=="
        }
    }))
    .unwrap();

    let ack = process_pull_resp(&gw, &body);
    assert_eq!(ack, TxAck::Warn(JitError::TxPower, 12));
    assert_eq!(ack.body(), "{\"txpk_ack\":{\"warn\":\"TX_POWER\",\"value\":12}}");
    /* the packet is queued at the substituted power */
    assert_eq!(gw.jit_queue[0].lock().unwrap().len(), 1);
}

#[test]
fn extreme_power_request_is_rejected_not_fatal() {
    /* powe is a server-supplied int8: -128 minus a positive antenna gain
       must surface as a power rejection, not an arithmetic panic */
    let mut cfg = test_config();
    cfg.gw.antenna_gain = 3;
    let sim = SimConcentrator::new(cfg.lgw.clone());
    let mut boxed: Box<dyn LgwHal> = Box::new(sim);
    boxed.lgw_start().unwrap();
    let sock_up = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock_up.connect("127.0.0.1:9").unwrap();
    let sock_down = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock_down.connect("127.0.0.1:9").unwrap();
    let gw = Arc::new(Gateway::new(cfg, boxed, None, sock_up, sock_down));

    let target = now_us(&gw).wrapping_add(1_000_000);
    let body = serde_json::to_vec(&json!({
        "txpk": {
            "tmst": target,
            "freq": 868.5,
            "rfch": 0,
            "powe": -128,
            "modu": "LORA",
            "datr": "SF9BW125",
            "codr": "4/5",
            "size": 1,
            "data": "AA=="
        }
    }))
    .unwrap();

    let ack = process_pull_resp(&gw, &body);
    /* no LUT entry is at or below the clamped request */
    assert_eq!(ack, TxAck::Error(JitError::TxPower));
    assert!(gw.jit_queue[0].lock().unwrap().is_empty());
}

#[test]
fn out_of_band_frequency_is_rejected() {
    let (gw, _sim) = test_gateway(false);
    let target = now_us(&gw).wrapping_add(1_000_000);
    let body = serde_json::to_vec(&json!({
        "txpk": {
            "tmst": target,
            "freq": 872.0, /* above tx_freq_max */
            "rfch": 0,
            "powe": 14,
            "modu": "LORA",
            "datr": "SF9BW125",
            "codr": "4/5",
            "size": 1,
            "data": "AA=="
        }
    }))
    .unwrap();

    let ack = process_pull_resp(&gw, &body);
    assert_eq!(ack, TxAck::Error(JitError::TxFreq));
    assert!(gw.jit_queue[0].lock().unwrap().is_empty());
}

#[test]
fn beacon_queue_fills_with_rotating_channels() {
    let (gw, _sim) = test_gateway(true);

    /* seed a valid time reference: GPS time 1000 s at the current counter */
    let count_us = now_us(&gw);
    {
        let mut state = gw.timeref.lock().unwrap();
        let utc = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        lgw_gps_sync(&mut state.tref, count_us, utc, Duration::from_secs(1000)).unwrap();
        state.gps_ref_valid = true;
    }
    gw.xtal.lock().unwrap().xtal_correct_ok = true;

    let mut builder =
        BeaconBuilder::new(&gw.cfg.gw.beacon, &gw.cfg.gw.ref_coord).unwrap();
    let mut last_beacon_gps_sec = 0u64;
    refill_beacon_queue(&gw, &mut builder, &mut last_beacon_gps_sec);

    let queue = gw.jit_queue[0].lock().unwrap();
    assert_eq!(queue.num_beacon(), 8);
    /* beacons start at the next multiple of the period after GPS 1000 s */
    assert_eq!(last_beacon_gps_sec, 1024 + 7 * 128);
    assert_eq!(gw.meas_dw.lock().unwrap().nb_beacon_queued, 8);

    /* frequency rotation: GPS 1024 s -> channel 0, 1152 s -> channel 1 */
    let mut check = BeaconBuilder::new(&gw.cfg.gw.beacon, &gw.cfg.gw.ref_coord).unwrap();
    assert_eq!(check.build(1024, 0).freq_hz, 869_525_000);
    assert_eq!(check.build(1152, 0).freq_hz, 869_725_000);
}

#[test]
fn downlink_colliding_with_beacon_slot_is_rejected() {
    let (gw, _sim) = test_gateway(true);

    let count_us = now_us(&gw);
    {
        let mut state = gw.timeref.lock().unwrap();
        let utc = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        lgw_gps_sync(&mut state.tref, count_us, utc, Duration::from_secs(1000)).unwrap();
        state.gps_ref_valid = true;
    }
    gw.xtal.lock().unwrap().xtal_correct_ok = true;

    let mut builder =
        BeaconBuilder::new(&gw.cfg.gw.beacon, &gw.cfg.gw.ref_coord).unwrap();
    let mut last = 0u64;
    refill_beacon_queue(&gw, &mut builder, &mut last);

    /* first beacon sits 24 s ahead (GPS 1024 s); aim a downlink at its guard */
    let beacon_target = count_us.wrapping_add(24_000_000);
    let ack = process_pull_resp(&gw, &pull_resp_body(beacon_target.wrapping_sub(1_000_000)));
    assert_eq!(ack, TxAck::Error(JitError::CollisionBeacon));
    assert_eq!(gw.meas_dw.lock().unwrap().nb_tx_rejected_collision_beacon, 1);
}
