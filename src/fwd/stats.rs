use chrono::Utc;
use tracing::info;

use super::Gateway;

/* measurements for upstream traffic, reset each reporting interval */
#[derive(Debug, Default, Clone, Copy)]
pub struct MeasUp {
    pub nb_rx_rcv: u32,         /* count packets received */
    pub nb_rx_ok: u32,          /* count packets received with PAYLOAD CRC OK */
    pub nb_rx_bad: u32,         /* count packets received with PAYLOAD CRC ERROR */
    pub nb_rx_nocrc: u32,       /* count packets received with NO PAYLOAD CRC */
    pub up_pkt_fwd: u32,        /* number of radio packet forwarded to the server */
    pub up_network_byte: u32,   /* sum of UDP bytes sent for upstream traffic */
    pub up_payload_byte: u32,   /* sum of radio payload bytes sent for upstream traffic */
    pub up_dgram_sent: u32,     /* number of datagrams sent for upstream traffic */
    pub up_ack_rcv: u32,        /* number of datagrams acknowledged for upstream traffic */
}

impl MeasUp {
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/* measurements for downstream traffic, reset each reporting interval */
#[derive(Debug, Default, Clone, Copy)]
pub struct MeasDown {
    pub dw_pull_sent: u32,      /* number of PULL requests sent for downstream traffic */
    pub dw_ack_rcv: u32,        /* number of PULL requests acknowledged */
    pub dw_dgram_rcv: u32,      /* count PULL response packets received */
    pub dw_network_byte: u32,
    pub dw_payload_byte: u32,
    pub nb_tx_ok: u32,          /* count packets emitted successfully */
    pub nb_tx_fail: u32,        /* count packets were TX failed for other reasons */
    pub nb_tx_requested: u32,   /* count TX request from server (downlinks) */
    pub nb_tx_rejected_collision_packet: u32,
    pub nb_tx_rejected_collision_beacon: u32,
    pub nb_tx_rejected_too_late: u32,
    pub nb_tx_rejected_too_early: u32,
    pub nb_beacon_queued: u32,
    pub nb_beacon_sent: u32,
    pub nb_beacon_rejected: u32,
}

impl MeasDown {
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/**
@brief Collect and reset the measurement buckets, log the report, and
refresh the JSON status report consumed by the upstream pipeline.
*/
pub fn report_stats(gw: &Gateway) {
    let stat_timestamp = Utc::now().format("%F %T %Z").to_string();

    let up = gw.meas_up.lock().unwrap().take();
    let dw = gw.meas_dw.lock().unwrap().take();

    let (rx_ok_ratio, rx_bad_ratio, rx_nocrc_ratio) = if up.nb_rx_rcv > 0 {
        (
            up.nb_rx_ok as f32 / up.nb_rx_rcv as f32,
            up.nb_rx_bad as f32 / up.nb_rx_rcv as f32,
            up.nb_rx_nocrc as f32 / up.nb_rx_rcv as f32,
        )
    } else {
        (0.0, 0.0, 0.0)
    };
    let up_ack_ratio =
        if up.up_dgram_sent > 0 { up.up_ack_rcv as f32 / up.up_dgram_sent as f32 } else { 0.0 };
    let dw_ack_ratio =
        if dw.dw_pull_sent > 0 { dw.dw_ack_rcv as f32 / dw.dw_pull_sent as f32 } else { 0.0 };

    /* access GPS statistics, copy them */
    let (coord_ok, coord) = {
        let c = gw.gps_coords.lock().unwrap();
        (c.valid, c.coord)
    };
    /* overwrite with reference coordinates if function is enabled */
    let coord = if gw.cfg.gw.fake_gps { gw.cfg.gw.ref_coord } else { coord };
    let coord_ok = coord_ok || gw.cfg.gw.fake_gps;

    let (inst_tstamp, trig_tstamp, temperature) = {
        let mut concentrator = gw.concentrator.lock().unwrap();
        (
            concentrator.lgw_get_instcnt().ok(),
            concentrator.lgw_get_trigcnt().ok(),
            concentrator.lgw_get_temperature().unwrap_or(0.0),
        )
    };

    info!("##### {} #####", stat_timestamp);
    info!("### [UPSTREAM] ###");
    info!("# RF packets received by concentrator: {}", up.nb_rx_rcv);
    info!(
        "# CRC_OK: {:.2}%, CRC_FAIL: {:.2}%, NO_CRC: {:.2}%",
        100.0 * rx_ok_ratio,
        100.0 * rx_bad_ratio,
        100.0 * rx_nocrc_ratio
    );
    info!("# RF packets forwarded: {} ({} bytes)", up.up_pkt_fwd, up.up_payload_byte);
    info!("# PUSH_DATA datagrams sent: {} ({} bytes)", up.up_dgram_sent, up.up_network_byte);
    info!("# PUSH_DATA acknowledged: {:.2}%", 100.0 * up_ack_ratio);
    info!("### [DOWNSTREAM] ###");
    info!("# PULL_DATA sent: {} ({:.2}% acknowledged)", dw.dw_pull_sent, 100.0 * dw_ack_ratio);
    info!("# PULL_RESP(onse) datagrams received: {} ({} bytes)", dw.dw_dgram_rcv, dw.dw_network_byte);
    info!(
        "# RF packets sent to concentrator: {} ({} bytes)",
        dw.nb_tx_ok + dw.nb_tx_fail,
        dw.dw_payload_byte
    );
    info!("# TX errors: {}", dw.nb_tx_fail);
    if dw.nb_tx_requested != 0 {
        info!(
            "# TX rejected (collision packet): {:.2}% (req:{}, rej:{})",
            100.0 * dw.nb_tx_rejected_collision_packet as f32 / dw.nb_tx_requested as f32,
            dw.nb_tx_requested,
            dw.nb_tx_rejected_collision_packet
        );
        info!(
            "# TX rejected (collision beacon): {:.2}% (req:{}, rej:{})",
            100.0 * dw.nb_tx_rejected_collision_beacon as f32 / dw.nb_tx_requested as f32,
            dw.nb_tx_requested,
            dw.nb_tx_rejected_collision_beacon
        );
        info!(
            "# TX rejected (too late): {:.2}% (req:{}, rej:{})",
            100.0 * dw.nb_tx_rejected_too_late as f32 / dw.nb_tx_requested as f32,
            dw.nb_tx_requested,
            dw.nb_tx_rejected_too_late
        );
        info!(
            "# TX rejected (too early): {:.2}% (req:{}, rej:{})",
            100.0 * dw.nb_tx_rejected_too_early as f32 / dw.nb_tx_requested as f32,
            dw.nb_tx_requested,
            dw.nb_tx_rejected_too_early
        );
    }
    info!("### Concentrator status ###");
    match (inst_tstamp, trig_tstamp) {
        (Some(inst), Some(trig)) => {
            info!("# Concentrator counter (INST): {}", inst);
            info!("# Concentrator counter (PPS):  {}", trig);
        }
        _ => info!("# Concentrator counter unknown"),
    }
    info!("# BEACON queued: {}", dw.nb_beacon_queued);
    info!("# BEACON sent so far: {}", dw.nb_beacon_sent);
    info!("# BEACON rejected: {}", dw.nb_beacon_rejected);
    info!("### [JIT] ###");
    for (i, queue) in gw.jit_queue.iter().enumerate() {
        info!("# [jit {}] {}", i, queue.lock().unwrap().summary());
    }
    info!("### [GPS] ###");
    if gw.gps_enabled {
        let tr = gw.timeref.lock().unwrap();
        let age = tr
            .tref
            .systime
            .elapsed()
            .map(|d| d.as_secs() as i64)
            .unwrap_or(-1);
        if tr.gps_ref_valid {
            info!("# Valid time reference (age: {} sec)", age);
        } else {
            info!("# Invalid time reference (age: {} sec)", age);
        }
        if coord_ok {
            info!(
                "# GPS coordinates: latitude {:.5}, longitude {:.5}, altitude {} m",
                coord.lat, coord.lon, coord.alt
            );
        } else {
            info!("# no valid GPS coordinates available yet");
        }
    } else if gw.cfg.gw.fake_gps {
        info!(
            "# GPS *FAKE* coordinates: latitude {:.5}, longitude {:.5}, altitude {} m",
            coord.lat, coord.lon, coord.alt
        );
    } else {
        info!("# GPS sync is disabled");
    }
    info!("##### END #####");

    /* generate a JSON report (will be sent to server by upstream thread) */
    let json = if coord_ok {
        format!(
            "\"stat\":{{\"time\":\"{}\",\"lati\":{:.5},\"long\":{:.5},\"alti\":{},\"rxnb\":{},\"rxok\":{},\"rxfw\":{},\"ackr\":{:.1},\"dwnb\":{},\"txnb\":{},\"temp\":{:.1}}}",
            stat_timestamp,
            coord.lat,
            coord.lon,
            coord.alt,
            up.nb_rx_rcv,
            up.nb_rx_ok,
            up.up_pkt_fwd,
            100.0 * up_ack_ratio,
            dw.dw_dgram_rcv,
            dw.nb_tx_ok,
            temperature
        )
    } else {
        format!(
            "\"stat\":{{\"time\":\"{}\",\"rxnb\":{},\"rxok\":{},\"rxfw\":{},\"ackr\":{:.1},\"dwnb\":{},\"txnb\":{},\"temp\":{:.1}}}",
            stat_timestamp,
            up.nb_rx_rcv,
            up.nb_rx_ok,
            up.up_pkt_fwd,
            100.0 * up_ack_ratio,
            dw.dw_dgram_rcv,
            dw.nb_tx_ok,
            temperature
        )
    };
    let mut report = gw.report.lock().unwrap();
    report.json = json;
    report.ready = true;
}
