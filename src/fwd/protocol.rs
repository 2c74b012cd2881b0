use std::fmt::Write as _;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::hal::gps::{lgw_cnt2gps, lgw_cnt2utc, TimeReference};
use crate::hal::{
    LgwPktRx, Modulation, BW_125KHZ, BW_250KHZ, BW_500KHZ, CR_LORA_4_5, CR_LORA_4_6, CR_LORA_4_7,
    CR_LORA_4_8, DR_LORA_SF10, DR_LORA_SF11, DR_LORA_SF12, DR_LORA_SF5, DR_LORA_SF6, DR_LORA_SF7,
    DR_LORA_SF8, DR_LORA_SF9, STAT_CRC_BAD, STAT_CRC_OK, STAT_NO_CRC,
};

use super::jitqueue::JitError;

pub const PROTOCOL_VERSION: u8 = 2; /* v1.6 */
pub const PROTOCOL_JSON_RXPK_FRAME_FORMAT: u8 = 1;

pub const PKT_PUSH_DATA: u8 = 0;
pub const PKT_PUSH_ACK: u8 = 1;
pub const PKT_PULL_DATA: u8 = 2;
pub const PKT_PULL_RESP: u8 = 3;
pub const PKT_PULL_ACK: u8 = 4;
pub const PKT_TX_ACK: u8 = 5;

/**
@brief 12-byte datagram header: version, random token, packet type, gateway
EUI in network order.
*/
pub fn datagram_header(pkt_type: u8, token_h: u8, token_l: u8, gateway_id: u64) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = PROTOCOL_VERSION;
    header[1] = token_h;
    header[2] = token_l;
    header[3] = pkt_type;
    header[4..12].copy_from_slice(&gateway_id.to_be_bytes());
    header
}

/* an ACK datagram is valid iff version, type and token all match */
pub fn is_ack(buf: &[u8], ack_type: u8, token_h: u8, token_l: u8) -> bool {
    buf.len() >= 4
        && buf[0] == PROTOCOL_VERSION
        && buf[3] == ack_type
        && buf[1] == token_h
        && buf[2] == token_l
}

/**
@brief Append one rxpk JSON object for a received packet.

Number formats are part of the protocol: carrier frequency with 6 decimals,
RSSI rounded to integers, SNR with one decimal.
*/
pub fn append_rxpk(
    buf: &mut String,
    p: &LgwPktRx,
    tref: Option<&TimeReference>,
) -> Result<(), std::fmt::Error> {
    buf.push('{');
    write!(buf, "\"jver\":{}", PROTOCOL_JSON_RXPK_FRAME_FORMAT)?;

    /* RAW timestamp */
    write!(buf, ",\"tmst\":{}", p.count_us)?;

    /* Packet RX time (GPS based) */
    if let Some(tref) = tref {
        if let Ok(utc) = lgw_cnt2utc(tref, p.count_us) {
            /* ISO 8601 format, 6-digit microseconds */
            write!(buf, ",\"time\":\"{}\"", utc.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
        }
        if let Ok(gps_time) = lgw_cnt2gps(tref, p.count_us) {
            /* GPS time in milliseconds since 06.Jan.1980 */
            write!(buf, ",\"tmms\":{}", gps_time.as_millis())?;
        }
    }

    /* Fine timestamp */
    if p.ftime_received {
        write!(buf, ",\"ftime\":{}", p.ftime)?;
    }

    /* Packet concentrator channel, RF chain & RX frequency */
    write!(
        buf,
        ",\"chan\":{},\"rfch\":{},\"freq\":{:.6},\"mid\":{}",
        p.if_chain,
        p.rf_chain,
        p.freq_hz as f64 / 1e6,
        p.modem_id
    )?;

    /* Packet status */
    match p.status {
        STAT_CRC_OK => buf.push_str(",\"stat\":1"),
        STAT_CRC_BAD => buf.push_str(",\"stat\":-1"),
        STAT_NO_CRC => buf.push_str(",\"stat\":0"),
        _ => buf.push_str(",\"stat\":?"),
    }

    /* Packet modulation */
    match p.modulation {
        Modulation::LORA => {
            buf.push_str(",\"modu\":\"LORA\"");

            /* Lora datarate & bandwidth */
            let sf = match p.datarate {
                DR_LORA_SF5 => "SF5",
                DR_LORA_SF6 => "SF6",
                DR_LORA_SF7 => "SF7",
                DR_LORA_SF8 => "SF8",
                DR_LORA_SF9 => "SF9",
                DR_LORA_SF10 => "SF10",
                DR_LORA_SF11 => "SF11",
                DR_LORA_SF12 => "SF12",
                _ => "SF?",
            };
            let bw = match p.bandwidth {
                BW_125KHZ => "BW125",
                BW_250KHZ => "BW250",
                BW_500KHZ => "BW500",
                _ => "BW?",
            };
            write!(buf, ",\"datr\":\"{}{}\"", sf, bw)?;

            /* Packet ECC coding rate */
            let codr = match p.coderate {
                CR_LORA_4_5 => "4/5",
                CR_LORA_4_6 => "4/6",
                CR_LORA_4_7 => "4/7",
                CR_LORA_4_8 => "4/8",
                0 => "OFF", /* the CR0 case (mostly false sync) */
                _ => "?",
            };
            write!(buf, ",\"codr\":\"{}\"", codr)?;

            /* Signal RSSI, SNR, frequency offset */
            write!(buf, ",\"rssis\":{:.0}", libm::roundf(p.rssis))?;
            write!(buf, ",\"lsnr\":{:.1}", p.snr)?;
            write!(buf, ",\"foff\":{}", p.freq_offset)?;
        }
        Modulation::FSK => {
            buf.push_str(",\"modu\":\"FSK\"");
            write!(buf, ",\"datr\":{}", p.datarate)?;
        }
        _ => {
            warn!("WARNING: [up] received packet with unknown modulation {}", p.modulation);
        }
    }

    /* Channel RSSI, payload size, base64-encoded payload */
    write!(buf, ",\"rssi\":{:.0},\"size\":{}", libm::roundf(p.rssic), p.size)?;
    write!(buf, ",\"data\":\"{}\"", BASE64.encode(&p.payload[..p.size as usize]))?;

    buf.push('}');
    Ok(())
}

/* recognized fields of a PULL_RESP txpk object */
#[derive(Debug, Clone, Deserialize)]
pub struct TxPk {
    #[serde(default)]
    pub imme: bool,             /* immediate send (class C) */
    pub tmst: Option<u32>,      /* concentrator counter target (class A) */
    pub tmms: Option<u64>,      /* GPS time in ms since 06.Jan.1980 (class B) */
    pub freq: f64,              /* TX frequency in MHz */
    pub rfch: u8,
    pub powe: Option<i8>,       /* requested dBm, antenna gain not yet subtracted */
    pub modu: String,           /* "LORA" or "FSK" */
    pub datr: serde_json::Value, /* "SF..BW.." for LoRa, bps for FSK */
    pub codr: Option<String>,
    #[serde(default)]
    pub ipol: bool,
    pub prea: Option<u16>,
    pub fdev: Option<f64>,      /* FSK frequency deviation, Hz */
    #[serde(default)]
    pub ncrc: bool,
    #[serde(default)]
    pub nhdr: bool,
    pub size: u16,
    pub data: String,           /* base64-encoded payload */
}

#[derive(Debug, Deserialize)]
pub struct PullResp {
    pub txpk: TxPk,
}

pub fn parse_pull_resp(json: &[u8]) -> Option<PullResp> {
    match serde_json::from_slice::<PullResp>(json) {
        Ok(resp) => Some(resp),
        Err(e) => {
            warn!("WARNING: [down] invalid JSON, TX aborted ({})", e);
            None
        }
    }
}

/* "SF7BW125" -> (7, BW_125KHZ) */
pub fn parse_lora_datr(datr: &str) -> Option<(u32, u8)> {
    let rest = datr.strip_prefix("SF")?;
    let bw_pos = rest.find("BW")?;
    let sf: u32 = rest[..bw_pos].parse().ok()?;
    if !(5..=12).contains(&sf) {
        return None;
    }
    let bw = match &rest[bw_pos + 2..] {
        "125" => BW_125KHZ,
        "250" => BW_250KHZ,
        "500" => BW_500KHZ,
        _ => return None,
    };
    Some((sf, bw))
}

/* coding rate tokens; "2/3" and "1/2" are aliases kept for server compatibility */
pub fn parse_codr(codr: &str) -> Option<u8> {
    match codr {
        "4/5" => Some(CR_LORA_4_5),
        "4/6" | "2/3" => Some(CR_LORA_4_6),
        "4/7" => Some(CR_LORA_4_7),
        "4/8" | "1/2" => Some(CR_LORA_4_8),
        _ => None,
    }
}

pub fn decode_payload(data: &str, expected_size: u16) -> Option<[u8; 256]> {
    let decoded = match BASE64.decode(data.trim_end_matches('=').to_string() + pad_for(data)) {
        Ok(d) => d,
        Err(e) => {
            warn!("WARNING: [down] failed to decode base64 payload ({})", e);
            return None;
        }
    };
    if decoded.len() > 256 {
        return None;
    }
    if decoded.len() != expected_size as usize {
        warn!("WARNING: [down] mismatch between .size and .data size once converted to binary");
    }
    let mut payload = [0u8; 256];
    payload[..decoded.len()].copy_from_slice(&decoded);
    Some(payload)
}

/* servers are inconsistent about base64 padding, re-pad before decoding */
fn pad_for(data: &str) -> &'static str {
    match data.trim_end_matches('=').len() % 4 {
        2 => "==",
        3 => "=",
        _ => "",
    }
}

/* GPS time in milliseconds (txpk.tmms) to Duration since the GPS epoch */
pub fn tmms_to_gps_time(tmms: u64) -> Duration {
    Duration::from_millis(tmms)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxAck {
    Ok,
    Warn(JitError, i32),    /* request honored with an adjusted value */
    Error(JitError),
}

impl TxAck {
    /* JSON body of the TX_ACK datagram; empty on success */
    pub fn body(&self) -> String {
        match self {
            TxAck::Ok => String::new(),
            TxAck::Warn(err, value) => {
                format!("{{\"txpk_ack\":{{\"warn\":\"{}\",\"value\":{}}}}}", err.ack_token(), value)
            }
            TxAck::Error(err) => {
                format!("{{\"txpk_ack\":{{\"error\":\"{}\"}}}}", err.ack_token())
            }
        }
    }
}

/* build a full TX_ACK datagram echoing the PULL_RESP token */
pub fn tx_ack_datagram(token_h: u8, token_l: u8, gateway_id: u64, ack: &TxAck) -> Vec<u8> {
    let mut buf = datagram_header(PKT_TX_ACK, token_h, token_l, gateway_id).to_vec();
    buf.extend_from_slice(ack.body().as_bytes());
    debug!("TX_ACK: {}", ack.body());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::STAT_CRC_OK;

    fn sample_rx() -> LgwPktRx {
        let mut p = LgwPktRx::new();
        p.freq_hz = 868_100_000;
        p.if_chain = 2;
        p.rf_chain = 0;
        p.status = STAT_CRC_OK;
        p.count_us = 0x11223344;
        p.modulation = Modulation::LORA;
        p.bandwidth = BW_125KHZ;
        p.datarate = DR_LORA_SF7;
        p.coderate = CR_LORA_4_5;
        p.rssic = -98.4;
        p.rssis = -99.2;
        p.snr = 9.25;
        p.freq_offset = -120;
        p.size = 2;
        p.payload[0] = 0xAA;
        p.payload[1] = 0xBB;
        p
    }

    #[test]
    fn rxpk_serialization_bit_exact() {
        let mut buf = String::new();
        append_rxpk(&mut buf, &sample_rx(), None).unwrap();
        assert!(buf.contains("\"jver\":1"));
        assert!(buf.contains("\"tmst\":287454020"));
        assert!(buf.contains("\"freq\":868.100000"));
        assert!(buf.contains("\"stat\":1"));
        assert!(buf.contains("\"modu\":\"LORA\""));
        assert!(buf.contains("\"datr\":\"SF7BW125\""));
        assert!(buf.contains("\"codr\":\"4/5\""));
        assert!(buf.contains("\"lsnr\":9.2"));
        assert!(buf.contains("\"size\":2"));
        assert!(buf.contains("\"data\":\"qrs=\""));
        /* the object must be valid JSON on its own */
        serde_json::from_str::<serde_json::Value>(&buf).unwrap();
    }

    #[test]
    fn rxpk_fsk_datarate_is_numeric() {
        let mut p = sample_rx();
        p.modulation = Modulation::FSK;
        p.datarate = 50000;
        let mut buf = String::new();
        append_rxpk(&mut buf, &p, None).unwrap();
        assert!(buf.contains("\"modu\":\"FSK\""));
        assert!(buf.contains("\"datr\":50000"));
    }

    #[test]
    fn header_layout() {
        let h = datagram_header(PKT_PUSH_DATA, 0xAB, 0xCD, 0xAA555A0000000101);
        assert_eq!(h[0], 2);
        assert_eq!(h[1], 0xAB);
        assert_eq!(h[2], 0xCD);
        assert_eq!(h[3], 0);
        assert_eq!(&h[4..12], &[0xAA, 0x55, 0x5A, 0x00, 0x00, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn ack_validation() {
        let mut ack = datagram_header(PKT_PUSH_ACK, 0x12, 0x34, 0).to_vec();
        assert!(is_ack(&ack, PKT_PUSH_ACK, 0x12, 0x34));
        assert!(!is_ack(&ack, PKT_PUSH_ACK, 0x12, 0x35)); /* wrong token */
        assert!(!is_ack(&ack, PKT_PULL_ACK, 0x12, 0x34)); /* wrong type */
        ack[0] = 1;
        assert!(!is_ack(&ack, PKT_PUSH_ACK, 0x12, 0x34)); /* wrong version */
        assert!(!is_ack(&[2, 0x12], PKT_PUSH_ACK, 0x12, 0x34)); /* short */
    }

    #[test]
    fn datr_and_codr_parsing() {
        assert_eq!(parse_lora_datr("SF7BW125"), Some((7, BW_125KHZ)));
        assert_eq!(parse_lora_datr("SF12BW500"), Some((12, BW_500KHZ)));
        assert_eq!(parse_lora_datr("SF4BW125"), None);
        assert_eq!(parse_lora_datr("SF7BW200"), None);
        assert_eq!(parse_lora_datr("7BW125"), None);

        assert_eq!(parse_codr("4/5"), Some(CR_LORA_4_5));
        assert_eq!(parse_codr("2/3"), Some(CR_LORA_4_6));
        assert_eq!(parse_codr("1/2"), Some(CR_LORA_4_8));
        assert_eq!(parse_codr("3/4"), None);
    }

    #[test]
    fn pull_resp_parsing() {
        let json = br#"{"txpk":{"imme":false,"tmst":2000000,"freq":868.5,"rfch":0,"powe":14,
            "modu":"LORA","datr":"SF9BW125","codr":"4/5","size":1,"data":"AA=="}}"#;
        let resp = parse_pull_resp(json).unwrap();
        assert_eq!(resp.txpk.tmst, Some(2_000_000));
        assert_eq!(resp.txpk.freq, 868.5);
        assert_eq!(resp.txpk.datr.as_str(), Some("SF9BW125"));
        assert!(parse_pull_resp(b"{\"txpk\":{}}").is_none()); /* missing mandatory fields */
        assert!(parse_pull_resp(b"not json").is_none());
    }

    #[test]
    fn payload_base64_round_trip() {
        for size in [1usize, 2, 3, 17, 255] {
            let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let encoded = BASE64.encode(&data);
            let decoded = decode_payload(&encoded, size as u16).unwrap();
            assert_eq!(&decoded[..size], &data[..]);
            assert_eq!(BASE64.encode(&decoded[..size]), encoded);
        }
        /* unpadded input is tolerated */
        assert!(decode_payload("qrs", 2).is_some());
    }

    #[test]
    fn tx_ack_bodies() {
        assert_eq!(TxAck::Ok.body(), "");
        assert_eq!(
            TxAck::Error(JitError::TooLate).body(),
            "{\"txpk_ack\":{\"error\":\"TOO_LATE\"}}"
        );
        assert_eq!(
            TxAck::Error(JitError::GpsUnlocked).body(),
            "{\"txpk_ack\":{\"error\":\"GPS_UNLOCKED\"}}"
        );
        assert_eq!(
            TxAck::Warn(JitError::TxPower, 14).body(),
            "{\"txpk_ack\":{\"warn\":\"TX_POWER\",\"value\":14}}"
        );
    }
}
