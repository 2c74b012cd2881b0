use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serialport::{FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, trace, warn};

use super::error::Error;

pub const LGW_GPS_UBX_SYNC_CHAR: u8 = 0xB5;
pub const LGW_GPS_NMEA_SYNC_CHAR: u8 = b'$';
pub const LGW_GPS_MIN_MSG_SIZE: usize = 8;

/* Number of seconds ellapsed between 01.Jan.1970 00:00:00 and 06.Jan.1980 00:00:00 */
pub const UNIX_GPS_EPOCH_OFFSET: u64 = 315964800;

const GPS_EPOCH_WEEK_SECONDS: u64 = 7 * 24 * 3600;

/* concentrator timestamp counts per second */
const TS_CPS: f64 = 1E6;

/* tolerated clock slope between two PPS syncs before a sample is flagged aberrant */
const PLUS_10PPM: f64 = 1.00001;
const MINUS_10PPM: f64 = 0.99999;

/* consecutive aberrant samples forcing a resync */
const MAX_ABERRANT_SYNC: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpsMsg {
    Ignored,        /* checksum-valid frame the forwarder does not care about */
    Unknown,
    Invalid,
    Incomplete,
    UbxNavTimegps,
    NmeaRmc,
    NmeaGga,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Coord {
    pub lat: f64,   /* latitude in degrees, north positive */
    pub lon: f64,   /* longitude in degrees, east positive */
    pub alt: i16,   /* altitude in meters */
}

/**
@struct TimeReference
@brief Time reference linking the concentrator counter to UTC and GPS time,
captured on a PPS edge.
*/
#[derive(Debug, Clone, Copy)]
pub struct TimeReference {
    pub systime: SystemTime,    /* system time when the reference was taken */
    pub count_us: u32,          /* concentrator counter at last PPS */
    pub utc: DateTime<Utc>,     /* UTC time at last PPS */
    pub gps: Duration,          /* GPS time at last PPS, since 06.Jan.1980 */
    pub xtal_err: f64,          /* raw clock error: concentrator seconds per UTC second */
    aberrant_streak: u8,
}

impl Default for TimeReference {
    fn default() -> Self {
        Self {
            systime: UNIX_EPOCH,
            count_us: 0,
            utc: Utc.timestamp_opt(0, 0).unwrap(),
            gps: Duration::ZERO,
            xtal_err: 1.0,
            aberrant_streak: 0,
        }
    }
}

impl TimeReference {
    fn is_set(&self) -> bool {
        self.systime != UNIX_EPOCH
    }
}

/**
@brief Update the time reference with a new PPS sync point.

The counter/UTC slope is screened against a +/-10 ppm band; a sample outside
the band is rejected unless it is the MAX_ABERRANT_SYNC'th rejection in a
row, in which case the reference is re-seeded with a unity clock error.
*/
pub fn lgw_gps_sync(
    tref: &mut TimeReference,
    count_us: u32,
    utc: DateTime<Utc>,
    gps_time: Duration,
) -> Result<()> {
    if !tref.is_set() {
        *tref = TimeReference {
            systime: SystemTime::now(),
            count_us,
            utc,
            gps: gps_time,
            xtal_err: 1.0,
            aberrant_streak: 0,
        };
        return Ok(());
    }

    let cnt_diff = count_us.wrapping_sub(tref.count_us) as f64 / TS_CPS;
    let utc_diff = (utc - tref.utc).num_nanoseconds().unwrap_or(0) as f64 * 1E-9;

    let slope = if utc_diff > 0.0 { cnt_diff / utc_diff } else { 0.0 };
    if slope < MINUS_10PPM || slope > PLUS_10PPM {
        tref.aberrant_streak += 1;
        trace!("aberrant GPS sync slope {:.9} (streak {})", slope, tref.aberrant_streak);
        if tref.aberrant_streak < MAX_ABERRANT_SYNC {
            return Err(anyhow!(Error::LGW_GPS_ERROR));
        }
        /* lost track of the counter (wrap during outage), start a new reference */
        *tref = TimeReference {
            systime: SystemTime::now(),
            count_us,
            utc,
            gps: gps_time,
            xtal_err: 1.0,
            aberrant_streak: 0,
        };
        return Ok(());
    }

    *tref = TimeReference {
        systime: SystemTime::now(),
        count_us,
        utc,
        gps: gps_time,
        xtal_err: slope,
        aberrant_streak: 0,
    };
    Ok(())
}

/* Convert a concentrator counter value to UTC using the time reference */
pub fn lgw_cnt2utc(tref: &TimeReference, count_us: u32) -> Result<DateTime<Utc>> {
    if !tref.is_set() || tref.xtal_err > PLUS_10PPM || tref.xtal_err < MINUS_10PPM {
        return Err(anyhow!(Error::LGW_GPS_ERROR));
    }
    let delta_sec = count_us.wrapping_sub(tref.count_us) as i32 as f64 / (TS_CPS * tref.xtal_err);
    Ok(tref.utc + chrono::Duration::nanoseconds((delta_sec * 1E9) as i64))
}

/* Convert a concentrator counter value to GPS time (since 06.Jan.1980) */
pub fn lgw_cnt2gps(tref: &TimeReference, count_us: u32) -> Result<Duration> {
    if !tref.is_set() || tref.xtal_err > PLUS_10PPM || tref.xtal_err < MINUS_10PPM {
        return Err(anyhow!(Error::LGW_GPS_ERROR));
    }
    let delta_sec = count_us.wrapping_sub(tref.count_us) as i32 as f64 / (TS_CPS * tref.xtal_err);
    let gps_sec = tref.gps.as_secs_f64() + delta_sec;
    if gps_sec < 0.0 {
        return Err(anyhow!(Error::LGW_GPS_ERROR));
    }
    Ok(Duration::from_secs_f64(gps_sec))
}

/* Convert a GPS time (since 06.Jan.1980) to a concentrator counter value */
pub fn lgw_gps2cnt(tref: &TimeReference, gps_time: Duration) -> Result<u32> {
    if !tref.is_set() || tref.xtal_err > PLUS_10PPM || tref.xtal_err < MINUS_10PPM {
        return Err(anyhow!(Error::LGW_GPS_ERROR));
    }
    let delta_sec = gps_time.as_secs_f64() - tref.gps.as_secs_f64();
    let delta_cnt = (delta_sec * TS_CPS * tref.xtal_err).round() as i64;
    Ok(tref.count_us.wrapping_add(delta_cnt as u32))
}

/**
@struct Gps
@brief GPS receiver session: serial port plus the latest decoded fix.
*/
pub struct Gps {
    port: Option<Box<dyn SerialPort>>,
    gps_time: Option<Duration>,     /* from UBX-NAV-TIMEGPS */
    utc: Option<DateTime<Utc>>,     /* from UBX-NAV-TIMEGPS, leap seconds applied */
    coord: Option<Coord>,           /* from NMEA-RMC (+GGA altitude) */
    altitude: i16,
}

impl Gps {
    pub fn enable(tty_path: &str) -> Result<Self> {
        let port = serialport::new(tty_path, 9600)
            .flow_control(FlowControl::None)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(500))
            .open()?;

        Ok(Self {
            port: Some(port),
            gps_time: None,
            utc: None,
            coord: None,
            altitude: 0,
        })
    }

    /* session with no serial port behind it, fed by the caller */
    pub fn new_unbound() -> Self {
        Self {
            port: None,
            gps_time: None,
            utc: None,
            coord: None,
            altitude: 0,
        }
    }

    pub fn disable(&mut self) {
        self.port = None;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.port {
            Some(ref mut port) => port.read(buf),
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "Port not open")),
        }
    }

    /* latest (utc, gps_time) pair decoded from UBX-NAV-TIMEGPS */
    pub fn get_times(&self) -> Result<(DateTime<Utc>, Duration)> {
        match (self.utc, self.gps_time) {
            (Some(utc), Some(gps)) => Ok((utc, gps)),
            _ => Err(anyhow!(Error::LGW_GPS_ERROR)),
        }
    }

    /* latest coordinates decoded from NMEA-RMC */
    pub fn get_coords(&self) -> Result<Coord> {
        self.coord.ok_or_else(|| anyhow!(Error::LGW_GPS_ERROR))
    }

    /**
    @brief Try to decode one UBX frame at the start of buf.

    Returns the message kind plus the frame size when the header could be
    read (0 when not even the header is complete).
    */
    pub fn parse_ubx(&mut self, buf: &[u8]) -> (GpsMsg, usize) {
        if buf.len() < 6 {
            return (GpsMsg::Incomplete, 0);
        }
        if buf[0] != 0xB5 || buf[1] != 0x62 {
            return (GpsMsg::Invalid, 0);
        }
        let payload_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let frame_size = 8 + payload_len;
        if buf.len() < frame_size {
            return (GpsMsg::Incomplete, frame_size);
        }

        /* 8-bit Fletcher checksum over class..payload */
        let mut ck_a: u8 = 0;
        let mut ck_b: u8 = 0;
        for &b in &buf[2..6 + payload_len] {
            ck_a = ck_a.wrapping_add(b);
            ck_b = ck_b.wrapping_add(ck_a);
        }
        if ck_a != buf[6 + payload_len] || ck_b != buf[7 + payload_len] {
            return (GpsMsg::Invalid, frame_size);
        }

        /* UBX-NAV-TIMEGPS */
        if buf[2] == 0x01 && buf[3] == 0x20 && payload_len >= 16 {
            let p = &buf[6..6 + payload_len];
            let itow = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);        /* ms of GPS week */
            let ftow = i32::from_le_bytes([p[4], p[5], p[6], p[7]]);        /* ns remainder */
            let week = i16::from_le_bytes([p[8], p[9]]);
            let leap_s = p[10] as i8;
            let valid = p[11];
            if (valid & 0x03) != 0x03 {
                /* time of week or week number not valid yet */
                return (GpsMsg::Ignored, frame_size);
            }

            let mut gps_ns: i64 = week as i64 * GPS_EPOCH_WEEK_SECONDS as i64 * 1_000_000_000
                + itow as i64 * 1_000_000
                + ftow as i64;
            if gps_ns < 0 {
                gps_ns = 0;
            }
            let gps = Duration::from_nanos(gps_ns as u64);
            let utc_sec = UNIX_GPS_EPOCH_OFFSET as i64 + gps.as_secs() as i64 - leap_s as i64;
            self.gps_time = Some(gps);
            self.utc = Utc.timestamp_opt(utc_sec, gps.subsec_nanos()).single();
            debug!("UBX NAV-TIMEGPS: gps={}s leap={}", gps.as_secs(), leap_s);
            return (GpsMsg::UbxNavTimegps, frame_size);
        }

        (GpsMsg::Ignored, frame_size)
    }

    /**
    @brief Decode one complete NMEA sentence (from '$' to the line feed).
    */
    pub fn parse_nmea(&mut self, frame: &[u8]) -> GpsMsg {
        if frame.len() < 8 || frame[0] != b'$' {
            return GpsMsg::Invalid;
        }
        let body = match std::str::from_utf8(frame) {
            Ok(s) => s.trim_end(),
            Err(_) => return GpsMsg::Invalid,
        };

        /* validate the checksum between '$' and '*' */
        let star = match body.rfind('*') {
            Some(i) => i,
            None => return GpsMsg::Invalid,
        };
        let expected = match u8::from_str_radix(&body[star + 1..], 16) {
            Ok(v) => v,
            Err(_) => return GpsMsg::Invalid,
        };
        let computed = body[1..star].bytes().fold(0u8, |acc, b| acc ^ b);
        if computed != expected {
            warn!("WARNING: invalid NMEA checksum in {}", body);
            return GpsMsg::Invalid;
        }

        let fields: Vec<&str> = body[1..star].split(',').collect();
        let talker = fields[0];
        if talker.len() < 5 {
            return GpsMsg::Unknown;
        }
        match &talker[2..5] {
            "RMC" => {
                /* $xxRMC,time,status,lat,NS,lon,EW,spd,cog,date,... */
                if fields.len() < 7 || fields[2] != "A" {
                    return GpsMsg::Ignored; /* no valid fix */
                }
                match (
                    parse_nmea_angle(fields[3], fields[4]),
                    parse_nmea_angle(fields[5], fields[6]),
                ) {
                    (Some(lat), Some(lon)) => {
                        self.coord = Some(Coord { lat, lon, alt: self.altitude });
                        GpsMsg::NmeaRmc
                    }
                    _ => GpsMsg::Invalid,
                }
            }
            "GGA" => {
                /* $xxGGA,time,lat,NS,lon,EW,fix,numSV,HDOP,alt,... */
                if fields.len() > 9 {
                    if let Ok(alt) = fields[9].parse::<f64>() {
                        self.altitude = alt as i16;
                        if let Some(ref mut coord) = self.coord {
                            coord.alt = self.altitude;
                        }
                    }
                }
                GpsMsg::NmeaGga
            }
            _ => GpsMsg::Unknown,
        }
    }
}

/* NMEA (d)ddmm.mmmm + hemisphere -> signed degrees */
fn parse_nmea_angle(value: &str, hemisphere: &str) -> Option<f64> {
    let dot = value.find('.')?;
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    let angle = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(angle),
        "S" | "W" => Some(-angle),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ubx_timegps_frame(itow_ms: u32, week: i16, leap_s: i8) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&itow_ms.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes()); /* fTOW */
        payload.extend_from_slice(&week.to_le_bytes());
        payload.push(leap_s as u8);
        payload.push(0x07); /* tow/week/leap valid */
        payload.extend_from_slice(&0u32.to_le_bytes()); /* tAcc */

        let mut frame = vec![0xB5, 0x62, 0x01, 0x20];
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        let mut ck_a: u8 = 0;
        let mut ck_b: u8 = 0;
        for &b in &frame[2..] {
            ck_a = ck_a.wrapping_add(b);
            ck_b = ck_b.wrapping_add(ck_a);
        }
        frame.push(ck_a);
        frame.push(ck_b);
        frame
    }

    fn nmea_with_checksum(body: &str) -> String {
        let ck = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${}*{:02X}\r\n", body, ck)
    }

    #[test]
    fn ubx_timegps_decodes_gps_time() {
        let mut gps = Gps::new_unbound();
        /* week 2048, 2 days + 3600 s into the week, 18 leap seconds */
        let itow = (2 * 86400 + 3600) * 1000;
        let frame = ubx_timegps_frame(itow, 2048, 18);
        let (msg, size) = gps.parse_ubx(&frame);
        assert_eq!(msg, GpsMsg::UbxNavTimegps);
        assert_eq!(size, frame.len());
        let (utc, gps_time) = gps.get_times().unwrap();
        let want_gps = 2048u64 * 7 * 86400 + 2 * 86400 + 3600;
        assert_eq!(gps_time.as_secs(), want_gps);
        assert_eq!(utc.timestamp(), UNIX_GPS_EPOCH_OFFSET as i64 + want_gps as i64 - 18);
    }

    #[test]
    fn ubx_bad_checksum_is_invalid() {
        let mut gps = Gps::new_unbound();
        let mut frame = ubx_timegps_frame(1000, 2048, 18);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let (msg, _) = gps.parse_ubx(&frame);
        assert_eq!(msg, GpsMsg::Invalid);
    }

    #[test]
    fn ubx_truncated_is_incomplete() {
        let mut gps = Gps::new_unbound();
        let frame = ubx_timegps_frame(1000, 2048, 18);
        let (msg, size) = gps.parse_ubx(&frame[..10]);
        assert_eq!(msg, GpsMsg::Incomplete);
        assert_eq!(size, frame.len());
    }

    #[test]
    fn nmea_rmc_decodes_coordinates() {
        let mut gps = Gps::new_unbound();
        let sentence =
            nmea_with_checksum("GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W");
        assert_eq!(gps.parse_nmea(sentence.as_bytes()), GpsMsg::NmeaRmc);
        let coord = gps.get_coords().unwrap();
        assert!((coord.lat - (48.0 + 7.038 / 60.0)).abs() < 1e-9);
        assert!((coord.lon - (11.0 + 31.0 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn nmea_gga_sets_altitude() {
        let mut gps = Gps::new_unbound();
        let rmc =
            nmea_with_checksum("GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W");
        gps.parse_nmea(rmc.as_bytes());
        let gga = nmea_with_checksum("GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert_eq!(gps.parse_nmea(gga.as_bytes()), GpsMsg::NmeaGga);
        assert_eq!(gps.get_coords().unwrap().alt, 545);
    }

    #[test]
    fn nmea_bad_checksum_rejected() {
        let mut gps = Gps::new_unbound();
        let sentence = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*00\r\n";
        assert_eq!(gps.parse_nmea(sentence.as_bytes()), GpsMsg::Invalid);
    }

    #[test]
    fn gps_sync_tracks_slope() {
        let mut tref = TimeReference::default();
        let t0 = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        lgw_gps_sync(&mut tref, 1_000_000, t0, Duration::from_secs(1000)).unwrap();
        assert_eq!(tref.xtal_err, 1.0);
        /* 1.000002e6 counts over 1 wall second: +2 ppm crystal error */
        lgw_gps_sync(
            &mut tref,
            1_000_000 + 1_000_002,
            t0 + chrono::Duration::seconds(1),
            Duration::from_secs(1001),
        )
        .unwrap();
        assert!((tref.xtal_err - 1.000002).abs() < 1e-9);
    }

    #[test]
    fn gps_sync_rejects_aberrant_then_reseeds() {
        let mut tref = TimeReference::default();
        let t0 = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        lgw_gps_sync(&mut tref, 0, t0, Duration::from_secs(1000)).unwrap();
        /* counter jumped 2 s in 1 wall second: aberrant */
        for i in 1..MAX_ABERRANT_SYNC {
            let r = lgw_gps_sync(
                &mut tref,
                2_000_000 * i as u32,
                t0 + chrono::Duration::seconds(i as i64),
                Duration::from_secs(1000 + i as u64),
            );
            assert!(r.is_err());
        }
        /* third one in a row reseeds */
        lgw_gps_sync(
            &mut tref,
            2_000_000 * MAX_ABERRANT_SYNC as u32,
            t0 + chrono::Duration::seconds(MAX_ABERRANT_SYNC as i64),
            Duration::from_secs(1000 + MAX_ABERRANT_SYNC as u64),
        )
        .unwrap();
        assert_eq!(tref.xtal_err, 1.0);
        assert_eq!(tref.count_us, 2_000_000 * MAX_ABERRANT_SYNC as u32);
    }

    #[test]
    fn cnt_gps_round_trip() {
        let mut tref = TimeReference::default();
        let t0 = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        lgw_gps_sync(&mut tref, 0x8000_0000, t0, Duration::from_secs(100_000)).unwrap();
        tref.xtal_err = 1.0000003;

        for offset_s in [0i64, 1, 30, 128, 1024] {
            let gps = Duration::from_secs((100_000 + offset_s) as u64);
            let cnt = lgw_gps2cnt(&tref, gps).unwrap();
            let back = lgw_cnt2gps(&tref, cnt).unwrap();
            let diff = (back.as_secs_f64() - gps.as_secs_f64()).abs();
            assert!(diff < 2e-6, "offset {}: diff {}", offset_s, diff);
        }
    }

    #[test]
    fn gps2cnt_wraps_across_counter_boundary() {
        let mut tref = TimeReference::default();
        let t0 = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        /* reference close to the 32-bit wrap */
        lgw_gps_sync(&mut tref, u32::MAX - 500_000, t0, Duration::from_secs(5000)).unwrap();
        let cnt = lgw_gps2cnt(&tref, Duration::from_secs(5001)).unwrap();
        assert_eq!(cnt, (u32::MAX - 500_000).wrapping_add(1_000_000));
    }
}
