use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::hal::gps::{
    lgw_cnt2utc, lgw_gps_sync, GpsMsg, LGW_GPS_MIN_MSG_SIZE, LGW_GPS_NMEA_SYNC_CHAR,
    LGW_GPS_UBX_SYNC_CHAR,
};

use super::Gateway;

/* do not touch the OS clock for GPS fixes older than 2020-03-05, sanity gate */
const OS_TIME_SANITY_FLOOR: i64 = 1583402711;
/* drift beyond which the OS clock is set from GPS, once */
const OS_TIME_MAX_DRIFT_S: i64 = 10;

/**
@brief Set the system wall clock from a GPS-derived UTC time, once per
process, when the drift is large enough to matter.
*/
fn modify_os_time(gw: &Gateway, trig_tstamp: u32, time_already_set: &mut bool) {
    if *time_already_set {
        return;
    }
    let utc = {
        let state = gw.timeref.lock().unwrap();
        match lgw_cnt2utc(&state.tref, trig_tstamp) {
            Ok(utc) => utc,
            Err(_) => return,
        }
    };
    if utc.timestamp() < OS_TIME_SANITY_FLOOR {
        return;
    }

    let now: DateTime<Utc> = SystemTime::now().into();
    let time_diff = (utc.timestamp() - now.timestamp()).abs();
    info!(
        "INFO: [modify_os_time] local_time={}, gps_time={}",
        now.timestamp(),
        utc.timestamp()
    );
    if time_diff < OS_TIME_MAX_DRIFT_S {
        *time_already_set = true;
        info!("INFO: [modify_os_time] system time is within {} seconds of GPS time, keeping it", OS_TIME_MAX_DRIFT_S);
        return;
    }

    let tv = libc::timespec { tv_sec: utc.timestamp() as libc::time_t, tv_nsec: 0 };
    let ret = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &tv) };
    if ret == 0 {
        *time_already_set = true;
        info!("INFO: [modify_os_time] system time has been synchronized via GPS");
    } else {
        warn!("WARNING: [modify_os_time] clock_settime failed (insufficient privileges?)");
    }
}

/* called on every validated UBX-NAV-TIMEGPS */
fn gps_process_sync(gw: &Gateway, time_already_set: &mut bool) {
    /* get GPS time for synchronization */
    let (utc, gps_time) = {
        let gps = gw.gps.as_ref().unwrap().lock().unwrap();
        match gps.get_times() {
            Ok(times) => times,
            Err(_) => return,
        }
    };

    /* get timestamp captured on PPM pulse */
    let trig_tstamp = {
        let mut concentrator = gw.concentrator.lock().unwrap();
        match concentrator.lgw_get_trigcnt() {
            Ok(cnt) => cnt,
            Err(_) => {
                warn!("WARNING: [gps] failed to read concentrator timestamp");
                return;
            }
        }
    };

    /* try to update time reference with the new GPS time & timestamp */
    {
        let mut state = gw.timeref.lock().unwrap();
        if lgw_gps_sync(&mut state.tref, trig_tstamp, utc, gps_time).is_err() {
            warn!("WARNING: [gps] GPS out of sync, keeping previous time reference");
            return;
        }
    }
    modify_os_time(gw, trig_tstamp, time_already_set);
}

/* called on every validated NMEA-RMC */
fn gps_process_coords(gw: &Gateway) {
    let coord = {
        let gps = gw.gps.as_ref().unwrap().lock().unwrap();
        gps.get_coords()
    };
    let mut meas = gw.gps_coords.lock().unwrap();
    match coord {
        Ok(coord) => {
            meas.valid = true;
            meas.coord = coord;
        }
        Err(_) => meas.valid = false,
    }
}

/**
@brief GPS reader: framed input over the serial byte stream, scanning for
UBX and NMEA sync characters and decoding whatever follows.
*/
pub fn thread_gps(gw: &Gateway) {
    /* serial variables */
    let mut serial_buff = [0u8; 128];   /* buffer to receive GPS data */
    let mut wr_idx: usize = 0;          /* pointer to end of chars in buffer */

    let mut time_already_set = false;

    while gw.running() {
        /* blocking non-canonical read on serial port */
        let nb_char = {
            let mut gps = gw.gps.as_ref().unwrap().lock().unwrap();
            let free = &mut serial_buff[wr_idx..];
            let max = free.len().min(LGW_GPS_MIN_MSG_SIZE);
            match gps.read(&mut free[..max]) {
                Ok(n) => n,
                Err(_) => continue, /* timeout or port hiccup */
            }
        };
        if nb_char == 0 {
            continue;
        }
        wr_idx += nb_char;

        /*******************************************
         * Scan buffer for UBX/NMEA sync chars and *
         * attempt to decode frame if one is found *
         *******************************************/
        let mut rd_idx: usize = 0;
        let mut frame_end_idx: usize = 0;
        while rd_idx < wr_idx {
            let mut frame_size: usize = 0;

            if serial_buff[rd_idx] == LGW_GPS_UBX_SYNC_CHAR {
                /***********************
                 * Found UBX sync char *
                 ***********************/
                let (latest_msg, size) = {
                    let mut gps = gw.gps.as_ref().unwrap().lock().unwrap();
                    gps.parse_ubx(&serial_buff[rd_idx..wr_idx])
                };
                match latest_msg {
                    GpsMsg::Incomplete => { /* UBX header found but frame appears to be missing bytes */ }
                    GpsMsg::Invalid => {
                        warn!("WARNING: [gps] could not get a valid message from GPS (no time)");
                    }
                    GpsMsg::UbxNavTimegps => {
                        frame_size = size;
                        gps_process_sync(gw, &mut time_already_set);
                    }
                    _ => frame_size = size,
                }
            } else if serial_buff[rd_idx] == LGW_GPS_NMEA_SYNC_CHAR {
                /************************
                 * Found NMEA sync char *
                 ************************/
                /* scan for NMEA end marker (LF = 0x0a) */
                if let Some(end) =
                    serial_buff[rd_idx..wr_idx].iter().position(|&b| b == 0x0a)
                {
                    let size = end + 1;
                    let latest_msg = {
                        let mut gps = gw.gps.as_ref().unwrap().lock().unwrap();
                        gps.parse_nmea(&serial_buff[rd_idx..rd_idx + size])
                    };
                    match latest_msg {
                        GpsMsg::Invalid | GpsMsg::Unknown => { /* checksum failed, resync */ }
                        GpsMsg::NmeaRmc => {
                            frame_size = size;
                            /* Get location from RMC frames */
                            gps_process_coords(gw);
                        }
                        _ => frame_size = size,
                    }
                }
            }

            if frame_size > 0 {
                /* At this point message is a checksum verified frame,
                   processed or ignored. Remove frame from buffer */
                rd_idx += frame_size;
                frame_end_idx = rd_idx;
            } else {
                rd_idx += 1;
            }
        }

        if frame_end_idx > 0 {
            /* Frames have been processed. Remove bytes to end of last processed frame */
            serial_buff.copy_within(frame_end_idx..wr_idx, 0);
            wr_idx -= frame_end_idx;
        }

        /* Prevent buffer overflow */
        if serial_buff.len() - wr_idx < LGW_GPS_MIN_MSG_SIZE {
            serial_buff.copy_within(LGW_GPS_MIN_MSG_SIZE..wr_idx, 0);
            wr_idx -= LGW_GPS_MIN_MSG_SIZE;
        }
    }
    info!("INFO: End of GPS thread");
}
