use std::time::Instant;

use tracing::{error, info};

use crate::hal::LgwSpectralScanStatus::{
    LGW_SPECTRAL_SCAN_STATUS_ABORTED, LGW_SPECTRAL_SCAN_STATUS_COMPLETED,
};
use crate::hal::{TX_EMITTING, TX_SCHEDULED};

use super::{wait_ms, Gateway};

const SCAN_POLL_MS: u64 = 10;
const SCAN_TIMEOUT_MS: u128 = 2000;
const SCAN_CHANNEL_STEP_HZ: u32 = 200_000; /* 200kHz channels */

/**
@brief Background spectral scan: sweep the configured channels whenever no
TX is scheduled or emitting on any TX-enabled chain.
*/
pub fn thread_spectral_scan(gw: &Gateway) {
    let params = &gw.cfg.spectral_scan;
    let mut freq_hz = params.freq_start;
    let freq_hz_stop = params.freq_start + params.nb_chan as u32 * SCAN_CHANNEL_STEP_HZ;

    while gw.running() {
        /* Pace the scan thread (1 sec min), and avoid waiting several seconds when exit */
        for _ in 0..params.pace_s.max(1) {
            if !gw.running() {
                info!("INFO: End of Spectral Scan thread");
                return;
            }
            wait_ms(1000);
        }

        /* Start spectral scan (if no downlink programmed) */
        let scan_started = {
            let mut concentrator = gw.concentrator.lock().unwrap();

            /* -- Check if there is a downlink programmed */
            let mut tx_busy = false;
            for (i, enabled) in gw.cfg.tx.tx_enable.iter().enumerate() {
                if !enabled {
                    continue;
                }
                match concentrator.lgw_status(i as u8) {
                    Err(e) => error!("ERROR: failed to get TX status on chain {} ({})", i, e),
                    Ok(status) if status == TX_SCHEDULED || status == TX_EMITTING => {
                        info!("INFO: skip spectral scan (downlink programmed on RF chain {})", i);
                        tx_busy = true;
                        break;
                    }
                    Ok(_) => {}
                }
            }

            if tx_busy {
                false
            } else {
                match concentrator.lgw_spectral_scan_start(freq_hz, params.nb_scan) {
                    Ok(()) => true,
                    Err(e) => {
                        error!("ERROR: spectral scan start failed ({})", e);
                        false
                    }
                }
            }
        };
        if !scan_started {
            continue;
        }

        /* Wait for scan to be completed */
        let started = Instant::now();
        let status = loop {
            /* handle timeout */
            if started.elapsed().as_millis() > SCAN_TIMEOUT_MS {
                error!("ERROR: TIMEOUT on Spectral Scan");
                break None;
            }

            /* get spectral scan status */
            let status = {
                let mut concentrator = gw.concentrator.lock().unwrap();
                concentrator.lgw_spectral_scan_get_status()
            };
            match status {
                Err(e) => {
                    error!("ERROR: spectral scan status failed ({})", e);
                    break None;
                }
                Ok(status)
                    if status == LGW_SPECTRAL_SCAN_STATUS_COMPLETED
                        || status == LGW_SPECTRAL_SCAN_STATUS_ABORTED =>
                {
                    break Some(status);
                }
                Ok(_) => {}
            }

            /* wait a bit before checking status again */
            wait_ms(SCAN_POLL_MS);
        };

        match status {
            Some(LGW_SPECTRAL_SCAN_STATUS_COMPLETED) => {
                /* Get spectral scan results */
                let results = {
                    let mut concentrator = gw.concentrator.lock().unwrap();
                    concentrator.lgw_spectral_scan_get_results()
                };
                match results {
                    Err(e) => {
                        error!("ERROR: spectral scan get results failed ({})", e);
                        continue;
                    }
                    Ok((_levels, results)) => {
                        let histogram: Vec<String> =
                            results.iter().map(|r| r.to_string()).collect();
                        info!("SPECTRAL SCAN - {} Hz: {}", freq_hz, histogram.join(" "));
                    }
                }

                /* Next frequency to scan */
                freq_hz += SCAN_CHANNEL_STEP_HZ;
                if freq_hz >= freq_hz_stop {
                    freq_hz = params.freq_start;
                }
            }
            Some(LGW_SPECTRAL_SCAN_STATUS_ABORTED) => {
                info!("INFO: spectral scan has been aborted");
            }
            Some(status) => {
                error!("ERROR: spectral scan status is unexpected {:?}", status);
            }
            None => {}
        }
    }
    info!("INFO: End of Spectral Scan thread");
}
