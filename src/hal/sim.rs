use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{debug, error, info, warn};

use super::error::Error;
use super::toa::lgw_time_on_air;
use super::{
    is_fsk_dr, is_lora_bw, is_lora_cr, is_lora_dr, LgwContext, LgwHal, LgwPktRx, LgwPktTx,
    LgwSpectralScanStatus, Modulation, TxMode, LGW_RF_CHAIN_NB, LGW_SPECTRAL_SCAN_RESULT_SIZE,
    TX_EMITTING, TX_FREE, TX_SCHEDULED,
};

const SIM_EUI: u64 = 0x0016C001_F00FBEEF;
const SIM_TEMPERATURE: f32 = 27.5;

/* simulated scan completes after this much wall time */
const SCAN_DURATION: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct ProgrammedTx {
    count_us: u32,
    toa_us: u32,
}

struct SimState {
    started: bool,
    t0: Instant,
    ctx: LgwContext,
    rx_fifo: VecDeque<LgwPktRx>,
    tx_programmed: [Option<ProgrammedTx>; LGW_RF_CHAIN_NB],
    tx_log: Vec<LgwPktTx>,
    scan: Option<(u32, Instant)>,
    scan_status: LgwSpectralScanStatus,
}

impl SimState {
    fn counter(&self) -> u32 {
        self.t0.elapsed().as_micros() as u32
    }
}

/**
@struct SimConcentrator
@brief Software concentrator: a free-running microsecond counter with an
injectable RX FIFO and a per-chain TX status model. Clones share state, so a
test can keep a handle while the gateway owns the boxed device.
*/
#[derive(Clone)]
pub struct SimConcentrator {
    state: Arc<Mutex<SimState>>,
}

impl SimConcentrator {
    pub fn new(ctx: LgwContext) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                started: false,
                t0: Instant::now(),
                ctx,
                rx_fifo: VecDeque::new(),
                tx_programmed: [None; LGW_RF_CHAIN_NB],
                tx_log: Vec::new(),
                scan: None,
                scan_status: LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_NONE,
            })),
        }
    }

    /* push a frame into the RX FIFO, as if the modem had demodulated it */
    pub fn inject_rx(&self, pkt: LgwPktRx) {
        self.state.lock().unwrap().rx_fifo.push_back(pkt);
    }

    /* packets handed to lgw_send so far */
    pub fn tx_log(&self) -> Vec<LgwPktTx> {
        self.state.lock().unwrap().tx_log.clone()
    }

    pub fn clear_tx_log(&self) {
        self.state.lock().unwrap().tx_log.clear();
    }
}

impl LgwHal for SimConcentrator {
    fn lgw_start(&mut self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.started {
            return Ok(());
        }
        s.t0 = Instant::now();
        s.started = true;
        info!("INFO: simulated concentrator started (EUI 0x{:016X})", SIM_EUI);
        Ok(())
    }

    fn lgw_stop(&mut self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if !s.started {
            info!("Note: LoRa concentrator was not started...");
            return Ok(());
        }
        s.started = false;
        s.rx_fifo.clear();
        s.tx_programmed = [None; LGW_RF_CHAIN_NB];
        Ok(())
    }

    fn lgw_receive(&mut self, max_pkt: usize) -> Result<Vec<LgwPktRx>> {
        let mut s = self.state.lock().unwrap();
        if !s.started {
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        let mut pkts = Vec::new();
        while pkts.len() < max_pkt {
            match s.rx_fifo.pop_front() {
                Some(mut pkt) => {
                    let rssi_offset = s.ctx.rf_chain_cfg[pkt.rf_chain as usize].rssi_offset;
                    pkt.rssic += rssi_offset;
                    pkt.rssis += rssi_offset;
                    pkts.push(pkt)
                }
                None => break,
            }
        }
        Ok(pkts)
    }

    fn lgw_send(&mut self, pkt_data: &LgwPktTx) -> Result<()> {
        let mut s = self.state.lock().unwrap();

        /* check if the concentrator is running */
        if !s.started {
            error!("ERROR: CONCENTRATOR IS NOT RUNNING, START IT BEFORE SENDING");
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }

        /* check input range (segfault prevention) */
        if pkt_data.rf_chain as usize >= LGW_RF_CHAIN_NB {
            error!("ERROR: INVALID RF_CHAIN TO SEND PACKETS");
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }

        /* check input variables */
        if !s.ctx.rf_chain_cfg[pkt_data.rf_chain as usize].tx_enable {
            error!("ERROR: SELECTED RF_CHAIN IS DISABLED FOR TX ON SELECTED BOARD");
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        if !s.ctx.rf_chain_cfg[pkt_data.rf_chain as usize].enable {
            error!("ERROR: SELECTED RF_CHAIN IS DISABLED");
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }

        match pkt_data.modulation {
            Modulation::LORA => {
                if !is_lora_bw(pkt_data.bandwidth) {
                    error!("ERROR: BANDWIDTH NOT SUPPORTED BY LORA TX");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
                if !is_lora_dr(pkt_data.datarate) {
                    error!("ERROR: DATARATE NOT SUPPORTED BY LORA TX");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
                if !is_lora_cr(pkt_data.coderate) {
                    error!("ERROR: CODERATE NOT SUPPORTED BY LORA TX");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
                if pkt_data.size > 255 {
                    error!("ERROR: PAYLOAD LENGTH TOO BIG FOR LORA TX");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
            }
            Modulation::FSK => {
                if pkt_data.f_dev < 1 || pkt_data.f_dev > 200 {
                    error!("ERROR: TX FREQUENCY DEVIATION OUT OF ACCEPTABLE RANGE");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
                if !is_fsk_dr(pkt_data.datarate) {
                    error!("ERROR: DATARATE NOT SUPPORTED BY FSK IF CHAIN");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
                if pkt_data.size > 255 {
                    error!("ERROR: PAYLOAD LENGTH TOO BIG FOR FSK TX");
                    return Err(anyhow!(Error::LGW_HAL_ERROR));
                }
            }
            Modulation::CW => { /* do nothing */ }
            _ => {
                error!("ERROR: INVALID TX MODULATION");
                return Err(anyhow!(Error::LGW_HAL_ERROR));
            }
        }

        let toa_us = lgw_time_on_air(pkt_data).unwrap_or(0);
        let count_us = match pkt_data.tx_mode {
            TxMode::IMMEDIATE => s.counter(),
            TxMode::TIMESTAMPED | TxMode::ON_GPS => pkt_data.count_us,
        };
        s.tx_programmed[pkt_data.rf_chain as usize] = Some(ProgrammedTx { count_us, toa_us });
        s.tx_log.push(*pkt_data);
        debug!(
            "sim: TX programmed on rf_chain {} at count_us={} (toa {} us)",
            pkt_data.rf_chain, count_us, toa_us
        );
        Ok(())
    }

    fn lgw_status(&mut self, rf_chain: u8) -> Result<u8> {
        let mut s = self.state.lock().unwrap();
        if rf_chain as usize >= LGW_RF_CHAIN_NB {
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        let now = s.counter();
        match s.tx_programmed[rf_chain as usize] {
            None => Ok(TX_FREE),
            Some(tx) => {
                let since_start = now.wrapping_sub(tx.count_us) as i32;
                if since_start < 0 {
                    Ok(TX_SCHEDULED)
                } else if (since_start as u32) <= tx.toa_us {
                    Ok(TX_EMITTING)
                } else {
                    s.tx_programmed[rf_chain as usize] = None;
                    Ok(TX_FREE)
                }
            }
        }
    }

    fn lgw_get_instcnt(&mut self) -> Result<u32> {
        let s = self.state.lock().unwrap();
        if !s.started {
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        Ok(s.counter())
    }

    fn lgw_get_trigcnt(&mut self) -> Result<u32> {
        let s = self.state.lock().unwrap();
        if !s.started {
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        /* PPS latched on whole seconds of the simulated clock */
        let elapsed = s.t0.elapsed();
        Ok(s.counter().wrapping_sub(elapsed.subsec_micros()))
    }

    fn lgw_get_eui(&mut self) -> Result<u64> {
        Ok(SIM_EUI)
    }

    fn lgw_get_temperature(&mut self) -> Result<f32> {
        Ok(SIM_TEMPERATURE)
    }

    fn lgw_spectral_scan_start(&mut self, freq_hz: u32, _nb_scan: u16) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if !s.started {
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        s.scan = Some((freq_hz, Instant::now()));
        s.scan_status = LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_ON_GOING;
        Ok(())
    }

    fn lgw_spectral_scan_get_status(&mut self) -> Result<LgwSpectralScanStatus> {
        let mut s = self.state.lock().unwrap();
        if let Some((_, started)) = s.scan {
            if s.scan_status == LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_ON_GOING
                && started.elapsed() >= SCAN_DURATION
            {
                s.scan_status = LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_COMPLETED;
            }
        }
        Ok(s.scan_status)
    }

    fn lgw_spectral_scan_get_results(
        &mut self,
    ) -> Result<([i16; LGW_SPECTRAL_SCAN_RESULT_SIZE], [u16; LGW_SPECTRAL_SCAN_RESULT_SIZE])> {
        let mut s = self.state.lock().unwrap();
        if s.scan_status != LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_COMPLETED {
            warn!("WARNING: spectral scan results read before completion");
            return Err(anyhow!(Error::LGW_HAL_ERROR));
        }
        let mut levels = [0i16; LGW_SPECTRAL_SCAN_RESULT_SIZE];
        let mut results = [0u16; LGW_SPECTRAL_SCAN_RESULT_SIZE];
        for (i, level) in levels.iter_mut().enumerate() {
            /* -142 dBm .. -78 dBm buckets, noise floor shape */
            *level = -142 + 2 * i as i16;
            results[i] = if i < 8 { 100 - 10 * i as u16 } else { 0 };
        }
        s.scan = None;
        s.scan_status = LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_NONE;
        Ok((levels, results))
    }

    fn lgw_spectral_scan_abort(&mut self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.scan.take().is_some() {
            s.scan_status = LgwSpectralScanStatus::LGW_SPECTRAL_SCAN_STATUS_ABORTED;
        }
        Ok(())
    }
}
