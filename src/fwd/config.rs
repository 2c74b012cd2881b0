use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::hal::gps::Coord;
use crate::hal::{
    LgwConfDemod, LgwConfRxIf, LgwConfRxrf, LgwConfSx1261, LgwConfigBoard, LgwConfigFtime,
    LgwContext, LgwTxGainLut, BW_125KHZ, TX_GAIN_LUT_SIZE_MAX, LGW_MULTI_NB, LGW_RF_CHAIN_NB,
};

pub const JSON_CONF_DEFAULT: &str = "global_conf.json";
pub const JSON_CONF_LOCAL: &str = "local_conf.json";

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_PORT_UP: u16 = 1780;
pub const DEFAULT_PORT_DW: u16 = 1782;
pub const DEFAULT_KEEPALIVE: i64 = 5;   /* default time interval for downstream keep-alive packet */
pub const DEFAULT_STAT: u64 = 30;       /* default time interval for statistics */
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 100;

pub const DEFAULT_BEACON_FREQ_HZ: u32 = 869_525_000;
pub const DEFAULT_BEACON_FREQ_NB: u8 = 1;
pub const DEFAULT_BEACON_FREQ_STEP: u32 = 0;
pub const DEFAULT_BEACON_DATARATE: u8 = 9;
pub const DEFAULT_BEACON_BW_HZ: u32 = 125_000;
pub const DEFAULT_BEACON_POWER: i8 = 14;
pub const DEFAULT_BEACON_INFODESC: u8 = 0;

/* beacon broadcast parameters */
#[derive(Debug, Clone)]
pub struct BeaconConf {
    pub period: u32,        /* must be a sub-multiple of 86400, the nb of sec in a day */
    pub freq_hz: u32,
    pub freq_nb: u8,
    pub freq_step: u32,
    pub datarate: u8,       /* SF */
    pub bw_hz: u32,
    pub power: i8,
    pub infodesc: u8,
}

/* spectral scan activity parameters */
#[derive(Debug, Clone, Deserialize)]
pub struct SpectralScanConf {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub freq_start: u32,    /* first channel frequency, in Hz */
    #[serde(default)]
    pub nb_chan: u8,        /* number of channels to scan (200kHz between each channel) */
    #[serde(default)]
    pub nb_scan: u16,       /* number of scan points for each frequency scan */
    #[serde(default = "default_pace_s")]
    pub pace_s: u32,        /* number of seconds between 2 scans in the thread */
}

fn default_pace_s() -> u32 {
    10
}

impl Default for SpectralScanConf {
    fn default() -> Self {
        Self { enable: false, freq_start: 0, nb_chan: 0, nb_scan: 0, pace_s: 10 }
    }
}

/* gateway_conf, flattened to runtime form */
#[derive(Debug, Clone)]
pub struct GatewayConf {
    pub gateway_id: u64,
    pub serv_addr: String,
    pub serv_port_up: u16,
    pub serv_port_down: u16,
    pub keepalive_time: i64,    /* send a PULL_DATA request every X seconds, negative = disabled */
    pub stat_interval: u64,
    pub push_timeout_ms: u64,
    pub fwd_valid_pkt: bool,    /* packets with PAYLOAD CRC OK are forwarded */
    pub fwd_error_pkt: bool,    /* packets with PAYLOAD CRC ERROR are forwarded */
    pub fwd_nocrc_pkt: bool,    /* packets with NO PAYLOAD CRC are forwarded */
    pub gps_tty_path: Option<String>,
    pub fake_gps: bool,
    pub ref_coord: Coord,
    pub beacon: BeaconConf,
    pub autoquit_threshold: u32, /* 0 = disabled */
    pub antenna_gain: i8,
}

/* per-chain TX capabilities, extracted from the radio configuration */
#[derive(Debug, Clone)]
pub struct TxCapabilities {
    pub tx_enable: [bool; LGW_RF_CHAIN_NB],
    pub tx_freq_min: [u32; LGW_RF_CHAIN_NB],
    pub tx_freq_max: [u32; LGW_RF_CHAIN_NB],
    pub txlut: [LgwTxGainLut; LGW_RF_CHAIN_NB],
}

#[derive(Debug, Clone)]
pub struct Config {
    pub lgw: LgwContext,
    pub gw: GatewayConf,
    pub tx: TxCapabilities,
    pub spectral_scan: SpectralScanConf,
}

#[derive(Debug, Deserialize)]
struct GatewayConfFile {
    #[serde(rename = "gateway_ID")]
    gateway_id: Option<String>,
    server_address: Option<String>,
    serv_port_up: Option<u16>,
    serv_port_down: Option<u16>,
    keepalive_interval: Option<i64>,
    stat_interval: Option<u64>,
    push_timeout_ms: Option<u64>,
    forward_crc_valid: Option<bool>,
    forward_crc_error: Option<bool>,
    forward_crc_disabled: Option<bool>,
    gps_tty_path: Option<String>,
    fake_gps: Option<bool>,
    ref_latitude: Option<f64>,
    ref_longitude: Option<f64>,
    ref_altitude: Option<i16>,
    beacon_period: Option<u32>,
    beacon_freq_hz: Option<u32>,
    beacon_freq_nb: Option<u8>,
    beacon_freq_step: Option<u32>,
    beacon_datarate: Option<u8>,
    beacon_bw_hz: Option<u32>,
    beacon_power: Option<i8>,
    beacon_infodesc: Option<u8>,
    autoquit_threshold: Option<u32>,
    antenna_gain: Option<i8>,
}

impl Default for GatewayConf {
    fn default() -> Self {
        Self {
            gateway_id: 0,
            serv_addr: DEFAULT_SERVER.to_string(),
            serv_port_up: DEFAULT_PORT_UP,
            serv_port_down: DEFAULT_PORT_DW,
            keepalive_time: DEFAULT_KEEPALIVE,
            stat_interval: DEFAULT_STAT,
            push_timeout_ms: DEFAULT_PUSH_TIMEOUT_MS,
            fwd_valid_pkt: true,
            fwd_error_pkt: false,
            fwd_nocrc_pkt: false,
            gps_tty_path: None,
            fake_gps: false,
            ref_coord: Coord::default(),
            beacon: BeaconConf {
                period: 0,
                freq_hz: DEFAULT_BEACON_FREQ_HZ,
                freq_nb: DEFAULT_BEACON_FREQ_NB,
                freq_step: DEFAULT_BEACON_FREQ_STEP,
                datarate: DEFAULT_BEACON_DATARATE,
                bw_hz: DEFAULT_BEACON_BW_HZ,
                power: DEFAULT_BEACON_POWER,
                infodesc: DEFAULT_BEACON_INFODESC,
            },
            autoquit_threshold: 0,
            antenna_gain: 0,
        }
    }
}

impl GatewayConf {
    fn apply(&mut self, file: GatewayConfFile) -> Result<()> {
        if let Some(id) = file.gateway_id {
            self.gateway_id = u64::from_str_radix(&id, 16)
                .with_context(|| format!("invalid gateway_ID {}", id))?;
            info!("INFO: gateway MAC address is configured to {:016X}", self.gateway_id);
        }
        if let Some(addr) = file.server_address {
            self.serv_addr = addr;
            info!("INFO: server hostname or IP address is configured to \"{}\"", self.serv_addr);
        }
        if let Some(port) = file.serv_port_up {
            self.serv_port_up = port;
        }
        if let Some(port) = file.serv_port_down {
            self.serv_port_down = port;
        }
        if let Some(keepalive) = file.keepalive_interval {
            self.keepalive_time = keepalive;
            info!("INFO: downstream keep-alive interval is configured to {} seconds", keepalive);
        }
        if let Some(stat) = file.stat_interval {
            self.stat_interval = stat;
        }
        if let Some(timeout) = file.push_timeout_ms {
            self.push_timeout_ms = timeout;
        }
        if let Some(v) = file.forward_crc_valid {
            self.fwd_valid_pkt = v;
        }
        if let Some(v) = file.forward_crc_error {
            self.fwd_error_pkt = v;
        }
        if let Some(v) = file.forward_crc_disabled {
            self.fwd_nocrc_pkt = v;
        }
        if let Some(path) = file.gps_tty_path {
            info!("INFO: GPS serial port path is configured to \"{}\"", path);
            self.gps_tty_path = Some(path);
        }
        if let Some(v) = file.fake_gps {
            self.fake_gps = v;
        }
        if let Some(lat) = file.ref_latitude {
            self.ref_coord.lat = lat;
        }
        if let Some(lon) = file.ref_longitude {
            self.ref_coord.lon = lon;
        }
        if let Some(alt) = file.ref_altitude {
            self.ref_coord.alt = alt;
        }
        if let Some(period) = file.beacon_period {
            if period > 0 && (period < 6 || 86400 % period != 0) {
                return Err(anyhow!(
                    "invalid beacon_period {} (must divide 86400)",
                    period
                ));
            }
            self.beacon.period = period;
        }
        if let Some(v) = file.beacon_freq_hz {
            self.beacon.freq_hz = v;
        }
        if let Some(v) = file.beacon_freq_nb {
            self.beacon.freq_nb = v;
        }
        if let Some(v) = file.beacon_freq_step {
            self.beacon.freq_step = v;
        }
        if let Some(v) = file.beacon_datarate {
            self.beacon.datarate = v;
        }
        if let Some(v) = file.beacon_bw_hz {
            self.beacon.bw_hz = v;
        }
        if let Some(v) = file.beacon_power {
            self.beacon.power = v;
        }
        if let Some(v) = file.beacon_infodesc {
            self.beacon.infodesc = v;
        }
        if let Some(v) = file.autoquit_threshold {
            self.autoquit_threshold = v;
        }
        if let Some(v) = file.antenna_gain {
            self.antenna_gain = v;
        }
        Ok(())
    }
}

fn parse_sx130x_conf(root: &Value) -> Result<(LgwContext, TxCapabilities, SpectralScanConf)> {
    let conf_obj = root
        .get("SX130x_conf")
        .ok_or_else(|| anyhow!("no \"SX130x_conf\" object in configuration"))?;

    let mut ctx = LgwContext::default();
    let mut tx = TxCapabilities {
        tx_enable: [false; LGW_RF_CHAIN_NB],
        tx_freq_min: [0; LGW_RF_CHAIN_NB],
        tx_freq_max: [0; LGW_RF_CHAIN_NB],
        txlut: [LgwTxGainLut::default(); LGW_RF_CHAIN_NB],
    };

    /* set board configuration */
    ctx.board_cfg = serde_json::from_value::<LgwConfigBoard>(conf_obj.clone())
        .context("invalid board configuration in SX130x_conf")?;
    info!(
        "INFO: com_type {:?}, com_path {}, lorawan_public {}, clksrc {}, full_duplex {}",
        ctx.board_cfg.com_type,
        ctx.board_cfg.com_path,
        ctx.board_cfg.lorawan_public,
        ctx.board_cfg.clksrc,
        ctx.board_cfg.full_duplex
    );

    /* set fine timestamp configuration */
    if let Some(ts_obj) = conf_obj.get("fine_timestamp") {
        ctx.ftime_cfg = serde_json::from_value::<LgwConfigFtime>(ts_obj.clone())
            .context("invalid fine_timestamp configuration")?;
        info!(
            "INFO: Fine timestamp is {}",
            if ctx.ftime_cfg.enable { "enabled" } else { "disabled" }
        );
    }

    /* set configuration for RF chains */
    for i in 0..LGW_RF_CHAIN_NB {
        let key = format!("radio_{}", i);
        let radio_obj = match conf_obj.get(&key) {
            Some(v) => v,
            None => {
                info!("INFO: no configuration for radio {}", i);
                continue;
            }
        };
        let rfconf = serde_json::from_value::<LgwConfRxrf>(radio_obj.clone())
            .with_context(|| format!("invalid configuration for radio {}", i))?;
        if rfconf.enable {
            info!(
                "INFO: radio {} enabled ({}), center frequency {}, RSSI offset {}, tx enabled {}",
                i, rfconf._type, rfconf.freq_hz, rfconf.rssi_offset, rfconf.tx_enable
            );
        } else {
            info!("INFO: radio {} disabled", i);
        }
        tx.tx_enable[i] = rfconf.enable && rfconf.tx_enable;
        tx.tx_freq_min[i] = rfconf.tx_freq_min;
        tx.tx_freq_max[i] = rfconf.tx_freq_max;
        if tx.tx_enable[i] && (rfconf.tx_freq_min == 0 || rfconf.tx_freq_max == 0) {
            warn!("WARNING: no TX frequency range set for radio {}", i);
        }
        if let Some(ref lut) = rfconf.tx_gain_lut {
            if lut.is_empty() || lut.len() > TX_GAIN_LUT_SIZE_MAX {
                return Err(anyhow!("invalid TX gain LUT size {} for radio {}", lut.len(), i));
            }
            tx.txlut[i].size = lut.len();
            tx.txlut[i].lut[..lut.len()].copy_from_slice(lut);
            ctx.tx_gain_lut[i] = tx.txlut[i];
        } else if tx.tx_enable[i] {
            warn!("WARNING: no TX gain LUT defined for radio {}", i);
        }
        ctx.rf_chain_cfg[i] = rfconf;
    }

    /* set configuration for LoRa multi-SF channels (bandwidth cannot be set) */
    let mut multisf_datarate: u8 = 0;
    for i in 0..LGW_MULTI_NB {
        let key = format!("chan_multiSF_{}", i);
        let chan_obj = match conf_obj.get(&key) {
            Some(v) => v,
            None => {
                info!("INFO: no configuration for Lora multi-SF channel {}", i);
                continue;
            }
        };
        let mut ifconf = serde_json::from_value::<LgwConfRxIf>(chan_obj.clone())
            .with_context(|| format!("invalid configuration for Lora multi-SF channel {}", i))?;
        if ifconf.enable {
            ifconf.bandwidth = BW_125KHZ;
            info!(
                "INFO: Lora multi-SF channel {}> radio {}, IF {} Hz, 125 kHz bw, SF 5 to 12",
                i, ifconf.rf_chain, ifconf.freq_hz
            );
        } else {
            info!("INFO: Lora multi-SF channel {} disabled", i);
        }
        ctx.if_chain_cfg[i] = ifconf;
    }
    /* set demodulation SF bitmask from the multi-SF enable list */
    if let Some(demod_obj) = conf_obj.get("chan_multiSF_All") {
        if let Some(sfs) = demod_obj.get("spreading_factor_enable").and_then(Value::as_array) {
            for sf in sfs.iter().filter_map(Value::as_u64) {
                if (5..=12).contains(&sf) {
                    multisf_datarate |= 1 << (sf - 5);
                }
            }
        }
    }
    if multisf_datarate == 0 {
        multisf_datarate = 0xFF; /* all spreading factors enabled */
    }
    ctx.demod_cfg = LgwConfDemod { multisf_datarate };

    /* set configuration for Lora standard channel */
    match conf_obj.get("chan_Lora_std") {
        Some(chan_obj) => {
            let ifconf = serde_json::from_value::<LgwConfRxIf>(chan_obj.clone())
                .context("invalid configuration for Lora standard channel")?;
            if ifconf.enable {
                info!(
                    "INFO: Lora std channel> radio {}, IF {} Hz, SF {}",
                    ifconf.rf_chain, ifconf.freq_hz, ifconf.datarate
                );
            } else {
                info!("INFO: Lora standard channel disabled");
            }
            ctx.lora_service_cfg = ifconf;
            ctx.if_chain_cfg[8] = ifconf;
        }
        None => info!("INFO: no configuration for Lora standard channel"),
    }

    /* set configuration for FSK channel */
    match conf_obj.get("chan_FSK") {
        Some(chan_obj) => {
            let ifconf = serde_json::from_value::<LgwConfRxIf>(chan_obj.clone())
                .context("invalid configuration for FSK channel")?;
            if ifconf.enable {
                info!(
                    "INFO: FSK channel> radio {}, IF {} Hz, {} bps datarate",
                    ifconf.rf_chain, ifconf.freq_hz, ifconf.datarate
                );
            } else {
                info!("INFO: FSK channel disabled");
            }
            ctx.fsk_cfg = ifconf;
            ctx.if_chain_cfg[9] = ifconf;
        }
        None => info!("INFO: no configuration for FSK channel"),
    }

    /* SX1261 radio and its spectral scan */
    let mut scan_conf = SpectralScanConf::default();
    if let Some(sx1261_obj) = conf_obj.get("sx1261_conf") {
        ctx.sx1261_cfg = serde_json::from_value::<LgwConfSx1261>(sx1261_obj.clone())
            .context("invalid sx1261_conf")?;
        if let Some(scan_obj) = sx1261_obj.get("spectral_scan") {
            scan_conf = serde_json::from_value::<SpectralScanConf>(scan_obj.clone())
                .context("invalid spectral_scan configuration")?;
            if scan_conf.enable {
                info!(
                    "INFO: spectral scan enabled: start {} Hz, {} channels, {} points, pace {} s",
                    scan_conf.freq_start, scan_conf.nb_chan, scan_conf.nb_scan, scan_conf.pace_s
                );
            }
        }
        if sx1261_obj.get("lbt").and_then(|l| l.get("enable")).and_then(Value::as_bool)
            == Some(true)
        {
            warn!("WARNING: listen-before-talk is not supported, ignoring lbt configuration");
        }
    }

    Ok((ctx, tx, scan_conf))
}

fn parse_gateway_conf(root: &Value, gw: &mut GatewayConf) -> Result<()> {
    match root.get("gateway_conf") {
        Some(conf_obj) => {
            let file: GatewayConfFile = serde_json::from_value(conf_obj.clone())
                .context("invalid gateway_conf object")?;
            gw.apply(file)
        }
        None => {
            info!("INFO: no \"gateway_conf\" object, keeping defaults");
            Ok(())
        }
    }
}

fn parse_debug_conf(root: &Value) {
    if let Some(conf_obj) = root.get("debug_conf") {
        if let Some(log_file) = conf_obj.get("log_file").and_then(Value::as_str) {
            info!("INFO: debug log file is configured to {}", log_file);
        }
        if let Some(payloads) = conf_obj.get("ref_payload").and_then(Value::as_array) {
            info!("INFO: {} debug reference payload(s) configured", payloads.len());
        }
    }
}

/**
@brief Load the global configuration file, then overlay gateway_conf from
local_conf.json when present.
*/
pub fn load(conf_path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(conf_path)
        .with_context(|| format!("failed to read configuration file {}", conf_path))?;
    let root: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid JSON file", conf_path))?;
    info!("INFO: found configuration file {}, parsing it", conf_path);

    let (lgw, tx, spectral_scan) = parse_sx130x_conf(&root)?;

    let mut gw = GatewayConf::default();
    parse_gateway_conf(&root, &mut gw)?;
    parse_debug_conf(&root);

    /* overlay the local configuration if there is one */
    if Path::new(JSON_CONF_LOCAL).exists() {
        info!("INFO: found configuration file {}, parsing it", JSON_CONF_LOCAL);
        let text = std::fs::read_to_string(JSON_CONF_LOCAL)?;
        let local: Value = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid JSON file", JSON_CONF_LOCAL))?;
        parse_gateway_conf(&local, &mut gw)?;
    }

    Ok(Config { lgw, gw, tx, spectral_scan })
}

/* parse from an in-memory JSON document (tests, embedded defaults) */
pub fn from_json(root: &Value) -> Result<Config> {
    let (lgw, tx, spectral_scan) = parse_sx130x_conf(root)?;
    let mut gw = GatewayConf::default();
    parse_gateway_conf(root, &mut gw)?;
    Ok(Config { lgw, gw, tx, spectral_scan })
}
