
pub mod error;
pub mod gps;
pub mod sim;
pub mod toa;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

use self::error::Error;

/* radio-specific parameters */
pub const LGW_RF_CHAIN_NB: usize = 2;       /* number of RF chains */

/* concentrator chipset-specific parameters */
pub const LGW_IF_CHAIN_NB: usize = 10;      /* number of IF+modem RX chains */
pub const LGW_MULTI_NB: usize = 8;          /* number of LoRa 'multi SF' chains */

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum Modulation {
    UNDEFINED   = 0,
    CW          = 0x08,
    LORA        = 0x10,
    FSK         = 0x20,
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modulation::UNDEFINED => write!(f, "Undefined"),
            Modulation::CW => write!(f, "CW"),
            Modulation::LORA => write!(f, "LoRa"),
            Modulation::FSK => write!(f, "FSK"),
        }
    }
}

/* values available for the 'bandwidth' parameters (LoRa & FSK) */
pub const BW_UNDEFINED: u8 = 0;
pub const BW_500KHZ: u8 = 0x06;
pub const BW_250KHZ: u8 = 0x05;
pub const BW_125KHZ: u8 = 0x04;

/* values available for the 'datarate' parameters */
pub const DR_UNDEFINED: u32 = 0;
pub const DR_LORA_SF5: u32 = 5;
pub const DR_LORA_SF6: u32 = 6;
pub const DR_LORA_SF7: u32 = 7;
pub const DR_LORA_SF8: u32 = 8;
pub const DR_LORA_SF9: u32 = 9;
pub const DR_LORA_SF10: u32 = 10;
pub const DR_LORA_SF11: u32 = 11;
pub const DR_LORA_SF12: u32 = 12;
pub const DR_FSK_MIN: u32 = 500;
pub const DR_FSK_MAX: u32 = 250000;

/* values available for the 'coderate' parameters (LoRa only) */
/* NOTE: arbitrary values */
pub const CR_UNDEFINED: u8 = 0;     /* CR0 exists but is not recommended, so consider it as invalid */
pub const CR_LORA_4_5: u8 = 0x01;
pub const CR_LORA_4_6: u8 = 0x02;
pub const CR_LORA_4_7: u8 = 0x03;
pub const CR_LORA_4_8: u8 = 0x04;

pub const STAT_UNDEFINED: u8 = 0x00;
pub const STAT_NO_CRC: u8 = 0x01;
pub const STAT_CRC_BAD: u8 = 0x11;
pub const STAT_CRC_OK: u8 = 0x10;

/* status code for TX_STATUS */
/* NOTE: arbitrary values */
pub const TX_STATUS_UNKNOWN: u8 = 0;
pub const TX_OFF: u8 = 1;           /* TX modem disabled, it will ignore commands */
pub const TX_FREE: u8 = 2;          /* TX modem is free, ready to receive a command */
pub const TX_SCHEDULED: u8 = 3;     /* TX modem is loaded, ready to send the packet after an event and/or delay */
pub const TX_EMITTING: u8 = 4;      /* TX modem is emitting */

/* Spectral Scan */
pub const LGW_SPECTRAL_SCAN_RESULT_SIZE: usize = 33; /* number of results returned by the spectral scan */

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum LgwSpectralScanStatus {
    LGW_SPECTRAL_SCAN_STATUS_NONE,
    LGW_SPECTRAL_SCAN_STATUS_ON_GOING,
    LGW_SPECTRAL_SCAN_STATUS_ABORTED,
    LGW_SPECTRAL_SCAN_STATUS_COMPLETED,
    LGW_SPECTRAL_SCAN_STATUS_UNKNOWN,
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum TxMode {
    IMMEDIATE = 0,
    TIMESTAMPED = 1,
    ON_GPS = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum LgwComType {
    #[serde(rename = "SPI", alias = "spi")]
    LGW_COM_SPI,
    #[serde(rename = "USB", alias = "usb")]
    LGW_COM_USB,
    #[serde(rename = "SIM", alias = "sim")]
    LGW_COM_SIM,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum LgwRadioType {
    #[serde(rename = "NONE")]
    LGW_RADIO_TYPE_NONE,
    #[serde(rename = "SX1255")]
    LGW_RADIO_TYPE_SX1255,
    #[serde(rename = "SX1257")]
    LGW_RADIO_TYPE_SX1257,
    #[serde(rename = "SX1250")]
    LGW_RADIO_TYPE_SX1250,
}

impl std::fmt::Display for LgwRadioType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LgwRadioType::LGW_RADIO_TYPE_NONE => write!(f, "None"),
            LgwRadioType::LGW_RADIO_TYPE_SX1255 => write!(f, "SX1255"),
            LgwRadioType::LGW_RADIO_TYPE_SX1257 => write!(f, "SX1257"),
            LgwRadioType::LGW_RADIO_TYPE_SX1250 => write!(f, "SX1250"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LgwConfRxrf {
    pub enable: bool,               //* enable or disable that RF chain */
    #[serde(rename = "freq")]
    pub freq_hz: u32,               //* center frequency of the radio in Hz */
    #[serde(default)]
    pub rssi_offset: f32,           //* Board-specific RSSI correction factor */
    #[serde(rename = "type", default = "default_radio_type")]
    pub _type: LgwRadioType,        //* Radio type for that RF chain (SX1250, SX1257....) */
    #[serde(default)]
    pub tx_enable: bool,            //* enable or disable TX on that RF chain */
    #[serde(default)]
    pub single_input_mode: bool,    //* Configure the radio in single or differential input mode (SX1250 only) */
    #[serde(default)]
    pub tx_freq_min: u32,           //* lowest frequency supported by that TX chain */
    #[serde(default)]
    pub tx_freq_max: u32,           //* highest frequency supported by that TX chain */
    #[serde(default)]
    pub tx_gain_lut: Option<Vec<LgwTxGain>>,
}

fn default_radio_type() -> LgwRadioType {
    LgwRadioType::LGW_RADIO_TYPE_SX1250
}

impl Default for LgwConfRxrf {
    fn default() -> Self {
        Self {
            enable: false,
            freq_hz: 0,
            rssi_offset: 0.0,
            _type: LgwRadioType::LGW_RADIO_TYPE_SX1250,
            tx_enable: false,
            single_input_mode: false,
            tx_freq_min: 0,
            tx_freq_max: 0,
            tx_gain_lut: None,
        }
    }
}

/**
@struct LgwConfRxIf
@brief Configuration structure for an IF chain
*/
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LgwConfRxIf {
    pub enable: bool,               //* enable or disable that IF chain */
    #[serde(rename = "radio", default)]
    pub rf_chain: u8,               //* to which RF chain is that IF chain associated */
    #[serde(rename = "if", default)]
    pub freq_hz: i32,               //* center frequ of the IF chain, relative to RF chain frequency */
    #[serde(default, with = "bandwidth_serde")]
    pub bandwidth: u8,              //* RX bandwidth, 0 for default */
    #[serde(default, alias = "spread_factor")]
    pub datarate: u32,              //* RX datarate (SF for LoRa, bps for FSK), 0 for default */
    #[serde(default)]
    pub implicit_hdr: bool,         //* LoRa Service implicit header */
    #[serde(default)]
    pub implicit_payload_length: u8,
    #[serde(default)]
    pub implicit_crc_en: bool,
    #[serde(default)]
    pub implicit_coderate: u8,
}

impl Default for LgwConfRxIf {
    fn default() -> Self {
        Self {
            enable: false,
            rf_chain: 0,
            freq_hz: 0,
            bandwidth: BW_UNDEFINED,
            datarate: 0,
            implicit_hdr: false,
            implicit_payload_length: 0,
            implicit_crc_en: false,
            implicit_coderate: 0,
        }
    }
}

mod bandwidth_serde {
    use std::fmt;

    use serde::de;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::hal::{BW_125KHZ, BW_250KHZ, BW_500KHZ, BW_UNDEFINED};

    pub fn serialize<S>(value: &u8, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let v: u32 = match *value {
            BW_125KHZ => 125000,
            BW_250KHZ => 250000,
            BW_500KHZ => 500000,
            _ => 0,
        };
        serializer.serialize_u32(v)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BandwidthVisitor;

        impl<'de> de::Visitor<'de> for BandwidthVisitor {
            type Value = u8;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a u32 value of 500000, 250000, 125000, or null")
            }

            fn visit_u32<E>(self, value: u32) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    500000 => Ok(BW_500KHZ),
                    250000 => Ok(BW_250KHZ),
                    125000 => Ok(BW_125KHZ),
                    0 => Ok(BW_UNDEFINED),
                    _ => Err(de::Error::custom(format!("Invalid bandwidth value: {}", value))),
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_u32(value as u32)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(BW_UNDEFINED)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                self.visit_u32(Deserialize::deserialize(deserializer)?)
            }
        }

        deserializer.deserialize_option(BandwidthVisitor)
    }
}

pub const TX_GAIN_LUT_SIZE_MAX: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LgwTxGain {
    pub rf_power: i8,       //* measured TX power at the board connector, in dBm */
    #[serde(default)]
    pub dig_gain: u8,       //* (sx125x) 2 bits: control of the digital gain of SX1302 */
    #[serde(default)]
    pub pa_gain: u8,        //* external PA control (SX1302 I/O) */
    #[serde(default)]
    pub dac_gain: u8,       //* (sx125x) 2 bits: control of the radio DAC */
    #[serde(default = "default_mix_gain")]
    pub mix_gain: u8,       //* (sx125x) 4 bits: control of the radio mixer */
    #[serde(default)]
    pub pwr_idx: u8,        //* (sx1250) 6 bits: control the radio power index to be used for configuration */
}

fn default_mix_gain() -> u8 {
    8
}

impl Default for LgwTxGain {
    fn default() -> Self {
        Self {
            rf_power: 0,
            dig_gain: 0,
            pa_gain: 0,
            dac_gain: 0,
            mix_gain: 8,
            pwr_idx: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LgwTxGainLut {
    pub lut: [LgwTxGain; TX_GAIN_LUT_SIZE_MAX],     //* Array of Tx gain struct */
    pub size: usize,                                //* Number of LUT indexes */
}

impl Default for LgwTxGainLut {
    fn default() -> Self {
        Self {
            lut: [Default::default(); TX_GAIN_LUT_SIZE_MAX],
            size: 0,
        }
    }
}

/**
@struct LgwConfigBoard
@brief Configuration structure for board specificities
*/
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LgwConfigBoard {
    pub lorawan_public: bool,       //* Enable ONLY for *public* networks using the LoRa MAC protocol */
    pub clksrc: u8,                 //* Index of RF chain which provides clock to concentrator */
    #[serde(default)]
    pub full_duplex: bool,          //* Indicates if the gateway operates in full duplex mode or not */
    pub com_type: LgwComType,       //* The COMmunication interface to connect to the concentrator */
    pub com_path: String,           //* Path to access the COM device */
}

impl Default for LgwConfigBoard {
    fn default() -> Self {
        Self {
            lorawan_public: false,
            clksrc: 0,
            full_duplex: false,
            com_type: LgwComType::LGW_COM_SIM,
            com_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LgwConfDemod {
    pub multisf_datarate: u8,   //* bitmask to enable spreading-factors for correlators (SF12 - SF5) */
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum LgwFtimeMode {
    #[serde(rename = "high_capacity")]
    LGW_FTIME_MODE_HIGH_CAPACITY,   //* fine timestamps for SF5 -> SF10 */
    #[serde(rename = "all_sf")]
    LGW_FTIME_MODE_ALL_SF,          //* fine timestamps for SF5 -> SF12 */
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LgwConfigFtime {
    pub enable: bool,               //* Enable / Disable fine timestamping */
    #[serde(default = "default_ftime_mode")]
    pub mode: LgwFtimeMode,
}

fn default_ftime_mode() -> LgwFtimeMode {
    LgwFtimeMode::LGW_FTIME_MODE_HIGH_CAPACITY
}

impl Default for LgwConfigFtime {
    fn default() -> Self {
        Self { enable: false, mode: LgwFtimeMode::LGW_FTIME_MODE_HIGH_CAPACITY }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LgwConfSx1261 {
    #[serde(default)]
    pub enable: bool,               //* enable or disable SX1261 radio */
    #[serde(default)]
    pub spi_path: Option<String>,   //* Path to access the SPI device (not used for USB com type) */
    #[serde(default)]
    pub rssi_offset: f32,           //* value to be applied to the sx1261 RSSI value (dBm) */
}

/**
@struct LgwPktRx
@brief Structure containing the metadata of a packet that was received and its payload
*/
#[derive(Debug, Clone)]
pub struct LgwPktRx {
    pub freq_hz: u32,           /* central frequency of the IF chain */
    pub freq_offset: i32,
    pub if_chain: u8,           /* by which IF chain was packet received */
    pub status: u8,             /* status of the received packet */
    pub count_us: u32,          /* internal concentrator counter for timestamping, 1 microsecond resolution */
    pub rf_chain: u8,           /* through which RF chain the packet was received */
    pub modem_id: u8,
    pub modulation: Modulation, /* modulation used by the packet */
    pub bandwidth: u8,          /* modulation bandwidth (LoRa only) */
    pub datarate: u32,          /* RX datarate of the packet (SF for LoRa) */
    pub coderate: u8,           /* error-correcting code of the packet (LoRa only) */
    pub rssic: f32,             /* average RSSI of the channel in dB */
    pub rssis: f32,             /* average RSSI of the signal in dB */
    pub snr: f32,               /* average packet SNR, in dB (LoRa only) */
    pub size: u16,              /* payload size in bytes */
    pub payload: [u8; 256],     /* buffer containing the payload */
    pub ftime_received: bool,   /* a fine timestamp has been received */
    pub ftime: u32,             /* packet fine timestamp (nanoseconds since last PPS) */
}

impl LgwPktRx {
    pub fn new() -> Self {
        Self {
            freq_hz: 0,
            freq_offset: 0,
            if_chain: 0,
            status: 0,
            count_us: 0,
            rf_chain: 0,
            modem_id: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: 0,
            datarate: 0,
            coderate: 0,
            rssic: 0.0,
            rssis: 0.0,
            snr: 0.0,
            size: 0,
            payload: [0; 256],
            ftime_received: false,
            ftime: 0,
        }
    }
}

impl Default for LgwPktRx {
    fn default() -> Self {
        Self::new()
    }
}

/**
@struct LgwPktTx
@brief Structure containing the configuration of a packet to send and its payload
*/
#[derive(Debug, Clone, Copy)]
pub struct LgwPktTx {
    pub freq_hz: u32,           /* center frequency of TX */
    pub tx_mode: TxMode,        /* select on what event/time the TX is triggered */
    pub count_us: u32,          /* timestamp or delay in microseconds for TX trigger */
    pub rf_chain: u8,           /* through which RF chain will the packet be sent */
    pub rf_power: i8,           /* TX power, in dBm */
    pub modulation: Modulation, /* modulation to use for the packet */
    pub bandwidth: u8,          /* modulation bandwidth (LoRa only) */
    pub datarate: u32,          /* TX datarate (baudrate for FSK, SF for LoRa) */
    pub coderate: u8,           /* error-correcting code of the packet (LoRa only) */
    pub invert_pol: bool,       /* invert signal polarity, for orthogonal downlinks (LoRa only) */
    pub f_dev: u8,              /* frequency deviation, in kHz (FSK only) */
    pub preamble: u16,          /* set the preamble length, 0 for default */
    pub no_crc: bool,           /* if true, do not send a CRC in the packet */
    pub no_header: bool,        /* if true, enable implicit header mode (LoRa), fixed length (FSK) */
    pub size: u16,              /* payload size in bytes */
    pub payload: [u8; 256],     /* buffer containing the payload */
}

impl Default for LgwPktTx {
    fn default() -> Self {
        Self {
            freq_hz: 0,
            tx_mode: TxMode::IMMEDIATE,
            count_us: 0,
            rf_chain: 0,
            rf_power: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: BW_UNDEFINED,
            datarate: DR_UNDEFINED,
            coderate: CR_UNDEFINED,
            invert_pol: false,
            f_dev: 0,
            preamble: 0,
            no_crc: false,
            no_header: false,
            size: 0,
            payload: [0; 256],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LgwContext {
    pub board_cfg: LgwConfigBoard,                          //* Basic system configuration */
    pub rf_chain_cfg: [LgwConfRxrf; LGW_RF_CHAIN_NB],
    pub if_chain_cfg: [LgwConfRxIf; LGW_IF_CHAIN_NB],
    pub demod_cfg: LgwConfDemod,                            //* demodulation configuration */
    pub lora_service_cfg: LgwConfRxIf,                      /* LoRa service channel config parameters */
    pub fsk_cfg: LgwConfRxIf,                               /* FSK channel config parameters */
    pub tx_gain_lut: [LgwTxGainLut; LGW_RF_CHAIN_NB],       /* TX gain tables */
    pub ftime_cfg: LgwConfigFtime,                          /* Fine timestamp configuration */
    pub sx1261_cfg: LgwConfSx1261,                          /* SX1261 configuration */
}

pub fn is_lora_bw(bw: u8) -> bool {
    matches!(bw, BW_125KHZ | BW_250KHZ | BW_500KHZ)
}

pub fn is_lora_dr(dr: u32) -> bool {
    (DR_LORA_SF5..=DR_LORA_SF12).contains(&dr)
}

pub fn is_lora_cr(cr: u8) -> bool {
    matches!(cr, CR_LORA_4_5 | CR_LORA_4_6 | CR_LORA_4_7 | CR_LORA_4_8)
}

pub fn is_fsk_dr(dr: u32) -> bool {
    (DR_FSK_MIN..=DR_FSK_MAX).contains(&dr)
}

/**
@brief The concentrator operations consumed by the packet forwarder.

The register-level driver lives behind this trait; see `sim` for the
software backend.
*/
pub trait LgwHal: Send {
    fn lgw_start(&mut self) -> Result<()>;
    fn lgw_stop(&mut self) -> Result<()>;
    /* fetch up to max_pkt received packets from the concentrator FIFO */
    fn lgw_receive(&mut self, max_pkt: usize) -> Result<Vec<LgwPktRx>>;
    /* program one packet for transmission */
    fn lgw_send(&mut self, pkt: &LgwPktTx) -> Result<()>;
    /* TX modem status for one RF chain (TX_FREE / TX_SCHEDULED / TX_EMITTING) */
    fn lgw_status(&mut self, rf_chain: u8) -> Result<u8>;
    /* free-running 32-bit microsecond counter */
    fn lgw_get_instcnt(&mut self) -> Result<u32>;
    /* counter value latched on the last PPS edge */
    fn lgw_get_trigcnt(&mut self) -> Result<u32>;
    fn lgw_get_eui(&mut self) -> Result<u64>;
    fn lgw_get_temperature(&mut self) -> Result<f32>;
    fn lgw_spectral_scan_start(&mut self, freq_hz: u32, nb_scan: u16) -> Result<()>;
    fn lgw_spectral_scan_get_status(&mut self) -> Result<LgwSpectralScanStatus>;
    fn lgw_spectral_scan_get_results(
        &mut self,
    ) -> Result<([i16; LGW_SPECTRAL_SCAN_RESULT_SIZE], [u16; LGW_SPECTRAL_SCAN_RESULT_SIZE])>;
    fn lgw_spectral_scan_abort(&mut self) -> Result<()>;
}

/* Select the concentrator backend from the board configuration */
pub fn lgw_open(ctx: LgwContext) -> Result<Box<dyn LgwHal>> {
    match ctx.board_cfg.com_type {
        LgwComType::LGW_COM_SIM => Ok(Box::new(sim::SimConcentrator::new(ctx))),
        LgwComType::LGW_COM_SPI | LgwComType::LGW_COM_USB => {
            error!(
                "ERROR: no SPI/USB concentrator driver is built into this binary (com_path {})",
                ctx.board_cfg.com_path
            );
            Err(anyhow!(Error::LGW_COM_ERROR))
        }
    }
}
