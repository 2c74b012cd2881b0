use anyhow::{anyhow, Result};
use tracing::{error, trace};

use super::{
    is_fsk_dr, is_lora_bw, is_lora_cr, is_lora_dr, LgwPktTx, Modulation, BW_125KHZ, BW_250KHZ,
    BW_500KHZ,
};

/* default preamble lengths used when a TX packet leaves the field at 0 */
const DEFAULT_LORA_PREAMBLE: u16 = 8;
const DEFAULT_FSK_PREAMBLE: u16 = 5;

pub fn lora_packet_time_on_air(
    bw: u8,
    sf: u8,
    cr: u8,
    n_symbol_preamble: u16,
    no_header: bool,
    no_crc: bool,
    size: u8,
) -> Result<(u32, f64, u32, u16)> {
    /* Check input parameters */
    if !is_lora_dr(sf as u32) {
        error!("ERROR: wrong datarate");
        return Err(anyhow!("LGW_HAL_ERR"));
    }
    if !is_lora_bw(bw) {
        error!("ERROR: wrong bandwidth");
        return Err(anyhow!("LGW_HAL_ERR"));
    }
    if !is_lora_cr(cr) {
        error!("ERROR: wrong coding rate");
        return Err(anyhow!("LGW_HAL_ERR"));
    }

    /* Get bandwidth 125KHz divider*/
    let bw_pow: u8 = match bw {
        BW_125KHZ => 1,
        BW_250KHZ => 2,
        BW_500KHZ => 4,
        _ => {
            error!("ERROR: unsupported bandwidth 0x{:02X}", bw);
            return Err(anyhow!("LGW_HAL_ERR"));
        }
    };

    /* Duration of 1 symbol */
    let t_symbol_us: u16 = (1u16 << sf) * 8 / bw_pow as u16; /* 2^SF / BW , in microseconds */

    /* Packet parameters */
    let h: u8 = if !no_header { 1 } else { 0 }; /* header is always enabled, except for beacons */
    let de: u8 = if sf >= 11 { 1 } else { 0 }; /* Low datarate optimization enabled for SF11 and SF12 */
    let n_bit_crc: u8 = if !no_crc { 16 } else { 0 };

    /* Number of symbols in the payload */
    let n_symbol_payload: u32 = (((8 * size as i32 + n_bit_crc as i32 - 4 * sf as i32
        + if sf >= 7 { 8 } else { 0 }
        + 20 * h as i32) as f64)
        .max(0.0)
        / (4 * (sf as u32 - 2 * de as u32)) as f64)
        .ceil() as u32
        * (cr as u32 + 4);

    /* number of symbols in packet */
    let n_symbol: f64 =
        n_symbol_preamble as f64 + if sf >= 7 { 4.25 } else { 6.25 } + 8.0 + n_symbol_payload as f64;

    /* Duration of packet in microseconds */
    let toa_us = (n_symbol * t_symbol_us as f64) as u32;

    trace!(
        "INFO: LoRa packet ToA: {} us (n_symbol:{}, t_symbol_us:{})",
        toa_us,
        n_symbol,
        t_symbol_us
    );

    Ok((toa_us, n_symbol, n_symbol_payload, t_symbol_us))
}

/* Airtime of a TX packet, all modulations, in microseconds */
pub fn lgw_time_on_air(pkt: &LgwPktTx) -> Result<u32> {
    match pkt.modulation {
        Modulation::LORA => {
            let preamble = if pkt.preamble == 0 { DEFAULT_LORA_PREAMBLE } else { pkt.preamble };
            let (toa_us, _, _, _) = lora_packet_time_on_air(
                pkt.bandwidth,
                pkt.datarate as u8,
                pkt.coderate,
                preamble,
                pkt.no_header,
                pkt.no_crc,
                pkt.size as u8,
            )?;
            Ok(toa_us)
        }
        Modulation::FSK => {
            if !is_fsk_dr(pkt.datarate) {
                error!("ERROR: wrong FSK datarate");
                return Err(anyhow!("LGW_HAL_ERR"));
            }
            let preamble = if pkt.preamble == 0 { DEFAULT_FSK_PREAMBLE } else { pkt.preamble };
            /* preamble + sync word (3) + length byte + payload + CRC */
            let nb_bytes: u64 =
                preamble as u64 + 3 + 1 + pkt.size as u64 + if pkt.no_crc { 0 } else { 2 };
            Ok((nb_bytes * 8 * 1_000_000 / pkt.datarate as u64) as u32)
        }
        _ => {
            error!("ERROR: cannot compute time on air for modulation {}", pkt.modulation);
            Err(anyhow!("LGW_HAL_ERR"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{CR_LORA_4_5, DR_LORA_SF12, DR_LORA_SF7, TxMode};

    #[test]
    fn lora_toa_sf7_bw125() {
        /* SF7BW125, CR4/5, 8-symbol preamble, explicit header, CRC on, 2 bytes */
        let (toa_us, n_symbol, n_symbol_payload, t_symbol_us) =
            lora_packet_time_on_air(BW_125KHZ, 7, CR_LORA_4_5, 8, false, false, 2).unwrap();
        assert_eq!(t_symbol_us, 1024);
        /* ceil((16 + 16 - 28 + 8 + 20) / 28) * 5 = 10 payload symbols */
        assert_eq!(n_symbol_payload, 10);
        /* 8 preamble + 4.25 sync + 8 header + 10 payload */
        assert_eq!(n_symbol, 30.25);
        assert_eq!(toa_us, 30976);
    }

    #[test]
    fn lora_toa_grows_with_sf() {
        let mut pkt = LgwPktTx::default();
        pkt.modulation = Modulation::LORA;
        pkt.bandwidth = BW_125KHZ;
        pkt.coderate = CR_LORA_4_5;
        pkt.size = 20;
        pkt.datarate = DR_LORA_SF7;
        let toa_sf7 = lgw_time_on_air(&pkt).unwrap();
        pkt.datarate = DR_LORA_SF12;
        let toa_sf12 = lgw_time_on_air(&pkt).unwrap();
        assert!(toa_sf12 > 10 * toa_sf7);
    }

    #[test]
    fn fsk_toa_50kbps() {
        let mut pkt = LgwPktTx::default();
        pkt.modulation = Modulation::FSK;
        pkt.tx_mode = TxMode::IMMEDIATE;
        pkt.datarate = 50000;
        pkt.preamble = 5;
        pkt.size = 10;
        /* (5 + 3 + 1 + 10 + 2) bytes * 8 bits / 50 kbps = 3360 us */
        assert_eq!(lgw_time_on_air(&pkt).unwrap(), 3360);
    }

    #[test]
    fn toa_rejects_bad_parameters() {
        assert!(lora_packet_time_on_air(BW_125KHZ, 4, CR_LORA_4_5, 8, false, false, 10).is_err());
        assert!(lora_packet_time_on_air(0x00, 7, CR_LORA_4_5, 8, false, false, 10).is_err());
        assert!(lora_packet_time_on_air(BW_125KHZ, 7, 0, 8, false, false, 10).is_err());
    }
}
