use anyhow::{anyhow, Result};
use tracing::error;

use crate::hal::gps::Coord;
use crate::hal::{
    LgwPktTx, Modulation, TxMode, BW_125KHZ, BW_500KHZ, CR_LORA_4_5, DR_LORA_SF10, DR_LORA_SF12,
    DR_LORA_SF8, DR_LORA_SF9,
};

use super::config::BeaconConf;

/**
@brief CRC-16 used by the class-B beacon fields (CCITT polynomial, zero
init, no reflection).
*/
pub fn crc16(data: &[u8]) -> u16 {
    const CRC_POLY: u16 = 0x1021;
    const INIT_VAL: u16 = 0x0000;

    let mut x = INIT_VAL;
    for &byte in data {
        x ^= (byte as u16) << 8;
        for _ in 0..8 {
            x = if x & 0x8000 != 0 { (x << 1) ^ CRC_POLY } else { x << 1 };
        }
    }
    x
}

/* which beacon channel is active for a given beacon GPS time */
pub fn beacon_channel(beacon_gps_sec: u64, beacon_period: u32, beacon_freq_nb: u8) -> u8 {
    if beacon_freq_nb > 1 {
        ((beacon_gps_sec / beacon_period as u64) % beacon_freq_nb as u64) as u8
    } else {
        0
    }
}

/**
@struct BeaconBuilder
@brief Pre-assembled beacon packet. The gateway-specific half (infodesc,
coordinates, CRC) never changes; `build` stamps the time, its CRC and the
rotating channel frequency for one beacon occurrence.

Payload layout, little endian:
  RFU1 | time u32 | crc1 u16 | infodesc u8 | lat i24 | lon i24 | RFU2 | crc2 u16
*/
pub struct BeaconBuilder {
    pkt: LgwPktTx,
    rfu1_size: usize,
    conf: BeaconConf,
}

impl BeaconBuilder {
    pub fn new(conf: &BeaconConf, coord: &Coord) -> Result<Self> {
        let mut pkt = LgwPktTx::default();

        pkt.tx_mode = TxMode::ON_GPS;   /* send on PPS pulse */
        pkt.rf_chain = 0;               /* antenna A */
        pkt.rf_power = conf.power;
        pkt.modulation = Modulation::LORA;

        pkt.bandwidth = match conf.bw_hz {
            125000 => BW_125KHZ,
            500000 => BW_500KHZ,
            _ => {
                error!("ERROR: unsupported bandwidth for beacon");
                return Err(anyhow!("unsupported beacon bandwidth {}", conf.bw_hz));
            }
        };

        let (rfu1_size, rfu2_size) = match conf.datarate {
            8 => {
                pkt.datarate = DR_LORA_SF8;
                (1usize, 3usize)
            }
            9 => {
                pkt.datarate = DR_LORA_SF9;
                (2, 0)
            }
            10 => {
                pkt.datarate = DR_LORA_SF10;
                (3, 1)
            }
            12 => {
                pkt.datarate = DR_LORA_SF12;
                (5, 3)
            }
            _ => {
                error!("ERROR: unsupported datarate for beacon");
                return Err(anyhow!("unsupported beacon datarate SF{}", conf.datarate));
            }
        };

        pkt.size = (rfu1_size + 4 + 2 + 7 + rfu2_size + 2) as u16;
        pkt.coderate = CR_LORA_4_5;
        pkt.invert_pol = false;
        pkt.preamble = 10;
        pkt.no_crc = true;
        pkt.no_header = true;

        /* network common part: RFU1 zeroed, time and crc1 filled per beacon */
        let mut idx = rfu1_size + 4 + 2;

        /* calculate the latitude and longitude that must be publicly reported */
        let mut field_latitude = ((coord.lat / 90.0) * (1 << 23) as f64) as i32;
        /* +90 N is represented as 89.99999 N */
        field_latitude = field_latitude.clamp(-(1 << 23), (1 << 23) - 1);
        let mut field_longitude = ((coord.lon / 180.0) * (1 << 23) as f64) as i32;
        field_longitude = field_longitude.clamp(-(1 << 23), (1 << 23) - 1);

        /* gateway specific beacon fields */
        pkt.payload[idx] = conf.infodesc;
        idx += 1;
        pkt.payload[idx] = field_latitude as u8;
        pkt.payload[idx + 1] = (field_latitude >> 8) as u8;
        pkt.payload[idx + 2] = (field_latitude >> 16) as u8;
        idx += 3;
        pkt.payload[idx] = field_longitude as u8;
        pkt.payload[idx + 1] = (field_longitude >> 8) as u8;
        pkt.payload[idx + 2] = (field_longitude >> 16) as u8;
        idx += 3;

        /* RFU2 already zeroed */
        idx += rfu2_size;

        /* CRC of the beacon gateway specific part fields */
        let crc2_start = rfu1_size + 4 + 2;
        let field_crc2 = crc16(&pkt.payload[crc2_start..crc2_start + 7 + rfu2_size]);
        pkt.payload[idx] = field_crc2 as u8;
        pkt.payload[idx + 1] = (field_crc2 >> 8) as u8;

        Ok(Self { pkt, rfu1_size, conf: conf.clone() })
    }

    /**
    @brief Beacon packet for the occurrence at beacon_gps_sec (GPS seconds),
    with the concentrator trigger counter already resolved by the caller.
    */
    pub fn build(&mut self, beacon_gps_sec: u64, count_us: u32) -> LgwPktTx {
        /* rotate across beacon channels */
        let chan = beacon_channel(beacon_gps_sec, self.conf.period, self.conf.freq_nb);
        self.pkt.freq_hz = self.conf.freq_hz + chan as u32 * self.conf.freq_step;
        self.pkt.count_us = count_us;

        /* load time in beacon payload */
        let time_field = beacon_gps_sec as u32;
        let mut idx = self.rfu1_size;
        self.pkt.payload[idx] = time_field as u8;
        self.pkt.payload[idx + 1] = (time_field >> 8) as u8;
        self.pkt.payload[idx + 2] = (time_field >> 16) as u8;
        self.pkt.payload[idx + 3] = (time_field >> 24) as u8;
        idx += 4;

        /* CRC for the network common part */
        let field_crc1 = crc16(&self.pkt.payload[..self.rfu1_size + 4]);
        self.pkt.payload[idx] = field_crc1 as u8;
        self.pkt.payload[idx + 1] = (field_crc1 >> 8) as u8;

        self.pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> BeaconConf {
        BeaconConf {
            period: 128,
            freq_hz: 869_525_000,
            freq_nb: 1,
            freq_step: 0,
            datarate: 9,
            bw_hz: 125_000,
            power: 14,
            infodesc: 0,
        }
    }

    #[test]
    fn crc16_ccitt_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn channel_rotation() {
        /* beacon_freq_nb=8, period 128: 1024 s -> channel 0, 1152 s -> channel 1 */
        assert_eq!(beacon_channel(1024, 128, 8), 0);
        assert_eq!(beacon_channel(1152, 128, 8), 1);
        assert_eq!(beacon_channel(1024 + 7 * 128, 128, 8), 7);
        assert_eq!(beacon_channel(1024 + 8 * 128, 128, 8), 0);
        /* single-channel plans never rotate */
        assert_eq!(beacon_channel(1152, 128, 1), 0);
    }

    #[test]
    fn rotating_frequency_plan() {
        let mut c = conf();
        c.freq_nb = 8;
        c.freq_step = 200_000;
        let mut builder = BeaconBuilder::new(&c, &Coord::default()).unwrap();
        let pkt = builder.build(1024, 0);
        assert_eq!(pkt.freq_hz, 869_525_000);
        let pkt = builder.build(1152, 0);
        assert_eq!(pkt.freq_hz, 869_725_000);
    }

    #[test]
    fn sf9_payload_layout() {
        let coord = Coord { lat: 45.0, lon: 90.0, alt: 0 };
        let mut builder = BeaconBuilder::new(&conf(), &coord).unwrap();
        let pkt = builder.build(0x01020304, 123_456);

        /* SF9: RFU1=2, RFU2=0 -> 17 bytes total */
        assert_eq!(pkt.size, 17);
        assert_eq!(pkt.count_us, 123_456);
        assert!(pkt.no_crc && pkt.no_header);
        assert_eq!(pkt.preamble, 10);

        /* time field, little endian, after RFU1 */
        assert_eq!(&pkt.payload[2..6], &[0x04, 0x03, 0x02, 0x01]);

        /* crc1 covers RFU1 + time */
        let crc1 = crc16(&pkt.payload[..6]);
        assert_eq!(pkt.payload[6], crc1 as u8);
        assert_eq!(pkt.payload[7], (crc1 >> 8) as u8);

        /* lat 45.0 -> 2^23/2, little endian i24 at offset 9 */
        let lat = ((45.0 / 90.0) * (1 << 23) as f64) as i32;
        assert_eq!(pkt.payload[9], lat as u8);
        assert_eq!(pkt.payload[10], (lat >> 8) as u8);
        assert_eq!(pkt.payload[11], (lat >> 16) as u8);

        /* crc2 covers infodesc + lat + lon (+ empty RFU2) */
        let crc2 = crc16(&pkt.payload[8..15]);
        assert_eq!(pkt.payload[15], crc2 as u8);
        assert_eq!(pkt.payload[16], (crc2 >> 8) as u8);
    }

    #[test]
    fn coordinates_clamped_at_poles() {
        let coord = Coord { lat: 90.0, lon: -180.0, alt: 0 };
        let builder = BeaconBuilder::new(&conf(), &coord).unwrap();
        /* +90 must clamp to 2^23-1 (89.99999 N) */
        let lat_bytes =
            [builder.pkt.payload[9], builder.pkt.payload[10], builder.pkt.payload[11]];
        assert_eq!(lat_bytes, [0xFF, 0xFF, 0x7F]);
        let lon_bytes =
            [builder.pkt.payload[12], builder.pkt.payload[13], builder.pkt.payload[14]];
        assert_eq!(lon_bytes, [0x00, 0x00, 0x80]);
    }

    #[test]
    fn bad_beacon_parameters_rejected() {
        let mut c = conf();
        c.datarate = 11;
        assert!(BeaconBuilder::new(&c, &Coord::default()).is_err());
        let mut c = conf();
        c.bw_hz = 250_000;
        assert!(BeaconBuilder::new(&c, &Coord::default()).is_err());
    }
}
