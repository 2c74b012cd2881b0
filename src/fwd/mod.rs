pub mod beacon;
pub mod config;
pub mod downstream;
pub mod gpsloop;
pub mod jit;
pub mod jitqueue;
pub mod protocol;
pub mod spectral;
pub mod stats;
pub mod upstream;
pub mod valid;

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::hal::gps::{Coord, Gps, TimeReference};
use crate::hal::{LgwHal, LGW_RF_CHAIN_NB};

use self::config::Config;
use self::jitqueue::JitQueue;
use self::stats::{MeasDown, MeasUp};

pub const GPS_REF_MAX_AGE: u64 = 30;    /* maximum admitted delay in seconds of GPS loss before considering latest GPS sync unusable */
pub const FETCH_SLEEP_MS: u64 = 10;     /* nb of ms waited when a fetch return no packets */

pub const XERR_INIT_AVG: u32 = 16;      /* nb of measurements the XTAL correction is averaged on as initial value */
pub const XERR_FILT_COEF: f64 = 256.0;  /* coefficient for low-pass XTAL error tracking */

pub const NB_PKT_MAX: usize = 255;      /* max number of packets per fetch/send cycle */

pub const MIN_LORA_PREAMB: u16 = 6;     /* minimum Lora preamble length for this application */
pub const STD_LORA_PREAMB: u16 = 8;
pub const MIN_FSK_PREAMB: u16 = 3;      /* minimum FSK preamble length for this application */
pub const STD_FSK_PREAMB: u16 = 5;

pub fn wait_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[derive(Debug, Default)]
pub struct StatusReport {
    pub ready: bool,        /* true when there is a new report to send to the server */
    pub json: String,       /* status report as a JSON object ("stat":{...}) */
}

#[derive(Debug, Default)]
pub struct TimeRefState {
    pub gps_ref_valid: bool,    /* is GPS reference acceptable (ie. not too old) */
    pub tref: TimeReference,    /* time reference used for GPS <-> timestamp conversion */
}

#[derive(Debug)]
pub struct XtalState {
    pub xtal_correct_ok: bool,  /* set true when XTAL correction is stable enough */
    pub xtal_correct: f64,
}

impl Default for XtalState {
    fn default() -> Self {
        Self { xtal_correct_ok: false, xtal_correct: 1.0 }
    }
}

#[derive(Debug, Default)]
pub struct GpsCoordState {
    pub valid: bool,
    pub coord: Coord,
}

/**
@struct Gateway
@brief Owned context shared by every activity of the forwarder.

Each field carries its own synchronization: the radio and the GPS time
reference behind mutexes, cancellation as atomics, the JIT queues one mutex
per RF chain.
*/
pub struct Gateway {
    /* signal handling */
    pub exit_sig: AtomicBool,   /* terminate cleanly: drain, shut down hardware */
    pub quit_sig: AtomicBool,   /* terminate without touching the hardware */

    pub cfg: Config,

    /* hardware access control */
    pub concentrator: Mutex<Box<dyn LgwHal>>,

    /* Just In Time TX scheduling, one queue per RF chain */
    pub jit_queue: [Mutex<JitQueue>; LGW_RF_CHAIN_NB],

    /* GPS time reference and crystal correction */
    pub gps_enabled: bool,
    pub gps: Option<Mutex<Gps>>,
    pub timeref: Mutex<TimeRefState>,
    pub xtal: Mutex<XtalState>,
    pub gps_coords: Mutex<GpsCoordState>,

    /* measurements to establish statistics */
    pub meas_up: Mutex<MeasUp>,
    pub meas_dw: Mutex<MeasDown>,
    pub report: Mutex<StatusReport>,

    /* network sockets, connected to the server */
    pub sock_up: UdpSocket,
    pub sock_down: UdpSocket,
}

impl Gateway {
    pub fn new(
        cfg: Config,
        concentrator: Box<dyn LgwHal>,
        gps: Option<Gps>,
        sock_up: UdpSocket,
        sock_down: UdpSocket,
    ) -> Self {
        Self {
            exit_sig: AtomicBool::new(false),
            quit_sig: AtomicBool::new(false),
            cfg,
            concentrator: Mutex::new(concentrator),
            jit_queue: [Mutex::new(JitQueue::new()), Mutex::new(JitQueue::new())],
            gps_enabled: gps.is_some(),
            gps: gps.map(Mutex::new),
            timeref: Mutex::new(TimeRefState::default()),
            xtal: Mutex::new(XtalState::default()),
            gps_coords: Mutex::new(GpsCoordState::default()),
            meas_up: Mutex::new(MeasUp::default()),
            meas_dw: Mutex::new(MeasDown::default()),
            report: Mutex::new(StatusReport::default()),
            sock_up,
            sock_down,
        }
    }

    pub fn running(&self) -> bool {
        !self.exit_sig.load(Ordering::Relaxed) && !self.quit_sig.load(Ordering::Relaxed)
    }

    /* snapshot of the GPS time reference, only when usable */
    pub fn timeref_snapshot(&self) -> Option<TimeReference> {
        if !self.gps_enabled {
            return None;
        }
        let state = self.timeref.lock().unwrap();
        if state.gps_ref_valid {
            Some(state.tref)
        } else {
            None
        }
    }
}
