use tracing::{debug, info};

use super::{wait_ms, Gateway, GPS_REF_MAX_AGE, XERR_FILT_COEF, XERR_INIT_AVG};

/**
@brief Validation loop: check the age of the GPS time reference at 1 Hz and
maintain the XTAL correction factor.

The correction starts as the inverse of an average over XERR_INIT_AVG raw
samples, then tracks with a first-order low-pass filter.
*/
pub fn thread_valid(gw: &Gateway) {
    /* variables for XTAL correction averaging */
    let mut init_cpt: u32 = 0;
    let mut init_acc: f64 = 0.0;

    while gw.running() {
        wait_ms(1000);

        /* calculate when the time reference was last updated */
        let (ref_valid_local, xtal_err_cpy) = {
            let mut state = gw.timeref.lock().unwrap();
            let gps_ref_age = state
                .tref
                .systime
                .elapsed()
                .map(|age| age.as_secs())
                .unwrap_or(u64::MAX);
            if gps_ref_age <= GPS_REF_MAX_AGE {
                /* time ref is ok, validate and */
                state.gps_ref_valid = true;
                (true, state.tref.xtal_err)
            } else {
                /* time ref is too old, invalidate */
                state.gps_ref_valid = false;
                (false, 1.0)
            }
        };

        /* manage XTAL correction */
        if !ref_valid_local {
            /* couldn't sync, or sync too old -> invalidate XTAL correction */
            let mut xtal = gw.xtal.lock().unwrap();
            xtal.xtal_correct_ok = false;
            xtal.xtal_correct = 1.0;
            init_cpt = 0;
            init_acc = 0.0;
        } else if init_cpt < XERR_INIT_AVG {
            /* initial accumulation */
            init_acc += xtal_err_cpy;
            init_cpt += 1;

            if init_cpt == XERR_INIT_AVG {
                /* initial average calculation */
                let mut xtal = gw.xtal.lock().unwrap();
                xtal.xtal_correct = XERR_INIT_AVG as f64 / init_acc;
                xtal.xtal_correct_ok = true;
                debug!("XERR_INIT_AVG={}, init_acc={:.15}", XERR_INIT_AVG, init_acc);
            }
        } else {
            /* tracking with low-pass filter */
            let x = 1.0 / xtal_err_cpy;
            let mut xtal = gw.xtal.lock().unwrap();
            xtal.xtal_correct = xtal.xtal_correct - xtal.xtal_correct / XERR_FILT_COEF
                + x / XERR_FILT_COEF;
        }
    }
    info!("INFO: End of validation thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    /* the estimator itself, isolated from the thread loop */
    struct Estimator {
        init_cpt: u32,
        init_acc: f64,
        correct: f64,
        ok: bool,
    }

    impl Estimator {
        fn new() -> Self {
            Self { init_cpt: 0, init_acc: 0.0, correct: 1.0, ok: false }
        }

        fn step(&mut self, xtal_err: f64) {
            if self.init_cpt < XERR_INIT_AVG {
                self.init_acc += xtal_err;
                self.init_cpt += 1;
                if self.init_cpt == XERR_INIT_AVG {
                    self.correct = XERR_INIT_AVG as f64 / self.init_acc;
                    self.ok = true;
                }
            } else {
                let x = 1.0 / xtal_err;
                self.correct = self.correct - self.correct / XERR_FILT_COEF + x / XERR_FILT_COEF;
            }
        }

        fn invalidate(&mut self) {
            self.init_cpt = 0;
            self.init_acc = 0.0;
            self.correct = 1.0;
            self.ok = false;
        }
    }

    #[test]
    fn stabilizes_after_initial_average() {
        let mut est = Estimator::new();
        for _ in 0..XERR_INIT_AVG - 1 {
            est.step(1.00002);
            assert!(!est.ok);
        }
        est.step(1.00002);
        assert!(est.ok);
        assert!((est.correct - 1.0 / 1.00002).abs() < 1e-12);
    }

    #[test]
    fn iir_converges_to_inverse_of_constant_input() {
        let mut est = Estimator::new();
        /* settle the initial average on a unity error first */
        for _ in 0..XERR_INIT_AVG {
            est.step(1.0);
        }
        /* then feed a constant error e: the correction must converge to 1/e */
        let e = 1.00005;
        /* K * ln(1/eps) steps with K=256 and eps=1e-3 is ~1770 */
        for _ in 0..2000 {
            est.step(e);
        }
        let target = 1.0 / e;
        assert!(
            (est.correct - target).abs() < 1e-3 * (1.0 - target).abs().max(1e-6),
            "correction {} did not converge to {}",
            est.correct,
            target
        );
    }

    #[test]
    fn invalidation_resets_the_estimator() {
        let mut est = Estimator::new();
        for _ in 0..XERR_INIT_AVG {
            est.step(1.00002);
        }
        assert!(est.ok);
        est.invalidate();
        assert!(!est.ok);
        assert_eq!(est.correct, 1.0);
        /* needs a full re-average before stabilizing again */
        est.step(1.00002);
        assert!(!est.ok);
    }
}
