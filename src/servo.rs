//! Closed-loop clock correction: a PID phase-locked loop and a
//! constant-velocity Kalman estimator over [offset, drift].
//!
//! Both loops keep all state explicit so a sequence of samples replays
//! deterministically in tests. Non-finite samples are dropped rather than
//! poisoning the state.

use log::debug;

/// Gains and limits for the digital PLL.
#[derive(Debug, Clone, Copy)]
pub struct DpllConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Anti-windup clamp on the accumulated integral (ns·s).
    pub max_integral: f64,
    /// Clamp on the emitted correction (ns).
    pub max_correction_ns: f64,
    /// Lock is declared while |error| stays under this (ns).
    pub lock_threshold_ns: f64,
}

impl Default for DpllConfig {
    fn default() -> Self {
        DpllConfig {
            kp: 0.8,
            ki: 0.2,
            kd: 0.05,
            max_integral: 1000.0,
            max_correction_ns: 1e6,
            lock_threshold_ns: 1.0,
        }
    }
}

/// Digital phase-locked loop. Drives a phase error (ns) toward zero with a
/// PID law; the lock flag is level-triggered on the current sample.
#[derive(Debug, Clone)]
pub struct Dpll {
    cfg: DpllConfig,
    integral: f64,
    last_error_ns: f64,
    pub locked: bool,
}

impl Dpll {
    pub fn new(cfg: DpllConfig) -> Self {
        Dpll {
            cfg,
            integral: 0.0,
            last_error_ns: 0.0,
            locked: false,
        }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error_ns = 0.0;
        self.locked = false;
    }

    /// Produce a bounded correction (ns) for the given phase error (ns).
    ///
    /// Lock follows the error level each sample: one excursion above the
    /// threshold unlocks immediately, one sample below re-locks.
    pub fn update(&mut self, error_ns: f64, dt: f64) -> f64 {
        if !(dt > 0.0) || !error_ns.is_finite() {
            return 0.0;
        }

        self.integral = (self.integral + error_ns * dt)
            .clamp(-self.cfg.max_integral, self.cfg.max_integral);
        let derivative = (error_ns - self.last_error_ns) / dt;

        let output = self.cfg.kp * error_ns + self.cfg.ki * self.integral + self.cfg.kd * derivative;

        self.locked = error_ns.abs() < self.cfg.lock_threshold_ns;
        self.last_error_ns = error_ns;

        let correction = output.clamp(-self.cfg.max_correction_ns, self.cfg.max_correction_ns);
        debug!(
            "DPLL: err={:.2}ns I={:.2} D={:.2} out={:.2}ns locked={}",
            error_ns, self.integral, derivative, correction, self.locked
        );
        correction
    }
}

/// Two-state Kalman filter over [offset (ns), drift (ns/s)] with a
/// constant-velocity process model.
#[derive(Debug, Clone)]
pub struct KalmanEstimator {
    x: [f64; 2],
    p: [[f64; 2]; 2],
    /// Process-noise spectral density.
    q: f64,
}

impl KalmanEstimator {
    pub fn new(initial_offset_ns: f64) -> Self {
        KalmanEstimator {
            x: [initial_offset_ns, 0.0],
            p: [[1.0, 0.0], [0.0, 1.0]],
            q: 1e-3,
        }
    }

    pub fn offset_ns(&self) -> f64 {
        self.x[0]
    }

    pub fn drift_ns_per_s(&self) -> f64 {
        self.x[1]
    }

    /// Propagate the state forward by `dt` seconds. `dt <= 0` is a no-op.
    pub fn predict(&mut self, dt: f64) {
        if !(dt > 0.0) || !dt.is_finite() {
            return;
        }

        // x = F x with F = [[1, dt], [0, 1]]
        self.x[0] += self.x[1] * dt;

        // P = F P Fᵀ + Q
        let [[p00, p01], [p10, p11]] = self.p;
        let q00 = self.q * dt.powi(3) / 3.0;
        let q01 = self.q * dt.powi(2) / 2.0;
        let q11 = self.q * dt;

        self.p = [
            [
                p00 + dt * (p10 + p01) + dt * dt * p11 + q00,
                p01 + dt * p11 + q01,
            ],
            [p10 + dt * p11 + q01, p11 + q11],
        ];
    }

    /// Fold in a scalar offset measurement (ns) with the caller-supplied
    /// measurement variance. An effectively infinite variance leaves the
    /// state untouched, which is how suspect samples get ignored.
    pub fn update(&mut self, measured_offset_ns: f64, measurement_variance: f64) {
        if !measured_offset_ns.is_finite() || !(measurement_variance >= 0.0) {
            return;
        }

        let [[p00, p01], [p10, p11]] = self.p;
        let innovation = measured_offset_ns - self.x[0];
        let s = p00 + measurement_variance;
        if !(s > 0.0) || !s.is_finite() {
            return;
        }

        let k0 = p00 / s;
        let k1 = p10 / s;

        self.x[0] += k0 * innovation;
        self.x[1] += k1 * innovation;

        // P = (I - K H) P with H = [1, 0]
        self.p = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::gauss;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dpll() -> Dpll {
        Dpll::new(DpllConfig::default())
    }

    #[test]
    fn test_dpll_proportional() {
        let mut loop_ = Dpll::new(DpllConfig {
            kp: 0.5,
            ki: 0.0,
            kd: 0.0,
            ..DpllConfig::default()
        });
        let out = loop_.update(100.0, 1.0);
        assert!((out - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_dpll_integral_windup_clamp() {
        let mut loop_ = Dpll::new(DpllConfig {
            kp: 0.0,
            ki: 1.0,
            kd: 0.0,
            max_integral: 200.0,
            ..DpllConfig::default()
        });
        for _ in 0..10 {
            loop_.update(1000.0, 1.0);
        }
        let out = loop_.update(0.0, 1.0);
        assert!(
            (out - 200.0).abs() < 1e-9,
            "integral must clamp at 200, got {out}"
        );
    }

    #[test]
    fn test_dpll_output_clamp() {
        let mut loop_ = Dpll::new(DpllConfig {
            kp: 1.0,
            max_correction_ns: 500.0,
            ..DpllConfig::default()
        });
        assert_eq!(loop_.update(1e9, 1.0), 500.0);
        assert_eq!(loop_.update(-1e9, 1.0), -500.0);
    }

    #[test]
    fn test_dpll_lock_is_level_triggered() {
        let mut loop_ = dpll();
        for _ in 0..5 {
            loop_.update(0.5, 1.0);
        }
        assert!(loop_.locked, "sub-threshold error must lock");

        loop_.update(50.0, 1.0);
        assert!(!loop_.locked, "one large sample must unlock immediately");

        loop_.update(0.2, 1.0);
        assert!(loop_.locked);
    }

    #[test]
    fn test_dpll_rejects_bad_input() {
        let mut loop_ = dpll();
        assert_eq!(loop_.update(f64::NAN, 1.0), 0.0);
        assert_eq!(loop_.update(f64::INFINITY, 1.0), 0.0);
        assert_eq!(loop_.update(100.0, 0.0), 0.0);
        assert!(!loop_.locked);
    }

    #[test]
    fn test_dpll_reset() {
        let mut loop_ = dpll();
        loop_.update(0.5, 1.0);
        assert!(loop_.locked);
        loop_.reset();
        assert!(!loop_.locked);
        // Integral gone: a zero-error sample produces zero output.
        assert_eq!(loop_.update(0.0, 1.0), 0.0);
    }

    #[test]
    fn test_kalman_converges_to_constant_offset() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut kf = KalmanEstimator::new(0.0);
        let true_offset = 250.0;

        for _ in 0..200 {
            kf.predict(1.0);
            let z = true_offset + gauss(&mut rng, 5.0);
            kf.update(z, 25.0);
        }

        assert!(
            (kf.offset_ns() - true_offset).abs() < 5.0,
            "estimate {} not near {}",
            kf.offset_ns(),
            true_offset
        );
        assert!(kf.drift_ns_per_s().abs() < 1.0);
    }

    #[test]
    fn test_kalman_tracks_drift() {
        let mut kf = KalmanEstimator::new(0.0);
        // Noiseless ramp: offset grows 10 ns per second.
        for i in 1..=100 {
            kf.predict(1.0);
            kf.update(10.0 * i as f64, 1.0);
        }
        assert!((kf.drift_ns_per_s() - 10.0).abs() < 1.0);
    }

    #[test]
    fn test_kalman_zero_dt_predict_is_noop() {
        let mut kf = KalmanEstimator::new(42.0);
        let before = (kf.offset_ns(), kf.drift_ns_per_s());
        kf.predict(0.0);
        kf.predict(-5.0);
        assert_eq!((kf.offset_ns(), kf.drift_ns_per_s()), before);
    }

    #[test]
    fn test_kalman_huge_variance_ignores_sample() {
        let mut kf = KalmanEstimator::new(100.0);
        kf.predict(1.0);
        let before = kf.offset_ns();
        kf.update(1e9, 1e18);
        assert!(
            (kf.offset_ns() - before).abs() < 1.0,
            "huge-variance sample must be effectively ignored"
        );
    }

    #[test]
    fn test_kalman_rejects_non_finite() {
        let mut kf = KalmanEstimator::new(10.0);
        kf.update(f64::NAN, 1.0);
        kf.update(100.0, f64::NAN);
        assert_eq!(kf.offset_ns(), 10.0);
    }
}
