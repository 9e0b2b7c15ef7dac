//! Simulated oscillator models.
//!
//! Every node carries a `ClockState` that free-runs between corrections:
//! frequency error integrates into phase, drift (aging) integrates into
//! frequency, temperature couples in through a per-class coefficient, and a
//! bounded Gaussian term models short-term phase noise. The profile tables
//! mirror real oscillator classes (rubidium down to plain quartz crystals).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Returned by `allan_deviation` when the sample buffer cannot support the
/// requested averaging interval.
pub const ALLAN_FLOOR: f64 = 1e-12;

/// Cap on the rolling frequency-sample buffer used for Allan statistics.
pub const MAX_FREQ_SAMPLES: usize = 1000;

/// Oscillator class, ordered best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockClass {
    Rubidium,
    Ocxo,
    Tcxo,
    Quartz,
}

impl ClockClass {
    pub fn name(self) -> &'static str {
        match self {
            ClockClass::Rubidium => "rubidium",
            ClockClass::Ocxo => "ocxo",
            ClockClass::Tcxo => "tcxo",
            ClockClass::Quartz => "quartz",
        }
    }

    /// Rank used by leader election (higher = better clock).
    pub fn rank(self) -> i64 {
        match self {
            ClockClass::Rubidium => 100,
            ClockClass::Ocxo => 80,
            ClockClass::Tcxo => 60,
            ClockClass::Quartz => 40,
        }
    }

    pub fn profile(self) -> ClockProfile {
        match self {
            ClockClass::Rubidium => ClockProfile {
                class: self,
                drift_range_ppm_per_s: 1e-9,
                stability: 1e-12,
                accuracy_ppm: 1e-5,
                phase_noise_ns: 0.5,
                temp_coeff_ppm_per_c: 1e-6,
                stability_weight: 0.95,
            },
            ClockClass::Ocxo => ClockProfile {
                class: self,
                drift_range_ppm_per_s: 1e-6,
                stability: 1e-11,
                accuracy_ppm: 1e-3,
                phase_noise_ns: 1.0,
                temp_coeff_ppm_per_c: 1e-5,
                stability_weight: 0.85,
            },
            ClockClass::Tcxo => ClockProfile {
                class: self,
                drift_range_ppm_per_s: 1e-4,
                stability: 1e-10,
                accuracy_ppm: 1e-1,
                phase_noise_ns: 5.0,
                temp_coeff_ppm_per_c: 1e-4,
                stability_weight: 0.70,
            },
            ClockClass::Quartz => ClockProfile {
                class: self,
                drift_range_ppm_per_s: 1e-3,
                stability: 1e-9,
                accuracy_ppm: 1.0,
                phase_noise_ns: 20.0,
                temp_coeff_ppm_per_c: 1e-3,
                stability_weight: 0.50,
            },
        }
    }
}

/// Immutable per-node oscillator characteristics, fixed at node creation
/// (or replaced wholesale when a node is promoted to master).
#[derive(Debug, Clone, Copy)]
pub struct ClockProfile {
    pub class: ClockClass,
    /// Symmetric bound on the aging rate drawn at creation (ppm/s).
    pub drift_range_ppm_per_s: f64,
    /// Allan-deviation floor (relative).
    pub stability: f64,
    /// Absolute frequency accuracy bound (ppm).
    pub accuracy_ppm: f64,
    /// Phase-noise floor (ns).
    pub phase_noise_ns: f64,
    /// Frequency sensitivity to temperature (ppm/°C).
    pub temp_coeff_ppm_per_c: f64,
    /// Consensus weight for this class, in (0, 1].
    pub stability_weight: f64,
}

/// Mutable clock state, owned exclusively by its node and advanced once per
/// simulation tick.
#[derive(Debug, Clone)]
pub struct ClockState {
    /// Local minus reference time (ns).
    pub offset_ns: f64,
    /// Relative frequency error (ppm).
    pub freq_offset_ppm: f64,
    /// Frequency aging rate (ppm/s).
    pub drift_ppm_per_s: f64,
    /// Short-term noise magnitude (ns). Invariant: never negative.
    pub jitter_ns: f64,
    /// Simulated case temperature (°C).
    pub temperature_c: f64,
    /// Seconds since the last accepted correction.
    pub holdover_s: f64,
    /// Simulation time of the last advance (s).
    pub last_update_s: f64,
}

impl ClockState {
    /// Randomized initial state within the profile's bounds.
    pub fn randomized<R: Rng>(profile: &ClockProfile, rng: &mut R) -> Self {
        ClockState {
            offset_ns: rng.random_range(-100.0..100.0),
            freq_offset_ppm: rng.random_range(-profile.accuracy_ppm..profile.accuracy_ppm),
            drift_ppm_per_s: rng
                .random_range(-profile.drift_range_ppm_per_s..profile.drift_range_ppm_per_s),
            jitter_ns: rng.random_range(1.0f64..10.0).max(profile.phase_noise_ns),
            temperature_c: rng.random_range(20.0..30.0),
            holdover_s: 0.0,
            last_update_s: 0.0,
        }
    }

    /// Zeroed state for the reference (master) clock. It still drifts per its
    /// profile, it just starts on the reference timescale.
    pub fn reference<R: Rng>(profile: &ClockProfile, rng: &mut R) -> Self {
        let mut state = Self::randomized(profile, rng);
        state.offset_ns = 0.0;
        state.freq_offset_ppm = 0.0;
        state
    }

    /// Free-run the oscillator for `dt` seconds.
    ///
    /// Aging integrates into frequency, frequency integrates into phase, the
    /// temperature delta couples in through the profile coefficient, and a
    /// 3-sigma-bounded Gaussian term models phase noise. Non-positive or
    /// non-finite `dt` is a no-op.
    pub fn advance<R: Rng>(&mut self, profile: &ClockProfile, dt: f64, rng: &mut R) {
        if !(dt > 0.0) || !dt.is_finite() {
            return;
        }

        // Temperature random walk inside a plausible airframe band.
        let temp_step = rng.random_range(-0.05..0.05) * dt.min(10.0);
        let new_temp = (self.temperature_c + temp_step).clamp(15.0, 35.0);
        let temp_delta = new_temp - self.temperature_c;
        self.temperature_c = new_temp;

        self.freq_offset_ppm += self.drift_ppm_per_s * dt;
        self.freq_offset_ppm += profile.temp_coeff_ppm_per_c * temp_delta;

        // 1 ppm sustained for 1 s accumulates 1000 ns of phase.
        self.offset_ns += self.freq_offset_ppm * 1000.0 * dt;

        let noise_ns = gauss(rng, 1.0).clamp(-3.0, 3.0) * profile.stability * dt * 1e9;
        self.offset_ns += noise_ns;

        self.jitter_ns = (self.jitter_ns + rng.random_range(-0.2..0.2) * profile.phase_noise_ns)
            .max(profile.phase_noise_ns * 0.1);

        self.holdover_s += dt;
        self.last_update_s += dt;
    }

    /// Record the residual of an applied correction. Residuals under the
    /// quality threshold end holdover; anything worse leaves it running.
    pub fn record_correction(&mut self, residual_ns: f64, quality_threshold_ns: f64) {
        if residual_ns.abs() < quality_threshold_ns {
            self.holdover_s = 0.0;
        }
    }

    /// Estimated accumulated error while in holdover, clamped per class.
    pub fn holdover_error_ns(&self, profile: &ClockProfile) -> f64 {
        let base = profile.stability * self.holdover_s * 1e9;
        let cap = match profile.class {
            ClockClass::Rubidium => 2e5,
            ClockClass::Ocxo => 2e6,
            ClockClass::Tcxo => 5e6,
            ClockClass::Quartz => 5e7,
        };
        base.min(cap)
    }
}

/// Two-sample Allan deviation for averaging interval `tau` (in samples).
///
/// Partitions the buffer into blocks of `tau` samples, differences
/// consecutive block means and averages the squared differences. Degenerate
/// requests (`tau` of zero, or fewer than two full blocks) return
/// `ALLAN_FLOOR` instead of failing.
pub fn allan_deviation(samples: &[f64], tau: usize) -> f64 {
    if tau == 0 || samples.len() < 2 * tau {
        return ALLAN_FLOOR;
    }

    let means: Vec<f64> = samples
        .chunks_exact(tau)
        .map(|block| block.iter().sum::<f64>() / tau as f64)
        .collect();
    if means.len() < 2 {
        return ALLAN_FLOOR;
    }

    let sum_sq: f64 = means.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    let avar = sum_sq / (2.0 * (means.len() - 1) as f64);
    avar.sqrt()
}

/// Standard-normal sample scaled by `sigma` (Box-Muller).
pub(crate) fn gauss<R: Rng>(rng: &mut R, sigma: f64) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * sigma
}
