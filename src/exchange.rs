//! Two-way time transfer over a simulated radio link.
//!
//! The four-timestamp exchange is the same math wherever it is used: the
//! topology strategies only differ in who they exchange with. The link
//! itself sits behind the `RadioLink` trait so control-loop code can be
//! tested against a mock that returns scripted results.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::clock::gauss;

/// Four-timestamp record of one exchange. All values in nanoseconds on a
/// shared simulated timeline.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimeTransferPacket {
    pub t1_ns: f64,
    pub t2_ns: f64,
    pub t3_ns: f64,
    pub t4_ns: f64,
    pub partner_stratum: u8,
    /// Expected timestamp precision under the current impairments (ns).
    pub precision_ns: f64,
}

impl TimeTransferPacket {
    /// offset = ((t2 - t1) + (t3 - t4)) / 2
    pub fn offset_ns(&self) -> f64 {
        ((self.t2_ns - self.t1_ns) + (self.t3_ns - self.t4_ns)) / 2.0
    }

    /// delay = ((t2 - t1) - (t3 - t4)) / 2
    pub fn delay_ns(&self) -> f64 {
        ((self.t2_ns - self.t1_ns) - (self.t3_ns - self.t4_ns)) / 2.0
    }
}

/// Per-link impairment knobs sampled on every attempt.
#[derive(Debug, Clone, Copy)]
pub struct LinkImpairment {
    /// Probability in [0, 1] that the attempt yields nothing.
    pub loss_probability: f64,
    /// Sigma of the multipath perturbation added to the computed offset (ns).
    pub multipath_sigma_ns: f64,
    /// One-way propagation delay for the exchange (ns).
    pub path_delay_ns: f64,
}

/// Outcome of a successful exchange, ready for the control loop.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeResult {
    pub offset_ns: f64,
    pub delay_ns: f64,
    pub partner_stratum: u8,
}

/// Adaptive estimate of forward/reverse path asymmetry. The learned factor
/// scales the measured path delay into a correction subtracted from the raw
/// offset.
#[derive(Debug, Clone)]
pub struct AsymmetryEstimator {
    factor: f64,
    learning_rate: f64,
}

impl AsymmetryEstimator {
    pub fn new(learning_rate: f64) -> Self {
        AsymmetryEstimator {
            factor: 0.0,
            learning_rate,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// factor += (measured - expected) * learning_rate
    pub fn observe(&mut self, measured_offset_ns: f64, expected_offset_ns: f64) {
        let err = measured_offset_ns - expected_offset_ns;
        if !err.is_finite() {
            return;
        }
        self.factor += err * self.learning_rate;
        self.factor = self.factor.clamp(-1.0, 1.0);
    }

    /// Correction to subtract from a raw offset for a given path delay.
    pub fn correction_ns(&self, delay_ns: f64) -> f64 {
        self.factor * delay_ns
    }
}

/// Seam between the sync strategies and the medium carrying the exchange.
///
/// `true_offset_ns` is remote clock minus local clock at the moment of the
/// exchange; the link may only ever see it through the timestamps it builds.
#[cfg_attr(test, mockall::automock)]
pub trait RadioLink {
    fn exchange(
        &mut self,
        true_offset_ns: f64,
        impairment: &LinkImpairment,
        partner_stratum: u8,
    ) -> Option<ExchangeResult>;
}

/// Simulated medium: probabilistic loss, symmetric propagation, bounded
/// Gaussian multipath on the computed offset.
pub struct SimulatedLink {
    rng: StdRng,
    now_ns: f64,
}

impl SimulatedLink {
    pub fn new(seed: u64) -> Self {
        SimulatedLink {
            rng: StdRng::seed_from_u64(seed),
            now_ns: 0.0,
        }
    }
}

impl RadioLink for SimulatedLink {
    fn exchange(
        &mut self,
        true_offset_ns: f64,
        impairment: &LinkImpairment,
        partner_stratum: u8,
    ) -> Option<ExchangeResult> {
        if impairment.loss_probability > 0.0
            && self.rng.random::<f64>() < impairment.loss_probability
        {
            debug!("exchange lost (p={:.3})", impairment.loss_probability);
            return None;
        }

        let d = impairment.path_delay_ns.max(0.0);
        let theta = true_offset_ns;

        // Symmetric four-timestamp build: receiver turnaround of 1 us.
        let t1 = self.now_ns;
        let t2 = t1 + d + theta;
        let t3 = t2 + 1_000.0;
        let t4 = t3 - theta + d;
        self.now_ns = t4 + 1_000.0;

        let pkt = TimeTransferPacket {
            t1_ns: t1,
            t2_ns: t2,
            t3_ns: t3,
            t4_ns: t4,
            partner_stratum,
            precision_ns: impairment.multipath_sigma_ns,
        };

        let mut offset = pkt.offset_ns();
        if impairment.multipath_sigma_ns > 0.0 {
            let sigma = impairment.multipath_sigma_ns;
            let noise = gauss(&mut self.rng, sigma).clamp(-3.0 * sigma, 3.0 * sigma);
            offset += noise;
        }

        Some(ExchangeResult {
            offset_ns: offset,
            delay_ns: pkt.delay_ns(),
            partner_stratum,
        })
    }
}
