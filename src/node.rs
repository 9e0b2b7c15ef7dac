//! Per-node state: identity, oscillator, control loops, sync bookkeeping
//! and the resource model feeding election eligibility.

use std::collections::VecDeque;

use log::debug;
use rand::Rng;
use serde::Serialize;

use crate::clock::{allan_deviation, ClockClass, ClockProfile, ClockState, MAX_FREQ_SAMPLES};
use crate::election::ElectionPhase;
use crate::exchange::AsymmetryEstimator;
use crate::servo::{Dpll, DpllConfig, KalmanEstimator};

pub type NodeId = u32;

/// Recent correction samples kept for gain diagnostics.
const MAX_CORRECTION_SAMPLES: usize = 64;

/// Battery drain per simulated second (fraction of full charge).
const BATTERY_DRAIN_PER_S: f64 = 5e-5;

/// Role a node plays in the current cycle's sync graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    Master,
    Slave,
    Relay,
    Gateway,
}

/// One synchronized drone.
pub struct Node {
    pub id: NodeId,
    /// Owned by the movement subsystem; read-only here.
    pub position: [f64; 3],
    pub profile: ClockProfile,
    pub clock: ClockState,
    pub dpll: Dpll,
    pub kalman: KalmanEstimator,
    pub asymmetry: AsymmetryEstimator,
    pub stratum: u8,
    pub sync_quality: f64,
    pub is_master: bool,
    pub failed: bool,
    pub mode: SyncMode,

    // Failover bookkeeping.
    pub phase: ElectionPhase,
    pub last_master_contact_s: f64,
    pub votes: u32,
    pub voted_for: Option<NodeId>,

    // Resource model.
    pub battery_level: f64,
    pub signal_strength: f64,

    // Counters exposed through the status snapshot.
    pub sync_count: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub sync_error_count: u64,

    corrections_ns: VecDeque<f64>,
    freq_samples_ppm: VecDeque<f64>,
}

impl Node {
    pub fn new<R: Rng>(
        id: NodeId,
        class: ClockClass,
        position: [f64; 3],
        is_master: bool,
        rng: &mut R,
    ) -> Self {
        let profile = class.profile();
        let clock = if is_master {
            ClockState::reference(&profile, rng)
        } else {
            ClockState::randomized(&profile, rng)
        };
        Node {
            id,
            position,
            profile,
            clock,
            dpll: Dpll::new(DpllConfig::default()),
            kalman: KalmanEstimator::new(0.0),
            asymmetry: AsymmetryEstimator::new(0.01),
            stratum: if is_master { 0 } else { u8::MAX },
            sync_quality: if is_master { 1.0 } else { 0.0 },
            is_master,
            failed: false,
            mode: if is_master {
                SyncMode::Master
            } else {
                SyncMode::Slave
            },
            phase: if is_master {
                ElectionPhase::Leading
            } else {
                ElectionPhase::Following
            },
            last_master_contact_s: 0.0,
            votes: 0,
            voted_for: None,
            battery_level: 1.0,
            signal_strength: 0.9,
            sync_count: 0,
            packets_sent: 0,
            packets_received: 0,
            sync_error_count: 0,
            corrections_ns: VecDeque::with_capacity(MAX_CORRECTION_SAMPLES),
            freq_samples_ppm: VecDeque::with_capacity(64),
        }
    }

    pub fn distance_to(&self, other_position: [f64; 3]) -> f64 {
        let dx = self.position[0] - other_position[0];
        let dy = self.position[1] - other_position[1];
        let dz = self.position[2] - other_position[2];
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Advance the oscillator and the resource model by `dt` seconds.
    pub fn tick<R: Rng>(&mut self, dt: f64, rng: &mut R) {
        if self.failed || !(dt > 0.0) {
            return;
        }
        self.clock.advance(&self.profile, dt, rng);

        self.freq_samples_ppm.push_back(self.clock.freq_offset_ppm);
        while self.freq_samples_ppm.len() > MAX_FREQ_SAMPLES {
            self.freq_samples_ppm.pop_front();
        }

        self.battery_level = (self.battery_level - BATTERY_DRAIN_PER_S * dt).max(0.0);
        self.signal_strength =
            (self.signal_strength + rng.random_range(-0.02..0.02) * dt).clamp(0.3, 1.0);
    }

    /// Apply a correction (ns) produced by a control loop. Quality-weighted
    /// by the caller; residual below the threshold resets holdover.
    pub fn apply_correction(&mut self, correction_ns: f64, quality_threshold_ns: f64) {
        if !correction_ns.is_finite() {
            self.sync_error_count += 1;
            return;
        }
        self.clock.offset_ns -= correction_ns;
        self.clock
            .record_correction(self.clock.offset_ns, quality_threshold_ns);

        self.corrections_ns.push_back(correction_ns);
        while self.corrections_ns.len() > MAX_CORRECTION_SAMPLES {
            self.corrections_ns.pop_front();
        }
        self.sync_count += 1;
        debug!(
            "node {}: corrected {:.2}ns, residual {:.2}ns",
            self.id, correction_ns, self.clock.offset_ns
        );
    }

    /// Allan deviation of the rolling frequency history at the given tau.
    pub fn stability(&self, tau: usize) -> f64 {
        let samples: Vec<f64> = self.freq_samples_ppm.iter().copied().collect();
        allan_deviation(&samples, tau)
    }

    /// Mean magnitude of recent corrections, for gain diagnostics.
    pub fn mean_correction_ns(&self) -> f64 {
        if self.corrections_ns.is_empty() {
            return 0.0;
        }
        self.corrections_ns.iter().map(|c| c.abs()).sum::<f64>()
            / self.corrections_ns.len() as f64
    }

    /// Eligible to stand in an election: alive, not already master, enough
    /// battery and radio margin to carry the reference role.
    pub fn is_eligible_candidate(&self) -> bool {
        !self.failed && !self.is_master && self.battery_level > 0.5 && self.signal_strength > 0.6
    }

    pub fn reset_election_state(&mut self, now_s: f64) {
        if self.phase != ElectionPhase::Leading {
            self.phase = ElectionPhase::Following;
        }
        self.votes = 0;
        self.voted_for = None;
        self.last_master_contact_s = now_s;
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            position: self.position,
            is_master: self.is_master,
            failed: self.failed,
            clock_class: self.profile.class.name(),
            mode: self.mode,
            phase: self.phase,
            offset_ns: self.clock.offset_ns,
            frequency_offset_ppm: self.clock.freq_offset_ppm,
            jitter_ns: self.clock.jitter_ns,
            sync_quality: self.sync_quality,
            dpll_locked: self.dpll.locked,
            sync_count: self.sync_count,
            stratum: self.stratum,
            battery_level: self.battery_level,
            signal_strength: self.signal_strength,
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            sync_error_count: self.sync_error_count,
            holdover_error_ns: self.clock.holdover_error_ns(&self.profile),
        }
    }
}

/// Read-only snapshot consumed by telemetry and the orchestration layer.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub position: [f64; 3],
    pub is_master: bool,
    pub failed: bool,
    pub clock_class: &'static str,
    pub mode: SyncMode,
    pub phase: ElectionPhase,
    pub offset_ns: f64,
    pub frequency_offset_ppm: f64,
    pub jitter_ns: f64,
    pub sync_quality: f64,
    pub dpll_locked: bool,
    pub sync_count: u64,
    pub stratum: u8,
    pub battery_level: f64,
    pub signal_strength: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub sync_error_count: u64,
    pub holdover_error_ns: f64,
}
