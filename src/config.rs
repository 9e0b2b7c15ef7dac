use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::clock::ClockClass;
use crate::servo::DpllConfig;
use crate::topology::{ConsensusAlgorithm, SyncTopology};

/// Topology selector as it appears in configuration and on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    MasterSlave,
    PeerToPeer,
    Hierarchical,
    Mesh,
}

impl FromStr for TopologyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "master-slave" => Ok(TopologyKind::MasterSlave),
            "peer-to-peer" => Ok(TopologyKind::PeerToPeer),
            "hierarchical" => Ok(TopologyKind::Hierarchical),
            "mesh" => Ok(TopologyKind::Mesh),
            other => bail!(
                "unknown topology '{}', expected master-slave | peer-to-peer | hierarchical | mesh",
                other
            ),
        }
    }
}

impl FromStr for ConsensusAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "weighted-average" => Ok(ConsensusAlgorithm::WeightedAverage),
            "kuramoto" => Ok(ConsensusAlgorithm::Kuramoto),
            other => bail!(
                "unknown consensus algorithm '{}', expected weighted-average | kuramoto",
                other
            ),
        }
    }
}

impl FromStr for ClockClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rubidium" => Ok(ClockClass::Rubidium),
            "ocxo" => Ok(ClockClass::Ocxo),
            "tcxo" => Ok(ClockClass::Tcxo),
            "quartz" => Ok(ClockClass::Quartz),
            other => bail!(
                "unknown clock class '{}', expected rubidium | ocxo | tcxo | quartz",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub ensemble: EnsembleConfig,
    pub link: LinkConfig,
    pub control: ControlConfig,
    pub failure: FailureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub node_count: usize,
    pub topology: TopologyKind,
    pub consensus_algorithm: ConsensusAlgorithm,
    /// Seconds of simulated time per sync cycle.
    pub sync_interval_s: f64,
    pub radio_range_m: f64,
    /// Nodes are placed uniformly within this radius at setup.
    pub placement_radius_m: f64,
    pub master_clock: ClockClass,
    pub slave_clock: ClockClass,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub loss_probability: f64,
    pub multipath_sigma_ns: f64,
    /// Consensus self-weight.
    pub self_weight: f64,
    /// Kuramoto coupling strength K.
    pub coupling_strength: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub max_integral: f64,
    pub max_correction_ns: f64,
    pub lock_threshold_ns: f64,
    /// Residual below this resets clock holdover.
    pub quality_threshold_ns: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    pub enabled: bool,
    /// Per-tick probability of a spontaneous master failure.
    pub per_tick_probability: f64,
    /// Elevated failure probability once battery drops below the threshold.
    pub low_battery_probability: f64,
    pub low_battery_threshold: f64,
    pub election_timeout_s: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            ensemble: EnsembleConfig {
                node_count: 10,
                topology: TopologyKind::MasterSlave,
                consensus_algorithm: ConsensusAlgorithm::WeightedAverage,
                sync_interval_s: 1.0,
                radio_range_m: 500.0,
                placement_radius_m: 200.0,
                master_clock: ClockClass::Rubidium,
                slave_clock: ClockClass::Tcxo,
                seed: 0,
            },
            link: LinkConfig {
                loss_probability: 0.02,
                multipath_sigma_ns: 10.0,
                self_weight: 0.6,
                // K * dt must stay below 1 or the phase update overshoots.
                coupling_strength: 0.5,
            },
            control: ControlConfig {
                kp: 0.8,
                ki: 0.2,
                kd: 0.05,
                max_integral: 1000.0,
                max_correction_ns: 1e6,
                lock_threshold_ns: 1.0,
                quality_threshold_ns: 100.0,
            },
            failure: FailureConfig {
                enabled: false,
                per_tick_probability: 0.001,
                low_battery_probability: 0.05,
                low_battery_threshold: 0.3,
                election_timeout_s: 5.0,
            },
        }
    }
}

impl SimConfig {
    /// Reject a configuration before it reaches the ensemble. Every error
    /// names the offending field and value.
    pub fn validate(&self) -> Result<()> {
        let e = &self.ensemble;
        if e.node_count == 0 {
            bail!("ensemble.node_count must be at least 1");
        }
        if !(e.sync_interval_s > 0.0) {
            bail!("ensemble.sync_interval_s must be positive, got {}", e.sync_interval_s);
        }
        if !(e.radio_range_m > 0.0) {
            bail!("ensemble.radio_range_m must be positive, got {}", e.radio_range_m);
        }
        if !(e.placement_radius_m > 0.0) {
            bail!(
                "ensemble.placement_radius_m must be positive, got {}",
                e.placement_radius_m
            );
        }

        let l = &self.link;
        if !(0.0..=1.0).contains(&l.loss_probability) {
            bail!("link.loss_probability must be in [0,1], got {}", l.loss_probability);
        }
        if !(0.0..=1.0).contains(&l.self_weight) {
            bail!("link.self_weight must be in [0,1], got {}", l.self_weight);
        }
        if l.multipath_sigma_ns < 0.0 {
            bail!("link.multipath_sigma_ns must be non-negative, got {}", l.multipath_sigma_ns);
        }
        if !(l.coupling_strength > 0.0) {
            bail!("link.coupling_strength must be positive, got {}", l.coupling_strength);
        }

        let c = &self.control;
        if !(c.lock_threshold_ns > 0.0) {
            bail!("control.lock_threshold_ns must be positive, got {}", c.lock_threshold_ns);
        }
        if !(c.quality_threshold_ns > 0.0) {
            bail!(
                "control.quality_threshold_ns must be positive, got {}",
                c.quality_threshold_ns
            );
        }

        let f = &self.failure;
        if !(0.0..=1.0).contains(&f.per_tick_probability) {
            bail!(
                "failure.per_tick_probability must be in [0,1], got {}",
                f.per_tick_probability
            );
        }
        if !(0.0..=1.0).contains(&f.low_battery_probability) {
            bail!(
                "failure.low_battery_probability must be in [0,1], got {}",
                f.low_battery_probability
            );
        }
        if !(f.election_timeout_s > 0.0) {
            bail!("failure.election_timeout_s must be positive, got {}", f.election_timeout_s);
        }
        Ok(())
    }

    pub fn sync_topology(&self) -> SyncTopology {
        match self.ensemble.topology {
            TopologyKind::MasterSlave => SyncTopology::MasterSlave,
            TopologyKind::PeerToPeer => SyncTopology::PeerToPeer {
                algorithm: self.ensemble.consensus_algorithm,
            },
            TopologyKind::Hierarchical => SyncTopology::Hierarchical,
            TopologyKind::Mesh => SyncTopology::Mesh,
        }
    }

    pub fn dpll(&self) -> DpllConfig {
        DpllConfig {
            kp: self.control.kp,
            ki: self.control.ki,
            kd: self.control.kd,
            max_integral: self.control.max_integral,
            max_correction_ns: self.control.max_correction_ns,
            lock_threshold_ns: self.control.lock_threshold_ns,
        }
    }
}

/// Runtime-adjustable subset, applied through `Simulator::update_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub sync_interval_s: Option<f64>,
    pub loss_probability: Option<f64>,
    pub multipath_sigma_ns: Option<f64>,
    pub self_weight: Option<f64>,
    pub coupling_strength: Option<f64>,
    pub failure_enabled: Option<bool>,
    pub failure_probability: Option<f64>,
    pub election_timeout_s: Option<f64>,
}

impl ConfigPatch {
    pub fn apply(&self, cfg: &mut SimConfig) {
        if let Some(v) = self.sync_interval_s {
            cfg.ensemble.sync_interval_s = v;
        }
        if let Some(v) = self.loss_probability {
            cfg.link.loss_probability = v;
        }
        if let Some(v) = self.multipath_sigma_ns {
            cfg.link.multipath_sigma_ns = v;
        }
        if let Some(v) = self.self_weight {
            cfg.link.self_weight = v;
        }
        if let Some(v) = self.coupling_strength {
            cfg.link.coupling_strength = v;
        }
        if let Some(v) = self.failure_enabled {
            cfg.failure.enabled = v;
        }
        if let Some(v) = self.failure_probability {
            cfg.failure.per_tick_probability = v;
        }
        if let Some(v) = self.election_timeout_s {
            cfg.failure.election_timeout_s = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let mut cfg = SimConfig::default();
        cfg.ensemble.node_count = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("node_count"), "unexpected message: {err}");
    }

    #[test]
    fn test_out_of_range_probability_rejected() {
        let mut cfg = SimConfig::default();
        cfg.link.loss_probability = 1.5;
        assert!(cfg.validate().is_err());
        cfg.link.loss_probability = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        let mut cfg = SimConfig::default();
        cfg.ensemble.sync_interval_s = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_topology_from_str() {
        assert_eq!(
            "peer-to-peer".parse::<TopologyKind>().unwrap(),
            TopologyKind::PeerToPeer
        );
        assert!("ring".parse::<TopologyKind>().is_err());
        assert_eq!(
            "kuramoto".parse::<ConsensusAlgorithm>().unwrap(),
            ConsensusAlgorithm::Kuramoto
        );
        assert_eq!("ocxo".parse::<ClockClass>().unwrap(), ClockClass::Ocxo);
        assert!("cesium".parse::<ClockClass>().is_err());
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let mut cfg = SimConfig::default();
        let patch = ConfigPatch {
            loss_probability: Some(0.3),
            failure_enabled: Some(true),
            ..ConfigPatch::default()
        };
        patch.apply(&mut cfg);
        assert_eq!(cfg.link.loss_probability, 0.3);
        assert!(cfg.failure.enabled);
        assert_eq!(cfg.ensemble.sync_interval_s, 1.0);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let cfg = SimConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SimConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ensemble.node_count, cfg.ensemble.node_count);
        assert_eq!(back.ensemble.topology, cfg.ensemble.topology);
    }
}
