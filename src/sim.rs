//! Simulation control surface.
//!
//! Thin stateful wrapper the orchestration layer talks to: validated start,
//! cooperative stop, one `tick` per sync interval and read-only snapshots.
//! A shared status cell mirrors the latest metrics for observers on other
//! threads (the binary's ctrl-c handler, an embedding UI).

use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use log::info;
use serde::Serialize;

use crate::config::{ConfigPatch, SimConfig};
use crate::coordinator::{Ensemble, EnsembleMetrics};
use crate::node::{NodeId, NodeStatus};
use crate::telemetry::{Alert, Telemetry};

/// Mirror of the latest cycle, readable without touching the simulator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStatus {
    pub running: bool,
    pub time_s: f64,
    pub metrics: EnsembleMetrics,
    pub alert_count: usize,
}

#[derive(Default)]
pub struct Simulator {
    ensemble: Option<Ensemble>,
    telemetry: Telemetry,
    status: Arc<RwLock<SimStatus>>,
}

impl Simulator {
    pub fn new() -> Self {
        Simulator::default()
    }

    /// Validate and apply a configuration, building a fresh ensemble.
    /// Restarting an already-running simulation replaces it wholesale.
    pub fn start(&mut self, cfg: SimConfig) -> Result<()> {
        cfg.validate()?;
        info!(
            "starting simulation: {} nodes, topology {:?}",
            cfg.ensemble.node_count, cfg.ensemble.topology
        );
        self.ensemble = Some(Ensemble::new(cfg));
        self.telemetry = Telemetry::new();
        if let Ok(mut s) = self.status.write() {
            *s = SimStatus {
                running: true,
                ..SimStatus::default()
            };
        }
        Ok(())
    }

    /// Stop issuing further cycles. Snapshots and alerts stay readable.
    pub fn stop(&mut self) {
        if self.ensemble.take().is_some() {
            info!("simulation stopped");
        }
        if let Ok(mut s) = self.status.write() {
            s.running = false;
        }
    }

    pub fn is_running(&self) -> bool {
        self.ensemble.is_some()
    }

    /// Run one sync cycle of the configured interval.
    pub fn tick(&mut self) -> Result<EnsembleMetrics> {
        let Some(ensemble) = self.ensemble.as_mut() else {
            bail!("simulation is not running");
        };
        let dt = ensemble.config().ensemble.sync_interval_s;
        let report = ensemble.run_sync_cycle(dt);
        let metrics = ensemble.metrics().clone();
        self.telemetry
            .observe(&metrics, ensemble.statuses(), &report);

        if let Ok(mut s) = self.status.write() {
            s.running = true;
            s.time_s = metrics.time_s;
            s.metrics = metrics.clone();
            s.alert_count = self.telemetry.alerts().len();
        }
        Ok(metrics)
    }

    pub fn status(&self) -> SimStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Handle for observers on other threads.
    pub fn status_handle(&self) -> Arc<RwLock<SimStatus>> {
        Arc::clone(&self.status)
    }

    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.ensemble
            .as_ref()
            .map(Ensemble::statuses)
            .unwrap_or_default()
    }

    pub fn alerts(&self) -> &[Alert] {
        self.telemetry.alerts()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Apply a runtime patch. The patched configuration is validated before
    /// it takes effect; an invalid patch leaves the current one untouched.
    pub fn update_config(&mut self, patch: &ConfigPatch) -> Result<()> {
        let Some(ensemble) = self.ensemble.as_mut() else {
            bail!("simulation is not running");
        };
        let mut candidate = ensemble.config().clone();
        patch.apply(&mut candidate);
        candidate.validate()?;
        *ensemble.config_mut() = candidate;
        info!("configuration updated");
        Ok(())
    }

    /// Inject a permanent node failure (failure-simulation control).
    pub fn fail_node(&mut self, id: NodeId) -> Result<()> {
        let Some(ensemble) = self.ensemble.as_mut() else {
            bail!("simulation is not running");
        };
        ensemble.fail_node(id);
        Ok(())
    }

    pub fn status_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.status())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimConfig {
        let mut cfg = SimConfig::default();
        cfg.ensemble.node_count = 4;
        cfg.ensemble.seed = 3;
        cfg.link.loss_probability = 0.0;
        cfg
    }

    #[test]
    fn test_tick_before_start_fails() {
        let mut sim = Simulator::new();
        assert!(sim.tick().is_err());
        assert!(!sim.is_running());
    }

    #[test]
    fn test_invalid_config_rejected_at_start() {
        let mut sim = Simulator::new();
        let mut cfg = config();
        cfg.ensemble.node_count = 0;
        assert!(sim.start(cfg).is_err());
        assert!(!sim.is_running());
    }

    #[test]
    fn test_start_tick_stop_lifecycle() {
        let mut sim = Simulator::new();
        sim.start(config()).unwrap();
        assert!(sim.is_running());

        let metrics = sim.tick().unwrap();
        assert!(metrics.time_s > 0.0);
        assert_eq!(sim.nodes().len(), 4);
        assert_eq!(sim.status().metrics.active_count, 4);

        sim.stop();
        assert!(!sim.is_running());
        assert!(sim.tick().is_err());
        // History survives the stop.
        assert_eq!(sim.telemetry().history().len(), 1);
    }

    #[test]
    fn test_status_handle_tracks_progress() {
        let mut sim = Simulator::new();
        sim.start(config()).unwrap();
        let handle = sim.status_handle();
        sim.tick().unwrap();
        sim.tick().unwrap();
        let s = handle.read().unwrap();
        assert!(s.running);
        assert!((s.time_s - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_config_validates_patch() {
        let mut sim = Simulator::new();
        sim.start(config()).unwrap();

        let bad = ConfigPatch {
            loss_probability: Some(2.0),
            ..ConfigPatch::default()
        };
        assert!(sim.update_config(&bad).is_err());

        let good = ConfigPatch {
            loss_probability: Some(0.1),
            ..ConfigPatch::default()
        };
        sim.update_config(&good).unwrap();
        sim.tick().unwrap();
    }

    #[test]
    fn test_status_json_serializes() {
        let mut sim = Simulator::new();
        sim.start(config()).unwrap();
        sim.tick().unwrap();
        let json = sim.status_json().unwrap();
        assert!(json.contains("\"running\": true"));
    }
}
