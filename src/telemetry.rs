//! Snapshot history and alerting.
//!
//! The telemetry store is passive: the orchestration layer feeds it one
//! observation per sync cycle and polls the alert stream. Alerts are
//! append-only records with no deduplication; consumers that want edge
//! triggering can diff consecutive snapshots.

use std::collections::VecDeque;

use log::warn;
use serde::Serialize;

use crate::coordinator::{CycleReport, EnsembleMetrics};
use crate::node::{NodeId, NodeStatus};

/// Bound on the retained snapshot history.
pub const MAX_HISTORY: usize = 1000;

/// Offset magnitude (ns) above which a node is alerted.
pub const HIGH_OFFSET_NS: f64 = 1e6;

/// Per-node sync-quality floor.
pub const LOW_QUALITY: f64 = 0.3;

/// Ensemble-wide coverage floor.
pub const LOW_COVERAGE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    HighOffset,
    NodeFailure,
    LowSyncQuality,
    LowSyncCoverage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub time_s: f64,
    pub kind: AlertKind,
    /// Node the alert refers to; `None` for ensemble-wide conditions.
    pub subject: Option<NodeId>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub time_s: f64,
    pub metrics: EnsembleMetrics,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Default)]
pub struct Telemetry {
    history: VecDeque<TelemetrySnapshot>,
    alerts: Vec<Alert>,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry::default()
    }

    pub fn history(&self) -> &VecDeque<TelemetrySnapshot> {
        &self.history
    }

    pub fn latest(&self) -> Option<&TelemetrySnapshot> {
        self.history.back()
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Record one cycle's state and evaluate every alert rule against it.
    pub fn observe(
        &mut self,
        metrics: &EnsembleMetrics,
        nodes: Vec<NodeStatus>,
        report: &CycleReport,
    ) {
        let t = metrics.time_s;

        for id in &report.newly_failed {
            self.push_alert(Alert {
                time_s: t,
                kind: AlertKind::NodeFailure,
                subject: Some(*id),
                value: 1.0,
            });
        }

        for n in &nodes {
            if n.failed {
                continue;
            }
            if n.offset_ns.abs() > HIGH_OFFSET_NS {
                self.push_alert(Alert {
                    time_s: t,
                    kind: AlertKind::HighOffset,
                    subject: Some(n.id),
                    value: n.offset_ns,
                });
            }
            if !n.is_master && n.sync_quality < LOW_QUALITY {
                self.push_alert(Alert {
                    time_s: t,
                    kind: AlertKind::LowSyncQuality,
                    subject: Some(n.id),
                    value: n.sync_quality,
                });
            }
        }

        if metrics.sync_coverage < LOW_COVERAGE {
            self.push_alert(Alert {
                time_s: t,
                kind: AlertKind::LowSyncCoverage,
                subject: None,
                value: metrics.sync_coverage,
            });
        }

        self.history.push_back(TelemetrySnapshot {
            time_s: t,
            metrics: metrics.clone(),
            nodes,
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    fn push_alert(&mut self, alert: Alert) {
        warn!(
            "alert at t={:.1}s: {:?} subject={:?} value={:.3}",
            alert.time_s, alert.kind, alert.subject, alert.value
        );
        self.alerts.push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::ElectionPhase;
    use crate::node::SyncMode;

    fn status(id: NodeId) -> NodeStatus {
        NodeStatus {
            id,
            position: [0.0, 0.0, 0.0],
            is_master: id == 0,
            failed: false,
            clock_class: "ocxo",
            mode: if id == 0 {
                SyncMode::Master
            } else {
                SyncMode::Slave
            },
            phase: if id == 0 {
                ElectionPhase::Leading
            } else {
                ElectionPhase::Following
            },
            offset_ns: 0.0,
            frequency_offset_ppm: 0.0,
            jitter_ns: 1.0,
            sync_quality: 0.9,
            dpll_locked: true,
            sync_count: 10,
            stratum: if id == 0 { 0 } else { 1 },
            battery_level: 1.0,
            signal_strength: 0.9,
            packets_sent: 10,
            packets_received: 10,
            sync_error_count: 0,
            holdover_error_ns: 0.0,
        }
    }

    fn healthy_metrics(t: f64) -> EnsembleMetrics {
        EnsembleMetrics {
            time_s: t,
            sync_coverage: 1.0,
            failure_resilience: 1.0,
            ..EnsembleMetrics::default()
        }
    }

    #[test]
    fn test_healthy_cycle_produces_no_alerts() {
        let mut tel = Telemetry::new();
        tel.observe(
            &healthy_metrics(1.0),
            vec![status(0), status(1)],
            &CycleReport::default(),
        );
        assert!(tel.alerts().is_empty());
        assert_eq!(tel.history().len(), 1);
        assert_eq!(tel.latest().unwrap().time_s, 1.0);
    }

    #[test]
    fn test_high_offset_alert() {
        let mut tel = Telemetry::new();
        let mut bad = status(1);
        bad.offset_ns = 2e6;
        tel.observe(&healthy_metrics(1.0), vec![status(0), bad], &CycleReport::default());
        assert_eq!(tel.alerts().len(), 1);
        assert_eq!(tel.alerts()[0].kind, AlertKind::HighOffset);
        assert_eq!(tel.alerts()[0].subject, Some(1));
    }

    #[test]
    fn test_node_failure_alert() {
        let mut tel = Telemetry::new();
        let report = CycleReport {
            newly_failed: vec![3],
            ..CycleReport::default()
        };
        tel.observe(&healthy_metrics(2.0), vec![status(0)], &report);
        assert_eq!(tel.alerts().len(), 1);
        assert_eq!(tel.alerts()[0].kind, AlertKind::NodeFailure);
        assert_eq!(tel.alerts()[0].subject, Some(3));
    }

    #[test]
    fn test_low_quality_and_coverage_alerts() {
        let mut tel = Telemetry::new();
        let mut weak = status(2);
        weak.sync_quality = 0.1;
        let mut metrics = healthy_metrics(3.0);
        metrics.sync_coverage = 0.5;
        tel.observe(&metrics, vec![status(0), weak], &CycleReport::default());

        let kinds: Vec<AlertKind> = tel.alerts().iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AlertKind::LowSyncQuality));
        assert!(kinds.contains(&AlertKind::LowSyncCoverage));
    }

    #[test]
    fn test_master_quality_not_alerted() {
        let mut tel = Telemetry::new();
        let mut master = status(0);
        master.sync_quality = 0.0;
        tel.observe(&healthy_metrics(1.0), vec![master], &CycleReport::default());
        assert!(tel.alerts().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tel = Telemetry::new();
        for i in 0..(MAX_HISTORY + 100) {
            tel.observe(
                &healthy_metrics(i as f64),
                vec![status(0)],
                &CycleReport::default(),
            );
        }
        assert_eq!(tel.history().len(), MAX_HISTORY);
        // Oldest entries dropped first.
        assert_eq!(tel.history().front().unwrap().time_s, 100.0);
    }

    #[test]
    fn test_alerts_are_append_only_ordered() {
        let mut tel = Telemetry::new();
        for t in 1..=3 {
            let report = CycleReport {
                newly_failed: vec![t as NodeId],
                ..CycleReport::default()
            };
            tel.observe(&healthy_metrics(t as f64), vec![status(0)], &report);
        }
        let times: Vec<f64> = tel.alerts().iter().map(|a| a.time_s).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
    }
}
