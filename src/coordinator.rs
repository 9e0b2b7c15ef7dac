//! Ensemble coordinator.
//!
//! One owner for the whole node collection: each `run_sync_cycle` advances
//! every oscillator, simulates failures, drives the election machine, runs
//! the topology exchanges against an immutable per-cycle peer view and then
//! recomputes the aggregate metrics from scratch. Recomputing instead of
//! incrementally maintaining keeps the metrics consistent across elections
//! and prunes.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::{SimConfig, TopologyKind};
use crate::election::{run_election_step, ElectionPhase};
use crate::exchange::SimulatedLink;
use crate::node::{Node, NodeId, NodeStatus, SyncMode};
use crate::topology::{order_parameter, phase_of, PeerView, SyncParams, SyncTopology};

/// Sync quality above which a node counts toward coverage.
const COVERAGE_QUALITY: f64 = 0.5;

/// Sync quality required to stand as a fallback master.
const MASTER_QUALITY: f64 = 0.8;

/// Aggregate view recomputed at the end of every cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnsembleMetrics {
    pub time_s: f64,
    /// Mean |offset| of active non-master nodes relative to the master (ns).
    pub average_offset_ns: f64,
    pub max_offset_ns: f64,
    /// Fraction of active nodes with sync quality above the coverage bar.
    pub sync_coverage: f64,
    /// Max stratum among synchronized active nodes.
    pub network_diameter: u8,
    /// 1 - failed fraction over the current fleet.
    pub failure_resilience: f64,
    pub dpll_locked_count: usize,
    pub order_parameter: f64,
    pub master_id: Option<NodeId>,
    pub active_count: usize,
    pub failed_count: usize,
    pub master_count: usize,
    pub slave_count: usize,
    pub relay_count: usize,
    pub gateway_count: usize,
}

/// What happened during one cycle, for telemetry.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub newly_failed: Vec<NodeId>,
    pub promoted: Option<NodeId>,
    pub pruned: Vec<NodeId>,
}

pub struct Ensemble {
    cfg: SimConfig,
    nodes: Vec<Node>,
    rng: StdRng,
    link: SimulatedLink,
    topology: SyncTopology,
    /// Weak reference to the current master, by id.
    master_id: Option<NodeId>,
    now_s: f64,
    metrics: EnsembleMetrics,
    /// Failed nodes already alerted, removed at the start of the next cycle.
    pending_prune: Vec<NodeId>,
}

impl Ensemble {
    pub fn new(cfg: SimConfig) -> Self {
        let e = &cfg.ensemble;
        let mut rng = StdRng::seed_from_u64(e.seed);
        let link = SimulatedLink::new(e.seed.wrapping_add(1));

        let mut nodes = Vec::with_capacity(e.node_count);
        for id in 0..e.node_count as NodeId {
            let is_master = id == 0;
            let class = if is_master { e.master_clock } else { e.slave_clock };
            let r = e.placement_radius_m;
            let position = if is_master {
                [0.0, 0.0, 30.0]
            } else {
                [
                    rng.random_range(-r..r),
                    rng.random_range(-r..r),
                    rng.random_range(10.0..50.0),
                ]
            };
            let mut node = Node::new(id, class, position, is_master, &mut rng);
            node.dpll = crate::servo::Dpll::new(cfg.dpll());
            nodes.push(node);
        }

        let topology = cfg.sync_topology();
        info!(
            "ensemble: {} nodes, topology {:?}, seed {}",
            nodes.len(),
            topology,
            e.seed
        );
        Ensemble {
            cfg,
            nodes,
            rng,
            link,
            topology,
            master_id: Some(0),
            now_s: 0.0,
            metrics: EnsembleMetrics::default(),
            pending_prune: Vec::new(),
        }
    }

    pub fn now_s(&self) -> f64 {
        self.now_s
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn metrics(&self) -> &EnsembleMetrics {
        &self.metrics
    }

    pub fn master_id(&self) -> Option<NodeId> {
        self.master_id
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn config_mut(&mut self) -> &mut SimConfig {
        &mut self.cfg
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(Node::status).collect()
    }

    /// Force a node into permanent failure (used by failure injection).
    pub fn fail_node(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.iter_mut().find(|n| n.id == id) {
            warn!("node {}: forced failure", id);
            n.failed = true;
            if n.is_master {
                n.is_master = false;
                n.phase = ElectionPhase::Following;
                n.mode = SyncMode::Slave;
            }
        }
        if self.master_id == Some(id) {
            self.master_id = None;
        }
    }

    /// One full sync cycle over `dt` simulated seconds.
    pub fn run_sync_cycle(&mut self, dt: f64) -> CycleReport {
        let mut report = CycleReport::default();
        if !(dt > 0.0) {
            return report;
        }
        self.now_s += dt;

        // Remove nodes whose failure was observed last cycle.
        if !self.pending_prune.is_empty() {
            let prune = std::mem::take(&mut self.pending_prune);
            self.nodes.retain(|n| !prune.contains(&n.id));
            info!("pruned failed nodes: {:?}", prune);
            report.pruned = prune;
        }

        for n in self.nodes.iter_mut() {
            n.tick(dt, &mut self.rng);
        }

        if self.cfg.failure.enabled {
            self.simulate_failures();
        }
        for n in self.nodes.iter().filter(|n| n.failed) {
            if !self.pending_prune.contains(&n.id) {
                self.pending_prune.push(n.id);
                report.newly_failed.push(n.id);
            }
        }

        report.promoted =
            run_election_step(&mut self.nodes, self.now_s, self.cfg.failure.election_timeout_s);
        if let Some(id) = report.promoted {
            self.master_id = Some(id);
        }
        if let Some(id) = self.master_id {
            if !self.nodes.iter().any(|n| n.id == id && n.is_master && !n.failed) {
                self.master_id = None;
            }
        }
        if self.master_id.is_none() {
            self.reselect_master();
        }

        self.run_exchanges(dt);
        self.derive_modes();
        self.recompute_metrics();
        report
    }

    fn simulate_failures(&mut self) {
        let f = self.cfg.failure.clone();
        for n in self.nodes.iter_mut() {
            if n.failed {
                continue;
            }
            let mut p = f.per_tick_probability;
            if n.is_master && n.battery_level < f.low_battery_threshold {
                p += f.low_battery_probability;
            }
            if p > 0.0 && self.rng.random::<f64>() < p {
                warn!("node {}: simulated failure at t={:.1}s", n.id, self.now_s);
                n.failed = true;
                if n.is_master {
                    // Self-demotion: stop acting as a time source.
                    n.is_master = false;
                    n.phase = ElectionPhase::Following;
                    n.mode = SyncMode::Slave;
                }
            }
        }
        if let Some(id) = self.master_id {
            if self.nodes.iter().any(|n| n.id == id && n.failed) {
                self.master_id = None;
            }
        }
    }

    /// Fast-path reselection when no live master exists and no election is
    /// in progress: pick the highest-quality candidate above the quality
    /// bar, lowest id on ties. The voting machine covers the case where no
    /// candidate clears the bar.
    fn reselect_master(&mut self) {
        let election_in_progress = self.nodes.iter().any(|n| {
            n.phase == ElectionPhase::Detecting || n.phase == ElectionPhase::Candidate
        });
        if election_in_progress {
            return;
        }
        let best = self
            .nodes
            .iter()
            .filter(|n| !n.failed && n.sync_quality > MASTER_QUALITY)
            .max_by(|a, b| {
                a.sync_quality
                    .total_cmp(&b.sync_quality)
                    .then(b.id.cmp(&a.id))
            })
            .map(|n| n.id);
        if let Some(id) = best {
            info!("reselecting master: node {}", id);
            for n in self.nodes.iter_mut() {
                if n.id == id {
                    n.is_master = true;
                    n.phase = ElectionPhase::Leading;
                    n.mode = SyncMode::Master;
                    n.stratum = 0;
                } else {
                    n.reset_election_state(self.now_s);
                }
            }
            self.master_id = Some(id);
        }
    }

    fn run_exchanges(&mut self, dt: f64) {
        let params = SyncParams {
            radio_range_m: self.cfg.ensemble.radio_range_m,
            loss_probability: self.cfg.link.loss_probability,
            multipath_sigma_ns: self.cfg.link.multipath_sigma_ns,
            self_weight: self.cfg.link.self_weight,
            coupling_strength: self.cfg.link.coupling_strength,
            quality_threshold_ns: self.cfg.control.quality_threshold_ns,
            now_s: self.now_s,
            dt,
        };

        let view: Vec<PeerView> = self
            .nodes
            .iter()
            .map(|n| PeerView {
                id: n.id,
                position: n.position,
                offset_ns: n.clock.offset_ns,
                stratum: n.stratum,
                is_master: n.is_master,
                failed: n.failed,
                clock_rank: n.profile.class.rank(),
                accuracy_ppm: n.profile.accuracy_ppm,
                stability_weight: n.profile.stability_weight,
                sync_quality: n.sync_quality,
            })
            .collect();

        let Ensemble {
            nodes,
            rng,
            link,
            topology,
            ..
        } = self;
        for node in nodes.iter_mut() {
            let peers: Vec<PeerView> =
                view.iter().filter(|p| p.id != node.id).copied().collect();
            topology.run_cycle(node, &peers, &params, &mut *link, &mut *rng);
        }
    }

    /// Derive per-cycle sync roles from the topology shape.
    fn derive_modes(&mut self) {
        let strata: Vec<u8> = self.nodes.iter().map(|n| n.stratum).collect();
        let positions: Vec<(NodeId, [f64; 3], bool)> = self
            .nodes
            .iter()
            .map(|n| (n.id, n.position, n.failed))
            .collect();
        let range = self.cfg.ensemble.radio_range_m;
        let topology_kind = self.cfg.ensemble.topology;

        for n in self.nodes.iter_mut() {
            if n.failed {
                continue;
            }
            if n.is_master {
                n.mode = SyncMode::Master;
                continue;
            }
            n.mode = match topology_kind {
                TopologyKind::Hierarchical => {
                    let has_child = n.stratum < u8::MAX
                        && strata.iter().any(|&s| s == n.stratum.saturating_add(1));
                    if n.stratum > 0 && has_child {
                        SyncMode::Relay
                    } else {
                        SyncMode::Slave
                    }
                }
                TopologyKind::Mesh => {
                    let neighbor_count = positions
                        .iter()
                        .filter(|(id, pos, failed)| {
                            *id != n.id && !*failed && n.distance_to(*pos) <= range
                        })
                        .count();
                    if neighbor_count >= 3 {
                        SyncMode::Gateway
                    } else {
                        SyncMode::Slave
                    }
                }
                _ => SyncMode::Slave,
            };
        }
    }

    fn recompute_metrics(&mut self) {
        let active: Vec<&Node> = self.nodes.iter().filter(|n| !n.failed).collect();
        let failed_count = self.nodes.len() - active.len();

        let master_offset = self
            .master_id
            .and_then(|id| active.iter().find(|n| n.id == id))
            .map(|m| m.clock.offset_ns)
            .unwrap_or(0.0);

        let rel_offsets: Vec<f64> = active
            .iter()
            .filter(|n| !n.is_master)
            .map(|n| (n.clock.offset_ns - master_offset).abs())
            .collect();
        let average_offset_ns = if rel_offsets.is_empty() {
            0.0
        } else {
            rel_offsets.iter().sum::<f64>() / rel_offsets.len() as f64
        };
        let max_offset_ns = rel_offsets.iter().copied().fold(0.0, f64::max);

        let covered = active
            .iter()
            .filter(|n| n.sync_quality > COVERAGE_QUALITY)
            .count();
        let sync_coverage = if active.is_empty() {
            0.0
        } else {
            covered as f64 / active.len() as f64
        };

        let network_diameter = active
            .iter()
            .map(|n| n.stratum)
            .filter(|&s| s < u8::MAX)
            .max()
            .unwrap_or(0);

        let failure_resilience = if self.nodes.is_empty() {
            0.0
        } else {
            1.0 - failed_count as f64 / self.nodes.len() as f64
        };

        let phases: Vec<f64> = active
            .iter()
            .map(|n| phase_of(n.clock.offset_ns - master_offset))
            .collect();

        let mode_count = |m: SyncMode| active.iter().filter(|n| n.mode == m).count();

        self.metrics = EnsembleMetrics {
            time_s: self.now_s,
            average_offset_ns,
            max_offset_ns,
            sync_coverage,
            network_diameter,
            failure_resilience,
            dpll_locked_count: active
                .iter()
                .filter(|n| !n.is_master && n.dpll.locked)
                .count(),
            order_parameter: order_parameter(&phases),
            master_id: self.master_id,
            active_count: active.len(),
            failed_count,
            master_count: mode_count(SyncMode::Master),
            slave_count: mode_count(SyncMode::Slave),
            relay_count: mode_count(SyncMode::Relay),
            gateway_count: mode_count(SyncMode::Gateway),
        };
    }
}
