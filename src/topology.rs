//! Synchronization topology strategies.
//!
//! One tagged variant per strategy, all driving the same node/exchange data
//! model. Strategies receive an immutable snapshot of the peers and mutate
//! only the node under update; the coordinator owns the iteration order.

use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::exchange::{LinkImpairment, RadioLink};
use crate::node::{Node, NodeId};

/// Signal propagation in ns per meter of range (free-space light speed).
pub const PROPAGATION_NS_PER_M: f64 = 3.336;

/// Offset-to-phase scale for Kuramoto coupling: one full turn per 1 ms.
pub const PHASE_PERIOD_NS: f64 = 1e6;

/// Floor applied to distance-derived link quality.
pub const QUALITY_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusAlgorithm {
    WeightedAverage,
    Kuramoto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTopology {
    MasterSlave,
    PeerToPeer { algorithm: ConsensusAlgorithm },
    Hierarchical,
    Mesh,
}

/// Immutable per-cycle view of one peer, published by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct PeerView {
    pub id: NodeId,
    pub position: [f64; 3],
    pub offset_ns: f64,
    pub stratum: u8,
    pub is_master: bool,
    pub failed: bool,
    pub clock_rank: i64,
    pub accuracy_ppm: f64,
    pub stability_weight: f64,
    pub sync_quality: f64,
}

/// Per-cycle tuning shared by every strategy.
#[derive(Debug, Clone, Copy)]
pub struct SyncParams {
    pub radio_range_m: f64,
    pub loss_probability: f64,
    pub multipath_sigma_ns: f64,
    /// Consensus self-weight in [0, 1].
    pub self_weight: f64,
    /// Kuramoto coupling strength K.
    pub coupling_strength: f64,
    /// Residual below this resets holdover.
    pub quality_threshold_ns: f64,
    /// Simulation time at the start of the cycle (s).
    pub now_s: f64,
    pub dt: f64,
}

/// Distance-derived link quality with the configured floor.
fn link_quality(distance_m: f64, range_m: f64) -> f64 {
    if range_m <= 0.0 {
        return QUALITY_FLOOR;
    }
    (1.0 - distance_m / range_m).max(QUALITY_FLOOR)
}

/// Map a time offset onto the unit circle.
pub fn phase_of(offset_ns: f64) -> f64 {
    offset_ns * std::f64::consts::TAU / PHASE_PERIOD_NS
}

/// Kuramoto order parameter r = |mean(e^{i theta})|, in [0, 1].
pub fn order_parameter(phases: &[f64]) -> f64 {
    if phases.is_empty() {
        return 0.0;
    }
    let (mut re, mut im) = (0.0, 0.0);
    for &theta in phases {
        re += theta.cos();
        im += theta.sin();
    }
    let n = phases.len() as f64;
    ((re / n).powi(2) + (im / n).powi(2)).sqrt()
}

impl SyncTopology {
    /// Run one sync cycle for `node` against the published peer view.
    /// Returns true when a correction was applied; zero eligible partners
    /// is a silent free-run cycle.
    pub fn run_cycle<R: Rng>(
        &self,
        node: &mut Node,
        peers: &[PeerView],
        params: &SyncParams,
        link: &mut dyn RadioLink,
        rng: &mut R,
    ) -> bool {
        if node.failed || node.is_master {
            return false;
        }
        match self {
            SyncTopology::MasterSlave => master_slave(node, peers, params, link),
            SyncTopology::PeerToPeer { algorithm } => match algorithm {
                ConsensusAlgorithm::WeightedAverage => weighted_consensus(node, peers, params),
                ConsensusAlgorithm::Kuramoto => kuramoto(node, peers, params),
            },
            SyncTopology::Hierarchical => hierarchical(node, peers, params, link),
            SyncTopology::Mesh => mesh(node, peers, params, link, rng),
        }
    }
}

/// Full two-way exchange against one partner, feeding both control loops.
/// Shared by the master-slave, hierarchical and mesh single-partner paths.
fn exchange_and_correct(
    node: &mut Node,
    partner: &PeerView,
    quality: f64,
    params: &SyncParams,
    link: &mut dyn RadioLink,
) -> bool {
    let distance = node.distance_to(partner.position);
    let impairment = LinkImpairment {
        loss_probability: params.loss_probability,
        multipath_sigma_ns: params.multipath_sigma_ns,
        path_delay_ns: distance * PROPAGATION_NS_PER_M,
    };
    let true_offset = partner.offset_ns - node.clock.offset_ns;

    node.packets_sent += 1;
    let Some(res) = link.exchange(true_offset, &impairment, partner.stratum) else {
        node.sync_error_count += 1;
        trace!("node {}: exchange with {} lost", node.id, partner.id);
        return false;
    };
    node.packets_received += 1;

    // Raw offset is remote minus local; the loops work in local-minus-remote.
    let raw = res.offset_ns - node.asymmetry.correction_ns(res.delay_ns);
    let error_ns = -raw;

    node.kalman.predict(params.dt);
    let variance = (node.clock.jitter_ns + params.multipath_sigma_ns).powi(2).max(1.0);
    node.kalman.update(error_ns, variance);
    node.asymmetry.observe(error_ns, node.kalman.offset_ns());

    // Drift estimate trims the frequency correction (ns/s to ppm).
    node.clock.freq_offset_ppm -= 0.1 * node.kalman.drift_ns_per_s() / 1000.0;

    let correction = node.dpll.update(error_ns, params.dt);
    node.apply_correction(correction * quality, params.quality_threshold_ns);

    node.sync_quality = quality;
    if partner.stratum < u8::MAX && partner.stratum.saturating_add(1) < node.stratum {
        node.stratum = partner.stratum + 1;
    }
    if partner.is_master {
        node.last_master_contact_s = params.now_s;
    }
    debug!(
        "node {}: exchange with {} err={:.1}ns q={:.2}",
        node.id, partner.id, error_ns, quality
    );
    true
}

fn master_slave(
    node: &mut Node,
    peers: &[PeerView],
    params: &SyncParams,
    link: &mut dyn RadioLink,
) -> bool {
    let Some(master) = peers.iter().find(|p| p.is_master && !p.failed) else {
        return false;
    };
    let quality = link_quality(node.distance_to(master.position), params.radio_range_m);
    exchange_and_correct(node, master, quality, params, link)
}

fn neighbors<'a>(node: &Node, peers: &'a [PeerView], range_m: f64) -> Vec<&'a PeerView> {
    peers
        .iter()
        .filter(|p| !p.failed && node.distance_to(p.position) <= range_m)
        .collect()
}

fn propagate_stratum(node: &mut Node, nbrs: &[&PeerView]) {
    if let Some(min) = nbrs.iter().map(|p| p.stratum).min() {
        if min < u8::MAX && min.saturating_add(1) < node.stratum {
            node.stratum = min + 1;
        }
    }
}

fn weighted_consensus(node: &mut Node, peers: &[PeerView], params: &SyncParams) -> bool {
    let nbrs = neighbors(node, peers, params.radio_range_m);
    if nbrs.is_empty() {
        return false;
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for p in &nbrs {
        let q = link_quality(node.distance_to(p.position), params.radio_range_m);
        let w = q * p.stability_weight;
        weighted_sum += w * p.offset_ns;
        weight_total += w;
    }
    if weight_total <= 0.0 {
        return false;
    }
    let neighbor_mean = weighted_sum / weight_total;

    let target = params.self_weight * node.clock.offset_ns
        + (1.0 - params.self_weight) * neighbor_mean;
    let correction = node.clock.offset_ns - target;
    node.apply_correction(correction, params.quality_threshold_ns);
    node.sync_quality = (weight_total / nbrs.len() as f64).min(1.0);

    if nbrs.iter().any(|p| p.is_master) {
        node.last_master_contact_s = params.now_s;
    }
    propagate_stratum(node, &nbrs);
    true
}

fn kuramoto(node: &mut Node, peers: &[PeerView], params: &SyncParams) -> bool {
    let nbrs = neighbors(node, peers, params.radio_range_m);
    if nbrs.is_empty() {
        return false;
    }

    // d theta/dt = omega + (K/N) sum sin(theta_j - theta_i). The natural
    // frequency term is already produced by the oscillator model, so only
    // the coupling sum acts here.
    let theta_i = phase_of(node.clock.offset_ns);
    let coupling: f64 = nbrs
        .iter()
        .map(|p| (phase_of(p.offset_ns) - theta_i).sin())
        .sum::<f64>()
        * params.coupling_strength
        / nbrs.len() as f64;

    let dtheta = coupling * params.dt;
    let correction = -dtheta * PHASE_PERIOD_NS / std::f64::consts::TAU;
    node.apply_correction(correction, params.quality_threshold_ns);
    node.sync_quality = nbrs
        .iter()
        .map(|p| link_quality(node.distance_to(p.position), params.radio_range_m))
        .fold(0.0, f64::max);

    if nbrs.iter().any(|p| p.is_master) {
        node.last_master_contact_s = params.now_s;
    }
    propagate_stratum(node, &nbrs);
    true
}

fn hierarchical(
    node: &mut Node,
    peers: &[PeerView],
    params: &SyncParams,
    link: &mut dyn RadioLink,
) -> bool {
    // Greedy parent: nearest peer with strictly better absolute accuracy.
    let parent = peers
        .iter()
        .filter(|p| !p.failed && p.accuracy_ppm < node.profile.accuracy_ppm)
        .min_by(|a, b| {
            node.distance_to(a.position)
                .total_cmp(&node.distance_to(b.position))
        });
    let Some(parent) = parent else {
        return false;
    };
    let quality = link_quality(node.distance_to(parent.position), params.radio_range_m);
    exchange_and_correct(node, parent, quality, params, link)
}

fn mesh<R: Rng>(
    node: &mut Node,
    peers: &[PeerView],
    params: &SyncParams,
    link: &mut dyn RadioLink,
    _rng: &mut R,
) -> bool {
    let nbrs = neighbors(node, peers, params.radio_range_m);
    match nbrs.len() {
        0 => false,
        1 => {
            let quality = link_quality(node.distance_to(nbrs[0].position), params.radio_range_m);
            exchange_and_correct(node, nbrs[0], quality, params, link)
        }
        2 => {
            // Simplified two-timestamp estimate against the best-ranked
            // neighbor: split the difference instead of a full exchange.
            let best = nbrs.iter().copied().max_by(|a, b| {
                a.clock_rank.cmp(&b.clock_rank).then_with(|| {
                    let qa = link_quality(node.distance_to(a.position), params.radio_range_m);
                    let qb = link_quality(node.distance_to(b.position), params.radio_range_m);
                    qa.total_cmp(&qb)
                })
            });
            let Some(best) = best else { return false };
            let correction = 0.5 * (node.clock.offset_ns - best.offset_ns);
            node.apply_correction(correction, params.quality_threshold_ns);
            node.sync_quality =
                link_quality(node.distance_to(best.position), params.radio_range_m);
            if best.is_master {
                node.last_master_contact_s = params.now_s;
            }
            propagate_stratum(node, &nbrs);
            true
        }
        _ => weighted_consensus(node, peers, params),
    }
}
