//! Leader election and failover.
//!
//! Every node runs the same four-state machine. Detection is driven purely
//! by staleness of the coordinator-maintained master contact timestamp, so
//! the whole flow replays deterministically in simulated time.

use log::{info, warn};
use serde::Serialize;

use crate::clock::ClockClass;
use crate::node::{Node, NodeId, SyncMode};

/// Election state per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectionPhase {
    /// Has a live master in contact.
    Following,
    /// Master silent beyond the timeout, no candidate nominated yet.
    Detecting,
    /// Voted for a candidate, awaiting a majority.
    Candidate,
    /// Is the master.
    Leading,
}

/// Weighted candidate score. Higher wins; the id term breaks ties toward
/// lower ids.
pub fn leader_priority(node: &Node) -> f64 {
    node.profile.class.rank() as f64
        + node.profile.stability_weight * 20.0
        + node.battery_level * 10.0
        - node.id as f64 * 0.01
}

/// Simple majority over the active non-master population.
pub fn majority_threshold(active_non_master: usize) -> u32 {
    (active_non_master / 2) as u32 + 1
}

/// Drive every node's election state machine one step.
///
/// Returns the id of a newly promoted leader, if a candidate reached a
/// majority this step.
pub fn run_election_step(nodes: &mut [Node], now_s: f64, timeout_s: f64) -> Option<NodeId> {
    let active_non_master = nodes
        .iter()
        .filter(|n| !n.failed && !n.is_master)
        .count();
    if active_non_master == 0 {
        return None;
    }

    // Following -> Detecting on stale master contact.
    for n in nodes.iter_mut() {
        if n.failed || n.is_master {
            continue;
        }
        if n.phase == ElectionPhase::Following && now_s - n.last_master_contact_s > timeout_s {
            warn!(
                "node {}: master silent for {:.1}s, starting failure detection",
                n.id,
                now_s - n.last_master_contact_s
            );
            n.phase = ElectionPhase::Detecting;
        }
    }

    // A candidate that hears the master again withdraws its vote.
    let mut withdrawn: Vec<NodeId> = Vec::new();
    for n in nodes.iter_mut() {
        if n.phase == ElectionPhase::Candidate && now_s - n.last_master_contact_s <= timeout_s {
            if let Some(c) = n.voted_for.take() {
                withdrawn.push(c);
            }
            n.phase = ElectionPhase::Following;
        }
    }
    for c in withdrawn {
        if let Some(cand) = nodes.iter_mut().find(|n| n.id == c) {
            cand.votes = cand.votes.saturating_sub(1);
        }
    }

    if !nodes.iter().any(|n| n.phase == ElectionPhase::Detecting) {
        return promote_if_majority(nodes, now_s, active_non_master);
    }

    // Rank eligible candidates once; every detecting node votes for the top.
    let mut candidates: Vec<(NodeId, f64)> = nodes
        .iter()
        .filter(|n| n.is_eligible_candidate())
        .map(|n| (n.id, leader_priority(n)))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    let Some(&(top_id, top_priority)) = candidates.first() else {
        warn!("election aborted: no eligible candidates");
        for n in nodes.iter_mut() {
            if n.phase == ElectionPhase::Detecting {
                n.phase = ElectionPhase::Following;
                n.last_master_contact_s = now_s;
            }
        }
        return None;
    };

    let mut new_votes = 0u32;
    for n in nodes.iter_mut() {
        if n.phase == ElectionPhase::Detecting {
            n.phase = ElectionPhase::Candidate;
            n.voted_for = Some(top_id);
            new_votes += 1;
        }
    }
    if let Some(candidate) = nodes.iter_mut().find(|n| n.id == top_id) {
        candidate.votes += new_votes;
        info!(
            "election: {} votes cast for node {} (priority {:.2})",
            new_votes, top_id, top_priority
        );
    }

    promote_if_majority(nodes, now_s, active_non_master)
}

fn promote_if_majority(
    nodes: &mut [Node],
    now_s: f64,
    active_non_master: usize,
) -> Option<NodeId> {
    let needed = majority_threshold(active_non_master);
    let winner = nodes
        .iter()
        .position(|n| !n.failed && !n.is_master && n.votes >= needed)?;

    let winner_id = nodes[winner].id;
    info!(
        "election: node {} reached majority ({} of {} needed), promoting",
        winner_id, nodes[winner].votes, needed
    );

    for (i, n) in nodes.iter_mut().enumerate() {
        if i == winner {
            n.is_master = true;
            n.failed = false;
            n.phase = ElectionPhase::Leading;
            n.mode = SyncMode::Master;
            n.stratum = 0;
            n.sync_quality = 1.0;
            n.votes = 0;
            n.voted_for = None;
            // The reference role gets the best oscillator available.
            n.profile = ClockClass::Rubidium.profile();
        } else {
            n.reset_election_state(now_s);
        }
    }
    Some(winner_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const TIMEOUT_S: f64 = 5.0;

    fn fleet(n: usize) -> Vec<Node> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n as u32)
            .map(|id| {
                Node::new(
                    id,
                    if id == 0 {
                        ClockClass::Rubidium
                    } else {
                        ClockClass::Ocxo
                    },
                    [id as f64 * 10.0, 0.0, 0.0],
                    id == 0,
                    &mut rng,
                )
            })
            .collect()
    }

    fn kill_master(nodes: &mut [Node]) {
        nodes[0].is_master = false;
        nodes[0].failed = true;
        nodes[0].phase = ElectionPhase::Following;
    }

    #[test]
    fn test_majority_threshold() {
        assert_eq!(majority_threshold(4), 3);
        assert_eq!(majority_threshold(5), 3);
        assert_eq!(majority_threshold(1), 1);
    }

    #[test]
    fn test_priority_prefers_better_clock_then_lower_id() {
        let nodes = fleet(3);
        assert!(leader_priority(&nodes[0]) > leader_priority(&nodes[1]));
        assert!(leader_priority(&nodes[1]) > leader_priority(&nodes[2]));
    }

    #[test]
    fn test_no_election_while_master_in_contact() {
        let mut nodes = fleet(5);
        for n in nodes.iter_mut() {
            n.last_master_contact_s = 9.0;
        }
        assert!(run_election_step(&mut nodes, 10.0, TIMEOUT_S).is_none());
        assert!(nodes
            .iter()
            .skip(1)
            .all(|n| n.phase == ElectionPhase::Following));
    }

    #[test]
    fn test_stale_master_triggers_full_election() {
        let mut nodes = fleet(5);
        kill_master(&mut nodes);
        // Everyone last heard the master at t=0; it is now t=10.
        let promoted = run_election_step(&mut nodes, 10.0, TIMEOUT_S);

        // Four voters, majority of 4/2+1 = 3 reached in one step.
        let new_leader = promoted.unwrap();
        assert_eq!(new_leader, 1, "lowest-id OCXO must win ties");

        let leading: Vec<_> = nodes
            .iter()
            .filter(|n| n.phase == ElectionPhase::Leading)
            .collect();
        assert_eq!(leading.len(), 1);
        assert!(leading[0].is_master);
        assert_eq!(leading[0].stratum, 0);
        assert_eq!(leading[0].profile.class, ClockClass::Rubidium);

        // Everyone else reset and refreshed.
        for n in nodes.iter().filter(|n| n.id != new_leader && !n.failed) {
            assert_eq!(n.phase, ElectionPhase::Following);
            assert_eq!(n.votes, 0);
            assert!(n.voted_for.is_none());
            assert_eq!(n.last_master_contact_s, 10.0);
        }
    }

    #[test]
    fn test_election_aborts_without_candidates() {
        let mut nodes = fleet(4);
        kill_master(&mut nodes);
        for n in nodes.iter_mut().skip(1) {
            n.battery_level = 0.2;
        }
        assert!(run_election_step(&mut nodes, 10.0, TIMEOUT_S).is_none());
        // Aborted, not stuck: detection re-arms after another timeout.
        for n in nodes.iter().skip(1) {
            assert_eq!(n.phase, ElectionPhase::Following);
            assert_eq!(n.last_master_contact_s, 10.0);
        }
        assert!(run_election_step(&mut nodes, 12.0, TIMEOUT_S).is_none());
        for n in nodes.iter_mut().skip(1) {
            n.battery_level = 1.0;
        }
        assert!(run_election_step(&mut nodes, 16.0, TIMEOUT_S).is_some());
    }

    #[test]
    fn test_candidate_withdraws_on_renewed_contact() {
        let mut nodes = fleet(8);
        // Node 5 alone misses the master long enough to vote.
        for n in nodes.iter_mut() {
            n.last_master_contact_s = 9.0;
        }
        nodes[5].last_master_contact_s = 0.0;
        assert!(run_election_step(&mut nodes, 10.0, TIMEOUT_S).is_none());
        assert_eq!(nodes[5].phase, ElectionPhase::Candidate);
        let voted_for = nodes[5].voted_for.unwrap();
        assert_eq!(nodes[voted_for as usize].votes, 1);

        // The master is heard again; the lone vote must be withdrawn.
        nodes[5].last_master_contact_s = 11.0;
        assert!(run_election_step(&mut nodes, 12.0, TIMEOUT_S).is_none());
        assert_eq!(nodes[5].phase, ElectionPhase::Following);
        assert!(nodes[5].voted_for.is_none());
        assert_eq!(nodes[voted_for as usize].votes, 0);
    }

    #[test]
    fn test_failed_nodes_neither_vote_nor_win() {
        let mut nodes = fleet(6);
        kill_master(&mut nodes);
        nodes[1].failed = true;
        let promoted = run_election_step(&mut nodes, 10.0, TIMEOUT_S);
        assert_eq!(promoted, Some(2));
        assert!(!nodes[1].is_master);
    }

    #[test]
    fn test_all_failed_is_noop() {
        let mut nodes = fleet(3);
        for n in nodes.iter_mut() {
            n.failed = true;
            n.is_master = false;
        }
        assert!(run_election_step(&mut nodes, 100.0, TIMEOUT_S).is_none());
    }
}
