/// Galera backend selection
///
/// Candidates are filtered by what the request needs, then drawn either
/// uniformly or by effective weight. Nodes are walked in backend-key order so
/// a seeded generator reproduces the same sequence of picks.
use crate::core::Backend;
use crate::health::galera::{NodeInfo, NodeState};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Instant;

const FLOW_CONTROL_PENALTY: f64 = 0.1;
const ERROR_PENALTY: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    /// Also read from joined nodes that are not paused by flow control
    pub read_only_nodes: bool,
    /// Weighted draw; uniform index otherwise
    pub weighted: bool,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            read_only_nodes: false,
            weighted: true,
        }
    }
}

pub struct BackendSelector {
    policy: SelectionPolicy,
    rng: Mutex<StdRng>,
}

/// Configured weight with health penalties applied
pub fn effective_weight(node: &NodeInfo) -> f64 {
    let mut weight = node.weight.max(1.0);
    if node.flow_control_paused {
        weight *= FLOW_CONTROL_PENALTY;
    }
    if node.consecutive_errors > 0 {
        weight *= ERROR_PENALTY;
    }
    weight
}

impl BackendSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(policy: SelectionPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    fn is_candidate(&self, node: &NodeInfo, is_write: bool, now: Instant) -> bool {
        if is_write {
            return node.can_serve_writes_at(now);
        }
        node.can_serve_reads_at(now)
            || (self.policy.read_only_nodes
                && node.state == NodeState::Joined
                && !node.flow_control_paused)
    }

    /// Pick a backend for a read or write, or `None` when no node qualifies
    pub fn select(&self, nodes: &BTreeMap<String, NodeInfo>, is_write: bool) -> Option<Backend> {
        let now = Instant::now();
        let candidates: Vec<&NodeInfo> = nodes
            .values()
            .filter(|node| self.is_candidate(node, is_write, now))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let picked = if self.policy.weighted {
            self.select_weighted(&candidates)
        } else {
            self.select_uniform(&candidates)
        };
        picked.map(|node| node.backend.clone())
    }

    fn select_uniform<'a>(&self, candidates: &[&'a NodeInfo]) -> Option<&'a NodeInfo> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..candidates.len());
        candidates.get(index).copied()
    }

    /// Cumulative-weight draw over `candidates`
    pub fn select_weighted<'a>(&self, candidates: &[&'a NodeInfo]) -> Option<&'a NodeInfo> {
        let first = candidates.first().copied()?;

        let total: f64 = candidates.iter().map(|node| effective_weight(node)).sum();
        if total <= 0.0 {
            return Some(first);
        }

        let draw = self.rng.lock().gen_range(0.0..total);
        let mut cumulative = 0.0;
        for &node in candidates {
            cumulative += effective_weight(node);
            if cumulative >= draw {
                return Some(node);
            }
        }

        // Rounding can leave the last sum a hair under the draw
        candidates.last().copied()
    }
}
