/// Backend rotation for raw TCP routes
use crate::config::BalancingAlgorithm;
use crate::core::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Index into `backends` for the next connection
    fn select_backend(&self, backends: &[Backend]) -> Option<usize>;
}

pub fn algorithm(kind: BalancingAlgorithm) -> Box<dyn LoadBalancingAlgorithm> {
    match kind {
        BalancingAlgorithm::RoundRobin => Box::new(RoundRobin::new()),
        BalancingAlgorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingAlgorithm for RoundRobin {
    fn select_backend(&self, backends: &[Backend]) -> Option<usize> {
        if backends.is_empty() {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % backends.len())
    }
}

/// Each backend gets `round(weight)` consecutive turns per cycle, at least one
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn turns(backend: &Backend) -> usize {
        (backend.weight.round() as usize).max(1)
    }
}

impl LoadBalancingAlgorithm for WeightedRoundRobin {
    fn select_backend(&self, backends: &[Backend]) -> Option<usize> {
        if backends.is_empty() {
            return None;
        }

        let total: usize = backends.iter().map(Self::turns).sum();
        let position = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        let mut current = 0;
        for (index, backend) in backends.iter().enumerate() {
            current += Self::turns(backend);
            if position < current {
                return Some(index);
            }
        }
        Some(backends.len() - 1)
    }
}
