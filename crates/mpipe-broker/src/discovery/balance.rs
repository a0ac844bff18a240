//! Load-balance strategies

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::ClientInformation;
use crate::error::{BrokerError, BrokerResult};

/// Picks one client among healthy candidates
pub trait LoadBalanceStrategy: Send + Sync {
    /// Choose a client; fails with [`BrokerError::EmptyCandidates`] on an
    /// empty slice
    fn select(&self, candidates: &[ClientInformation]) -> BrokerResult<ClientInformation>;

    fn name(&self) -> &'static str;
}

/// A candidate with its weights, built per lookup
#[derive(Debug, Clone)]
pub struct LoadBalanceNode {
    pub client: ClientInformation,
    pub init_weight: u32,
    pub current_weight: u32,
}

impl LoadBalanceNode {
    pub fn new(client: ClientInformation) -> Self {
        Self {
            client,
            init_weight: 1,
            current_weight: 1,
        }
    }
}

/// Weighted random selection over cumulative weights
///
/// Every candidate weighs 1, so selection is uniform in expectation.
/// Seeded instances are deterministic.
pub struct WeightedRandomStrategy {
    rng: Mutex<StdRng>,
}

impl Default for WeightedRandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRandomStrategy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn draw(&self) -> f64 {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.random::<f64>()
    }
}

impl LoadBalanceStrategy for WeightedRandomStrategy {
    fn select(&self, candidates: &[ClientInformation]) -> BrokerResult<ClientInformation> {
        if candidates.is_empty() {
            return Err(BrokerError::EmptyCandidates);
        }

        let nodes: Vec<LoadBalanceNode> = candidates
            .iter()
            .cloned()
            .map(LoadBalanceNode::new)
            .collect();

        let mut cumulative = Vec::with_capacity(nodes.len());
        let mut total: u64 = 0;
        for node in &nodes {
            total += u64::from(node.current_weight);
            cumulative.push(total);
        }

        let point = self.draw() * total as f64;
        let index = cumulative
            .iter()
            .position(|&upper| upper as f64 > point)
            .unwrap_or(nodes.len() - 1);

        Ok(nodes[index].client.clone())
    }

    fn name(&self) -> &'static str {
        "weighted-random"
    }
}

/// Cycles through candidates in order
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalanceStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[ClientInformation]) -> BrokerResult<ClientInformation> {
        if candidates.is_empty() {
            return Err(BrokerError::EmptyCandidates);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}
