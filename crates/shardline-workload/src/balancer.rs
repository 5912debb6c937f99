//! Round-robin shard and instance selection.
//!
//! `ShardSelector` picks the next shard in id order, skipping shards that
//! own no instance, then picks the next instance within that shard with a
//! per-shard counter. Under uniform load every non-empty shard receives
//! the same number of requests, plus or minus one.
//!
//! Instances marked dead in the run's `InstanceLiveness` are skipped, and
//! a shard with no live instance left is skipped as a whole.

use std::sync::atomic::{AtomicUsize, Ordering};

use shardline_core::{InstanceId, ShardAssignment, ShardId};
use shardline_metrics::InstanceLiveness;

/// Lock-free round-robin index selection.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }

    /// Current counter value (for diagnostics).
    pub fn current(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

struct ShardSlot {
    shard_id: ShardId,
    instances: Vec<InstanceId>,
    balancer: RoundRobinBalancer,
}

/// A shard and the instance within it that should serve a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub shard_id: ShardId,
    pub instance_id: InstanceId,
}

impl ShardSlot {
    fn next_alive(&self, liveness: &InstanceLiveness) -> Option<&InstanceId> {
        (0..self.instances.len()).find_map(|_| {
            let idx = self.balancer.next(self.instances.len())?;
            let instance = &self.instances[idx];
            liveness.is_alive(instance).then_some(instance)
        })
    }
}

/// Two-level round-robin over a run's shard assignment.
pub struct ShardSelector {
    slots: Vec<ShardSlot>,
    shards: RoundRobinBalancer,
    liveness: InstanceLiveness,
}

impl ShardSelector {
    /// Select over every instance in `assignment`, all considered alive.
    pub fn new(assignment: &ShardAssignment) -> Self {
        Self::with_liveness(assignment, InstanceLiveness::from(assignment))
    }

    /// Select only instances `liveness` still reports alive.
    pub fn with_liveness(assignment: &ShardAssignment, liveness: InstanceLiveness) -> Self {
        let slots = assignment
            .shard_ids()
            .filter_map(|shard_id| {
                let instances = assignment.instances_in(shard_id);
                (!instances.is_empty()).then(|| ShardSlot {
                    shard_id,
                    instances: instances.to_vec(),
                    balancer: RoundRobinBalancer::new(),
                })
            })
            .collect();
        Self {
            slots,
            shards: RoundRobinBalancer::new(),
            liveness,
        }
    }

    /// Next target, or `None` when no live instance remains.
    pub fn next(&self) -> Option<Target> {
        (0..self.slots.len()).find_map(|_| {
            let slot = &self.slots[self.shards.next(self.slots.len())?];
            let instance_id = slot.next_alive(&self.liveness)?;
            Some(Target {
                shard_id: slot.shard_id,
                instance_id: instance_id.clone(),
            })
        })
    }

    /// Number of shards that can receive requests.
    pub fn active_shards(&self) -> usize {
        self.slots.len()
    }
}
