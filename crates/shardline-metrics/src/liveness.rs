//! Shared view of which instances of a run are still alive.
//!
//! The set is fixed when the run starts; instances only ever move from
//! alive to dead. The sampler marks an instance dead the first time it
//! fails to read it, and the tracker and shard selector consult the same
//! flags so no further requests are attributed to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shardline_core::{InstanceId, ShardAssignment};

/// Cloneable, lock-free liveness flags for one run.
#[derive(Debug, Clone, Default)]
pub struct InstanceLiveness {
    flags: Arc<HashMap<InstanceId, AtomicBool>>,
}

impl InstanceLiveness {
    /// Every instance in `ids` starts out alive.
    pub fn new<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = InstanceId>,
    {
        Self {
            flags: Arc::new(ids.into_iter().map(|id| (id, AtomicBool::new(true))).collect()),
        }
    }

    /// Mark `instance_id` dead. Returns whether it was alive before.
    pub fn mark_dead(&self, instance_id: &str) -> bool {
        self.flags
            .get(instance_id)
            .is_some_and(|flag| flag.swap(false, Ordering::AcqRel))
    }

    /// Unknown instances are never alive.
    pub fn is_alive(&self, instance_id: &str) -> bool {
        self.flags
            .get(instance_id)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn alive_count(&self) -> usize {
        self.flags
            .values()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }
}

impl From<&ShardAssignment> for InstanceLiveness {
    fn from(assignment: &ShardAssignment) -> Self {
        Self::new(
            assignment
                .shard_ids()
                .flat_map(|shard| assignment.instances_in(shard).iter().cloned()),
        )
    }
}
