//! Domain types for a shardline run.
//!
//! A run owns a set of instances partitioned into shards, and two
//! append-only logs: resource samples and request records. `RunStats` is
//! derived from those logs once, when the run stops. All wire-facing
//! types serialize with camelCase field names so host dashboards can
//! consume them directly.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for an instance within a run.
pub type InstanceId = String;

/// Shard index in `0..shard_count`.
pub type ShardId = u32;

// ── Orchestrator phase ────────────────────────────────────────────

/// Lifecycle phase of the orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl Phase {
    /// Whether `start()` is accepted from this phase.
    pub fn can_start(self) -> bool {
        matches!(self, Phase::Idle | Phase::Stopped)
    }

    /// Whether `stop()` is accepted from this phase.
    pub fn can_stop(self) -> bool {
        self == Phase::Running
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of a single worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Alive,
    Terminating,
    Dead,
}

/// Reporting view of an instance. The live process handle stays with
/// the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub shard_id: ShardId,
    pub pid: u32,
    /// Unix timestamp (milliseconds) when the instance was spawned.
    pub started_at: u64,
    pub status: InstanceStatus,
}

// ── Shard assignment ──────────────────────────────────────────────

/// Immutable mapping of shards to instances for one run.
///
/// Built once at start with `shard = index mod shard_count`. Every shard
/// id in `0..shard_count` has an entry, possibly empty when there are
/// more shards than instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    shards: BTreeMap<ShardId, Vec<InstanceId>>,
    owners: HashMap<InstanceId, ShardId>,
}

impl ShardAssignment {
    /// The shard an instance at spawn position `index` belongs to.
    pub fn shard_for_index(index: u32, shard_count: u32) -> ShardId {
        index % shard_count.max(1)
    }

    /// Assign instances (in spawn order) to `shard_count` shards.
    pub fn balanced(instance_ids: &[InstanceId], shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards: BTreeMap<ShardId, Vec<InstanceId>> =
            (0..shard_count).map(|s| (s, Vec::new())).collect();
        let mut owners = HashMap::with_capacity(instance_ids.len());

        for (index, id) in instance_ids.iter().enumerate() {
            let shard = Self::shard_for_index(index as u32, shard_count);
            shards.entry(shard).or_default().push(id.clone());
            owners.insert(id.clone(), shard);
        }

        Self { shards, owners }
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn instance_count(&self) -> usize {
        self.owners.len()
    }

    /// Instances assigned to `shard`, in spawn order.
    pub fn instances_in(&self, shard: ShardId) -> &[InstanceId] {
        self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The shard that owns `instance_id`, if it belongs to this run.
    pub fn shard_of(&self, instance_id: &str) -> Option<ShardId> {
        self.owners.get(instance_id).copied()
    }

    /// All shard ids, ascending.
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shards.keys().copied()
    }
}

// ── Logs ──────────────────────────────────────────────────────────

/// One CPU/memory reading for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub instance_id: InstanceId,
    /// Unix timestamp (milliseconds) of the sampling tick. All samples
    /// taken in the same tick share this value.
    pub timestamp_ms: u64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// One completed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: u64,
    pub shard_id: ShardId,
    pub instance_id: InstanceId,
    /// Unix timestamp (milliseconds) when the request was recorded.
    pub dispatched_at_ms: u64,
    pub latency_ms: f64,
}

// ── Run summary ───────────────────────────────────────────────────

/// Performance summary of one completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub instances: u32,
    pub shards: u32,
    pub duration_ms: u64,
    pub speedup_ratio: f64,
    /// Average CPU across all retained samples, e.g. `"37%"`.
    pub cpu_utilization: String,
    /// Memory at the final sampling tick, e.g. `"212MB"`.
    pub memory_usage: String,
    /// Completed requests per second.
    pub throughput: f64,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub efficiency_score: f64,
    pub request_distribution: BTreeMap<ShardId, u64>,
    pub total_requests: u64,
}

/// Non-fatal condition observed during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// A sampled instance disappeared; it is excluded from later ticks.
    SampleCollectionGap { instance_id: InstanceId, at_ms: u64 },
    /// An instance needed a force kill (or could not be signalled) at stop.
    DegradedStop {
        instance_id: InstanceId,
        pid: u32,
        reason: String,
    },
}

// ── Control surface ───────────────────────────────────────────────

/// Parameters for one `start()` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub instance_count: u32,
    pub shard_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub started: bool,
    /// Sequence number of this run on its orchestrator, starting at 1.
    pub run: u64,
    pub instances: u32,
    pub shards: u32,
    pub pids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub stopped: bool,
    pub stats: RunStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
}

/// Point-in-time view of an orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub phase: Phase,
    /// Number of runs started so far (the current one included).
    pub run: u64,
    pub instances: Vec<InstanceInfo>,
    pub shards: u32,
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
