//! Platform-neutral seams for worker instances.

use shardline_core::ShardId;

/// Everything a launcher needs to know about the instance it spawns.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub instance_id: &'a str,
    pub shard_id: ShardId,
    pub shard_count: u32,
    /// Spawn position in `0..world_size`.
    pub rank: u32,
    /// Number of instances in the run.
    pub world_size: u32,
}

/// One running worker.
///
/// Methods are cheap and non-blocking; callers poll `is_alive` to wait.
pub trait InstanceHandle: Send {
    /// OS process id, or a synthetic id for in-process instances.
    fn pid(&self) -> u32;

    /// Whether the worker is still running. Reaps exited children.
    fn is_alive(&mut self) -> bool;

    /// Ask the worker to shut down gracefully.
    fn terminate(&mut self) -> anyhow::Result<()>;

    /// Kill the worker immediately.
    fn force_kill(&mut self) -> anyhow::Result<()>;
}

/// Spawns instances and provides the matching usage probe.
pub trait InstanceLauncher: Send + Sync {
    fn launch(&self, ctx: &LaunchContext<'_>) -> anyhow::Result<Box<dyn InstanceHandle>>;

    fn usage_probe(&self) -> Box<dyn UsageProbe>;
}

/// Cumulative resource usage of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUsage {
    /// Total CPU time consumed since the process started (milliseconds).
    pub cpu_time_ms: u64,
    /// Current resident memory (bytes).
    pub resident_bytes: u64,
}

/// Reads per-process resource usage.
pub trait UsageProbe: Send {
    /// Refresh cached readings for `pids`. Called once per sampling tick.
    fn refresh(&mut self, pids: &[u32]);

    /// Latest reading for `pid`, or `None` if the process is gone.
    fn read(&self, pid: u32) -> Option<ProcessUsage>;

    /// Whether `refresh` does blocking I/O and must stay off async workers.
    fn blocks(&self) -> bool {
        false
    }
}
