//! In-process simulated instances.
//!
//! Simulated instances have synthetic pids above the kernel pid range,
//! consume a fixed share of one CPU core, and hold a fixed resident set.
//! They support fault injection for tests: a spawn index that fails, ranks
//! that ignore graceful termination, and crashing an instance mid-run.
//!
//! CPU time follows tokio's clock, so usage stays consistent with the
//! sampler under a paused test clock. Dead instances leave the registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::debug;

use crate::handle::{InstanceHandle, InstanceLauncher, LaunchContext, ProcessUsage, UsageProbe};

/// Linux caps pids at 2^22, so synthetic ids never alias a real process.
const SIMULATED_PID_BASE: u32 = 1 << 23;

struct SimProcess {
    alive: AtomicBool,
    ignores_terminate: bool,
    started: Instant,
    cpu_share: f64,
    resident_bytes: u64,
}

#[derive(Default)]
struct Registry {
    processes: HashMap<u32, Arc<SimProcess>>,
}

struct Shared {
    next_pid: AtomicU32,
    launched: AtomicUsize,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `pid` dead and forget it.
    fn retire(&self, pid: u32) {
        if let Some(process) = self.registry().processes.remove(&pid) {
            process.alive.store(false, Ordering::SeqCst);
        }
    }
}

/// Launcher for in-process simulated workers.
#[derive(Clone)]
pub struct SimulatedLauncher {
    shared: Arc<Shared>,
    fail_at: Option<u32>,
    stubborn_ranks: HashSet<u32>,
    cpu_share: f64,
    resident_bytes: u64,
}

impl SimulatedLauncher {
    /// Instances use a quarter core and 64 MiB each.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_pid: AtomicU32::new(SIMULATED_PID_BASE),
                launched: AtomicUsize::new(0),
                registry: Mutex::new(Registry::default()),
            }),
            fail_at: None,
            stubborn_ranks: HashSet::new(),
            cpu_share: 0.25,
            resident_bytes: 64 * 1024 * 1024,
        }
    }

    /// Make the spawn at `rank` fail.
    pub fn fail_at(mut self, rank: u32) -> Self {
        self.fail_at = Some(rank);
        self
    }

    /// Make the instance at `rank` ignore graceful termination.
    pub fn ignore_terminate(mut self, rank: u32) -> Self {
        self.stubborn_ranks.insert(rank);
        self
    }

    /// Fraction of one core each instance consumes.
    pub fn with_cpu_share(mut self, share: f64) -> Self {
        self.cpu_share = share.max(0.0);
        self
    }

    pub fn with_resident_mb(mut self, mb: u64) -> Self {
        self.resident_bytes = mb * 1024 * 1024;
        self
    }

    /// Crash the instance with `pid`, as if it exited on its own.
    pub fn crash(&self, pid: u32) {
        self.shared.retire(pid);
        debug!(pid, "simulated instance crashed");
    }

    /// Number of instances launched over this launcher's lifetime.
    pub fn launched(&self) -> usize {
        self.shared.launched.load(Ordering::Relaxed)
    }

    /// Number of instances currently alive.
    pub fn live_count(&self) -> usize {
        self.shared.registry().processes.len()
    }
}

impl Default for SimulatedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceLauncher for SimulatedLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> anyhow::Result<Box<dyn InstanceHandle>> {
        if self.fail_at == Some(ctx.rank) {
            anyhow::bail!("simulated spawn failure for {} (rank {})", ctx.instance_id, ctx.rank);
        }

        let pid = self.shared.next_pid.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(SimProcess {
            alive: AtomicBool::new(true),
            ignores_terminate: self.stubborn_ranks.contains(&ctx.rank),
            started: Instant::now(),
            cpu_share: self.cpu_share,
            resident_bytes: self.resident_bytes,
        });
        self.shared.registry().processes.insert(pid, process.clone());
        self.shared.launched.fetch_add(1, Ordering::Relaxed);

        debug!(instance_id = %ctx.instance_id, pid, "simulated instance launched");
        Ok(Box::new(SimulatedHandle {
            pid,
            process,
            shared: self.shared.clone(),
        }))
    }

    fn usage_probe(&self) -> Box<dyn UsageProbe> {
        Box::new(SimulatedProbe {
            shared: self.shared.clone(),
        })
    }
}

struct SimulatedHandle {
    pid: u32,
    process: Arc<SimProcess>,
    shared: Arc<Shared>,
}

impl InstanceHandle for SimulatedHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        self.process.alive.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        if !self.process.ignores_terminate {
            self.shared.retire(self.pid);
        }
        Ok(())
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        self.shared.retire(self.pid);
        Ok(())
    }
}

/// Reads synthetic usage: CPU time grows linearly with wall time.
struct SimulatedProbe {
    shared: Arc<Shared>,
}

impl UsageProbe for SimulatedProbe {
    fn refresh(&mut self, _pids: &[u32]) {}

    fn read(&self, pid: u32) -> Option<ProcessUsage> {
        let registry = self.shared.registry();
        let process = registry.processes.get(&pid)?;
        let wall_ms = process.started.elapsed().as_millis() as f64;
        Some(ProcessUsage {
            cpu_time_ms: (wall_ms * process.cpu_share) as u64,
            resident_bytes: process.resident_bytes,
        })
    }
}
