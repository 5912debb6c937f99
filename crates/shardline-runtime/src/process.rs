//! Child-process instances.
//!
//! `ProcessLauncher` runs the configured worker command once per
//! instance through `tokio::process`, and `SysinfoProbe` reads cumulative
//! CPU time and resident memory for those pids.

use std::process::Stdio;

use anyhow::Context;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tracing::debug;

use shardline_core::WorkerConfig;

use crate::handle::{InstanceHandle, InstanceLauncher, LaunchContext, ProcessUsage, UsageProbe};

/// Spawns the configured worker command as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    worker: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(worker: WorkerConfig) -> Self {
        Self { worker }
    }

    fn command(&self, ctx: &LaunchContext<'_>) -> Command {
        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .envs(&self.worker.env)
            .env("SHARDLINE_INSTANCE_ID", ctx.instance_id)
            .env("SHARDLINE_SHARD_ID", ctx.shard_id.to_string())
            .env("SHARDLINE_SHARD_COUNT", ctx.shard_count.to_string())
            .env("SHARDLINE_RANK", ctx.rank.to_string())
            .env("SHARDLINE_WORLD_SIZE", ctx.world_size.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl InstanceLauncher for ProcessLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> anyhow::Result<Box<dyn InstanceHandle>> {
        let child = self
            .command(ctx)
            .spawn()
            .with_context(|| format!("failed to spawn worker `{}`", self.worker.program))?;
        let pid = child
            .id()
            .context("spawned worker exited before its pid could be read")?;

        debug!(instance_id = %ctx.instance_id, pid, program = %self.worker.program, "worker process spawned");
        Ok(Box::new(ProcessHandle { child, pid }))
    }

    fn usage_probe(&self) -> Box<dyn UsageProbe> {
        Box::new(SysinfoProbe::new())
    }
}

/// A spawned child process.
struct ProcessHandle {
    child: Child,
    pid: u32,
}

impl InstanceHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        // Never signal a reaped pid: it may already belong to another process.
        if !self.is_alive() {
            return Ok(());
        }
        send_terminate(&mut self.child, self.pid)
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.child
            .start_kill()
            .with_context(|| format!("failed to kill pid {}", self.pid))
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: u32) -> anyhow::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions; the pid is a live child.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to send SIGTERM to pid {pid}"));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, pid: u32) -> anyhow::Result<()> {
    // No graceful signal on this platform.
    child
        .start_kill()
        .with_context(|| format!("failed to terminate pid {pid}"))
}

/// Usage probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for SysinfoProbe {
    fn refresh(&mut self, pids: &[u32]) {
        let pids: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);
    }

    fn read(&self, pid: u32) -> Option<ProcessUsage> {
        let process = self.system.process(Pid::from_u32(pid))?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }
        Some(ProcessUsage {
            cpu_time_ms: process.accumulated_cpu_time(),
            resident_bytes: process.memory(),
        })
    }

    /// Refreshing reads `/proc` (or the platform equivalent) synchronously.
    fn blocks(&self) -> bool {
        true
    }
}
