//! Instance supervisor — owns the worker instances of one run.
//!
//! The supervisor spawns a batch of instances, assigns each one to a
//! shard (`index mod shard_count`), and tears the batch down again on
//! stop. A failed spawn aborts the batch: everything already spawned is
//! terminated before the error is returned, so a partial start never
//! keeps running.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use shardline_core::{
    epoch_millis, validate_counts, InstanceId, InstanceInfo, InstanceStatus, ShardAssignment,
    ShardId,
};

use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::{InstanceHandle, InstanceLauncher, LaunchContext, UsageProbe};

/// How often a terminating instance is polled for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for a force-killed instance to disappear.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// A supervised worker instance.
struct Instance {
    id: InstanceId,
    shard_id: ShardId,
    started_at: u64,
    status: InstanceStatus,
    handle: Box<dyn InstanceHandle>,
}

impl Instance {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            shard_id: self.shard_id,
            pid: self.handle.pid(),
            started_at: self.started_at,
            status: self.status,
        }
    }
}

/// The outcome of a successful `start()`.
#[derive(Debug, Clone)]
pub struct StartedInstances {
    pub instances: Vec<InstanceInfo>,
    pub assignment: ShardAssignment,
}

impl StartedInstances {
    pub fn pids(&self) -> Vec<u32> {
        self.instances.iter().map(|i| i.pid).collect()
    }
}

/// How an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The instance had already exited before stop.
    AlreadyExited,
    /// Exited within the grace timeout after a graceful terminate.
    Graceful,
    /// Needed a force kill after the grace timeout.
    Forced,
    /// Could not be confirmed dead.
    Failed(String),
}

/// Termination result for one instance.
#[derive(Debug, Clone)]
pub struct TerminationReport {
    pub instance_id: InstanceId,
    pub pid: u32,
    pub outcome: TerminationOutcome,
    pub elapsed: Duration,
}

impl TerminationReport {
    /// Whether the instance did not go down gracefully.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self.outcome,
            TerminationOutcome::Forced | TerminationOutcome::Failed(_)
        )
    }
}

/// Owns the instances of the current run.
pub struct InstanceSupervisor {
    launcher: Arc<dyn InstanceLauncher>,
    grace_timeout: Duration,
    instances: Vec<Instance>,
    assignment: Option<ShardAssignment>,
}

impl InstanceSupervisor {
    pub fn new(launcher: Arc<dyn InstanceLauncher>, grace_timeout: Duration) -> Self {
        Self {
            launcher,
            grace_timeout,
            instances: Vec::new(),
            assignment: None,
        }
    }

    /// Spawn `instance_count` instances across `shard_count` shards.
    ///
    /// On any spawn failure the batch is aborted, every instance spawned
    /// so far is terminated, and `RuntimeError::PartialStart` is returned.
    pub async fn start(
        &mut self,
        instance_count: u32,
        shard_count: u32,
    ) -> RuntimeResult<StartedInstances> {
        if !self.instances.is_empty() {
            return Err(RuntimeError::AlreadyStarted);
        }
        validate_counts(instance_count, shard_count)?;

        let mut spawned: Vec<Instance> = Vec::with_capacity(instance_count as usize);

        for rank in 0..instance_count {
            let id = format!("inst-{rank}");
            let shard_id = ShardAssignment::shard_for_index(rank, shard_count);
            let ctx = LaunchContext {
                instance_id: &id,
                shard_id,
                shard_count,
                rank,
                world_size: instance_count,
            };

            let failure = match self.launcher.launch(&ctx) {
                Ok(handle) => {
                    let mut instance = Instance {
                        id: id.clone(),
                        shard_id,
                        started_at: epoch_millis(),
                        status: InstanceStatus::Starting,
                        handle,
                    };
                    if instance.handle.is_alive() {
                        instance.status = InstanceStatus::Alive;
                        debug!(instance_id = %id, shard_id, pid = instance.handle.pid(), "instance alive");
                        spawned.push(instance);
                        None
                    } else {
                        Some(format!("{id} exited immediately after spawn"))
                    }
                }
                Err(e) => Some(format!("{id}: {e:#}")),
            };

            if let Some(reason) = failure {
                let spawned_count = spawned.len() as u32;
                error!(
                    requested = instance_count,
                    spawned = spawned_count,
                    %reason,
                    "instance spawn failed, rolling back batch"
                );
                terminate_all(spawned, self.grace_timeout).await;
                return Err(RuntimeError::PartialStart {
                    requested: instance_count,
                    spawned: spawned_count,
                    failed: instance_count - spawned_count,
                    reason,
                });
            }
        }

        let ids: Vec<InstanceId> = spawned.iter().map(|i| i.id.clone()).collect();
        let assignment = ShardAssignment::balanced(&ids, shard_count);
        let instances = spawned.iter().map(Instance::info).collect();

        self.instances = spawned;
        self.assignment = Some(assignment.clone());

        info!(instances = instance_count, shards = shard_count, "instance batch started");
        Ok(StartedInstances {
            instances,
            assignment,
        })
    }

    /// Terminate every instance: graceful first, force kill after the
    /// grace timeout. Instances are handled in parallel. Never fails;
    /// calling it with no instances returns an empty report.
    pub async fn stop(&mut self) -> Vec<TerminationReport> {
        self.assignment = None;
        let instances = std::mem::take(&mut self.instances);
        if instances.is_empty() {
            return Vec::new();
        }

        let reports = terminate_all(instances, self.grace_timeout).await;
        let degraded = reports.iter().filter(|r| r.is_degraded()).count();
        info!(instances = reports.len(), degraded, "instance batch stopped");
        reports
    }

    /// Current instances (empty when no run is active).
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.instances.iter().map(Instance::info).collect()
    }

    pub fn assignment(&self) -> Option<&ShardAssignment> {
        self.assignment.as_ref()
    }

    /// A fresh usage probe matching this supervisor's launcher.
    pub fn usage_probe(&self) -> Box<dyn UsageProbe> {
        self.launcher.usage_probe()
    }
}

/// Terminate a batch of instances concurrently. Reports come back in
/// spawn order.
async fn terminate_all(instances: Vec<Instance>, grace: Duration) -> Vec<TerminationReport> {
    let mut tasks = JoinSet::new();
    for (rank, mut instance) in instances.into_iter().enumerate() {
        instance.status = InstanceStatus::Terminating;
        tasks.spawn(async move { (rank, terminate_instance(instance, grace).await) });
    }

    let mut ranked = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => ranked.push(report),
            Err(e) => error!(error = %e, "instance termination task failed"),
        }
    }
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, report)| report).collect()
}

async fn terminate_instance(mut instance: Instance, grace: Duration) -> TerminationReport {
    let started = Instant::now();
    let pid = instance.handle.pid();

    let outcome = if !instance.handle.is_alive() {
        TerminationOutcome::AlreadyExited
    } else {
        if let Err(e) = instance.handle.terminate() {
            warn!(instance_id = %instance.id, pid, error = %e, "graceful terminate failed");
        }
        if wait_for_exit(instance.handle.as_mut(), grace).await {
            TerminationOutcome::Graceful
        } else {
            force_kill(&mut instance).await
        }
    };

    instance.status = InstanceStatus::Dead;
    match &outcome {
        TerminationOutcome::AlreadyExited => {
            debug!(instance_id = %instance.id, pid, "instance had already exited")
        }
        TerminationOutcome::Graceful => {
            debug!(instance_id = %instance.id, pid, "instance terminated gracefully")
        }
        TerminationOutcome::Forced => warn!(
            instance_id = %instance.id,
            pid,
            grace_ms = grace.as_millis() as u64,
            "instance ignored graceful terminate, force killed"
        ),
        TerminationOutcome::Failed(reason) => {
            warn!(instance_id = %instance.id, pid, %reason, "instance could not be confirmed dead")
        }
    }

    TerminationReport {
        instance_id: instance.id,
        pid,
        outcome,
        elapsed: started.elapsed(),
    }
}

async fn force_kill(instance: &mut Instance) -> TerminationOutcome {
    if let Err(e) = instance.handle.force_kill() {
        return TerminationOutcome::Failed(format!("force kill failed: {e:#}"));
    }
    if wait_for_exit(instance.handle.as_mut(), KILL_CONFIRM_TIMEOUT).await {
        TerminationOutcome::Forced
    } else {
        TerminationOutcome::Failed("still alive after force kill".to_string())
    }
}

/// Poll until the instance exits or `timeout` elapses.
async fn wait_for_exit(handle: &mut dyn InstanceHandle, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !handle.is_alive() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedLauncher;

    fn supervisor(launcher: &SimulatedLauncher, grace: Duration) -> InstanceSupervisor {
        InstanceSupervisor::new(Arc::new(launcher.clone()), grace)
    }

    #[tokio::test]
    async fn start_assigns_shards_by_index() {
        let launcher = SimulatedLauncher::new();
        let mut sup = supervisor(&launcher, Duration::from_millis(100));

        let started = sup.start(4, 2).await.unwrap();
        assert_eq!(started.instances.len(), 4);
        assert_eq!(started.pids().len(), 4);
        let shards: Vec<ShardId> = started.instances.iter().map(|i| i.shard_id).collect();
        assert_eq!(shards, vec![0, 1, 0, 1]);
        assert!(started
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Alive));
        assert_eq!(started.assignment.instances_in(1), ["inst-1", "inst-3"]);
        assert_eq!(sup.instances().len(), 4);

        sup.stop().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let launcher = SimulatedLauncher::new();
        let mut sup = supervisor(&launcher, Duration::from_millis(100));

        sup.start(1, 1).await.unwrap();
        assert!(matches!(
            sup.start(1, 1).await,
            Err(RuntimeError::AlreadyStarted)
        ));
        assert_eq!(launcher.launched(), 1);
        sup.stop().await;
    }

    #[tokio::test]
    async fn zero_counts_are_rejected() {
        let launcher = SimulatedLauncher::new();
        let mut sup = supervisor(&launcher, Duration::from_millis(100));

        assert!(matches!(
            sup.start(0, 1).await,
            Err(RuntimeError::InvalidLayout(_))
        ));
        assert!(matches!(
            sup.start(2, 0).await,
            Err(RuntimeError::InvalidLayout(_))
        ));
        assert_eq!(launcher.launched(), 0);
    }

    #[tokio::test]
    async fn partial_start_tears_down_spawned_instances() {
        let launcher = SimulatedLauncher::new().fail_at(2);
        let mut sup = supervisor(&launcher, Duration::from_millis(100));

        let err = sup.start(5, 2).await.unwrap_err();
        match err {
            RuntimeError::PartialStart {
                requested,
                spawned,
                failed,
                ..
            } => {
                assert_eq!(requested, 5);
                assert_eq!(spawned, 2);
                assert_eq!(failed, 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(launcher.launched(), 2);
        assert_eq!(launcher.live_count(), 0);
        assert!(sup.instances().is_empty());
        assert!(sup.assignment().is_none());
    }

    #[tokio::test]
    async fn stop_is_graceful_and_idempotent() {
        let launcher = SimulatedLauncher::new();
        let mut sup = supervisor(&launcher, Duration::from_millis(100));
        sup.start(3, 1).await.unwrap();

        let reports = sup.stop().await;
        assert_eq!(reports.len(), 3);
        assert!(reports
            .iter()
            .all(|r| r.outcome == TerminationOutcome::Graceful));
        assert_eq!(launcher.live_count(), 0);

        assert!(sup.stop().await.is_empty());
    }

    #[tokio::test]
    async fn stubborn_instance_is_force_killed() {
        let launcher = SimulatedLauncher::new().ignore_terminate(1);
        let mut sup = supervisor(&launcher, Duration::from_millis(50));
        sup.start(2, 1).await.unwrap();

        let reports = sup.stop().await;
        let forced: Vec<_> = reports.iter().filter(|r| r.is_degraded()).collect();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].instance_id, "inst-1");
        assert_eq!(forced[0].outcome, TerminationOutcome::Forced);
        assert!(forced[0].elapsed >= Duration::from_millis(50));
        assert_eq!(launcher.live_count(), 0);
    }

    #[tokio::test]
    async fn reports_follow_spawn_order() {
        let launcher = SimulatedLauncher::new().ignore_terminate(3);
        let mut sup = supervisor(&launcher, Duration::from_millis(30));
        sup.start(12, 4).await.unwrap();

        let reports = sup.stop().await;
        let ids: Vec<&str> = reports.iter().map(|r| r.instance_id.as_str()).collect();
        let expected: Vec<String> = (0..12).map(|i| format!("inst-{i}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(reports[3].outcome, TerminationOutcome::Forced);
    }

    #[tokio::test]
    async fn crashed_instance_reports_already_exited() {
        let launcher = SimulatedLauncher::new();
        let mut sup = supervisor(&launcher, Duration::from_millis(100));
        let started = sup.start(2, 2).await.unwrap();

        launcher.crash(started.instances[0].pid);
        let reports = sup.stop().await;
        assert_eq!(reports[0].outcome, TerminationOutcome::AlreadyExited);
        assert_eq!(reports[1].outcome, TerminationOutcome::Graceful);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_batch_starts_and_stops() {
        use crate::process::ProcessLauncher;
        use shardline_core::WorkerConfig;

        let launcher = ProcessLauncher::new(WorkerConfig {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: Default::default(),
        });
        let mut sup = InstanceSupervisor::new(Arc::new(launcher), Duration::from_secs(2));

        let started = sup.start(2, 1).await.unwrap();
        assert!(started.pids().iter().all(|&pid| pid > 0));

        let reports = sup.stop().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| !r.is_degraded()));
    }
}
