//! Orchestrator controller — the run state machine.
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!  ▲                 │                                              │
//!  └────── failure ──┘                    start (next run) ◀────────┘
//! ```
//!
//! All orchestration state lives behind one mutex that is only held for
//! check-and-set transitions, never across an await. Spawning and
//! teardown happen outside the lock while the phase (`Starting` /
//! `Stopping`) keeps concurrent callers out.
//!
//! Both run on their own task and finish the transition themselves, so a
//! caller that drops a `start()` or `stop()` future, for example on a
//! timeout, never leaves the controller stuck in `Starting` or `Stopping`
//! and never leaves instances running.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use shardline_core::{
    epoch_millis, validate_counts, InstanceInfo, InstanceStatus, OrchestratorConfig,
    OrchestratorStatus, Phase, RunStats, RunWarning, ShardId, StartRequest, StartResponse,
    StopResponse,
};
use shardline_metrics::{
    compute, RequestCollector, RequestLog, RequestTracker, ResourceSampler, RunInputs,
    SampleTarget, SamplerHandle, StatsPolicy,
};
use shardline_runtime::{InstanceLauncher, InstanceSupervisor, TerminationOutcome, TerminationReport};
use shardline_workload::{ShardSelector, Target, WorkloadReport, WorkloadSimulator};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Everything owned by the active run.
struct ActiveRun {
    run: u64,
    instance_count: u32,
    shard_count: u32,
    started: Instant,
    started_at_ms: u64,
    supervisor: InstanceSupervisor,
    sampler: SamplerHandle,
    tracker: RequestTracker,
    collector: RequestCollector,
    selector: ShardSelector,
}

struct ControllerState {
    phase: Phase,
    runs: u64,
    active: Option<ActiveRun>,
    last_stats: Option<RunStats>,
}

type SharedState = Arc<Mutex<ControllerState>>;

/// Owns the lifecycle of one run at a time.
pub struct OrchestratorController {
    config: OrchestratorConfig,
    launcher: Arc<dyn InstanceLauncher>,
    policy: StatsPolicy,
    sampler: ResourceSampler,
    simulator: WorkloadSimulator,
    state: SharedState,
}

impl OrchestratorController {
    /// Build a controller; fails if the configuration is unusable.
    pub fn new(
        config: OrchestratorConfig,
        launcher: Arc<dyn InstanceLauncher>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        Ok(Self {
            policy: StatsPolicy::from(&config),
            sampler: ResourceSampler::new(config.sample_interval()),
            simulator: WorkloadSimulator::new(config.simulation.clone()),
            launcher,
            config,
            state: Arc::new(Mutex::new(ControllerState {
                phase: Phase::Idle,
                runs: 0,
                active: None,
                last_stats: None,
            })),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a run with the configured instance and shard counts.
    pub async fn start_default(&self) -> OrchestratorResult<StartResponse> {
        self.start(StartRequest {
            instance_count: self.config.instance_count,
            shard_count: self.config.shard_count,
        })
        .await
    }

    /// Spawn instances, attach the sampler and open a fresh request log.
    ///
    /// Dropping the returned future does not abort the start: the run
    /// either comes up `Running` or is rolled back to `Idle`.
    pub async fn start(&self, request: StartRequest) -> OrchestratorResult<StartResponse> {
        let StartRequest {
            instance_count,
            shard_count,
        } = request;

        {
            let mut state = self.lock();
            if !state.phase.can_start() {
                return Err(OrchestratorError::AlreadyRunning { phase: state.phase });
            }
            validate_counts(instance_count, shard_count)?;
            transition(&mut state, Phase::Starting);
        }

        let plan = LaunchPlan {
            instance_count,
            shard_count,
            launcher: self.launcher.clone(),
            grace: self.config.grace_timeout(),
            sampler: self.sampler,
        };
        match tokio::spawn(launch_run(plan, self.state.clone())).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "start task failed, returning to idle");
                let mut state = self.lock();
                if state.phase == Phase::Starting {
                    transition(&mut state, Phase::Idle);
                }
                Err(OrchestratorError::TaskFailed {
                    operation: "start",
                    reason: e.to_string(),
                })
            }
        }
    }

    /// End the active run and return its stats.
    ///
    /// Records arriving after this call begins are discarded, and so are
    /// samples taken after it. Instances that need a force kill, and
    /// instances that vanished while being sampled, are reported as
    /// warnings; neither fails the stop. Dropping the returned future does
    /// not abort the teardown.
    pub async fn stop(&self) -> OrchestratorResult<StopResponse> {
        let teardown = {
            let mut state = self.lock();
            if !state.phase.can_stop() {
                return Err(OrchestratorError::NotRunning { phase: state.phase });
            }
            let Some(active) = state.active.take() else {
                // Running always carries a run; recover rather than wedge.
                error!("running phase without an active run");
                transition(&mut state, Phase::Stopped);
                return Err(OrchestratorError::NotRunning { phase: Phase::Stopped });
            };
            transition(&mut state, Phase::Stopping);
            Teardown::begin(active)
        };

        let finish = teardown.finish(self.policy, self.config.grace_timeout(), self.state.clone());
        match tokio::spawn(finish).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(error = %e, "stop task failed");
                let mut state = self.lock();
                if state.phase == Phase::Stopping {
                    transition(&mut state, Phase::Stopped);
                }
                Err(OrchestratorError::TaskFailed {
                    operation: "stop",
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Generate synthetic load against the active run.
    ///
    /// Ends early, without error, if the run is stopped meanwhile.
    pub async fn simulate_workload(
        &self,
        duration: Duration,
        rate_per_second: u32,
    ) -> OrchestratorResult<WorkloadReport> {
        let tracker = self.tracker()?;
        Ok(self
            .simulator
            .run(&tracker, duration, f64::from(rate_per_second))
            .await)
    }

    /// A recording handle for host-driven traffic in the active run.
    pub fn tracker(&self) -> OrchestratorResult<RequestTracker> {
        let state = self.lock();
        match (&state.phase, &state.active) {
            (Phase::Running, Some(active)) => Ok(active.tracker.clone()),
            _ => Err(OrchestratorError::NotRunning { phase: state.phase }),
        }
    }

    /// Record one completed request in the active run.
    pub fn record(&self, shard_id: ShardId, instance_id: &str, latency_ms: f64) -> OrchestratorResult<()> {
        self.tracker()?.record(shard_id, instance_id, latency_ms)?;
        Ok(())
    }

    /// Next round-robin target among the live instances of the active run.
    pub fn select(&self) -> OrchestratorResult<Target> {
        let state = self.lock();
        match (&state.phase, &state.active) {
            (Phase::Running, Some(active)) => active
                .selector
                .next()
                .ok_or(OrchestratorError::NoLiveInstances),
            _ => Err(OrchestratorError::NotRunning { phase: state.phase }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn status(&self) -> OrchestratorStatus {
        let state = self.lock();
        let (instances, shards): (Vec<InstanceInfo>, u32) = match &state.active {
            Some(active) => {
                let liveness = active.tracker.liveness();
                let instances = active
                    .supervisor
                    .instances()
                    .into_iter()
                    .map(|mut info| {
                        if !liveness.is_alive(&info.id) {
                            info.status = InstanceStatus::Dead;
                        }
                        info
                    })
                    .collect();
                (instances, active.shard_count)
            }
            None => (Vec::new(), 0),
        };
        OrchestratorStatus {
            phase: state.phase,
            run: state.runs,
            instances,
            shards,
        }
    }

    /// Stats of the most recently completed run.
    pub fn last_stats(&self) -> Option<RunStats> {
        self.lock().last_stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transition(state: &mut ControllerState, to: Phase) {
    info!(from = %state.phase, to = %to, run = state.runs, "orchestrator phase transition");
    state.phase = to;
}

/// What a start task needs, detached from the controller.
struct LaunchPlan {
    instance_count: u32,
    shard_count: u32,
    launcher: Arc<dyn InstanceLauncher>,
    grace: Duration,
    sampler: ResourceSampler,
}

/// Spawn the batch and install it as the active run, or roll back to `Idle`.
async fn launch_run(plan: LaunchPlan, shared: SharedState) -> OrchestratorResult<StartResponse> {
    let LaunchPlan {
        instance_count,
        shard_count,
        launcher,
        grace,
        sampler,
    } = plan;

    let mut supervisor = InstanceSupervisor::new(launcher, grace);
    let started = match supervisor.start(instance_count, shard_count).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "start failed, returning to idle");
            transition(&mut lock(&shared), Phase::Idle);
            return Err(e.into());
        }
    };

    let (tracker, collector) = RequestTracker::open(started.assignment.clone());
    let liveness = tracker.liveness().clone();
    let targets: Vec<SampleTarget> = started.instances.iter().map(SampleTarget::from).collect();
    let sampler = sampler.attach(targets, supervisor.usage_probe(), liveness.clone());
    let selector = ShardSelector::with_liveness(&started.assignment, liveness);
    let pids = started.pids();

    let mut state = lock(&shared);
    state.runs += 1;
    let run = state.runs;
    state.active = Some(ActiveRun {
        run,
        instance_count,
        shard_count,
        started: Instant::now(),
        started_at_ms: epoch_millis(),
        supervisor,
        sampler,
        tracker,
        collector,
        selector,
    });
    transition(&mut state, Phase::Running);

    Ok(StartResponse {
        started: true,
        run,
        instances: instance_count,
        shards: shard_count,
        pids,
    })
}

/// A run whose stop point is fixed and whose instances still need
/// tearing down.
struct Teardown {
    run: u64,
    instance_count: u32,
    shard_count: u32,
    started_at_ms: u64,
    stopped_at_ms: u64,
    requests: RequestLog,
    sampler: SamplerHandle,
    supervisor: InstanceSupervisor,
}

impl Teardown {
    /// Freeze the request log and halt sampling. Synchronous, so it runs
    /// under the same lock that enters `Stopping`.
    fn begin(active: ActiveRun) -> Self {
        let ActiveRun {
            run,
            instance_count,
            shard_count,
            started,
            started_at_ms,
            supervisor,
            mut sampler,
            collector,
            ..
        } = active;

        let stopped_at_ms = started_at_ms + started.elapsed().as_millis() as u64;
        let requests = collector.freeze();
        sampler.halt();

        Self {
            run,
            instance_count,
            shard_count,
            started_at_ms,
            stopped_at_ms,
            requests,
            sampler,
            supervisor,
        }
    }

    /// Detach the sampler, stop every instance, publish the stats and
    /// enter `Stopped`.
    async fn finish(mut self, policy: StatsPolicy, grace: Duration, shared: SharedState) -> StopResponse {
        let samples = self.sampler.detach().await;
        let reports = self.supervisor.stop().await;

        let mut warnings: Vec<RunWarning> =
            samples.gaps().iter().cloned().map(RunWarning::from).collect();
        warnings.extend(
            reports
                .iter()
                .filter_map(|report| degraded_warning(report, grace)),
        );

        let stats = compute(
            &RunInputs {
                samples: samples.samples(),
                requests: self.requests.records(),
                started_at_ms: self.started_at_ms,
                stopped_at_ms: self.stopped_at_ms,
                instance_count: self.instance_count,
                shard_count: self.shard_count,
            },
            &policy,
        );
        info!(
            run = self.run,
            total_requests = stats.total_requests,
            duration_ms = stats.duration_ms,
            warnings = warnings.len(),
            "run complete"
        );

        let mut state = lock(&shared);
        state.last_stats = Some(stats.clone());
        transition(&mut state, Phase::Stopped);

        StopResponse {
            stopped: true,
            stats,
            warnings,
        }
    }
}

fn degraded_warning(report: &TerminationReport, grace: Duration) -> Option<RunWarning> {
    let reason = match &report.outcome {
        TerminationOutcome::Forced => format!(
            "force killed after ignoring terminate for {}ms",
            grace.as_millis()
        ),
        TerminationOutcome::Failed(reason) => reason.clone(),
        TerminationOutcome::AlreadyExited | TerminationOutcome::Graceful => return None,
    };
    warn!(instance_id = %report.instance_id, pid = report.pid, %reason, "degraded stop");
    Some(RunWarning::DegradedStop {
        instance_id: report.instance_id.clone(),
        pid: report.pid,
        reason,
    })
}
