//! Resource sampler — background CPU/memory sampling per instance.
//!
//! A sampler task reads every live instance at a fixed interval and
//! appends `ResourceSample`s to a log that only it writes. CPU percent is
//! the delta of cumulative process CPU time over the wall time elapsed
//! since the previous reading. An instance that disappears is dropped
//! from the sampling set after one warning and marked dead in the run's
//! `InstanceLiveness`; it contributes no further samples (never
//! zero-valued ones).
//!
//! `SamplerHandle::halt` fixes the stop point synchronously, so a caller
//! holding a lock can end sampling without awaiting. Samples stamped after
//! that point are dropped when the log is detached. Probes that block on
//! I/O are driven from the blocking pool.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use shardline_core::{epoch_millis, InstanceId, InstanceInfo, ResourceSample, RunWarning};
use shardline_runtime::UsageProbe;

use crate::liveness::InstanceLiveness;

/// An instance to sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleTarget {
    pub instance_id: InstanceId,
    pub pid: u32,
}

impl From<&InstanceInfo> for SampleTarget {
    fn from(info: &InstanceInfo) -> Self {
        Self {
            instance_id: info.id.clone(),
            pid: info.pid,
        }
    }
}

/// An instance that vanished while being sampled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGap {
    pub instance_id: InstanceId,
    pub pid: u32,
    /// Timestamp of the tick that first missed it.
    pub at_ms: u64,
}

impl From<SampleGap> for RunWarning {
    fn from(gap: SampleGap) -> Self {
        RunWarning::SampleCollectionGap {
            instance_id: gap.instance_id,
            at_ms: gap.at_ms,
        }
    }
}

/// Frozen sample log of one run.
#[derive(Debug, Clone, Default)]
pub struct SampleLog {
    samples: Vec<ResourceSample>,
    gaps: Vec<SampleGap>,
    ticks: u64,
}

impl SampleLog {
    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn gaps(&self) -> &[SampleGap] {
        &self.gaps
    }

    /// Number of sampling ticks executed.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn truncate_after(&mut self, cutoff_ms: u64) {
        self.samples.retain(|s| s.timestamp_ms <= cutoff_ms);
        self.gaps.retain(|g| g.at_ms <= cutoff_ms);
    }
}

/// Spawns sampler tasks at a fixed cadence.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSampler {
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start sampling `targets` in a background task. Vanished targets
    /// are marked dead in `liveness`.
    pub fn attach(
        &self,
        targets: Vec<SampleTarget>,
        probe: Box<dyn UsageProbe>,
        liveness: InstanceLiveness,
    ) -> SamplerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let clock = SampleClock::start();
        let state = SamplerState::new(targets, probe, liveness, clock);
        let interval = self.interval;

        info!(
            interval_ms = interval.as_millis() as u64,
            instances = state.live.len(),
            "resource sampler attached"
        );
        let task = tokio::spawn(run_sampler(state, interval, shutdown_rx));

        SamplerHandle {
            shutdown_tx,
            task,
            clock,
            cutoff_ms: None,
        }
    }
}

/// Maps the monotonic clock onto epoch milliseconds from a fixed origin.
#[derive(Debug, Clone, Copy)]
struct SampleClock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl SampleClock {
    fn start() -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch_ms: epoch_millis(),
        }
    }

    fn timestamp(&self, now: Instant) -> u64 {
        self.origin_epoch_ms + now.duration_since(self.origin).as_millis() as u64
    }
}

/// Handle to a running sampler task.
pub struct SamplerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<SampleLog>,
    clock: SampleClock,
    cutoff_ms: Option<u64>,
}

impl SamplerHandle {
    /// Signal the task to stop and fix the cutoff timestamp. Idempotent;
    /// the first call wins.
    pub fn halt(&mut self) -> u64 {
        if let Some(cutoff_ms) = self.cutoff_ms {
            return cutoff_ms;
        }
        let cutoff_ms = self.clock.timestamp(Instant::now());
        self.cutoff_ms = Some(cutoff_ms);
        let _ = self.shutdown_tx.send(true);
        debug!(cutoff_ms, "resource sampler halted");
        cutoff_ms
    }

    /// Stop sampling and return the frozen log, without samples taken
    /// after the cutoff.
    pub async fn detach(mut self) -> SampleLog {
        let cutoff_ms = self.halt();
        match self.task.await {
            Ok(mut log) => {
                log.truncate_after(cutoff_ms);
                info!(samples = log.len(), ticks = log.ticks, "resource sampler detached");
                log
            }
            Err(e) => {
                error!(error = %e, "resource sampler task failed, samples lost");
                SampleLog::default()
            }
        }
    }
}

struct Baseline {
    cpu_time_ms: u64,
    at: Instant,
}

struct SamplerState {
    probe: Box<dyn UsageProbe>,
    live: Vec<SampleTarget>,
    liveness: InstanceLiveness,
    baselines: HashMap<u32, Baseline>,
    clock: SampleClock,
    log: SampleLog,
}

impl SamplerState {
    fn new(
        targets: Vec<SampleTarget>,
        probe: Box<dyn UsageProbe>,
        liveness: InstanceLiveness,
        clock: SampleClock,
    ) -> Self {
        Self {
            probe,
            live: targets,
            liveness,
            baselines: HashMap::new(),
            clock,
            log: SampleLog::default(),
        }
    }

    fn pids(&self) -> Vec<u32> {
        self.live.iter().map(|t| t.pid).collect()
    }

    /// Record starting CPU time so the first tick has a delta.
    fn capture_baselines(&mut self) {
        let pids = self.pids();
        self.probe.refresh(&pids);
        let now = Instant::now();
        for target in &self.live {
            if let Some(usage) = self.probe.read(target.pid) {
                self.baselines.insert(
                    target.pid,
                    Baseline {
                        cpu_time_ms: usage.cpu_time_ms,
                        at: now,
                    },
                );
            }
        }
    }

    fn tick(&mut self) {
        let pids = self.pids();
        self.probe.refresh(&pids);
        let now = Instant::now();
        let timestamp_ms = self.clock.timestamp(now);
        self.log.ticks += 1;

        let mut live = std::mem::take(&mut self.live);
        live.retain(|target| {
            let Some(usage) = self.probe.read(target.pid) else {
                warn!(
                    instance_id = %target.instance_id,
                    pid = target.pid,
                    "instance disappeared, excluded from further sampling"
                );
                self.liveness.mark_dead(&target.instance_id);
                self.log.gaps.push(SampleGap {
                    instance_id: target.instance_id.clone(),
                    pid: target.pid,
                    at_ms: timestamp_ms,
                });
                return false;
            };

            let previous = self.baselines.insert(
                target.pid,
                Baseline {
                    cpu_time_ms: usage.cpu_time_ms,
                    at: now,
                },
            );
            // First sighting only establishes a baseline.
            if let Some(previous) = previous {
                self.log.samples.push(ResourceSample {
                    instance_id: target.instance_id.clone(),
                    timestamp_ms,
                    cpu_percent: cpu_percent(&previous, usage.cpu_time_ms, now),
                    memory_mb: usage.resident_bytes as f64 / (1024.0 * 1024.0),
                });
            }
            true
        });
        self.live = live;
    }
}

fn cpu_percent(previous: &Baseline, cpu_time_ms: u64, now: Instant) -> f64 {
    let wall_ms = now.duration_since(previous.at).as_secs_f64() * 1000.0;
    if wall_ms <= 0.0 {
        return 0.0;
    }
    let cpu_ms = cpu_time_ms.saturating_sub(previous.cpu_time_ms) as f64;
    cpu_ms / wall_ms * 100.0
}

/// Run one probe step, on the blocking pool if the probe does blocking I/O.
async fn probe_step(mut state: SamplerState, step: fn(&mut SamplerState)) -> Option<SamplerState> {
    if !state.probe.blocks() {
        step(&mut state);
        return Some(state);
    }
    match tokio::task::spawn_blocking(move || {
        step(&mut state);
        state
    })
    .await
    {
        Ok(state) => Some(state),
        Err(e) => {
            error!(error = %e, "resource probe panicked, sampling aborted");
            None
        }
    }
}

async fn run_sampler(
    state: SamplerState,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> SampleLog {
    let Some(mut state) = probe_step(state, SamplerState::capture_baselines).await else {
        return SampleLog::default();
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; baselines already cover it.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("resource sampler shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }
        state = match probe_step(state, SamplerState::tick).await {
            Some(state) => state,
            None => return SampleLog::default(),
        };
    }

    state.log
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use shardline_runtime::ProcessUsage;

    /// Probe whose CPU time grows at `share` of wall time (tokio clock).
    struct FakeProbe {
        started: Instant,
        share: HashMap<u32, f64>,
        vanish_after: HashMap<u32, Duration>,
    }

    impl FakeProbe {
        fn new(share: &[(u32, f64)]) -> Self {
            Self {
                started: Instant::now(),
                share: share.iter().copied().collect(),
                vanish_after: HashMap::new(),
            }
        }

        fn vanish(mut self, pid: u32, after: Duration) -> Self {
            self.vanish_after.insert(pid, after);
            self
        }
    }

    impl UsageProbe for FakeProbe {
        fn refresh(&mut self, _pids: &[u32]) {}

        fn read(&self, pid: u32) -> Option<ProcessUsage> {
            let elapsed = self.started.elapsed();
            if self.vanish_after.get(&pid).is_some_and(|after| elapsed >= *after) {
                return None;
            }
            let share = self.share.get(&pid)?;
            Some(ProcessUsage {
                cpu_time_ms: (elapsed.as_millis() as f64 * share) as u64,
                resident_bytes: 10 * 1024 * 1024,
            })
        }
    }

    fn targets(pids: &[u32]) -> Vec<SampleTarget> {
        pids.iter()
            .map(|&pid| SampleTarget {
                instance_id: format!("inst-{pid}"),
                pid,
            })
            .collect()
    }

    fn liveness(pids: &[u32]) -> InstanceLiveness {
        InstanceLiveness::new(pids.iter().map(|pid| format!("inst-{pid}")))
    }

    #[tokio::test(start_paused = true)]
    async fn samples_every_interval() {
        let sampler = ResourceSampler::new(Duration::from_millis(100));
        let probe = FakeProbe::new(&[(1, 0.5), (2, 0.25)]);
        let handle = sampler.attach(targets(&[1, 2]), Box::new(probe), liveness(&[1, 2]));

        tokio::time::sleep(Duration::from_millis(350)).await;
        let log = handle.detach().await;

        assert_eq!(log.ticks(), 3);
        assert_eq!(log.len(), 6);
        assert!(log.gaps().is_empty());

        for sample in log.samples() {
            let expected = if sample.instance_id == "inst-1" { 50.0 } else { 25.0 };
            assert!((sample.cpu_percent - expected).abs() < 1.0, "{sample:?}");
            assert_eq!(sample.memory_mb, 10.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_in_one_tick_share_a_timestamp() {
        let sampler = ResourceSampler::new(Duration::from_millis(100));
        let handle = sampler.attach(
            targets(&[1, 2, 3]),
            Box::new(FakeProbe::new(&[(1, 0.1), (2, 0.1), (3, 0.1)])),
            liveness(&[1, 2, 3]),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        let log = handle.detach().await;

        let samples = log.samples();
        assert_eq!(samples.len(), 6);
        assert_eq!(samples[0].timestamp_ms, samples[2].timestamp_ms);
        assert_eq!(samples[3].timestamp_ms - samples[0].timestamp_ms, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_instance_is_excluded_not_zeroed() {
        let sampler = ResourceSampler::new(Duration::from_millis(100));
        let probe =
            FakeProbe::new(&[(1, 0.5), (2, 0.5)]).vanish(2, Duration::from_millis(150));
        let alive = liveness(&[1, 2]);
        let handle = sampler.attach(targets(&[1, 2]), Box::new(probe), alive.clone());

        tokio::time::sleep(Duration::from_millis(450)).await;
        let log = handle.detach().await;

        assert!(alive.is_alive("inst-1"));
        assert!(!alive.is_alive("inst-2"));
        assert_eq!(log.gaps().len(), 1);
        assert_eq!(log.gaps()[0].instance_id, "inst-2");

        let from_2 = log
            .samples()
            .iter()
            .filter(|s| s.instance_id == "inst-2")
            .count();
        let from_1 = log
            .samples()
            .iter()
            .filter(|s| s.instance_id == "inst-1")
            .count();
        assert_eq!(from_2, 1);
        assert_eq!(from_1, 4);
        assert!(log.samples().iter().all(|s| s.cpu_percent > 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn detach_freezes_log() {
        let sampler = ResourceSampler::new(Duration::from_millis(100));
        let handle = sampler.attach(
            targets(&[1]),
            Box::new(FakeProbe::new(&[(1, 0.2)])),
            liveness(&[1]),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let log = handle.detach().await;
        let frozen = log.len();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(log.len(), frozen);
        assert_eq!(frozen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_detach_yields_empty_log() {
        let sampler = ResourceSampler::new(Duration::from_millis(100));
        let handle = sampler.attach(
            targets(&[1]),
            Box::new(FakeProbe::new(&[(1, 0.2)])),
            liveness(&[1]),
        );

        let log = handle.detach().await;
        assert!(log.is_empty());
        assert_eq!(log.ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn halt_fixes_the_cutoff() {
        let sampler = ResourceSampler::new(Duration::from_millis(100));
        let mut handle = sampler.attach(
            targets(&[1, 2]),
            Box::new(FakeProbe::new(&[(1, 0.2), (2, 0.2)])),
            liveness(&[1, 2]),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        let cutoff_ms = handle.halt();
        assert_eq!(handle.halt(), cutoff_ms);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let log = handle.detach().await;

        assert_eq!(log.ticks(), 2);
        assert_eq!(log.len(), 4);
        assert!(log.samples().iter().all(|s| s.timestamp_ms <= cutoff_ms));
    }

    /// Records which thread each refresh ran on.
    struct BlockingProbe {
        threads: Arc<Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl UsageProbe for BlockingProbe {
        fn refresh(&mut self, _pids: &[u32]) {
            self.threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
        }

        fn read(&self, _pid: u32) -> Option<ProcessUsage> {
            Some(ProcessUsage {
                cpu_time_ms: 0,
                resident_bytes: 1024 * 1024,
            })
        }

        fn blocks(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn blocking_probe_runs_off_the_runtime_thread() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let sampler = ResourceSampler::new(Duration::from_millis(10));
        let handle = sampler.attach(
            targets(&[1]),
            Box::new(BlockingProbe {
                threads: threads.clone(),
            }),
            liveness(&[1]),
        );

        tokio::time::sleep(Duration::from_millis(55)).await;
        let log = handle.detach().await;

        assert!(!log.is_empty());
        let runtime_thread = std::thread::current().id();
        let threads = threads.lock().unwrap();
        assert!(threads.len() >= 2);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[test]
    fn gap_converts_to_warning() {
        let gap = SampleGap {
            instance_id: "inst-0".to_string(),
            pid: 7,
            at_ms: 1234,
        };
        let warning: RunWarning = gap.into();
        assert_eq!(
            warning,
            RunWarning::SampleCollectionGap {
                instance_id: "inst-0".to_string(),
                at_ms: 1234,
            }
        );
    }
}
