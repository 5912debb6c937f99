//! Synthetic load generator.
//!
//! Requests are dispatched on a fixed schedule (`start + i / rate`) rather
//! than by sleeping a fixed gap after each one, so scheduling overhead
//! never accumulates and the generated count is `round(duration * rate)`
//! unless the run stops first. Latencies are `base + uniform[0, jitter)`
//! from a seeded PRNG, so two runs with the same seed see the same values.
//!
//! Waiting for the next slot races the tracker's close notification, so a
//! stopped run ends the workload immediately. Instances the run has seen
//! die receive no further requests.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use shardline_core::SimulationConfig;
use shardline_metrics::{RecordError, RequestTracker};

use crate::balancer::ShardSelector;

/// Outcome of one simulated workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadReport {
    /// Requests the schedule called for.
    pub planned: u64,
    /// Requests accepted by the tracker.
    pub dispatched: u64,
    /// Requests rejected by the tracker (log closed or invalid target).
    pub rejected: u64,
    /// Whether dispatch stopped early because the run ended.
    pub interrupted: bool,
}

/// Generates requests against a run's request tracker.
#[derive(Debug, Clone)]
pub struct WorkloadSimulator {
    config: SimulationConfig,
}

impl WorkloadSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Number of requests a `duration` at `rate_per_second` should produce.
    pub fn planned_requests(duration: Duration, rate_per_second: f64) -> u64 {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return 0;
        }
        (duration.as_secs_f64() * rate_per_second).round() as u64
    }

    /// Dispatch synthetic requests for `duration` at `rate_per_second`.
    pub async fn run(
        &self,
        tracker: &RequestTracker,
        duration: Duration,
        rate_per_second: f64,
    ) -> WorkloadReport {
        let planned = Self::planned_requests(duration, rate_per_second);
        let mut report = WorkloadReport {
            planned,
            dispatched: 0,
            rejected: 0,
            interrupted: false,
        };
        let selector = ShardSelector::with_liveness(tracker.assignment(), tracker.liveness().clone());
        if planned == 0 || selector.active_shards() == 0 {
            debug!(planned, "nothing to simulate");
            return report;
        }

        info!(
            duration_ms = duration.as_millis() as u64,
            rate_per_second, planned, "simulating workload"
        );

        let mut rng = fastrand::Rng::with_seed(self.config.seed);
        let gap = Duration::from_secs_f64(1.0 / rate_per_second);
        let start = Instant::now();

        for i in 0..planned {
            tokio::select! {
                biased;
                _ = tracker.closed() => {
                    debug!(dispatched = report.dispatched, "run stopped, ending workload early");
                    report.interrupted = true;
                    break;
                }
                _ = tokio::time::sleep_until(start + gap.mul_f64(i as f64)) => {}
            }

            let Some(target) = selector.next() else {
                warn!(dispatched = report.dispatched, "no live instance left, ending workload early");
                report.interrupted = true;
                break;
            };
            let latency_ms = self.config.base_latency_ms + rng.f64() * self.config.jitter_ms;

            match tracker.record(target.shard_id, &target.instance_id, latency_ms) {
                Ok(()) => report.dispatched += 1,
                Err(RecordError::Closed) => {
                    debug!(dispatched = report.dispatched, "run stopped, ending workload early");
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "simulated request rejected");
                    report.rejected += 1;
                }
            }
        }

        info!(
            dispatched = report.dispatched,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "workload finished"
        );
        report
    }
}
