//! Stats engine — derives `RunStats` from one run's frozen logs.
//!
//! `compute` is pure: the same inputs always give the same summary, and
//! nothing here touches a clock or a process.

use std::collections::BTreeMap;

use shardline_core::{MemoryAggregation, OrchestratorConfig, RequestRecord, ResourceSample, RunStats};

/// Policy knobs for the derived ratios.
///
/// `parallel_efficiency_factor` and `calibration_constant` are
/// approximations, not measured quantities: speedup is estimated against a
/// synthetic single-instance baseline, and efficiency is scaled by a tuning
/// constant expressed in requests/s per CPU percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsPolicy {
    pub parallel_efficiency_factor: f64,
    pub calibration_constant: f64,
    pub memory_aggregation: MemoryAggregation,
}

impl Default for StatsPolicy {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for StatsPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            parallel_efficiency_factor: config.parallel_efficiency_factor,
            calibration_constant: config.calibration_constant,
            memory_aggregation: config.memory_aggregation,
        }
    }
}

/// Everything one run contributes to its summary.
#[derive(Debug, Clone, Copy)]
pub struct RunInputs<'a> {
    pub samples: &'a [ResourceSample],
    pub requests: &'a [RequestRecord],
    pub started_at_ms: u64,
    pub stopped_at_ms: u64,
    pub instance_count: u32,
    pub shard_count: u32,
}

/// Compute the summary of one run.
pub fn compute(inputs: &RunInputs<'_>, policy: &StatsPolicy) -> RunStats {
    // Floor at 1ms so throughput is always defined.
    let duration_ms = inputs.stopped_at_ms.saturating_sub(inputs.started_at_ms).max(1);
    let total_requests = inputs.requests.len() as u64;
    let throughput = total_requests as f64 / (duration_ms as f64 / 1000.0);

    let mut latencies: Vec<f64> = inputs.requests.iter().map(|r| r.latency_ms).collect();
    latencies.sort_by(f64::total_cmp);

    let avg_cpu = average_cpu(inputs.samples);

    RunStats {
        instances: inputs.instance_count,
        shards: inputs.shard_count,
        duration_ms,
        speedup_ratio: speedup_ratio(throughput, inputs.instance_count, policy),
        cpu_utilization: format!("{:.0}%", avg_cpu.unwrap_or(0.0)),
        memory_usage: format!(
            "{:.0}MB",
            final_tick_memory(inputs.samples, policy.memory_aggregation)
        ),
        throughput,
        latency_p50: percentile(&latencies, 0.50),
        latency_p95: percentile(&latencies, 0.95),
        latency_p99: percentile(&latencies, 0.99),
        efficiency_score: efficiency_score(throughput, avg_cpu, policy),
        request_distribution: distribution(inputs.requests, inputs.shard_count),
        total_requests,
    }
}

/// `sorted[floor(len * p)]`, clamped to the last element. Empty → 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn average_cpu(samples: &[ResourceSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let total: f64 = samples.iter().map(|s| s.cpu_percent).sum();
    Some(total / samples.len() as f64)
}

/// Memory across the samples of the last tick that produced any.
fn final_tick_memory(samples: &[ResourceSample], aggregation: MemoryAggregation) -> f64 {
    let Some(last_tick) = samples.iter().map(|s| s.timestamp_ms).max() else {
        return 0.0;
    };
    let last: Vec<f64> = samples
        .iter()
        .filter(|s| s.timestamp_ms == last_tick)
        .map(|s| s.memory_mb)
        .collect();
    let sum: f64 = last.iter().sum();
    match aggregation {
        MemoryAggregation::Sum => sum,
        MemoryAggregation::Average => sum / last.len() as f64,
    }
}

fn speedup_ratio(throughput: f64, instance_count: u32, policy: &StatsPolicy) -> f64 {
    let scale = instance_count as f64 * policy.parallel_efficiency_factor;
    if throughput <= 0.0 || scale <= 0.0 {
        return 0.0;
    }
    let single_instance_estimate = throughput / scale;
    throughput / single_instance_estimate
}

fn efficiency_score(throughput: f64, avg_cpu: Option<f64>, policy: &StatsPolicy) -> f64 {
    let Some(avg_cpu) = avg_cpu else {
        return 0.0;
    };
    if throughput <= 0.0 {
        return 0.0;
    }
    if avg_cpu <= 0.0 || policy.calibration_constant <= 0.0 {
        return 1.0;
    }
    ((throughput / avg_cpu) / policy.calibration_constant).clamp(0.0, 1.0)
}

/// Request counts per shard; every shard in `0..shard_count` is present.
fn distribution(requests: &[RequestRecord], shard_count: u32) -> BTreeMap<u32, u64> {
    let mut counts: BTreeMap<u32, u64> = (0..shard_count).map(|s| (s, 0)).collect();
    for record in requests {
        *counts.entry(record.shard_id).or_insert(0) += 1;
    }
    counts
}
