//! Run lifecycle tests.
//!
//! Drives full start → load → stop cycles against simulated instances and
//! checks the published properties of `RunStats`: load accuracy,
//! distribution completeness, percentile ordering, run isolation and
//! speedup monotonicity, plus the state-machine guards.

use std::sync::Arc;
use std::time::Duration;

use shardline_core::{OrchestratorConfig, Phase, StartRequest};
use shardline_metrics::RecordError;
use shardline_orchestrator::{OrchestratorController, OrchestratorError};
use shardline_runtime::SimulatedLauncher;

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        sample_interval_ms: 50,
        grace_timeout_ms: 100,
        ..OrchestratorConfig::default()
    }
}

fn controller() -> (OrchestratorController, SimulatedLauncher) {
    let launcher = SimulatedLauncher::new();
    let ctl = OrchestratorController::new(test_config(), Arc::new(launcher.clone())).unwrap();
    (ctl, launcher)
}

fn request(instance_count: u32, shard_count: u32) -> StartRequest {
    StartRequest {
        instance_count,
        shard_count,
    }
}

#[tokio::test(start_paused = true)]
async fn end_to_end_four_instances_two_shards() {
    let (ctl, launcher) = controller();

    let started = ctl.start(request(4, 2)).await.unwrap();
    assert!(started.started);
    assert_eq!(started.instances, 4);
    assert_eq!(started.shards, 2);
    assert_eq!(started.pids.len(), 4);

    let report = ctl
        .simulate_workload(Duration::from_secs(10), 50)
        .await
        .unwrap();
    assert_eq!(report.dispatched, 500);

    let stopped = ctl.stop().await.unwrap();
    let stats = &stopped.stats;
    assert!(stopped.stopped);
    assert_eq!(stats.instances, 4);
    assert_eq!(stats.shards, 2);
    assert!(stats.total_requests > 0);
    assert_eq!(stats.request_distribution.len(), 2);
    assert_eq!(
        stats.request_distribution.values().sum::<u64>(),
        stats.total_requests
    );
    assert!(stats.duration_ms >= 9_900);
    assert!(stats.throughput > 45.0 && stats.throughput < 55.0);
    assert_eq!(launcher.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn resource_stats_reflect_instance_usage() {
    let (ctl, _launcher) = controller();
    ctl.start(request(4, 2)).await.unwrap();

    ctl.simulate_workload(Duration::from_secs(10), 50)
        .await
        .unwrap();
    let stats = ctl.stop().await.unwrap().stats;

    // Each simulated instance uses a quarter core and 64 MiB.
    assert_eq!(stats.cpu_utilization, "25%");
    assert_eq!(stats.memory_usage, "256MB");
    // (~50 req/s / 25%) / calibration 10.0
    assert!(
        stats.efficiency_score > 0.15 && stats.efficiency_score < 0.25,
        "efficiency_score = {}",
        stats.efficiency_score
    );
}

#[tokio::test]
async fn load_accuracy_within_ten_percent() {
    let (ctl, _launcher) = controller();
    ctl.start(request(4, 2)).await.unwrap();

    ctl.simulate_workload(Duration::from_millis(2000), 100)
        .await
        .unwrap();
    let stats = ctl.stop().await.unwrap().stats;

    assert!(
        (180..=220).contains(&stats.total_requests),
        "total_requests = {}",
        stats.total_requests
    );
}

#[tokio::test(start_paused = true)]
async fn distribution_has_every_shard() {
    let (ctl, _launcher) = controller();
    ctl.start(request(2, 4)).await.unwrap();

    ctl.simulate_workload(Duration::from_secs(1), 100)
        .await
        .unwrap();
    let stats = ctl.stop().await.unwrap().stats;

    let keys: Vec<u32> = stats.request_distribution.keys().copied().collect();
    assert_eq!(keys, vec![0, 1, 2, 3]);
    assert_eq!(stats.request_distribution[&2], 0);
    assert_eq!(stats.request_distribution[&3], 0);
    assert_eq!(
        stats.request_distribution.values().sum::<u64>(),
        stats.total_requests
    );
}

#[tokio::test(start_paused = true)]
async fn balanced_distribution_under_uniform_load() {
    let (ctl, _launcher) = controller();
    ctl.start(request(6, 3)).await.unwrap();

    ctl.simulate_workload(Duration::from_secs(3), 100)
        .await
        .unwrap();
    let stats = ctl.stop().await.unwrap().stats;

    for count in stats.request_distribution.values() {
        assert_eq!(*count, 100);
    }
}

#[tokio::test(start_paused = true)]
async fn percentiles_are_ordered() {
    let (ctl, _launcher) = controller();
    ctl.start(request(3, 3)).await.unwrap();

    ctl.simulate_workload(Duration::from_secs(2), 100)
        .await
        .unwrap();
    for i in 0..20 {
        let target = ctl.select().unwrap();
        ctl.record(target.shard_id, &target.instance_id, 50.0 + i as f64)
            .unwrap();
    }
    let stats = ctl.stop().await.unwrap().stats;

    assert!(stats.latency_p50 > 0.0);
    assert!(stats.latency_p50 <= stats.latency_p95);
    assert!(stats.latency_p95 <= stats.latency_p99);
}

#[tokio::test]
async fn empty_run_reports_zero_percentiles() {
    let (ctl, _launcher) = controller();
    ctl.start(request(2, 1)).await.unwrap();

    let stats = ctl.stop().await.unwrap().stats;
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.latency_p50, 0.0);
    assert_eq!(stats.latency_p99, 0.0);
    assert_eq!(stats.throughput, 0.0);
    assert!(stats.duration_ms >= 1);
}

#[tokio::test]
async fn state_guards_reject_without_side_effects() {
    let (ctl, launcher) = controller();

    let err = ctl.stop().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotRunning { phase: Phase::Idle }));
    assert_eq!(ctl.phase(), Phase::Idle);

    ctl.start(request(2, 1)).await.unwrap();
    let err = ctl.start(request(8, 4)).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::AlreadyRunning {
            phase: Phase::Running
        }
    ));
    assert_eq!(ctl.phase(), Phase::Running);
    assert_eq!(ctl.status().instances.len(), 2);
    assert_eq!(launcher.launched(), 2);

    ctl.stop().await.unwrap();
    let err = ctl.stop().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NotRunning {
            phase: Phase::Stopped
        }
    ));
    assert!(matches!(
        ctl.simulate_workload(Duration::from_millis(10), 10).await,
        Err(OrchestratorError::NotRunning { .. })
    ));
}

#[tokio::test]
async fn concurrent_starts_are_serialized() {
    let (ctl, launcher) = controller();

    let (a, b) = tokio::join!(ctl.start(request(2, 1)), ctl.start(request(2, 1)));
    let results = [a.is_ok(), b.is_ok()];
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    let err = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));

    assert_eq!(launcher.launched(), 2);
    ctl.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn consecutive_runs_share_no_data() {
    let (ctl, _launcher) = controller();

    let first = ctl.start(request(2, 2)).await.unwrap();
    let stale = ctl.tracker().unwrap();
    ctl.simulate_workload(Duration::from_secs(3), 100)
        .await
        .unwrap();
    let run1 = ctl.stop().await.unwrap().stats;

    let second = ctl.start(request(2, 2)).await.unwrap();
    assert_eq!(first.run, 1);
    assert_eq!(second.run, 2);

    // A handle from the finished run cannot leak into this one.
    assert_eq!(stale.record(0, "inst-0", 1.0), Err(RecordError::Closed));

    ctl.simulate_workload(Duration::from_secs(1), 100)
        .await
        .unwrap();
    let run2 = ctl.stop().await.unwrap().stats;

    assert_eq!(run1.total_requests, 300);
    assert_eq!(run2.total_requests, 100);
    assert_eq!(ctl.last_stats(), Some(run2));
}

#[tokio::test(start_paused = true)]
async fn speedup_grows_with_instances() {
    let mut previous = 0.0;
    for n in [1u32, 2, 4, 8] {
        let (ctl, _launcher) = controller();
        ctl.start(request(n, (n / 2).max(1))).await.unwrap();
        ctl.simulate_workload(Duration::from_secs(1), 20 * n)
            .await
            .unwrap();
        let stats = ctl.stop().await.unwrap().stats;

        assert!(stats.speedup_ratio >= previous, "n = {n}");
        if n > 1 {
            assert!(stats.speedup_ratio > 1.0, "n = {n}");
        }
        previous = stats.speedup_ratio;
    }
}

#[tokio::test(start_paused = true)]
async fn early_stop_cancels_workload() {
    let (ctl, _launcher) = controller();
    ctl.start(request(2, 2)).await.unwrap();

    let (report, stopped) = tokio::join!(
        ctl.simulate_workload(Duration::from_secs(60), 10),
        async {
            tokio::time::sleep(Duration::from_millis(1050)).await;
            ctl.stop().await
        }
    );
    let report = report.unwrap();
    let stats = stopped.unwrap().stats;

    assert!(report.interrupted);
    assert_eq!(report.dispatched, stats.total_requests);
    assert!(stats.total_requests > 0 && stats.total_requests < 600);
}

#[tokio::test]
async fn stop_response_serializes_camel_case() {
    let (ctl, _launcher) = controller();
    ctl.start(request(1, 1)).await.unwrap();
    let stopped = ctl.stop().await.unwrap();

    let json = serde_json::to_value(&stopped).unwrap();
    let stats = &json["stats"];
    for key in [
        "instances",
        "shards",
        "durationMs",
        "speedupRatio",
        "cpuUtilization",
        "memoryUsage",
        "throughput",
        "latencyP50",
        "latencyP95",
        "latencyP99",
        "efficiencyScore",
        "requestDistribution",
        "totalRequests",
    ] {
        assert!(stats.get(key).is_some(), "missing {key}");
    }
    assert_eq!(json["stopped"], true);
}
