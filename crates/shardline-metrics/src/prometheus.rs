//! Prometheus text exposition format.
//!
//! Renders a completed run's `RunStats` into the Prometheus text
//! exposition format, for pushing to a gateway or dumping from the CLI.

use shardline_core::RunStats;

/// Render one run summary into Prometheus text format.
///
/// Every metric is a GAUGE; per-shard and per-quantile values carry
/// `shard` and `quantile` labels.
pub fn render_prometheus(stats: &RunStats) -> String {
    let mut out = String::new();

    gauge(&mut out, "shardline_instances", "Instances in the run.", stats.instances);
    gauge(&mut out, "shardline_shards", "Shards in the run.", stats.shards);
    gauge(
        &mut out,
        "shardline_duration_ms",
        "Run duration in milliseconds.",
        stats.duration_ms,
    );
    gauge(
        &mut out,
        "shardline_throughput_rps",
        "Completed requests per second.",
        format!("{:.2}", stats.throughput),
    );

    out.push_str("# HELP shardline_latency_ms Request latency percentiles in milliseconds.\n");
    out.push_str("# TYPE shardline_latency_ms gauge\n");
    for (quantile, value) in [
        ("0.5", stats.latency_p50),
        ("0.95", stats.latency_p95),
        ("0.99", stats.latency_p99),
    ] {
        out.push_str(&format!(
            "shardline_latency_ms{{quantile=\"{quantile}\"}} {value:.2}\n"
        ));
    }

    gauge(
        &mut out,
        "shardline_speedup_ratio",
        "Estimated horizontal speedup over one instance.",
        format!("{:.2}", stats.speedup_ratio),
    );
    gauge(
        &mut out,
        "shardline_efficiency_score",
        "Throughput per CPU percent, calibrated to 0.0-1.0.",
        format!("{:.4}", stats.efficiency_score),
    );
    gauge(
        &mut out,
        "shardline_cpu_utilization_percent",
        "Average CPU utilization across all samples.",
        leading_number(&stats.cpu_utilization),
    );
    gauge(
        &mut out,
        "shardline_memory_mb",
        "Memory at the final sampling tick in MB.",
        leading_number(&stats.memory_usage),
    );
    gauge(
        &mut out,
        "shardline_requests_total",
        "Requests completed during the run.",
        stats.total_requests,
    );

    out.push_str("# HELP shardline_shard_requests Requests completed per shard.\n");
    out.push_str("# TYPE shardline_shard_requests gauge\n");
    for (shard, count) in &stats.request_distribution {
        out.push_str(&format!(
            "shardline_shard_requests{{shard=\"{shard}\"}} {count}\n"
        ));
    }

    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n"));
}

/// `"37%"` → `"37"`, `"212MB"` → `"212"`.
fn leading_number(formatted: &str) -> &str {
    let end = formatted
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(formatted.len());
    match &formatted[..end] {
        "" => "0",
        number => number,
    }
}
