//! shardline-metrics — measurement for shardline runs.
//!
//! Two append-only logs are collected while a run is active and read
//! once, after they are frozen, by the stats engine:
//!
//! ```text
//! ResourceSampler (background task, one writer)
//!   ├── attach(targets, probe, liveness) → SamplerHandle
//!   ├── SamplerHandle::halt() fixes the cutoff
//!   └── SamplerHandle::detach() → SampleLog (frozen)
//!
//! RequestTracker (cloneable sender, lock-free record path)
//!   ├── record(shard, instance, latency_ms)
//!   └── RequestCollector::freeze() → RequestLog (frozen)
//!
//! stats::compute(&RunInputs, &StatsPolicy) → RunStats
//! render_prometheus(&RunStats) → text/plain
//! ```
//!
//! `InstanceLiveness` is shared by both sides: the sampler marks vanished
//! instances dead and the tracker stops accepting records for them.

pub mod liveness;
pub mod prometheus;
pub mod sampler;
pub mod stats;
pub mod tracker;

pub use liveness::InstanceLiveness;
pub use prometheus::render_prometheus;
pub use sampler::{ResourceSampler, SampleGap, SampleLog, SampleTarget, SamplerHandle};
pub use stats::{compute, RunInputs, StatsPolicy};
pub use tracker::{RecordError, RequestCollector, RequestLog, RequestTracker};
