//! shardline-orchestrator — multi-instance run orchestration.
//!
//! An `OrchestratorController` is constructed by its host with an explicit
//! `OrchestratorConfig` and an `InstanceLauncher`. Each `start`/`stop`
//! cycle spawns a fresh batch of instances, samples their resource usage
//! in the background, records requests, and returns a `RunStats` computed
//! from that run's logs alone.
//!
//! ```text
//! start(n, m)
//!   ├── InstanceSupervisor::start   spawn, shard = index mod m
//!   ├── ResourceSampler::attach     background sampling task
//!   └── RequestTracker::open        fresh request log
//! simulate_workload(duration, rate) / record(shard, instance, latency)
//! stop()
//!   ├── RequestCollector::freeze    under the state lock
//!   ├── SamplerHandle::halt         under the state lock
//!   └── teardown task
//!       ├── SamplerHandle::detach
//!       ├── InstanceSupervisor::stop    graceful, then force kill
//!       └── stats::compute              → RunStats
//! ```

pub mod controller;
pub mod error;

pub use controller::OrchestratorController;
pub use error::{OrchestratorError, OrchestratorResult};
