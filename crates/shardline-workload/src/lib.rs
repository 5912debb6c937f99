//! shardline-workload — synthetic load for shardline runs.
//!
//! `ShardSelector` spreads requests over a run's shards with two-level
//! round-robin; `WorkloadSimulator` paces requests at a target rate and
//! records them through the run's `RequestTracker`.

pub mod balancer;
pub mod simulator;

pub use balancer::{RoundRobinBalancer, ShardSelector, Target};
pub use simulator::{WorkloadReport, WorkloadSimulator};
