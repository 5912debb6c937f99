//! shardline-runtime — worker instance lifecycle.
//!
//! Platform process APIs stay behind three traits so the supervisor and
//! the orchestrator never touch them directly:
//!
//! ```text
//! InstanceLauncher
//!   ├── launch(ctx) → Box<dyn InstanceHandle>   (spawn)
//!   └── usage_probe() → Box<dyn UsageProbe>     (CPU time + RSS reads)
//!
//! InstanceHandle: pid / is_alive / terminate / force_kill
//!
//! InstanceSupervisor
//!   ├── start(n, m) → spawn n instances, shard = index mod m
//!   │                 (any spawn failure tears the batch down)
//!   └── stop()      → terminate in parallel, force-kill after grace
//! ```
//!
//! Two launchers ship with the crate: `ProcessLauncher` (real child
//! processes, sampled through `sysinfo`) and `SimulatedLauncher`
//! (in-process instances with deterministic usage and fault injection).

pub mod error;
pub mod handle;
pub mod process;
pub mod simulated;
pub mod supervisor;

pub use error::{RuntimeError, RuntimeResult};
pub use handle::{InstanceHandle, InstanceLauncher, LaunchContext, ProcessUsage, UsageProbe};
pub use process::{ProcessLauncher, SysinfoProbe};
pub use simulated::SimulatedLauncher;
pub use supervisor::{InstanceSupervisor, StartedInstances, TerminationOutcome, TerminationReport};
