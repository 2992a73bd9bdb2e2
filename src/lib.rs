//! Task orchestrator: priority scheduling of multi-step tasks over
//! pluggable executors.

pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod store;
pub mod task;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use executor::{ActionRegistry, Executor};
pub use scheduler::{HealthReport, Scheduler, SchedulerEvent, SchedulerMetrics};
pub use store::TaskStore;
pub use task::{Action, Priority, Task, TaskSnapshot, TaskStatus};
