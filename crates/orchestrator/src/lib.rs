//! Task orchestration: the registry of live tasks, the run state machine,
//! retrying apply, and the controller loops that drive them.

pub mod controller;
pub mod driver;
pub mod error;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod tasks_manager;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use controller::Controller;
pub use driver::{Driver, DriverFactory, InspectPlan, PatchTask, RunOption};
pub use error::{DriverError, OrchestratorError, Result, WatcherError};
pub use registry::{ActiveGuard, TaskRegistry};
pub use retry::{Retry, RetryError};
pub use tasks_manager::TasksManager;
pub use watcher::Watcher;
