//! Task lifecycle notifications.
//!
//! The orchestrator publishes a [`TaskEvent`] whenever a task is created,
//! updated, deleted or finishes a run. Anything interested (log sinks, the
//! CLI, tests) subscribes to the [`EventBus`].

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
