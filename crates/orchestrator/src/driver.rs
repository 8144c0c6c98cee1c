//! Backend runner contract. A [`Driver`] owns one task and knows how to
//! render, plan and apply it; the orchestrator never looks inside.

use std::sync::Arc;

use async_trait::async_trait;
use syncd_core::{Config, Task};
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOption {
    /// Apply the change on the next trigger.
    #[default]
    Default,
    /// Apply the change immediately.
    Now,
    /// Compute the plan only.
    Inspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchTask {
    pub run_option: RunOption,
    pub enabled: bool,
}

/// Dry-run result: whether applying would change anything, and the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectPlan {
    pub changes_present: bool,
    pub plan: String,
    pub url: String,
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Snapshot of the task this driver runs.
    fn task(&self) -> Task;

    /// Identifiers of the dependency templates this task renders.
    fn template_ids(&self) -> Vec<String>;

    /// Suppresses the next trigger from the dependency watcher.
    fn override_notifier(&self);

    /// Applies the task's buffer period to its dependency watch.
    fn set_buffer_period(&self);

    /// Returns `true` once the template has all the data it needs.
    async fn render_template(&self, cancel: &CancellationToken) -> Result<bool, DriverError>;

    async fn apply_task(&self, cancel: &CancellationToken) -> Result<(), DriverError>;

    async fn inspect_task(&self, cancel: &CancellationToken) -> Result<InspectPlan, DriverError>;

    async fn update_task(
        &self,
        cancel: &CancellationToken,
        patch: PatchTask,
    ) -> Result<InspectPlan, DriverError>;

    /// Tears down backend state. Errors are the driver's to log.
    async fn destroy_task(&self, cancel: &CancellationToken);
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn init(&self, _cancel: &CancellationToken) -> Result<(), DriverError> {
        Ok(())
    }

    async fn make(
        &self,
        cancel: &CancellationToken,
        config: &Config,
        task: Task,
    ) -> Result<Arc<dyn Driver>, DriverError>;
}

