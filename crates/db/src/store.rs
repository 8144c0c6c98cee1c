use async_trait::async_trait;
use syncd_core::{Config, Event, TaskConfig};

use crate::error::Result;

/// Persistent task configuration and run history, addressed by task name.
#[async_trait]
pub trait Store: Send + Sync {
    /// The process configuration the store was opened with.
    fn config(&self) -> Config;

    async fn get_task(&self, name: &str) -> Result<Option<TaskConfig>>;

    /// All stored task configurations in insertion order.
    async fn get_all_tasks(&self) -> Result<Vec<TaskConfig>>;

    /// Inserts or replaces the task stored under `conf.name`.
    async fn set_task(&self, conf: TaskConfig) -> Result<()>;

    async fn delete_task(&self, name: &str) -> Result<()>;

    async fn add_task_event(&self, event: Event) -> Result<()>;

    /// Recent events for a task, newest first.
    async fn get_task_events(&self, name: &str) -> Result<Vec<Event>>;

    async fn delete_task_events(&self, name: &str) -> Result<()>;
}
