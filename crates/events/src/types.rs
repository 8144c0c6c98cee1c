use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A [`TaskEvent`] with its id and publication time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: TaskEvent,
}

impl EventEnvelope {
    pub fn new(event: TaskEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    #[serde(rename = "task.created")]
    TaskCreated { task_name: String, scheduled: bool },

    #[serde(rename = "task.updated")]
    TaskUpdated { task_name: String, enabled: bool },

    #[serde(rename = "task.deleted")]
    TaskDeleted { task_name: String },

    /// A run finished, successfully or not.
    #[serde(rename = "task.run_completed")]
    TaskRunCompleted {
        task_name: String,
        success: bool,
        error: Option<String>,
    },
}

impl TaskEvent {
    pub fn task_name(&self) -> &str {
        match self {
            Self::TaskCreated { task_name, .. }
            | Self::TaskUpdated { task_name, .. }
            | Self::TaskDeleted { task_name }
            | Self::TaskRunCompleted { task_name, .. } => task_name,
        }
    }
}
