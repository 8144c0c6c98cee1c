use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Task;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub providers: Vec<String>,
    pub services: Vec<String>,
    pub source: String,
}

impl EventConfig {
    pub fn from_task(task: &Task) -> Self {
        Self {
            providers: task.providers().to_vec(),
            services: task.services().to_vec(),
            source: task.module().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub message: String,
}

/// Record of a single task run, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub task_name: String,
    pub success: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<EventError>,
    pub config: EventConfig,
}

impl Event {
    pub fn new(task_name: impl Into<String>, config: EventConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_name: task_name.into(),
            success: false,
            start_time: None,
            end_time: None,
            error: None,
            config,
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self::new(task.name(), EventConfig::from_task(task))
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    pub fn end_success(&mut self) {
        self.end_time = Some(Utc::now());
        self.success = true;
        self.error = None;
    }

    pub fn end_failure(&mut self, message: impl Into<String>) {
        self.end_time = Some(Utc::now());
        self.success = false;
        self.error = Some(EventError {
            message: message.into(),
        });
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
