use chrono::{DateTime, TimeZone, Utc};
use syncd_core::{Event, EventConfig, EventError};
use uuid::Uuid;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub task_name: String,
    pub success: bool,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error_message: Option<String>,
    pub providers: String,
    pub services: String,
    pub source: String,
}

impl EventRow {
    pub fn from_domain(event: &Event) -> Result<Self, DbError> {
        Ok(Self {
            id: event.id.to_string(),
            task_name: event.task_name.clone(),
            success: event.success,
            start_time: event.start_time.map(datetime_to_millis),
            end_time: event.end_time.map(datetime_to_millis),
            error_message: event.error.as_ref().map(|e| e.message.clone()),
            providers: serde_json::to_string(&event.config.providers)?,
            services: serde_json::to_string(&event.config.services)?,
            source: event.config.source.clone(),
        })
    }

    pub fn into_domain(self) -> Result<Event, DbError> {
        Ok(Event {
            id: Uuid::parse_str(&self.id).unwrap_or_default(),
            task_name: self.task_name,
            success: self.success,
            start_time: self.start_time.and_then(millis_to_datetime),
            end_time: self.end_time.and_then(millis_to_datetime),
            error: self.error_message.map(|message| EventError { message }),
            config: EventConfig {
                providers: serde_json::from_str(&self.providers)?,
                services: serde_json::from_str(&self.services)?,
                source: self.source,
            },
        })
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}
