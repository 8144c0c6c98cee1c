use chrono::Utc;
use syncd_core::TaskConfig;

use crate::error::DbError;

/// A task configuration, stored as a JSON document keyed by task name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskConfigRow {
    pub name: String,
    pub config: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskConfigRow {
    pub fn from_domain(conf: &TaskConfig) -> Result<Self, DbError> {
        let now = Utc::now().timestamp();
        Ok(Self {
            name: conf.name_or_empty().to_string(),
            config: serde_json::to_string(conf)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn into_domain(self) -> Result<TaskConfig, DbError> {
        Ok(serde_json::from_str(&self.config)?)
    }
}
