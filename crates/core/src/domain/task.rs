use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{BufferPeriodConfig, ConditionConfig, TaskConfig};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs when watched dependencies change.
    #[default]
    Dynamic,
    /// Runs on a cron schedule.
    Scheduled,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPeriod {
    pub min: Duration,
    pub max: Duration,
}

/// A unit of work built from a finalized and validated [`TaskConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    name: String,
    description: String,
    enabled: bool,
    kind: TaskKind,
    module: String,
    version: String,
    providers: Vec<String>,
    services: Vec<String>,
    module_inputs: Vec<String>,
    variables: BTreeMap<String, serde_json::Value>,
    buffer_period: Option<BufferPeriod>,
    condition: Option<ConditionConfig>,
    working_dir: PathBuf,
}

impl Task {
    pub fn from_config(conf: &TaskConfig) -> Result<Self, CoreError> {
        let name = conf
            .name
            .clone()
            .ok_or_else(|| CoreError::validation("task name is required"))?;
        let module = conf
            .module
            .clone()
            .ok_or_else(|| CoreError::validation(format!("task '{}': module is required", name)))?;

        let buffer_period = conf
            .buffer_period
            .as_ref()
            .filter(|bp| bp.is_enabled())
            .map(|bp| BufferPeriod {
                min: bp.min.unwrap_or_default(),
                max: bp.max.unwrap_or_default(),
            });

        let variables = conf
            .variables
            .iter()
            .map(|(key, raw)| {
                let value = serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
                (key.clone(), value)
            })
            .collect();

        let kind = if conf.is_scheduled() {
            TaskKind::Scheduled
        } else {
            TaskKind::Dynamic
        };

        let working_dir = conf
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&name));

        Ok(Self {
            name,
            description: conf.description.clone().unwrap_or_default(),
            enabled: conf.enabled.unwrap_or(true),
            kind,
            module,
            version: conf.version.clone().unwrap_or_default(),
            providers: conf.providers.clone(),
            services: conf.services.clone(),
            module_inputs: conf.module_inputs.clone(),
            variables,
            buffer_period,
            condition: conf.condition.clone(),
            working_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_scheduled(&self) -> bool {
        self.kind == TaskKind::Scheduled
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn module_inputs(&self) -> &[String] {
        &self.module_inputs
    }

    pub fn variables(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.variables
    }

    pub fn buffer_period(&self) -> Option<BufferPeriod> {
        self.buffer_period
    }

    pub fn condition(&self) -> Option<&ConditionConfig> {
        self.condition.as_ref()
    }

    /// The cron expression of a scheduled task.
    pub fn schedule(&self) -> Option<&str> {
        match &self.condition {
            Some(ConditionConfig::Schedule { cron }) => Some(cron),
            _ => None,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Canonical configuration for this task. Variables are re-encoded as
    /// JSON and the buffer period is always explicit.
    pub fn to_config(&self) -> TaskConfig {
        let buffer_period = match self.buffer_period {
            Some(bp) => BufferPeriodConfig::new(bp.min, bp.max),
            None => BufferPeriodConfig::disabled(),
        };

        TaskConfig {
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            enabled: Some(self.enabled),
            module: Some(self.module.clone()),
            version: Some(self.version.clone()),
            providers: self.providers.clone(),
            services: self.services.clone(),
            module_inputs: self.module_inputs.clone(),
            variables: self
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            buffer_period: Some(buffer_period),
            condition: self.condition.clone(),
            working_dir: Some(self.working_dir.clone()),
        }
    }
}
