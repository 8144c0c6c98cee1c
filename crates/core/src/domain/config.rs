use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_WORKING_DIR: &str = "sync-tasks";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:syncd.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_EVENT_HISTORY: usize = 5;
pub const DEFAULT_BUFFER_PERIOD_MIN: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER_PERIOD_MAX: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

const TASK_NAME_PATTERN: &str = "^[a-zA-Z0-9_-]+$";

fn is_valid_task_name(name: &str) -> Result<bool, CoreError> {
    let pattern = Regex::new(TASK_NAME_PATTERN)
        .map_err(|e| CoreError::validation(format!("invalid task name pattern: {}", e)))?;
    Ok(pattern.is_match(name))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPeriodConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub min: Option<Duration>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub max: Option<Duration>,
}

impl BufferPeriodConfig {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            enabled: Some(true),
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: Some(false),
            min: Some(Duration::ZERO),
            max: Some(Duration::ZERO),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Fills unset fields from `parent`. Setting only `min` or `max` implies
    /// the period is enabled.
    pub fn finalize(&mut self, parent: &BufferPeriodConfig) {
        if self.enabled.is_none() {
            if self.min.is_some() || self.max.is_some() {
                self.enabled = Some(true);
            } else {
                self.enabled = Some(parent.enabled.unwrap_or(true));
            }
        }
        if self.min.is_none() {
            self.min = Some(parent.min.unwrap_or(DEFAULT_BUFFER_PERIOD_MIN));
        }
        if self.max.is_none() {
            self.max = Some(parent.max.unwrap_or(DEFAULT_BUFFER_PERIOD_MAX));
        }
        if !self.is_enabled() {
            self.min = Some(Duration::ZERO);
            self.max = Some(Duration::ZERO);
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(CoreError::validation(format!(
                    "buffer_period.min ({:?}) must not exceed buffer_period.max ({:?})",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// What triggers a task run. Tasks without a condition run on changes to
/// their `services`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    Services {
        #[serde(default)]
        names: Vec<String>,
    },
    CatalogServices {
        regexp: String,
    },
    Schedule {
        cron: String,
    },
}

impl ConditionConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Services { names } => {
                if names.is_empty() {
                    return Err(CoreError::validation(
                        "services condition requires at least one service name",
                    ));
                }
            }
            Self::CatalogServices { regexp } => {
                Regex::new(regexp).map_err(|e| {
                    CoreError::validation(format!("invalid catalog_services regexp: {}", e))
                })?;
            }
            Self::Schedule { cron } => {
                cron::Schedule::from_str(cron).map_err(|e| {
                    CoreError::validation(format!("invalid schedule cron '{}': {}", cron, e))
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub module_inputs: Vec<String>,
    /// Values are JSON documents. Anything that does not parse as JSON is
    /// treated as a plain string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_period: Option<BufferPeriodConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl TaskConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_condition(mut self, condition: ConditionConfig) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.condition, Some(ConditionConfig::Schedule { .. }))
    }

    /// Fields other than `enabled` that are set here and differ from
    /// `current`. Unset fields never count as a change.
    pub fn changed_fields(&self, current: &TaskConfig) -> Vec<&'static str> {
        fn differs<T: PartialEq>(wanted: &Option<T>, current: &Option<T>) -> bool {
            wanted.is_some() && wanted != current
        }
        fn differs_list<T: PartialEq>(wanted: &[T], current: &[T]) -> bool {
            !wanted.is_empty() && wanted != current
        }

        let mut fields = Vec::new();
        if differs(&self.description, &current.description) {
            fields.push("description");
        }
        if differs(&self.module, &current.module) {
            fields.push("module");
        }
        if differs(&self.version, &current.version) {
            fields.push("version");
        }
        if differs_list(&self.providers, &current.providers) {
            fields.push("providers");
        }
        if differs_list(&self.services, &current.services) {
            fields.push("services");
        }
        if differs_list(&self.module_inputs, &current.module_inputs) {
            fields.push("module_inputs");
        }
        if !self.variables.is_empty() && self.variables != current.variables {
            fields.push("variables");
        }
        if differs(&self.buffer_period, &current.buffer_period) {
            fields.push("buffer_period");
        }
        if differs(&self.condition, &current.condition) {
            fields.push("condition");
        }
        if differs(&self.working_dir, &current.working_dir) {
            fields.push("working_dir");
        }
        fields
    }

    pub fn finalize(&mut self, global_buffer_period: &BufferPeriodConfig, global_working_dir: &Path) {
        if self.enabled.is_none() {
            self.enabled = Some(true);
        }
        if self.description.is_none() {
            self.description = Some(String::new());
        }
        if self.version.is_none() {
            self.version = Some(String::new());
        }

        if self.is_scheduled() {
            self.buffer_period = Some(BufferPeriodConfig::disabled());
        } else {
            let mut bp = self.buffer_period.take().unwrap_or_default();
            bp.finalize(global_buffer_period);
            self.buffer_period = Some(bp);
        }

        if self.working_dir.is_none() {
            if let Some(name) = &self.name {
                self.working_dir = Some(global_working_dir.join(name));
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let name = match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => return Err(CoreError::validation("task name is required")),
        };
        if !is_valid_task_name(name)? {
            return Err(CoreError::validation(format!(
                "task name '{}' may only contain letters, digits, '_' and '-'",
                name
            )));
        }

        match self.module.as_deref() {
            Some(module) if !module.is_empty() => {}
            _ => {
                return Err(CoreError::validation(format!(
                    "task '{}': module is required",
                    name
                )))
            }
        }

        if let Some(bp) = &self.buffer_period {
            bp.validate()
                .map_err(|e| CoreError::validation(format!("task '{}': {}", name, e)))?;
        }

        if let Some(condition) = &self.condition {
            condition
                .validate()
                .map_err(|e| CoreError::validation(format!("task '{}': {}", name, e)))?;
        } else if self.services.is_empty() {
            return Err(CoreError::validation(format!(
                "task '{}': at least one service or a condition is required",
                name
            )));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.as_str()) {
                return Err(CoreError::validation(format!(
                    "task '{}': duplicate provider '{}'",
                    name, provider
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnceMode {
    /// One task at a time; the first failure aborts the pass.
    #[default]
    Consecutive,
    /// Every task at once; failures are collected.
    Concurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    DEFAULT_RETRY_BASE_DELAY
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

/// Process configuration, usually loaded from `syncd.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_period: Option<BufferPeriodConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub once_mode: OnceMode,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_history: Option<usize>,
    #[serde(default, rename = "task", skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskConfig>,
}

impl Config {
    pub fn with_task(mut self, task: TaskConfig) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKING_DIR))
    }

    pub fn database_url(&self) -> &str {
        self.database_url.as_deref().unwrap_or(DEFAULT_DATABASE_URL)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn event_history(&self) -> usize {
        self.event_history.unwrap_or(DEFAULT_EVENT_HISTORY)
    }

    pub fn global_buffer_period(&self) -> BufferPeriodConfig {
        let mut bp = self.buffer_period.clone().unwrap_or_default();
        bp.finalize(&BufferPeriodConfig::new(
            DEFAULT_BUFFER_PERIOD_MIN,
            DEFAULT_BUFFER_PERIOD_MAX,
        ));
        bp
    }

    pub fn finalize(&mut self) {
        let global_bp = self.global_buffer_period();
        let working_dir = self.working_dir();
        for task in &mut self.tasks {
            task.finalize(&global_bp, &working_dir);
        }
        self.buffer_period = Some(global_bp);
        self.working_dir = Some(working_dir);
        if self.database_url.is_none() {
            self.database_url = Some(DEFAULT_DATABASE_URL.to_string());
        }
        if self.log_level.is_none() {
            self.log_level = Some(DEFAULT_LOG_LEVEL.to_string());
        }
        if self.event_history.is_none() {
            self.event_history = Some(DEFAULT_EVENT_HISTORY);
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(bp) = &self.buffer_period {
            bp.validate()?;
        }
        let mut names = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            let name = task.name_or_empty();
            if !names.insert(name) {
                return Err(CoreError::DuplicateTask(name.to_string()));
            }
        }
        Ok(())
    }
}
