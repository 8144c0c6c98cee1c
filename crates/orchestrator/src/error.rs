use syncd_core::CoreError;
use thiserror::Error;

/// Failure reported by a [`Driver`](crate::Driver) backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("{0}")]
    Backend(String),

    #[error("driver operation canceled")]
    Canceled,
}

impl DriverError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("watcher failed: {0}")]
    Failed(String),

    #[error("watcher canceled")]
    Canceled,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task '{0}' is active and cannot be run at this time")]
    TaskBusy(String),

    #[error("Timed out initializing task '{0}'")]
    InitializationTimeout(String),

    #[error("Error rendering template for task '{task}': {source}")]
    Render {
        task: String,
        #[source]
        source: DriverError,
    },

    #[error("Could not apply changes for task '{task}' after {attempts} attempt(s): {source}")]
    ApplyFailed {
        task: String,
        attempts: u32,
        #[source]
        source: DriverError,
    },

    #[error("Operation canceled")]
    Canceled,

    #[error("Unsupported update for task '{task}': only 'enabled' can be changed, got {fields}")]
    UnsupportedUpdate { task: String, fields: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("{} task(s) failed: {}", .0.len(), summarize(.0))]
    OnceFailed(Vec<(String, OrchestratorError)>),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl OrchestratorError {
    pub fn task_failed(task: impl Into<String>, source: OrchestratorError) -> Self {
        Self::TaskFailed {
            task: task.into(),
            source: Box::new(source),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

fn summarize(failures: &[(String, OrchestratorError)]) -> String {
    failures
        .iter()
        .map(|(task, err)| format!("{}: {}", task, err))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
