//! Cron timer for a single scheduled task.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::driver::Driver;
use crate::error::{OrchestratorError, Result};
use crate::tasks_manager::TasksManager;

/// Stop handle of one schedule timer. The id tells a timer's own entry apart
/// from one registered for a re-created task of the same name.
#[derive(Debug, Clone)]
pub struct ScheduleStop {
    id: u64,
    token: CancellationToken,
}

impl ScheduleStop {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Fires `task_run_now` for `name` at every cron tick until `stop` or
/// `cancel` fires, or the task disappears from the registry. However it
/// exits, the timer releases its stop entry.
pub async fn run_schedule(
    tasks: Arc<TasksManager>,
    name: String,
    mut stop: ScheduleStop,
    cancel: CancellationToken,
) -> Result<()> {
    let mut served = None;
    loop {
        let result = schedule_loop(&tasks, &name, stop.token(), &cancel, &mut served).await;
        tasks.release_schedule_stop(&name, &stop);
        if result.is_err() || stop.token().is_cancelled() || cancel.is_cancelled() {
            return result;
        }

        // A task re-created while this timer was winding down had its
        // announcement skipped, so this timer takes it over.
        let replaced = match (tasks.registry().get(&name), &served) {
            (Some(current), Some(old)) => !Arc::ptr_eq(&current, old) && current.task().is_scheduled(),
            (Some(current), None) => current.task().is_scheduled(),
            (None, _) => false,
        };
        if !replaced {
            return result;
        }
        let Some(next) = tasks.register_schedule_stop(&name) else {
            return result;
        };
        debug!(task_name = %name, "Taking over schedule of re-created task");
        stop = next;
    }
}

async fn schedule_loop(
    tasks: &TasksManager,
    name: &str,
    stop: &CancellationToken,
    cancel: &CancellationToken,
    served: &mut Option<Arc<dyn Driver>>,
) -> Result<()> {
    let Some(driver) = tasks.registry().get(name) else {
        info!(task_name = %name, "Scheduled task no longer exists, not starting");
        return Ok(());
    };
    *served = Some(driver.clone());
    let task = driver.task();
    let expr = task.schedule().ok_or_else(|| {
        OrchestratorError::Validation(format!("task {} has no schedule condition", name))
    })?;
    let schedule = Schedule::from_str(expr).map_err(|e| {
        OrchestratorError::Validation(format!("invalid cron expression '{}': {}", expr, e))
    })?;

    info!(task_name = %name, cron = expr, "Starting scheduled task");
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            info!(task_name = %name, "Schedule has no upcoming runs, stopping");
            return Ok(());
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        trace!(task_name = %name, next_run = %next, "Waiting for next scheduled run");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task_name = %name, "Stopping scheduled task, shutting down");
                return Ok(());
            }
            _ = stop.cancelled() => {
                debug!(task_name = %name, "Stopping scheduled task, task deleted");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if tasks.registry().get(name).is_none() {
            info!(task_name = %name, "Scheduled task no longer exists, stopping");
            return Ok(());
        }

        match tasks.task_run_now(cancel, name).await {
            Ok(()) => {}
            Err(OrchestratorError::Canceled) => return Ok(()),
            Err(e) => error!(task_name = %name, error = %e, "Error running scheduled task"),
        }
    }
}
