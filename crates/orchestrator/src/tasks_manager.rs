//! Task CRUD and the run-now state machine.
//!
//! The registry is the source of truth for whether a task exists, is busy or
//! is being deleted. The store is only written after the matching registry
//! change has gone through, on both the create and the delete path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use db::Store;
use events::{EventBus, EventEnvelope, TaskEvent};
use syncd_core::{Config, Event, Task, TaskConfig};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::driver::{Driver, DriverFactory, InspectPlan, PatchTask, RunOption};
use crate::error::{OrchestratorError, Result};
use crate::registry::{ActiveGuard, TaskRegistry};
use crate::retry::{Retry, RetryError};
use crate::schedule::ScheduleStop;

/// Creation fires the driver's override notifier once if rendering has not
/// finished by then.
pub const OVERRIDE_NOTIFIER_AFTER: Duration = Duration::from_secs(30);
pub const INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const RENDER_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const INACTIVE_POLL_INTERVAL: Duration = Duration::from_micros(100);

const CHANNEL_CAPACITY: usize = 64;
const MIN_TEST_NOTIFY_CAPACITY: usize = 16;

pub struct TasksManager {
    store: Arc<dyn Store>,
    factory: Arc<dyn DriverFactory>,
    registry: TaskRegistry,
    retry: Retry,
    event_bus: EventBus,
    task_notify: Mutex<Option<mpsc::Sender<String>>>,
    created_schedule_tx: mpsc::Sender<String>,
    created_schedule_rx: AsyncMutex<mpsc::Receiver<String>>,
    delete_tx: mpsc::Sender<String>,
    delete_rx: AsyncMutex<mpsc::Receiver<String>>,
    schedule_stops: Mutex<HashMap<String, ScheduleStop>>,
    next_stop_id: AtomicU64,
}

impl TasksManager {
    pub fn new(store: Arc<dyn Store>, factory: Arc<dyn DriverFactory>) -> Self {
        let retry = Retry::new(store.config().retry, None);
        let (created_schedule_tx, created_schedule_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (delete_tx, delete_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Self {
            store,
            factory,
            registry: TaskRegistry::new(),
            retry,
            event_bus: EventBus::new(),
            task_notify: Mutex::new(None),
            created_schedule_tx,
            created_schedule_rx: AsyncMutex::new(created_schedule_rx),
            delete_tx,
            delete_rx: AsyncMutex::new(delete_rx),
            schedule_stops: Mutex::new(HashMap::new()),
            next_stop_id: AtomicU64::new(0),
        }
    }

    /// Publishes lifecycle events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_bus.subscribe()
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Clears the registry and initializes the driver factory.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        self.registry.reset();
        self.factory.init(cancel).await?;
        Ok(())
    }

    pub fn config(&self) -> Config {
        self.store.config()
    }

    pub async fn task(&self, name: &str) -> Result<TaskConfig> {
        self.store
            .get_task(name)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    pub async fn tasks(&self) -> Result<Vec<TaskConfig>> {
        Ok(self.store.get_all_tasks().await?)
    }

    /// Recent events for a task, newest first.
    pub async fn events(&self, name: &str) -> Result<Vec<Event>> {
        Ok(self.store.get_task_events(name).await?)
    }

    /// Name of the task that renders `template_id`, if any.
    pub fn task_by_template(&self, template_id: &str) -> Option<String> {
        self.registry
            .get_by_template_id(template_id)
            .map(|d| d.task().name().to_string())
    }

    /// Returns a receiver of task names, one per run that reached a
    /// completion point. Receivers that fall behind lose notifications.
    pub async fn enable_test_mode(&self) -> Result<mpsc::Receiver<String>> {
        let capacity = self
            .store
            .get_all_tasks()
            .await?
            .len()
            .max(MIN_TEST_NOTIFY_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        *self
            .task_notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    /// Names of newly created scheduled tasks.
    pub async fn created_schedule_receiver(&self) -> AsyncMutexGuard<'_, mpsc::Receiver<String>> {
        self.created_schedule_rx.lock().await
    }

    /// Names of tasks marked for deletion.
    pub async fn delete_receiver(&self) -> AsyncMutexGuard<'_, mpsc::Receiver<String>> {
        self.delete_rx.lock().await
    }

    /// Creates a task and adds it without running it.
    pub async fn task_create(&self, cancel: &CancellationToken, conf: TaskConfig) -> Result<TaskConfig> {
        let driver = self.create_task(cancel, conf).await?;
        self.add_task(cancel, driver).await
    }

    /// Creates a task, applies it once and then adds it.
    pub async fn task_create_and_run(
        &self,
        cancel: &CancellationToken,
        conf: TaskConfig,
    ) -> Result<TaskConfig> {
        let driver = self.create_task(cancel, conf).await?;
        self.run_new_task(cancel, &driver).await?;
        self.add_task(cancel, driver).await
    }

    /// Dry run of a task that is never registered.
    pub async fn task_inspect(
        &self,
        cancel: &CancellationToken,
        conf: TaskConfig,
    ) -> Result<InspectPlan> {
        let driver = self.create_task(cancel, conf).await?;
        let plan = driver.inspect_task(cancel).await;
        driver.destroy_task(cancel).await;
        Ok(plan?)
    }

    /// Toggles `enabled` on an existing task. No other field can change.
    pub async fn task_update(
        &self,
        cancel: &CancellationToken,
        update: TaskConfig,
        run_option: RunOption,
    ) -> Result<InspectPlan> {
        let name = match update.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(OrchestratorError::InvalidArgument(
                    "task name is required for updating a task".to_string(),
                ))
            }
        };

        let driver = self
            .registry
            .get(&name)
            .ok_or_else(|| OrchestratorError::NotFound(name.clone()))?;

        let unsupported = update.changed_fields(&driver.task().to_config());
        if !unsupported.is_empty() {
            return Err(OrchestratorError::UnsupportedUpdate {
                task: name,
                fields: unsupported.join(", "),
            });
        }
        let Some(enabled) = update.enabled else {
            trace!(task_name = %name, "Nothing to update");
            return Ok(InspectPlan::default());
        };

        trace!(task_name = %name, enabled, run_option = ?run_option, "Updating task");
        let _active = self
            .registry
            .try_activate(&name)?
            .ok_or_else(|| OrchestratorError::TaskBusy(name.clone()))?;

        let mut event = (run_option == RunOption::Now).then(|| {
            let mut event = Event::for_task(&driver.task());
            event.start();
            event
        });

        let patch = PatchTask {
            run_option,
            enabled,
        };
        let result = driver.update_task(cancel, patch).await;

        if let Some(event) = event.as_mut() {
            match &result {
                Ok(_) => event.end_success(),
                Err(e) => event.end_failure(e.to_string()),
            }
        }
        if let Some(event) = event {
            self.store_event(event).await;
        }

        let plan = result.map_err(|e| {
            trace!(task_name = %name, error = %e, "Error while updating task");
            OrchestratorError::Driver(e)
        })?;

        if run_option != RunOption::Inspect {
            let mut conf = driver.task().to_config();
            conf.enabled = Some(enabled);
            self.store.set_task(conf).await?;
            self.publish(TaskEvent::TaskUpdated {
                task_name: name.clone(),
                enabled,
            });
            info!(task_name = %name, enabled, "Task updated");
        }

        Ok(plan)
    }

    /// Runs an existing task: render, and apply when the template is ready.
    ///
    /// | outcome                  | event recorded  | notification |
    /// |--------------------------|-----------------|--------------|
    /// | marked for deletion      | no              | no           |
    /// | disabled                 | no              | yes          |
    /// | render error             | failure         | no           |
    /// | not rendered, dynamic    | no              | no           |
    /// | not rendered, scheduled  | success (no-op) | no           |
    /// | applied                  | success         | yes          |
    /// | apply error              | failure         | no           |
    pub async fn task_run_now(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        if self.registry.is_marked_for_deletion(name) {
            trace!(task_name = %name, "Task is marked for deletion, skipping");
            return Ok(());
        }

        let driver = self
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        let scheduled = driver.task().is_scheduled();

        // Schedule fires never queue behind a running task.
        let _active = if scheduled {
            self.registry
                .try_activate(name)?
                .ok_or_else(|| OrchestratorError::TaskBusy(name.to_string()))?
        } else {
            self.wait_and_activate(cancel, name).await?
        };

        if self.registry.is_marked_for_deletion(name) {
            trace!(task_name = %name, "Task was marked for deletion while waiting, skipping");
            return Ok(());
        }

        // Enabled may have changed while waiting.
        let task = driver.task();
        if !task.is_enabled() {
            if scheduled {
                info!(task_name = %name, "Skipping disabled scheduled task");
            } else {
                trace!(task_name = %name, "Skipping disabled task");
            }
            self.notify_completion(name);
            return Ok(());
        }

        let mut event = Event::for_task(&task);
        event.start();

        let rendered = match driver.render_template(cancel).await {
            Ok(rendered) => rendered,
            Err(e) => {
                event.end_failure(e.to_string());
                self.finish_run(event).await;
                return Err(OrchestratorError::Render {
                    task: name.to_string(),
                    source: e,
                });
            }
        };

        if !rendered {
            if scheduled {
                info!(task_name = %name, "Scheduled task triggered but had no changes");
                event.end_success();
                self.finish_run(event).await;
            }
            return Ok(());
        }

        info!(task_name = %name, "Executing task");
        let description = format!("apply task {}", name);
        let driver_ref: &dyn Driver = driver.as_ref();
        let applied = self
            .retry
            .run(cancel, &description, move || driver_ref.apply_task(cancel))
            .await;

        match applied {
            Ok(()) => {
                event.end_success();
                self.finish_run(event).await;
                info!(task_name = %name, "Task completed");
                self.notify_completion(name);
                Ok(())
            }
            Err(RetryError::Canceled { .. }) => {
                event.end_failure("canceled while retrying apply");
                self.finish_run(event).await;
                Err(OrchestratorError::Canceled)
            }
            Err(RetryError::Exhausted {
                attempts, source, ..
            }) => {
                event.end_failure(source.to_string());
                self.finish_run(event).await;
                Err(OrchestratorError::ApplyFailed {
                    task: name.to_string(),
                    attempts,
                    source,
                })
            }
        }
    }

    /// Marks a task for deletion and queues it for the controller. Repeated
    /// calls while a deletion is pending are no-ops.
    pub fn task_delete(&self, name: &str) -> Result<()> {
        if self.registry.is_marked_for_deletion(name) {
            debug!(task_name = %name, "Task is already marked for deletion");
            return Ok(());
        }
        self.registry.mark_for_deletion(name);
        match self.delete_tx.try_send(name.to_string()) {
            Ok(()) => debug!(task_name = %name, "Task marked for deletion"),
            Err(e) => warn!(task_name = %name, error = %e, "Dropping delete request"),
        }
        Ok(())
    }

    /// Removes a task once it is inactive: stop its schedule, drop it from
    /// the registry, then delete its stored config and events.
    pub async fn delete_task(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let Some(driver) = self.registry.get(name) else {
            debug!(task_name = %name, "Task does not exist");
            return Ok(());
        };

        // Held until the entry is gone so no run can start in between.
        let _active = match self.wait_and_activate(cancel, name).await {
            Ok(guard) => guard,
            Err(OrchestratorError::NotFound(_)) => {
                debug!(task_name = %name, "Task was deleted concurrently");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if driver.task().is_scheduled() {
            let stop = self
                .schedule_stops
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            if let Some(stop) = stop {
                stop.token().cancel();
            }
        }

        if let Err(e) = self.registry.delete(name) {
            error!(task_name = %name, error = %e, "Unable to delete task");
            return Err(e);
        }

        self.store.delete_task(name).await?;
        self.store.delete_task_events(name).await?;

        self.publish(TaskEvent::TaskDeleted {
            task_name: name.to_string(),
        });
        debug!(task_name = %name, "Task deleted");
        Ok(())
    }

    /// Stop token for a scheduled task's timer, or `None` if one is already
    /// registered.
    pub(crate) fn register_schedule_stop(&self, name: &str) -> Option<ScheduleStop> {
        let mut stops = self
            .schedule_stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if stops.contains_key(name) {
            return None;
        }
        let stop = ScheduleStop::new(self.next_stop_id.fetch_add(1, Ordering::Relaxed));
        stops.insert(name.to_string(), stop.clone());
        Some(stop)
    }

    /// Forgets the stop token of a finished timer. A token registered later
    /// for a re-created task with the same name is left alone.
    pub(crate) fn release_schedule_stop(&self, name: &str, stop: &ScheduleStop) {
        let mut stops = self
            .schedule_stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if stops.get(name).is_some_and(|current| current.id() == stop.id()) {
            stops.remove(name);
            trace!(task_name = %name, "Released schedule stop");
        }
    }

    /// Stops every schedule timer and forgets their tokens.
    pub(crate) fn stop_schedules(&self) {
        let stops: Vec<_> = self
            .schedule_stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (name, stop) in stops {
            trace!(task_name = %name, "Stopping schedule");
            stop.token().cancel();
        }
    }

    pub(crate) fn has_schedule_stop(&self, name: &str) -> bool {
        self.schedule_stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    async fn create_task(
        &self,
        cancel: &CancellationToken,
        mut conf: TaskConfig,
    ) -> Result<Arc<dyn Driver>> {
        let config = self.store.config();
        conf.finalize(&config.global_buffer_period(), &config.working_dir());
        if let Err(e) = conf.validate() {
            trace!(error = %e, "Invalid config to create task");
            return Err(e.into());
        }

        let name = conf.name_or_empty().to_string();
        if self.registry.get(&name).is_some() {
            trace!(task_name = %name, "Task already exists");
            return Err(OrchestratorError::Validation(format!(
                "task with name {} already exists",
                name
            )));
        }

        let task = Task::from_config(&conf)?;
        let driver = self.factory.make(cancel, &config, task).await?;

        let start = Instant::now();
        let override_at = start + OVERRIDE_NOTIFIER_AFTER;
        let deadline = start + INITIALIZATION_TIMEOUT;
        let mut overridden = false;

        loop {
            let render = driver.render_template(cancel);
            tokio::pin!(render);

            let rendered = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(OrchestratorError::Canceled),
                    _ = sleep_until(deadline) => {
                        error!(task_name = %name, "Timed out rendering template");
                        driver.destroy_task(cancel).await;
                        debug!(task_name = %name, "Task destroyed");
                        return Err(OrchestratorError::InitializationTimeout(name));
                    }
                    _ = sleep_until(override_at), if !overridden => {
                        debug!(task_name = %name, "Rendering is stalled, overriding notifier");
                        driver.override_notifier();
                        overridden = true;
                    }
                    result = &mut render => break result,
                }
            };

            match rendered {
                Ok(true) => {
                    // Creation renders can schedule a spurious extra trigger.
                    driver.override_notifier();
                    return Ok(driver.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    error!(task_name = %name, error = %e, "Error rendering task template");
                    driver.destroy_task(cancel).await;
                    debug!(task_name = %name, "Task destroyed");
                    return Err(OrchestratorError::Render {
                        task: name,
                        source: e,
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Canceled),
                _ = sleep(RENDER_POLL_INTERVAL) => {}
            }
        }
    }

    /// Applies a freshly created task once. No retries: the task is not
    /// registered yet and the caller decides what to do with a failure.
    async fn run_new_task(&self, cancel: &CancellationToken, driver: &Arc<dyn Driver>) -> Result<()> {
        let task = driver.task();
        let name = task.name().to_string();
        if !task.is_enabled() {
            trace!(task_name = %name, "Skipping disabled task");
            return Ok(());
        }

        let mut event = Event::for_task(&task);
        event.start();

        if let Err(e) = driver.apply_task(cancel).await {
            error!(task_name = %name, error = %e, "Error applying task");
            return Err(OrchestratorError::ApplyFailed {
                task: name,
                attempts: 1,
                source: e,
            });
        }

        event.end_success();
        self.finish_run(event).await;
        self.notify_completion(&name);
        Ok(())
    }

    async fn add_task(&self, cancel: &CancellationToken, driver: Arc<dyn Driver>) -> Result<TaskConfig> {
        driver.set_buffer_period();

        let task = driver.task();
        let name = task.name().to_string();
        if let Err(e) = self.registry.add(&name, driver.clone()) {
            // Lost a creation race; the registered task stays untouched.
            warn!(task_name = %name, error = %e, "Unable to add task, destroying new driver");
            driver.destroy_task(cancel).await;
            return Err(e);
        }

        let conf = task.to_config();
        if let Err(e) = self.store.set_task(conf.clone()).await {
            error!(task_name = %name, error = %e, "Unable to store task, cleaning up");
            self.cleanup_task(&name);
            return Err(e.into());
        }

        if task.is_scheduled() {
            if let Err(e) = self.created_schedule_tx.try_send(name.clone()) {
                warn!(task_name = %name, error = %e, "Dropping new scheduled task notification");
            }
        }

        self.publish(TaskEvent::TaskCreated {
            task_name: name.clone(),
            scheduled: task.is_scheduled(),
        });
        info!(task_name = %name, kind = task.kind().as_str(), "Task created");
        Ok(conf)
    }

    fn cleanup_task(&self, name: &str) {
        if let Err(e) = self.task_delete(name) {
            error!(task_name = %name, error = %e, "Unable to clean up task after error");
        }
    }

    async fn wait_and_activate(&self, cancel: &CancellationToken, name: &str) -> Result<ActiveGuard> {
        let mut logged = false;
        loop {
            if let Some(guard) = self.registry.try_activate(name)? {
                return Ok(guard);
            }
            if !logged {
                debug!(task_name = %name, "Waiting for task to become inactive");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Canceled),
                _ = sleep(INACTIVE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Stores a closed event and publishes the run outcome.
    async fn finish_run(&self, event: Event) {
        self.publish(TaskEvent::TaskRunCompleted {
            task_name: event.task_name.clone(),
            success: event.success,
            error: event.error.as_ref().map(|e| e.message.clone()),
        });
        self.store_event(event).await;
    }

    async fn store_event(&self, event: Event) {
        trace!(task_name = %event.task_name, event_id = %event.id, success = event.success, "Adding event");
        let id = event.id;
        let task_name = event.task_name.clone();
        if let Err(e) = self.store.add_task_event(event).await {
            error!(task_name = %task_name, event_id = %id, error = %e, "Error storing event");
        }
    }

    fn notify_completion(&self, name: &str) {
        let notify = self
            .task_notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = notify {
            if let Err(e) = tx.try_send(name.to_string()) {
                warn!(task_name = %name, error = %e, "Dropping task completion notification");
            }
        }
    }

    fn publish(&self, event: TaskEvent) {
        let receivers = self.event_bus.publish(event);
        trace!(receivers, "Published task event");
    }
}
