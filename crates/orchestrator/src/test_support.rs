//! Hand-written doubles for the driver, factory and watcher contracts.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db::InMemoryStore;
use syncd_core::{BufferPeriodConfig, Config, ConditionConfig, RetryConfig, Task, TaskConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::driver::{Driver, DriverFactory, InspectPlan, PatchTask, RunOption};
use crate::error::{DriverError, WatcherError};
use crate::retry::Retry;
use crate::tasks_manager::TasksManager;
use crate::watcher::Watcher;

pub(crate) fn dynamic_conf(name: &str) -> TaskConfig {
    TaskConfig::named(name)
        .with_module("org/module")
        .with_services(["api"])
}

pub(crate) fn scheduled_conf(name: &str, cron: &str) -> TaskConfig {
    TaskConfig::named(name)
        .with_module("org/module")
        .with_condition(ConditionConfig::Schedule {
            cron: cron.to_string(),
        })
}

fn finalized(mut conf: TaskConfig) -> TaskConfig {
    conf.finalize(
        &BufferPeriodConfig::new(Duration::from_secs(5), Duration::from_secs(20)),
        Path::new("sync-tasks"),
    );
    conf
}

pub(crate) fn dynamic_task(name: &str) -> Task {
    Task::from_config(&finalized(dynamic_conf(name))).unwrap()
}

pub(crate) fn scheduled_task(name: &str) -> Task {
    Task::from_config(&finalized(scheduled_conf(name, "0 0 * * * *"))).unwrap()
}

pub(crate) fn test_config(tasks: Vec<TaskConfig>) -> Config {
    Config {
        retry: RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        },
        tasks,
        ..Default::default()
    }
}

pub(crate) fn manager_with(
    factory: Arc<FakeFactory>,
    tasks: Vec<TaskConfig>,
) -> (Arc<TasksManager>, Arc<InMemoryStore>) {
    let config = test_config(tasks);
    let retry = Retry::new(config.retry, Some(7));
    let store = Arc::new(InMemoryStore::new(config));
    let manager = TasksManager::new(store.clone(), factory).with_retry(retry);
    (Arc::new(manager), store)
}

type RenderHook = Box<dyn FnMut(usize) + Send>;

pub(crate) struct FakeDriver {
    task: Mutex<Task>,
    template_ids: Vec<String>,
    renders: Mutex<VecDeque<Result<bool, DriverError>>>,
    default_render: bool,
    applies: Mutex<VecDeque<Result<(), DriverError>>>,
    render_delay: Duration,
    plan: InspectPlan,
    on_render: Mutex<Option<RenderHook>>,
    patches: Mutex<Vec<PatchTask>>,
    render_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    inspect_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    override_calls: AtomicUsize,
    buffer_period_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeDriver {
    pub(crate) fn new(task: Task) -> Self {
        Self {
            task: Mutex::new(task),
            template_ids: Vec::new(),
            renders: Mutex::new(VecDeque::new()),
            default_render: true,
            applies: Mutex::new(VecDeque::new()),
            render_delay: Duration::ZERO,
            plan: InspectPlan {
                changes_present: true,
                plan: "1 to add".to_string(),
                url: String::new(),
            },
            on_render: Mutex::new(None),
            patches: Mutex::new(Vec::new()),
            render_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
            inspect_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            override_calls: AtomicUsize::new(0),
            buffer_period_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_template_ids(mut self, ids: &[&str]) -> Self {
        self.template_ids = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Scripted render results, consumed in order before falling back to
    /// the default.
    pub(crate) fn with_renders(self, renders: Vec<Result<bool, DriverError>>) -> Self {
        *self.renders.lock().unwrap() = renders.into();
        self
    }

    pub(crate) fn with_default_render(mut self, rendered: bool) -> Self {
        self.default_render = rendered;
        self
    }

    pub(crate) fn with_applies(self, applies: Vec<Result<(), DriverError>>) -> Self {
        *self.applies.lock().unwrap() = applies.into();
        self
    }

    pub(crate) fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    /// Called with the 1-based render count at the start of every render.
    pub(crate) fn with_on_render(self, hook: impl FnMut(usize) + Send + 'static) -> Self {
        *self.on_render.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub(crate) fn with_enabled(self, enabled: bool) -> Self {
        self.task.lock().unwrap().set_enabled(enabled);
        self
    }

    pub(crate) fn into_dyn(self) -> Arc<dyn Driver> {
        Arc::new(self)
    }

    pub(crate) fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn override_calls(&self) -> usize {
        self.override_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn buffer_period_calls(&self) -> usize {
        self.buffer_period_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn patches(&self) -> Vec<PatchTask> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn task(&self) -> Task {
        self.task.lock().unwrap().clone()
    }

    fn template_ids(&self) -> Vec<String> {
        self.template_ids.clone()
    }

    fn override_notifier(&self) {
        self.override_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn set_buffer_period(&self) {
        self.buffer_period_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn render_template(&self, cancel: &CancellationToken) -> Result<bool, DriverError> {
        let call = self.render_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.on_render.lock().unwrap().as_mut() {
            hook(call);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let canceled = if self.render_delay.is_zero() {
            false
        } else {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.render_delay) => false,
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if canceled {
            return Err(DriverError::Canceled);
        }
        self.renders
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.default_render))
    }

    async fn apply_task(&self, _cancel: &CancellationToken) -> Result<(), DriverError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applies.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn inspect_task(&self, _cancel: &CancellationToken) -> Result<InspectPlan, DriverError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan.clone())
    }

    async fn update_task(
        &self,
        _cancel: &CancellationToken,
        patch: PatchTask,
    ) -> Result<InspectPlan, DriverError> {
        self.patches.lock().unwrap().push(patch);
        if patch.run_option != RunOption::Inspect {
            self.task.lock().unwrap().set_enabled(patch.enabled);
        }
        Ok(self.plan.clone())
    }

    async fn destroy_task(&self, _cancel: &CancellationToken) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
    }
}

type BuildFn = Box<dyn Fn(Task) -> FakeDriver + Send + Sync>;

/// Builds a [`FakeDriver`] per task and keeps every driver it made.
pub(crate) struct FakeFactory {
    build: BuildFn,
    made: Mutex<Vec<Arc<FakeDriver>>>,
}

impl FakeFactory {
    pub(crate) fn new(build: impl Fn(Task) -> FakeDriver + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            made: Mutex::new(Vec::new()),
        }
    }

    /// Every driver renders `true` on the first call.
    pub(crate) fn rendering() -> Self {
        Self::new(|task| {
            let id = format!("tmpl-{}", task.name());
            FakeDriver::new(task).with_template_ids(&[id.as_str()])
        })
    }

    /// Most recent driver made for `name`.
    pub(crate) fn driver(&self, name: &str) -> Option<Arc<FakeDriver>> {
        self.made
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|d| d.task().name() == name)
            .cloned()
    }

    pub(crate) fn made_count(&self) -> usize {
        self.made.lock().unwrap().len()
    }
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn make(
        &self,
        _cancel: &CancellationToken,
        _config: &Config,
        task: Task,
    ) -> Result<Arc<dyn Driver>, DriverError> {
        let driver = Arc::new((self.build)(task));
        self.made.lock().unwrap().push(driver.clone());
        Ok(driver)
    }
}

/// Forwards template ids sent on the paired sender to the controller.
pub(crate) struct FakeWatcher {
    triggers: Mutex<Option<mpsc::Receiver<String>>>,
    wait_error: Option<WatcherError>,
    watch_error: Option<WatcherError>,
    size: usize,
}

impl FakeWatcher {
    pub(crate) fn new() -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(16);
        let watcher = Self {
            triggers: Mutex::new(Some(rx)),
            wait_error: None,
            watch_error: None,
            size: 1,
        };
        (watcher, tx)
    }

    pub(crate) fn with_wait_error(mut self, err: WatcherError) -> Self {
        self.wait_error = Some(err);
        self
    }

    pub(crate) fn with_watch_error(mut self, err: WatcherError) -> Self {
        self.watch_error = Some(err);
        self
    }
}

#[async_trait]
impl Watcher for FakeWatcher {
    async fn watch(
        &self,
        cancel: CancellationToken,
        notify: mpsc::Sender<String>,
    ) -> Result<(), WatcherError> {
        if let Some(err) = self.watch_error.clone() {
            return Err(err);
        }
        let triggers = self.triggers.lock().unwrap().take();
        let Some(mut triggers) = triggers else {
            cancel.cancelled().await;
            return Ok(());
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                id = triggers.recv() => match id {
                    Some(id) => {
                        if notify.send(id).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        cancel.cancelled().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), WatcherError> {
        if let Some(err) = self.wait_error.clone() {
            return Err(err);
        }
        cancel.cancelled().await;
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }
}
