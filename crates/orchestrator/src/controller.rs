//! Drive loops: a bounded pass that creates and runs every configured task,
//! and the long-lived loop that reacts to dependency changes, schedules and
//! deletions.

use std::sync::Arc;

use futures::future::join_all;
use syncd_core::{OnceMode, TaskConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::error::{OrchestratorError, Result, WatcherError};
use crate::schedule::run_schedule;
use crate::tasks_manager::TasksManager;
use crate::watcher::Watcher;

const WATCH_CHANNEL_CAPACITY: usize = 64;

pub struct Controller {
    tasks: Arc<TasksManager>,
    watcher: Arc<dyn Watcher>,
    once_mode: OnceMode,
}

impl Controller {
    pub fn new(tasks: Arc<TasksManager>, watcher: Arc<dyn Watcher>) -> Self {
        let once_mode = tasks.config().once_mode;
        Self {
            tasks,
            watcher,
            once_mode,
        }
    }

    pub fn with_once_mode(mut self, once_mode: OnceMode) -> Self {
        self.once_mode = once_mode;
        self
    }

    pub fn tasks(&self) -> &Arc<TasksManager> {
        &self.tasks
    }

    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        self.tasks.init(cancel).await
    }

    /// Creates and runs every stored task once. A watcher failure while the
    /// pass is in progress aborts it with that error.
    pub async fn once(&self, cancel: &CancellationToken) -> Result<()> {
        let confs = self.tasks.tasks().await?;
        info!(tasks = confs.len(), mode = ?self.once_mode, "Running all tasks once");

        let pass = async {
            match self.once_mode {
                OnceMode::Consecutive => self.once_consecutive(cancel, confs).await,
                OnceMode::Concurrent => self.once_concurrent(cancel, confs).await,
            }
        };
        tokio::pin!(pass);

        let wait = self.watcher.wait(cancel);
        tokio::pin!(wait);
        let mut watching = self.watcher.size() > 0;

        loop {
            tokio::select! {
                result = &mut pass => {
                    match &result {
                        Ok(()) => info!("All tasks completed once"),
                        Err(e) => error!(error = %e, "Error running tasks once"),
                    }
                    return result;
                }
                waited = &mut wait, if watching => {
                    watching = false;
                    match waited {
                        Ok(()) => trace!("Watcher has nothing left to wait on"),
                        Err(e) if cancel.is_cancelled() => {
                            debug!(error = %e, "Watcher stopped during shutdown");
                        }
                        Err(e) => {
                            error!(error = %e, "Watcher failed while running tasks once");
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    async fn once_consecutive(&self, cancel: &CancellationToken, confs: Vec<TaskConfig>) -> Result<()> {
        for conf in confs {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Canceled);
            }
            let name = conf.name_or_empty().to_string();
            match self.tasks.task_create_and_run(cancel, conf).await {
                Ok(_) => trace!(task_name = %name, "Task ran once"),
                Err(OrchestratorError::Canceled) => return Err(OrchestratorError::Canceled),
                Err(e) => return Err(OrchestratorError::task_failed(name, e)),
            }
        }
        Ok(())
    }

    async fn once_concurrent(&self, cancel: &CancellationToken, confs: Vec<TaskConfig>) -> Result<()> {
        let runs = confs.into_iter().map(|conf| async move {
            let name = conf.name_or_empty().to_string();
            let result = self.tasks.task_create_and_run(cancel, conf).await;
            (name, result)
        });

        let failures: Vec<_> = join_all(runs)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        if failures.iter().all(|(_, e)| e.is_canceled()) {
            return Err(OrchestratorError::Canceled);
        }
        Err(OrchestratorError::OnceFailed(failures))
    }

    /// Watches dependencies and runs tasks until `cancel` fires or the
    /// watcher fails. Spawned work is drained before returning.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let run_cancel = cancel.child_token();
        let tracker = TaskTracker::new();

        let (notify_tx, mut notify_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut watch = {
            let watcher = self.watcher.clone();
            let token = run_cancel.clone();
            tokio::spawn(async move { watcher.watch(token, notify_tx).await })
        };
        let mut watching = true;

        for name in self.tasks.registry().scheduled_names() {
            self.start_schedule(&tracker, &run_cancel, name);
        }

        let mut created = self.tasks.created_schedule_receiver().await;
        let mut deletes = self.tasks.delete_receiver().await;
        info!(tasks = self.tasks.registry().len(), "Controller running");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping controller");
                    break Err(OrchestratorError::Canceled);
                }
                Some(template_id) = notify_rx.recv() => {
                    self.handle_trigger(&tracker, &run_cancel, &template_id);
                }
                Some(name) = created.recv() => {
                    self.start_schedule(&tracker, &run_cancel, name);
                }
                Some(name) = deletes.recv() => {
                    let tasks = self.tasks.clone();
                    let token = run_cancel.clone();
                    tracker.spawn(async move {
                        if let Err(e) = tasks.delete_task(&token, &name).await {
                            error!(task_name = %name, error = %e, "Error deleting task");
                        }
                    });
                }
                joined = &mut watch, if watching => {
                    watching = false;
                    match joined {
                        Ok(Ok(())) => debug!("Watcher stopped"),
                        Ok(Err(e)) => {
                            error!(error = %e, "Watcher failed");
                            break Err(e.into());
                        }
                        Err(e) => {
                            error!(error = %e, "Watcher task panicked");
                            break Err(WatcherError::Failed(e.to_string()).into());
                        }
                    }
                }
            }
        };

        run_cancel.cancel();
        self.tasks.stop_schedules();
        tracker.close();
        tracker.wait().await;
        if watching {
            if let Err(e) = watch.await {
                warn!(error = %e, "Watcher task did not stop cleanly");
            }
        }
        debug!("Controller stopped");
        result
    }

    fn handle_trigger(&self, tracker: &TaskTracker, cancel: &CancellationToken, template_id: &str) {
        let Some(name) = self.tasks.task_by_template(template_id) else {
            trace!(template_id, "No task for triggered template");
            return;
        };

        trace!(task_name = %name, template_id, "Template triggered");
        let tasks = self.tasks.clone();
        let token = cancel.clone();
        tracker.spawn(async move {
            match tasks.task_run_now(&token, &name).await {
                Ok(()) => {}
                Err(OrchestratorError::Canceled) => debug!(task_name = %name, "Task run canceled"),
                Err(e) => error!(task_name = %name, error = %e, "Error running task"),
            }
        });
    }

    fn start_schedule(&self, tracker: &TaskTracker, cancel: &CancellationToken, name: String) {
        let Some(stop) = self.tasks.register_schedule_stop(&name) else {
            trace!(task_name = %name, "Schedule already running");
            return;
        };

        let tasks = self.tasks.clone();
        let token = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = run_schedule(tasks, name.clone(), stop, token).await {
                error!(task_name = %name, error = %e, "Schedule stopped with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use crate::test_support::{dynamic_conf, manager_with, scheduled_conf, FakeDriver, FakeFactory, FakeWatcher};
    use std::time::Duration;
    use tokio::time::timeout;

    fn five_tasks() -> Vec<TaskConfig> {
        (1..=5).map(|i| dynamic_conf(&format!("task_0{}", i))).collect()
    }

    fn controller(factory: Arc<FakeFactory>, confs: Vec<TaskConfig>, watcher: FakeWatcher) -> Arc<Controller> {
        let (manager, _store) = manager_with(factory, confs);
        Arc::new(Controller::new(manager, Arc::new(watcher)))
    }

    fn failing_apply_for(names: &'static [&'static str]) -> FakeFactory {
        FakeFactory::new(move |task| {
            let id = format!("tmpl-{}", task.name());
            let fails = names.contains(&task.name());
            let driver = FakeDriver::new(task).with_template_ids(&[id.as_str()]);
            if fails {
                driver.with_applies(vec![Err(DriverError::backend("apply failed"))])
            } else {
                driver
            }
        })
    }

    async fn next_notification(rx: &mut mpsc::Receiver<String>) -> String {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for task notification")
            .expect("notification channel closed")
    }

    #[tokio::test]
    async fn test_once_consecutive_creates_every_task() {
        let factory = Arc::new(FakeFactory::rendering());
        let (watcher, _tx) = FakeWatcher::new();
        let ctrl = controller(factory.clone(), five_tasks(), watcher);

        ctrl.once(&CancellationToken::new()).await.unwrap();

        assert_eq!(ctrl.tasks().registry().len(), 5);
        assert_eq!(factory.made_count(), 5);
        for i in 1..=5 {
            let driver = factory.driver(&format!("task_0{}", i)).unwrap();
            assert_eq!(driver.apply_calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_once_consecutive_stops_at_first_failure() {
        let factory = Arc::new(failing_apply_for(&["task_03"]));
        let (watcher, _tx) = FakeWatcher::new();
        let ctrl = controller(factory.clone(), five_tasks(), watcher);

        let err = ctrl.once(&CancellationToken::new()).await.unwrap_err();

        match err {
            OrchestratorError::TaskFailed { task, source } => {
                assert_eq!(task, "task_03");
                assert!(matches!(*source, OrchestratorError::ApplyFailed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(factory.made_count(), 3);
        assert!(factory.driver("task_04").is_none());
        assert_eq!(ctrl.tasks().registry().names(), vec!["task_01", "task_02"]);
    }

    #[tokio::test]
    async fn test_once_cancel_mid_pass() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let factory = Arc::new(FakeFactory::new(move |task| {
            if task.name() == "task_02" {
                let canceller = canceller.clone();
                FakeDriver::new(task)
                    .with_default_render(false)
                    .with_on_render(move |_| canceller.cancel())
            } else {
                FakeDriver::new(task)
            }
        }));
        let (watcher, _tx) = FakeWatcher::new();
        let ctrl = controller(factory.clone(), five_tasks(), watcher);

        let err = ctrl.once(&cancel).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(ctrl.tasks().registry().names(), vec!["task_01"]);
        assert!(factory.driver("task_03").is_none());
    }

    #[tokio::test]
    async fn test_once_aborts_on_watcher_error() {
        let factory = Arc::new(FakeFactory::new(|task| {
            FakeDriver::new(task).with_render_delay(Duration::from_millis(50))
        }));
        let (watcher, _tx) = FakeWatcher::new();
        let watcher = watcher.with_wait_error(WatcherError::Failed("lost connection".to_string()));
        let ctrl = controller(factory, five_tasks(), watcher);

        let err = ctrl.once(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Watcher(WatcherError::Failed(msg)) if msg == "lost connection"));
        assert!(ctrl.tasks().registry().len() < 5);
    }

    #[tokio::test]
    async fn test_once_concurrent_collects_failures() {
        let factory = Arc::new(failing_apply_for(&["task_02", "task_04"]));
        let (watcher, _tx) = FakeWatcher::new();
        let (manager, _store) = manager_with(factory.clone(), five_tasks());
        let ctrl = Controller::new(manager, Arc::new(watcher)).with_once_mode(OnceMode::Concurrent);

        let err = ctrl.once(&CancellationToken::new()).await.unwrap_err();

        match err {
            OrchestratorError::OnceFailed(failures) => {
                let mut names: Vec<_> = failures.iter().map(|(name, _)| name.as_str()).collect();
                names.sort();
                assert_eq!(names, vec!["task_02", "task_04"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(factory.made_count(), 5);
        assert_eq!(ctrl.tasks().registry().names(), vec!["task_01", "task_03", "task_05"]);
    }

    #[tokio::test]
    async fn test_once_then_run_handles_triggers() {
        let factory = Arc::new(FakeFactory::rendering());
        let (watcher, triggers) = FakeWatcher::new();
        let ctrl = controller(factory.clone(), five_tasks(), watcher);
        let cancel = CancellationToken::new();

        ctrl.once(&cancel).await.unwrap();
        let mut notify = ctrl.tasks().enable_test_mode().await.unwrap();
        let runner = {
            let ctrl = ctrl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ctrl.run(&cancel).await })
        };

        triggers.send("unknown-template".to_string()).await.unwrap();
        for i in 1..=5 {
            let name = format!("task_0{}", i);
            triggers.send(format!("tmpl-{}", name)).await.unwrap();
            assert_eq!(next_notification(&mut notify).await, name);
        }

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
        assert!(matches!(result, Err(OrchestratorError::Canceled)));
        for i in 1..=5 {
            let driver = factory.driver(&format!("task_0{}", i)).unwrap();
            assert_eq!(driver.apply_calls(), 2);
        }
    }

    #[tokio::test]
    async fn test_run_ends_on_watch_error() {
        let (watcher, _tx) = FakeWatcher::new();
        let watcher = watcher.with_watch_error(WatcherError::Failed("boom".to_string()));
        let ctrl = controller(Arc::new(FakeFactory::rendering()), Vec::new(), watcher);

        let result = timeout(Duration::from_secs(5), ctrl.run(&CancellationToken::new()))
            .await
            .unwrap();

        assert!(matches!(result, Err(OrchestratorError::Watcher(_))));
    }

    #[tokio::test]
    async fn test_run_processes_deletes_and_new_schedules() {
        let factory = Arc::new(FakeFactory::rendering());
        let (watcher, _tx) = FakeWatcher::new();
        let ctrl = controller(factory, vec![dynamic_conf("web")], watcher);
        let cancel = CancellationToken::new();
        ctrl.once(&cancel).await.unwrap();

        let runner = {
            let ctrl = ctrl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ctrl.run(&cancel).await })
        };

        ctrl.tasks()
            .task_create(&cancel, scheduled_conf("nightly", "0 0 3 * * *"))
            .await
            .unwrap();
        ctrl.tasks().task_delete("web").unwrap();

        timeout(Duration::from_secs(5), async {
            while ctrl.tasks().registry().get("web").is_some()
                || !ctrl.tasks().has_schedule_stop("nightly")
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap_err();
        assert!(!ctrl.tasks().has_schedule_stop("nightly"));
        assert!(ctrl.tasks().registry().get("nightly").is_some());
    }

    #[tokio::test]
    async fn test_recreated_scheduled_task_gets_a_timer() {
        let (watcher, _tx) = FakeWatcher::new();
        let ctrl = controller(Arc::new(FakeFactory::rendering()), Vec::new(), watcher);
        let cancel = CancellationToken::new();
        ctrl.once(&cancel).await.unwrap();

        // Announced, then deleted before the run loop picks the announcement up.
        ctrl.tasks()
            .task_create(&cancel, scheduled_conf("tick", "* * * * * *"))
            .await
            .unwrap();
        ctrl.tasks().delete_task(&cancel, "tick").await.unwrap();
        let mut notify = ctrl.tasks().enable_test_mode().await.unwrap();

        let runner = {
            let ctrl = ctrl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ctrl.run(&cancel).await })
        };
        ctrl.tasks()
            .task_create(&cancel, scheduled_conf("tick", "* * * * * *"))
            .await
            .unwrap();

        let fired = timeout(Duration::from_secs(3), notify.recv()).await.unwrap();
        assert_eq!(fired.as_deref(), Some("tick"));
        assert!(ctrl.tasks().has_schedule_stop("tick"));

        cancel.cancel();
        timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap_err();
    }
}
