use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use syncd_core::{Config, Event, TaskConfig};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::Store;

/// Process-local store, seeded from the task list of a [`Config`].
pub struct InMemoryStore {
    config: Config,
    tasks: RwLock<Vec<TaskConfig>>,
    events: RwLock<HashMap<String, VecDeque<Event>>>,
    history: usize,
}

impl InMemoryStore {
    pub fn new(config: Config) -> Self {
        let tasks = config.tasks.clone();
        let history = config.event_history();
        Self {
            config,
            tasks: RwLock::new(tasks),
            events: RwLock::new(HashMap::new()),
            history,
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn config(&self) -> Config {
        self.config.clone()
    }

    async fn get_task(&self, name: &str) -> Result<Option<TaskConfig>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .iter()
            .find(|t| t.name.as_deref() == Some(name))
            .cloned())
    }

    async fn get_all_tasks(&self) -> Result<Vec<TaskConfig>> {
        Ok(self.tasks.read().await.clone())
    }

    async fn set_task(&self, conf: TaskConfig) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.name == conf.name) {
            Some(existing) => *existing = conf,
            None => tasks.push(conf),
        }
        Ok(())
    }

    async fn delete_task(&self, name: &str) -> Result<()> {
        self.tasks
            .write()
            .await
            .retain(|t| t.name.as_deref() != Some(name));
        Ok(())
    }

    async fn add_task_event(&self, event: Event) -> Result<()> {
        let mut events = self.events.write().await;
        let history = events.entry(event.task_name.clone()).or_default();
        history.push_front(event);
        history.truncate(self.history);
        Ok(())
    }

    async fn get_task_events(&self, name: &str) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        Ok(events
            .get(name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_task_events(&self, name: &str) -> Result<()> {
        self.events.write().await.remove(name);
        Ok(())
    }
}
