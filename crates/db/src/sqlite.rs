use async_trait::async_trait;
use sqlx::SqlitePool;
use syncd_core::{Config, Event, TaskConfig};
use tracing::{debug, info};

use crate::error::Result;
use crate::pool::{create_pool, run_migrations};
use crate::repositories::{EventRepository, TaskConfigRepository};
use crate::store::Store;

/// [`Store`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    config: Config,
    tasks: TaskConfigRepository,
    events: EventRepository,
    history: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let history = config.event_history();
        Self {
            config,
            tasks: TaskConfigRepository::new(pool.clone()),
            events: EventRepository::new(pool),
            history,
        }
    }

    /// Connects to `config.database_url`, applies migrations and stores the
    /// tasks listed in the config.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = create_pool(config.database_url()).await?;
        run_migrations(&pool).await?;
        info!(database_url = %config.database_url(), "Opened task store");

        let store = Self::new(pool, config);
        store.seed().await?;
        Ok(store)
    }

    async fn seed(&self) -> Result<()> {
        for conf in &self.config.tasks {
            debug!(task_name = %conf.name_or_empty(), "Seeding task config");
            self.tasks.upsert(conf).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn config(&self) -> Config {
        self.config.clone()
    }

    async fn get_task(&self, name: &str) -> Result<Option<TaskConfig>> {
        self.tasks.find_by_name(name).await
    }

    async fn get_all_tasks(&self) -> Result<Vec<TaskConfig>> {
        self.tasks.find_all().await
    }

    async fn set_task(&self, conf: TaskConfig) -> Result<()> {
        self.tasks.upsert(&conf).await
    }

    async fn delete_task(&self, name: &str) -> Result<()> {
        self.tasks.delete(name).await?;
        Ok(())
    }

    async fn add_task_event(&self, event: Event) -> Result<()> {
        self.events.insert_bounded(&event, self.history).await
    }

    async fn get_task_events(&self, name: &str) -> Result<Vec<Event>> {
        self.events.find_by_task(name).await
    }

    async fn delete_task_events(&self, name: &str) -> Result<()> {
        let removed = self.events.delete_by_task(name).await?;
        debug!(task_name = %name, removed, "Deleted task events");
        Ok(())
    }
}
