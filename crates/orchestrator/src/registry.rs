//! Concurrency-safe map of task name to driver.
//!
//! Each entry carries two flags readable without any run's cooperation:
//! `active` while a run or update is in flight, and `marked_for_deletion`,
//! which is one-way. Templates are indexed back to the owning task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::driver::Driver;
use crate::error::{OrchestratorError, Result};

struct Entry {
    driver: Arc<dyn Driver>,
    template_ids: Vec<String>,
    active: AtomicBool,
    marked_for_deletion: AtomicBool,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Arc<Entry>>,
    templates: HashMap<String, String>,
}

#[derive(Default)]
pub struct TaskRegistry {
    inner: RwLock<Inner>,
}

/// Clears the `active` flag of the entry it was taken from when dropped.
///
/// The guard is tied to the entry, not the name, so a task deleted and
/// re-created under the same name is never reset by a stale guard.
pub struct ActiveGuard {
    entry: Arc<Entry>,
    name: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.entry.active.store(false, Ordering::SeqCst);
        debug!(task_name = %self.name, "Task set inactive");
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.read().tasks.get(name).cloned()
    }

    pub fn add(&self, name: &str, driver: Arc<dyn Driver>) -> Result<()> {
        let mut inner = self.write();
        if inner.tasks.contains_key(name) {
            return Err(OrchestratorError::AlreadyExists(name.to_string()));
        }

        let template_ids = driver.template_ids();
        for id in &template_ids {
            inner.templates.insert(id.clone(), name.to_string());
        }
        inner.tasks.insert(
            name.to_string(),
            Arc::new(Entry {
                driver,
                template_ids,
                active: AtomicBool::new(false),
                marked_for_deletion: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.entry(name).map(|e| e.driver.clone())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.write();
        let entry = inner
            .tasks
            .remove(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        for id in &entry.template_ids {
            if inner.templates.get(id).map(String::as_str) == Some(name) {
                inner.templates.remove(id);
            }
        }
        Ok(())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Atomically marks the task active. Returns `Ok(None)` when another
    /// caller already holds it.
    pub fn try_activate(&self, name: &str) -> Result<Option<ActiveGuard>> {
        let entry = self
            .entry(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        if entry
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        debug!(task_name = %name, "Task set active");
        Ok(Some(ActiveGuard {
            entry,
            name: name.to_string(),
        }))
    }

    pub fn is_marked_for_deletion(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.marked_for_deletion.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// No-op for unknown names.
    pub fn mark_for_deletion(&self, name: &str) {
        if let Some(e) = self.entry(name) {
            e.marked_for_deletion.store(true, Ordering::SeqCst);
        }
    }

    pub fn get_by_template_id(&self, template_id: &str) -> Option<Arc<dyn Driver>> {
        let inner = self.read();
        let name = inner.templates.get(template_id)?;
        inner.tasks.get(name).map(|e| e.driver.clone())
    }

    pub fn reset(&self) {
        let mut inner = self.write();
        inner.tasks.clear();
        inner.templates.clear();
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn scheduled_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .read()
            .tasks
            .iter()
            .filter(|(_, e)| e.driver.task().is_scheduled())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
