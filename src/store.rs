//! Task persistence.
//!
//! The lifecycle manager reads and writes tasks only through `TaskStore`. `InMemoryTaskStore`
//! backs the CLI and the tests; a database-backed store implements the same trait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ExecError, Result};
use crate::task::{Task, TaskId};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new task under `app_id`, assigning an id if it has none.
    async fn insert(&self, app_id: &str, task: Task) -> Result<Task>;

    async fn update(&self, task: &Task) -> Result<()>;

    async fn get(&self, id: TaskId) -> Result<Task>;

    /// Tasks with the given ids, in the order given. Unknown ids are skipped.
    async fn list(&self, ids: &[TaskId]) -> Result<Vec<Task>>;

    /// Tasks of `app_id` that are queued, running or suspended.
    async fn list_executing(&self, app_id: &str) -> Result<Vec<Task>>;

    async fn list_all(&self, app_id: &str) -> Result<Vec<Task>>;
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, (String, Task)>>,
    next_id: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, app_id: &str, mut task: Task) -> Result<Task> {
        let id = match task.id {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                task.id = Some(id);
                id
            }
        };
        self.tasks
            .write()
            .await
            .insert(id, (app_id.to_string(), task.clone()));
        Ok(task)
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let id = task
            .id
            .ok_or_else(|| ExecError::InvalidState(format!("task '{}' was never stored", task.name)))?;
        match self.tasks.write().await.get_mut(&id) {
            Some((_, stored)) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(ExecError::TaskNotFound(id)),
        }
    }

    async fn get(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .map(|(_, task)| task.clone())
            .ok_or(ExecError::TaskNotFound(id))
    }

    async fn list(&self, ids: &[TaskId]) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tasks.get(id).map(|(_, task)| task.clone()))
            .collect())
    }

    async fn list_executing(&self, app_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|(app, task)| app == app_id && task.status.is_executing())
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn list_all(&self, app_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|(app, _)| app == app_id)
            .map(|(_, task)| task.clone())
            .collect())
    }
}
