//! Execution listeners.
//!
//! Listeners are grouped by callback protocol. For a given task only the first registered
//! listener of each protocol that supports it is notified.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::task::Task;

#[async_trait]
pub trait ExecutionListener: Send + Sync {
    /// Callback protocol this listener delivers, e.g. `log` or `http`.
    fn protocol(&self) -> &str;

    fn supports(&self, _task: &Task) -> bool {
        true
    }

    async fn on_started(&self, task: &Task);

    async fn on_updated(&self, task: &Task);

    async fn on_completed(&self, task: &Task);

    async fn on_error(&self, task: &Task, message: &str, exit_code: Option<i32>);
}

#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// One listener per protocol, in registration order.
    pub fn handlers_for(&self, task: &Task) -> Vec<Arc<dyn ExecutionListener>> {
        let mut seen = HashSet::new();
        self.listeners
            .iter()
            .filter(|l| l.supports(task) && seen.insert(l.protocol().to_string()))
            .cloned()
            .collect()
    }

    pub async fn started(&self, task: &Task) {
        for listener in self.handlers_for(task) {
            listener.on_started(task).await;
        }
    }

    pub async fn updated(&self, task: &Task) {
        for listener in self.handlers_for(task) {
            listener.on_updated(task).await;
        }
    }

    pub async fn completed(&self, task: &Task) {
        for listener in self.handlers_for(task) {
            listener.on_completed(task).await;
        }
    }

    pub async fn error(&self, task: &Task, message: &str, exit_code: Option<i32>) {
        for listener in self.handlers_for(task) {
            listener.on_error(task, message, exit_code).await;
        }
    }
}

/// Reports every notification as a log event.
#[derive(Debug, Default)]
pub struct LoggingListener;

#[async_trait]
impl ExecutionListener for LoggingListener {
    fn protocol(&self) -> &str {
        "log"
    }

    async fn on_started(&self, task: &Task) {
        tracing::info!(
            task_id = %task.display_id(),
            host = task.execution_node_host_name.as_deref().unwrap_or("-"),
            state = %task.status,
            "Task started"
        );
    }

    async fn on_updated(&self, task: &Task) {
        tracing::info!(task_id = %task.display_id(), state = %task.status, "Task updated");
    }

    async fn on_completed(&self, task: &Task) {
        tracing::info!(task_id = %task.display_id(), state = %task.status, "Task completed");
    }

    async fn on_error(&self, task: &Task, message: &str, exit_code: Option<i32>) {
        tracing::error!(
            task_id = %task.display_id(),
            exit_code = ?exit_code,
            "Task failed: {}",
            message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        protocol: &'static str,
        name: &'static str,
        only: Option<&'static str>,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ExecutionListener for Recorder {
        fn protocol(&self) -> &str {
            self.protocol
        }

        fn supports(&self, task: &Task) -> bool {
            self.only.map_or(true, |name| task.name == name)
        }

        async fn on_started(&self, task: &Task) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} started {}", self.name, task.name));
        }

        async fn on_updated(&self, _task: &Task) {}

        async fn on_completed(&self, _task: &Task) {}

        async fn on_error(&self, task: &Task, message: &str, _exit_code: Option<i32>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} error {} {}", self.name, task.name, message));
        }
    }

    #[tokio::test]
    async fn test_one_listener_per_protocol() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        for (protocol, name, only) in [
            ("http", "special", Some("b")),
            ("http", "generic", None),
            ("http", "shadowed", None),
            ("amqp", "queue", None),
        ] {
            registry.register(Arc::new(Recorder {
                protocol,
                name,
                only,
                events: Arc::clone(&events),
            }));
        }

        registry.started(&Task::new("a")).await;
        registry.error(&Task::new("b"), "boom", Some(1)).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "generic started a",
                "queue started a",
                "special error b boom",
                "queue error b boom",
            ]
        );
    }
}
