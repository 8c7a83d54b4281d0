//! Task lifecycle.
//!
//! `TaskLifecycleManager` takes tasks from submission to completion:
//!
//! 1. `execute` stores the task, resolves its component and puts it on a bounded queue.
//! 2. Workers (one per active node) take tasks off the queue, wait in the `NodeSelector` for a
//!    node with room, build the command, launch it and reserve memory in the ledger.
//! 3. `monitor_executions`, run on a ticker, polls the backend for every executing task and
//!    moves the task along its state machine, releasing memory and notifying listeners.
//!
//! All status changes go through one lock, and listeners are notified while it is held, so a
//! listener never sees a task in a state it is about to leave.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::command::{shell_quote, work_name, BuildRequest};
use crate::component::{ComponentDescriptor, ContainerDescriptor};
use crate::context::ExecutionContext;
use crate::error::{ExecError, Result};
use crate::inventory::Probe;
use crate::node::NodeDescription;
use crate::periodic::Ticker;
use crate::session::{ControlAction, JobState};
use crate::task::{ExecutionStatus, Task, TaskId};

/// Post-processing of a completed task's outputs on the node that produced them.
#[async_trait]
pub trait OutputFinalizer: Send + Sync {
    async fn finalize(&self, task: &Task, node: &NodeDescription) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopFinalizer;

#[async_trait]
impl OutputFinalizer for NoopFinalizer {
    async fn finalize(&self, _task: &Task, _node: &NodeDescription) -> Result<()> {
        Ok(())
    }
}

/// Hands absolute output paths over to `owner` with `chown -R`.
pub struct ChownFinalizer {
    owner: String,
    shell: Arc<dyn Probe>,
}

impl ChownFinalizer {
    pub fn new(owner: impl Into<String>, shell: Arc<dyn Probe>) -> Self {
        Self {
            owner: owner.into(),
            shell,
        }
    }

    pub fn script(&self, task: &Task) -> Option<String> {
        let paths: Vec<_> = task
            .outputs
            .iter()
            .map(|(_, path)| path)
            .filter(|path| path.starts_with('/'))
            .map(shell_quote)
            .collect();
        if paths.is_empty() {
            return None;
        }
        Some(format!(
            "chown -R {} {}",
            shell_quote(&self.owner),
            paths.join(" ")
        ))
    }
}

#[async_trait]
impl OutputFinalizer for ChownFinalizer {
    async fn finalize(&self, task: &Task, node: &NodeDescription) -> Result<()> {
        if let Some(script) = self.script(task) {
            self.shell.run(node, &script).await?;
        }
        Ok(())
    }
}

/// What one monitor pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorReport {
    pub polled: usize,
    pub changed: usize,
    pub failed: usize,
}

/// A stored task and the descriptors resolved for it, waiting for a worker.
struct Dispatch {
    task_id: TaskId,
    component: Option<ComponentDescriptor>,
    container: Option<ContainerDescriptor>,
}

/// Where a launched task runs and what it holds in the ledger.
struct Placement {
    node: NodeDescription,
    reserved_mb: Option<i64>,
}

pub struct TaskLifecycleManager {
    ctx: Arc<ExecutionContext>,
    queue_tx: flume::Sender<Dispatch>,
    queue_rx: flume::Receiver<Dispatch>,
    placements: Mutex<HashMap<TaskId, Placement>>,
    transitions: tokio::sync::Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskLifecycleManager {
    pub fn new(ctx: Arc<ExecutionContext>) -> Arc<Self> {
        let (queue_tx, queue_rx) = flume::bounded(ctx.queue_capacity);
        Arc::new(Self {
            ctx,
            queue_tx,
            queue_rx,
            placements: Mutex::new(HashMap::new()),
            transitions: tokio::sync::Mutex::new(()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Spawns the dispatch workers, one per active node (at least one). Returns how many.
    pub async fn start(self: &Arc<Self>) -> usize {
        let count = match &self.ctx.inventory {
            Some(inventory) => inventory
                .current_nodes()
                .await
                .iter()
                .filter(|n| n.active)
                .count()
                .max(1),
            None => 1,
        };
        let mut workers = lock(&self.workers);
        for index in 0..count {
            let manager = Arc::clone(self);
            workers.push(tokio::spawn(async move { manager.run_worker(index).await }));
        }
        tracing::info!(workers = count, engine = self.ctx.engine.name(), "Dispatch workers started");
        count
    }

    /// Aborts the dispatch workers. Tasks still queued stay UNDETERMINED.
    pub fn shutdown(&self) {
        for worker in lock(&self.workers).drain(..) {
            worker.abort();
        }
    }

    pub fn spawn_monitor(self: &Arc<Self>, period: Duration) -> Ticker {
        let manager = Arc::clone(self);
        Ticker::start("monitor", period, move || {
            let manager = Arc::clone(&manager);
            async move {
                if let Err(e) = manager.monitor_executions().await {
                    tracing::error!(error = %e, "Monitor pass failed");
                }
                ControlFlow::Continue(())
            }
        })
    }

    /// Stores a new task and queues it for dispatch.
    ///
    /// Problems with the task itself (unknown component, nothing to run) fail the task and are
    /// reported through its status, not as an error.
    pub async fn execute(&self, task: Task) -> Result<Task> {
        if task.status != ExecutionStatus::Undetermined {
            return Err(ExecError::InvalidState(format!(
                "task {} is {} and cannot be executed again",
                task.display_id(),
                task.status
            )));
        }
        let task = match task.id {
            Some(id) => match self.ctx.store.update(&task).await {
                Ok(()) => task,
                Err(ExecError::TaskNotFound(_)) => {
                    tracing::debug!(task_id = id, "Storing task with a preassigned id");
                    self.ctx.store.insert(&self.ctx.app_id, task).await?
                }
                Err(e) => return Err(e),
            },
            None => self.ctx.store.insert(&self.ctx.app_id, task).await?,
        };
        self.submit(task).await
    }

    async fn submit(&self, task: Task) -> Result<Task> {
        let task_id = stored_id(&task)?;
        let (component, container) = match self.resolve(&task) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(task_id, &e.to_string(), None).await;
                return self.ctx.store.get(task_id).await;
            }
        };
        let dispatch = Dispatch {
            task_id,
            component,
            container,
        };
        if self.queue_tx.send_async(dispatch).await.is_err() {
            let message = "dispatch queue is closed";
            self.fail(task_id, message, None).await;
            return Err(ExecError::Submission(message.to_string()));
        }
        tracing::debug!(task_id, "Task queued");
        Ok(task)
    }

    fn resolve(
        &self,
        task: &Task,
    ) -> Result<(Option<ComponentDescriptor>, Option<ContainerDescriptor>)> {
        let component = match &task.component_id {
            Some(id) => Some(
                self.ctx
                    .components
                    .component(id)
                    .ok_or_else(|| ExecError::UnknownComponent(id.clone()))?,
            ),
            None => None,
        };
        let container = match component.as_ref().and_then(|c| c.container.as_ref()) {
            Some(id) => Some(
                self.ctx
                    .components
                    .container(id)
                    .ok_or_else(|| ExecError::UnknownComponent(format!("container {}", id)))?,
            ),
            None => None,
        };
        if task.command.is_none() && component.is_none() {
            return Err(ExecError::Submission(format!(
                "task {} has neither a command nor a component",
                task.display_id()
            )));
        }
        Ok((component, container))
    }

    async fn run_worker(&self, index: usize) {
        while let Ok(dispatch) = self.queue_rx.recv_async().await {
            let task_id = dispatch.task_id;
            if let Err(e) = self.dispatch(dispatch).await {
                tracing::warn!(worker = index, task_id, error = %e, "Dispatch failed");
                self.fail(task_id, &e.to_string(), None).await;
            }
        }
    }

    async fn dispatch(&self, dispatch: Dispatch) -> Result<()> {
        let Dispatch {
            task_id,
            component,
            container,
        } = dispatch;
        let task = self.ctx.store.get(task_id).await?;
        if task.status.is_terminal() {
            tracing::debug!(task_id, state = %task.status, "Skipping task that already ended");
            return Ok(());
        }

        let memory_hint = match &container {
            Some(container) if container.app_memory_mb > 0 => container.app_memory_mb,
            _ => task.used_ram_mb,
        };
        let user = task.user.clone().unwrap_or_default();
        let node = self
            .ctx
            .selector
            .select_node(&user, task.used_cpu, memory_hint)
            .await;

        // Waiting for a node may take a while. Pick up whatever happened meanwhile.
        let mut task = self.ctx.store.get(task_id).await?;
        if task.status.is_terminal() {
            tracing::debug!(task_id, state = %task.status, "Task ended while waiting for a node");
            return Ok(());
        }
        self.bind_parent_outputs(&mut task).await?;
        let inputs = task.inputs.clone();

        let command = self.ctx.builder.build(&BuildRequest {
            task: &task,
            component: component.as_ref(),
            container: container.as_ref(),
            node: &node,
        })?;
        let handle = self.ctx.engine.create_handle(&work_name(&task), &node.node);
        let job_id = self.ctx.engine.launch(handle, &command).await?;
        if job_id.trim().is_empty() {
            return Err(ExecError::Submission(format!(
                "{} returned no job id for task {}",
                self.ctx.engine.name(),
                task_id
            )));
        }
        self.reserve(task_id, &node.node, node.memory_to_use);

        let _guard = self.transitions.lock().await;
        let mut task = self.ctx.store.get(task_id).await?;
        if task.status.is_terminal() {
            // Stopped while launching.
            if let Err(e) = self
                .ctx
                .engine
                .control(&job_id, ControlAction::Terminate)
                .await
            {
                tracing::debug!(task_id, job_id = %job_id, error = %e, "Terminate after stop");
            }
            self.forget(task_id);
            return Ok(());
        }
        task.inputs = inputs;
        task.resource_id = Some(job_id.clone());
        task.execution_node_host_name = Some(node.node.hostname.clone());
        task.used_cpu = node.cpu_to_use;
        task.used_ram_mb = node.memory_to_use;
        task.start_time = Some(Utc::now());
        task.append_log(&format!("$ {}", command.command_line()));
        let next = if self.ctx.engine.queues_jobs() {
            ExecutionStatus::QueuedActive
        } else {
            ExecutionStatus::Running
        };
        task.transition(next)?;
        self.ctx.store.update(&task).await?;
        tracing::info!(
            task_id,
            job_id = %job_id,
            host = %node.node.hostname,
            state = %task.status,
            "Task launched"
        );
        self.ctx.listeners.started(&task).await;
        Ok(())
    }

    /// Fills unbound inputs from parent outputs of the same name.
    async fn bind_parent_outputs(&self, task: &mut Task) -> Result<()> {
        if task.parents.is_empty() {
            return Ok(());
        }
        let parents = self.ctx.store.list(&task.parents).await?;
        for parent in &parents {
            for (key, value) in parent.outputs.iter() {
                if task.inputs.get(key).map_or(true, str::is_empty) {
                    task.set_input(key, value);
                }
            }
        }
        Ok(())
    }

    /// One pass over every executing task. A failure polling one task fails that task only.
    pub async fn monitor_executions(&self) -> Result<MonitorReport> {
        let tasks = self.ctx.store.list_executing(&self.ctx.app_id).await?;
        let mut report = MonitorReport::default();
        for task in tasks {
            let (task_id, job_id) = match (task.id, task.resource_id.clone()) {
                (Some(id), Some(job_id)) => (id, job_id),
                // Still waiting for a worker.
                _ => continue,
            };
            report.polled += 1;
            let outcome = match self.ctx.engine.query_status(&job_id).await {
                Ok(state) => self.apply(task_id, &job_id, state).await,
                Err(e) => Err(ExecError::Poll {
                    job: job_id.clone(),
                    reason: e.to_string(),
                }),
            };
            match outcome {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(task_id, job_id = %job_id, error = %e, "Failed to poll task");
                    self.fail(task_id, &e.to_string(), None).await;
                    self.cleanup(&job_id).await;
                    report.failed += 1;
                }
            }
        }
        if report.polled > 0 {
            tracing::debug!(?report, "Monitor pass done");
        }
        Ok(report)
    }

    /// Moves the task to match the backend state. Returns whether anything changed.
    async fn apply(&self, task_id: TaskId, job_id: &str, state: JobState) -> Result<bool> {
        let _guard = self.transitions.lock().await;
        let mut task = self.ctx.store.get(task_id).await?;
        if task.status.is_terminal() || task.resource_id.as_deref() != Some(job_id) {
            return Ok(false);
        }
        match state {
            JobState::Queued | JobState::Undetermined => {
                task.last_updated = Some(Utc::now());
                self.ctx.store.update(&task).await?;
                Ok(false)
            }
            JobState::Running => {
                if task.status == ExecutionStatus::Running {
                    task.last_updated = Some(Utc::now());
                    self.ctx.store.update(&task).await?;
                    return Ok(false);
                }
                if task.status == ExecutionStatus::Suspended {
                    // Resumed behind our back.
                    task.transition(ExecutionStatus::QueuedActive)?;
                    self.reserve_again(&task);
                }
                task.transition(ExecutionStatus::Running)?;
                self.ctx.store.update(&task).await?;
                self.ctx.listeners.updated(&task).await;
                Ok(true)
            }
            JobState::Suspended => {
                if task.status == ExecutionStatus::Suspended {
                    return Ok(false);
                }
                self.mark_suspended(&mut task, job_id).await?;
                Ok(true)
            }
            JobState::Done => {
                if task.status == ExecutionStatus::Suspended {
                    // Resumed behind our back and finished between two polls.
                    task.transition(ExecutionStatus::QueuedActive)?;
                }
                self.release(task_id);
                self.capture_output(&mut task, job_id).await;
                if let Some(node) = self.placement_node(task_id) {
                    if let Err(e) = self.ctx.finalizer.finalize(&task, &node).await {
                        tracing::warn!(task_id, host = %node.hostname, error = %e, "Output fix-up failed");
                        task.append_log(&format!("output fix-up failed: {}", e));
                    }
                }
                task.transition(ExecutionStatus::PendingFinalisation)?;
                self.ctx.store.update(&task).await?;
                tracing::info!(task_id, job_id, "Task completed");
                self.ctx.listeners.completed(&task).await;
                if self.ctx.auto_finalize {
                    task.transition(ExecutionStatus::Done)?;
                    self.ctx.store.update(&task).await?;
                    self.ctx.listeners.updated(&task).await;
                }
                self.forget(task_id);
                self.cleanup(job_id).await;
                Ok(true)
            }
            JobState::Failed => {
                self.release(task_id);
                self.capture_output(&mut task, job_id).await;
                let exit_code = match self.ctx.engine.exit_code(job_id).await {
                    Ok(code) => code,
                    Err(e) => {
                        tracing::debug!(task_id, job_id, error = %e, "No exit code");
                        None
                    }
                };
                let message = match exit_code {
                    Some(code) => format!("job {} exited with code {}", job_id, code),
                    None => format!("job {} failed", job_id),
                };
                task.append_log(&message);
                task.transition(ExecutionStatus::Failed)?;
                self.ctx.store.update(&task).await?;
                tracing::warn!(task_id, job_id, exit_code = ?exit_code, "Task failed");
                self.ctx.listeners.error(&task, &message, exit_code).await;
                self.forget(task_id);
                self.cleanup(job_id).await;
                Ok(true)
            }
        }
    }

    async fn capture_output(&self, task: &mut Task, job_id: &str) {
        match self.ctx.engine.capture_output(job_id).await {
            Ok(output) => task.append_log(output.trim_end()),
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to capture output"),
        }
    }

    async fn cleanup(&self, job_id: &str) {
        if let Err(e) = self.ctx.engine.cleanup(job_id).await {
            tracing::debug!(job_id, error = %e, "Backend cleanup failed");
        }
    }

    /// Marks the task FAILED, records `message` in its log and notifies listeners.
    async fn fail(&self, task_id: TaskId, message: &str, exit_code: Option<i32>) {
        let _guard = self.transitions.lock().await;
        self.forget(task_id);
        let mut task = match self.ctx.store.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(task_id, error = %e, "Cannot mark task as failed");
                return;
            }
        };
        if task.status.is_terminal() {
            return;
        }
        task.append_log(message);
        if let Err(e) = task.transition(ExecutionStatus::Failed) {
            tracing::error!(task_id, error = %e, "Cannot mark task as failed");
            return;
        }
        if let Err(e) = self.ctx.store.update(&task).await {
            tracing::error!(task_id, error = %e, "Cannot store failed task");
        }
        self.ctx.listeners.error(&task, message, exit_code).await;
    }

    /// Requests termination and marks the task CANCELLED whatever the backend says.
    pub async fn stop(&self, task_id: TaskId) -> Result<Task> {
        let _guard = self.transitions.lock().await;
        let mut task = self.ctx.store.get(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if let Some(job_id) = task.resource_id.clone() {
            if let Err(e) = self
                .ctx
                .engine
                .control(&job_id, ControlAction::Terminate)
                .await
            {
                tracing::debug!(task_id, job_id = %job_id, error = %e, "Terminate request failed");
            }
            self.cleanup(&job_id).await;
        }
        self.forget(task_id);
        task.transition(ExecutionStatus::Cancelled)?;
        self.ctx.store.update(&task).await?;
        tracing::info!(task_id, "Task cancelled");
        self.ctx.listeners.updated(&task).await;
        Ok(task)
    }

    pub async fn suspend(&self, task_id: TaskId) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let mut task = self.ctx.store.get(task_id).await?;
        let job_id = match (task.status, &task.resource_id) {
            (ExecutionStatus::QueuedActive | ExecutionStatus::Running, Some(job_id)) => job_id.clone(),
            (status, _) => {
                return Err(ExecError::InvalidState(format!(
                    "task {} is {} and cannot be suspended",
                    task_id, status
                )))
            }
        };
        self.ctx
            .engine
            .control(&job_id, ControlAction::Suspend)
            .await?;
        self.mark_suspended(&mut task, &job_id).await
    }

    /// Releases the task's memory and records it as SUSPENDED. Callers hold `transitions`.
    async fn mark_suspended(&self, task: &mut Task, job_id: &str) -> Result<()> {
        let task_id = stored_id(task)?;
        self.release(task_id);
        task.transition(ExecutionStatus::Suspended)?;
        self.ctx.store.update(task).await?;
        tracing::info!(task_id, job_id, "Task suspended");
        self.ctx.listeners.updated(task).await;
        Ok(())
    }

    /// Resumes a suspended task. When the backend no longer knows the job, the task is
    /// submitted again.
    pub async fn resume(&self, task_id: TaskId) -> Result<()> {
        let guard = self.transitions.lock().await;
        let mut task = self.ctx.store.get(task_id).await?;
        if task.status != ExecutionStatus::Suspended {
            return Err(ExecError::InvalidState(format!(
                "task {} is {} and cannot be resumed",
                task_id, task.status
            )));
        }
        let job_id = task.resource_id.clone().unwrap_or_default();
        match self.ctx.engine.control(&job_id, ControlAction::Resume).await {
            Ok(()) => {
                task.transition(ExecutionStatus::QueuedActive)?;
                self.reserve_again(&task);
                self.ctx.store.update(&task).await?;
                tracing::info!(task_id, job_id = %job_id, "Task resumed");
                self.ctx.listeners.updated(&task).await;
                Ok(())
            }
            Err(ExecError::NoActiveSession(_)) => {
                tracing::warn!(task_id, job_id = %job_id, "Backend lost the job, submitting again");
                self.forget(task_id);
                task.transition(ExecutionStatus::QueuedActive)?;
                task.resource_id = None;
                task.execution_node_host_name = None;
                self.ctx.store.update(&task).await?;
                self.ctx.listeners.updated(&task).await;
                drop(guard);
                self.submit(task).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves PENDING_FINALISATION to DONE.
    pub async fn finalize(&self, task_id: TaskId) -> Result<Task> {
        let _guard = self.transitions.lock().await;
        let mut task = self.ctx.store.get(task_id).await?;
        if task.status != ExecutionStatus::PendingFinalisation {
            return Err(ExecError::InvalidState(format!(
                "task {} is {}, not pending finalisation",
                task_id, task.status
            )));
        }
        task.transition(ExecutionStatus::Done)?;
        self.ctx.store.update(&task).await?;
        self.ctx.listeners.updated(&task).await;
        Ok(task)
    }

    /// Number of tasks of this application that have not reached a terminal state.
    pub async fn unfinished(&self) -> Result<usize> {
        Ok(self
            .ctx
            .store
            .list_all(&self.ctx.app_id)
            .await?
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count())
    }

    fn reserve(&self, task_id: TaskId, node: &NodeDescription, amount_mb: i64) {
        self.ctx.ledger.reserve(node, amount_mb);
        lock(&self.placements).insert(
            task_id,
            Placement {
                node: node.clone(),
                reserved_mb: Some(amount_mb),
            },
        );
    }

    /// Reserves again what a suspended task released.
    fn reserve_again(&self, task: &Task) {
        let task_id = match task.id {
            Some(id) => id,
            None => return,
        };
        let mut placements = lock(&self.placements);
        if let Some(placement) = placements.get_mut(&task_id) {
            if placement.reserved_mb.is_none() {
                self.ctx.ledger.reserve(&placement.node, task.used_ram_mb);
                placement.reserved_mb = Some(task.used_ram_mb);
            }
        }
    }

    /// Releases the task's reservation, if it holds one. Never releases twice.
    fn release(&self, task_id: TaskId) {
        let mut placements = lock(&self.placements);
        if let Some(placement) = placements.get_mut(&task_id) {
            if let Some(amount_mb) = placement.reserved_mb.take() {
                self.ctx.ledger.release(&placement.node.hostname, amount_mb);
            }
        }
    }

    fn placement_node(&self, task_id: TaskId) -> Option<NodeDescription> {
        lock(&self.placements)
            .get(&task_id)
            .map(|placement| placement.node.clone())
    }

    /// Releases and drops the task's placement.
    fn forget(&self, task_id: TaskId) {
        self.release(task_id);
        lock(&self.placements).remove(&task_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stored_id(task: &Task) -> Result<TaskId> {
    task.id
        .ok_or_else(|| ExecError::InvalidState(format!("task {} was never stored", task.display_id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Flavor;

    struct Echo;

    #[async_trait]
    impl Probe for Echo {
        async fn run(&self, _node: &NodeDescription, script: &str) -> Result<String> {
            Ok(script.to_string())
        }
    }

    #[tokio::test]
    async fn test_chown_finalizer() {
        let finalizer = ChownFinalizer::new("eo:eo", Arc::new(Echo));
        let mut task = Task::new("t");
        task.set_output("out", "/data/out dir/result.tif");
        task.set_output("label", "relative.txt");
        assert_eq!(
            finalizer.script(&task).unwrap(),
            "chown -R eo:eo '/data/out dir/result.tif'"
        );
        finalizer
            .finalize(&task, &NodeDescription::new("w1", Flavor::default()))
            .await
            .unwrap();
        assert!(finalizer.script(&Task::new("no outputs")).is_none());
    }
}
