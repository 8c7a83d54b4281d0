//! Tasks, task groups and jobs.
//!
//! A `Task` is one unit of work moving through the `ExecutionStatus` state machine. A
//! `TaskGroup` owns child tasks (multi-step loops) and fans group input out to its level-1
//! children. A `Job` is one workflow execution made of tasks and their dependency edges.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ExecError, Result};

pub type TaskId = u64;
pub type JobId = u64;

/// Separator of list values encoded in a single parameter binding.
pub const LIST_SEPARATOR: char = ',';

static NEXT_REFERENCE: AtomicU64 = AtomicU64::new(1);

fn next_reference() -> u64 {
    NEXT_REFERENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    Undetermined,
    QueuedActive,
    Running,
    Suspended,
    /// The backend reported completion, local post-processing has not run yet.
    PendingFinalisation,
    Done,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// States in which a backend session may exist for the task.
    pub fn is_executing(self) -> bool {
        matches!(self, Self::QueuedActive | Self::Running | Self::Suspended)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Failed | Cancelled) => true,
            (Undetermined, QueuedActive | Running) => true,
            (QueuedActive, Running | Suspended | PendingFinalisation) => true,
            (Running, Suspended | PendingFinalisation) => true,
            (Suspended, QueuedActive) => true,
            (PendingFinalisation, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Undetermined => "UNDETERMINED",
            Self::QueuedActive => "QUEUED_ACTIVE",
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::PendingFinalisation => "PENDING_FINALISATION",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Splits a list value (`a,b,c` or `[a,b,c]`) into its items.
pub fn decode_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    if inner.is_empty() {
        return Vec::new();
    }
    inner
        .split(LIST_SEPARATOR)
        .map(|item| item.trim().to_string())
        .collect()
}

pub fn encode_list<S: AsRef<str>>(items: &[S]) -> String {
    let joined = items
        .iter()
        .map(|item| item.as_ref())
        .collect::<Vec<_>>()
        .join(&LIST_SEPARATOR.to_string());
    format!("[{}]", joined)
}

/// Ordered key to value parameter bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterBindings(Vec<(String, String)>);

impl ParameterBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the value of an existing key in place, appends otherwise.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.0.iter().cloned().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterBindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bindings = Self::new();
        for (k, v) in iter {
            bindings.set(k, v);
        }
        bindings
    }
}

impl Serialize for ParameterBindings {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterBindings {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BindingsVisitor;

        impl<'de> Visitor<'de> for BindingsVisitor {
            type Value = ParameterBindings;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of parameter names to values")
            }

            fn visit_map<M>(self, mut access: M) -> std::result::Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut bindings = ParameterBindings::new();
                while let Some((key, value)) = access.next_entry::<String, serde_yaml::Value>()? {
                    let value = match value {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        serde_yaml::Value::Null => String::new(),
                        serde_yaml::Value::Sequence(items) => encode_list(
                            &items
                                .iter()
                                .map(|item| match item {
                                    serde_yaml::Value::String(s) => s.clone(),
                                    serde_yaml::Value::Number(n) => n.to_string(),
                                    serde_yaml::Value::Bool(b) => b.to_string(),
                                    _ => String::new(),
                                })
                                .collect::<Vec<_>>(),
                        ),
                        serde_yaml::Value::Mapping(_) => {
                            return Err(serde::de::Error::custom(format!(
                                "parameter '{}' cannot be a mapping",
                                key
                            )))
                        }
                    };
                    bindings.set(key, value);
                }
                Ok(bindings)
            }
        }

        deserializer.deserialize_map(BindingsVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Persistent identity, assigned by the task store.
    pub id: Option<TaskId>,
    /// In-memory identity used before the task is persisted. Clones share it.
    #[serde(skip, default = "next_reference")]
    reference: u64,
    pub job_id: Option<JobId>,
    pub name: String,
    /// Component this task runs, resolved through the component registry.
    pub component_id: Option<String>,
    /// Workflow node this task was instantiated from.
    pub workflow_node_id: Option<u64>,
    /// DAG depth. Root tasks are at level 1.
    pub level: u32,
    pub status: ExecutionStatus,
    /// Backend-assigned job handle.
    pub resource_id: Option<String>,
    pub execution_node_host_name: Option<String>,
    pub used_cpu: usize,
    pub used_ram_mb: i64,
    pub user: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub log: Option<String>,
    pub inputs: ParameterBindings,
    pub outputs: ParameterBindings,
    /// Opaque serialized state of multi-step tasks.
    pub internal_state: Option<String>,
    /// Command template. Falls back to the component template when absent.
    pub command: Option<String>,
    /// Expected number of inputs.
    pub cardinality: usize,
    /// Tasks whose outputs feed unbound inputs of this one.
    pub parents: Vec<TaskId>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            reference: next_reference(),
            job_id: None,
            name: name.into(),
            component_id: None,
            workflow_node_id: None,
            level: 1,
            status: ExecutionStatus::Undetermined,
            resource_id: None,
            execution_node_host_name: None,
            used_cpu: 0,
            used_ram_mb: 0,
            user: None,
            start_time: None,
            end_time: None,
            last_updated: None,
            log: None,
            inputs: ParameterBindings::new(),
            outputs: ParameterBindings::new(),
            internal_state: None,
            command: None,
            cardinality: 1,
            parents: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = Some(component_id.into());
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Same task: equal persistent ids, or the same in-memory instance before persistence.
    pub fn is_same(&self, other: &Task) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self.reference == other.reference,
        }
    }

    pub fn set_input(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inputs.set(key, value);
    }

    pub fn set_output(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.outputs.set(key, value);
    }

    /// Moves the task to `next`, stamping timestamps. Terminal states accept nothing.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ExecError::InvalidState(format!(
                "task {} cannot move from {} to {}",
                self.display_id(),
                self.status,
                next
            )));
        }
        let now = Utc::now();
        self.status = next;
        self.last_updated = Some(now);
        match next {
            ExecutionStatus::QueuedActive | ExecutionStatus::Running => {
                self.start_time.get_or_insert(now);
            }
            ExecutionStatus::PendingFinalisation
            | ExecutionStatus::Done
            | ExecutionStatus::Failed
            | ExecutionStatus::Cancelled => {
                self.end_time = Some(now);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn append_log(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match &mut self.log {
            Some(log) => {
                if !log.is_empty() && !log.ends_with('\n') {
                    log.push('\n');
                }
                log.push_str(text);
            }
            None => self.log = Some(text.to_string()),
        }
    }

    pub fn display_id(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => format!("'{}'", self.name),
        }
    }
}

/// Re-maps group input per child, e.g. a loop picking one item of a list per iteration.
pub trait StateHandler: fmt::Debug + Send + Sync {
    fn map_input(&mut self, child_index: usize, key: &str, value: &str) -> String;

    /// Serialized state stored in the owning task's `internal_state`.
    fn serialize_state(&self) -> Result<String>;
}

/// Loop over a list-valued input: every child of the group receives the item at the current
/// iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    /// Input key holding the list. `None` loops over every list-valued input.
    pub key: Option<String>,
    pub current: usize,
    pub limit: usize,
}

impl LoopState {
    pub fn over(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn restore(state: &str) -> Result<Self> {
        Ok(serde_json::from_str(state)?)
    }

    /// Moves to the next iteration. Returns `false` once the list is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.current + 1 < self.limit {
            self.current += 1;
            true
        } else {
            false
        }
    }
}

impl StateHandler for LoopState {
    fn map_input(&mut self, _child_index: usize, key: &str, value: &str) -> String {
        if self.key.as_deref().map_or(false, |k| k != key) {
            return value.to_string();
        }
        let items = decode_list(value);
        if items.len() <= 1 && self.key.is_none() {
            return value.to_string();
        }
        self.limit = items.len();
        items.get(self.current).cloned().unwrap_or_default()
    }

    fn serialize_state(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A task owning an ordered collection of child tasks.
#[derive(Debug)]
pub struct TaskGroup {
    pub task: Task,
    children: Vec<Task>,
    state_handler: Option<Box<dyn StateHandler>>,
}

impl TaskGroup {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            children: Vec::new(),
            state_handler: None,
        }
    }

    pub fn with_state_handler(mut self, handler: Box<dyn StateHandler>) -> Self {
        self.state_handler = Some(handler);
        self
    }

    /// Adds a child unless it is already part of the group. Returns whether it was added.
    pub fn add_child(&mut self, child: Task) -> bool {
        if self.children.iter().any(|c| c.is_same(&child)) {
            return false;
        }
        self.children.push(child);
        true
    }

    pub fn children(&self) -> &[Task] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Task] {
        &mut self.children
    }

    /// Binds a group input and propagates it to every first-level child.
    pub fn set_input_parameter_value(&mut self, key: &str, value: &str) -> Result<()> {
        self.task.set_input(key, value);
        let child_level = self.task.level + 1;
        let mut position = 0;
        for child in self.children.iter_mut().filter(|c| c.level == child_level) {
            let mapped = match self.state_handler.as_mut() {
                Some(handler) => handler.map_input(position, key, value),
                None => value.to_string(),
            };
            child.set_input(key, mapped);
            position += 1;
        }
        if let Some(handler) = &self.state_handler {
            self.task.internal_state = Some(handler.serialize_state()?);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackEndpoint {
    /// Notification protocol, used to pick the listener handling this job.
    pub protocol: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub workflow_id: Option<u64>,
    pub user: String,
    pub output_path: PathBuf,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub callback: Option<CallbackEndpoint>,
    /// Task id to the ids of its parents.
    pub dependencies: HashMap<TaskId, Vec<TaskId>>,
    pub job_type: String,
    tasks: Vec<Task>,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            workflow_id: None,
            user: user.into(),
            output_path: PathBuf::new(),
            status: ExecutionStatus::Undetermined,
            start_time: None,
            end_time: None,
            callback: None,
            dependencies: HashMap::new(),
            job_type: "EXECUTION".to_string(),
            tasks: Vec::new(),
        }
    }

    /// Adds a task unless an identical one is already there. Returns whether it was added.
    pub fn add_task(&mut self, mut task: Task) -> bool {
        if self.tasks.iter().any(|t| t.is_same(&task)) {
            return false;
        }
        task.job_id = Some(self.id);
        task.user.get_or_insert_with(|| self.user.clone());
        self.tasks.push(task);
        true
    }

    pub fn add_dependency(&mut self, task_id: TaskId, parent_id: TaskId) {
        let parents = self.dependencies.entry(task_id).or_default();
        if !parents.contains(&parent_id) {
            parents.push(parent_id);
        }
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == Some(task_id)) {
            if !task.parents.contains(&parent_id) {
                task.parents.push(parent_id);
            }
        }
    }

    pub fn parents_of(&self, task_id: TaskId) -> &[TaskId] {
        self.dependencies
            .get(&task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn root_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.level == 1)
    }

    /// Job status derived from its tasks.
    pub fn aggregate_status(&self) -> ExecutionStatus {
        use ExecutionStatus::*;
        if self.tasks.is_empty() {
            return Undetermined;
        }
        let any = |s: ExecutionStatus| self.tasks.iter().any(|t| t.status == s);
        if any(Failed) {
            Failed
        } else if self.tasks.iter().all(|t| t.status == Done) {
            Done
        } else if any(Cancelled) && self.tasks.iter().all(|t| t.status.is_terminal()) {
            Cancelled
        } else if any(Running) || any(PendingFinalisation) {
            Running
        } else if any(QueuedActive) {
            QueuedActive
        } else if any(Suspended) {
            Suspended
        } else {
            Undetermined
        }
    }
}

/// Task file entry: a bare command string or a full mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub inputs: ParameterBindings,
    #[serde(default)]
    pub outputs: ParameterBindings,
    #[serde(default)]
    pub cpus: usize,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub level: Option<u32>,
}

impl FromStr for TaskSpec {
    type Err = void::Void;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self {
            name: None,
            component: None,
            command: Some(s.to_string()),
            inputs: ParameterBindings::new(),
            outputs: ParameterBindings::new(),
            cpus: 0,
            memory_mb: 0,
            level: None,
        })
    }
}

impl TaskSpec {
    pub fn into_task(self, index: usize) -> Task {
        let mut task = Task::new(self.name.unwrap_or_else(|| format!("task-{}", index)));
        task.component_id = self.component;
        task.command = self.command;
        task.inputs = self.inputs;
        task.outputs = self.outputs;
        task.used_cpu = self.cpus;
        task.used_ram_mb = self.memory_mb;
        task.level = self.level.unwrap_or(1);
        task
    }
}

#[derive(Debug, Deserialize)]
struct TaskFileEntry(#[serde(deserialize_with = "crate::serde::string_or_mapping")] TaskSpec);

/// Reads the task file (YAML list of command strings or task mappings).
pub fn get_tasks(tasks_file: &str) -> Result<Vec<Task>> {
    let fd = std::fs::File::open(tasks_file)?;
    let entries: Vec<TaskFileEntry> = serde_yaml::from_reader(fd)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, TaskFileEntry(spec))| spec.into_task(i))
        .collect())
}

pub fn parse_tasks(yaml: &str) -> Result<Vec<Task>> {
    let entries: Vec<TaskFileEntry> = serde_yaml::from_str(yaml)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, TaskFileEntry(spec))| spec.into_task(i))
        .collect())
}
