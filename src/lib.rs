//! eoflow: task execution engine and node-resource allocator for EO processing pipelines.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent compute nodes.
pub mod node;
// Tasks, groups, jobs and their state machine.
pub mod task;
// Outstanding memory reservations per host.
pub mod ledger;
// Runtime snapshots and the live node inventory.
pub mod inventory;
// Picking a node with room for a task.
pub mod selector;
// Processing components and containers.
pub mod component;
// Turning tasks into command invocations.
pub mod command;
// Execution backends.
pub mod session;
// Task persistence.
pub mod store;
// Execution listeners.
pub mod listener;
// Cooperative periodic tasks.
pub mod periodic;
// Submission, dispatch and monitoring of tasks.
pub mod lifecycle;
// Explicitly constructed collaborators.
pub mod context;
// Transfer progress and cancellation.
pub mod progress;

pub use command::{BuiltCommand, CommandBuilder};
pub use config::{Config, EngineConfig, Mode};
pub use context::ExecutionContext;
pub use error::{ExecError, Result};
pub use inventory::{InventoryService, NodeInventory, RuntimeInspector, RuntimeSnapshot};
pub use ledger::ResourceLedger;
pub use lifecycle::TaskLifecycleManager;
pub use node::{get_nodes, NodeDescription};
pub use selector::{NodeData, NodeSelector};
pub use session::{ControlAction, JobState, SessionEngine};
pub use store::{InMemoryTaskStore, TaskStore};
pub use task::{ExecutionStatus, Job, Task, TaskGroup};
pub use progress::TransferProgressTracker;
