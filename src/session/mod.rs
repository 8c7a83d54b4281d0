//! Execution backends.
//!
//! A `SessionEngine` launches a built command on a node and then controls and polls it by the
//! job id it returned. Engines are picked by configuration:
//!
//! - `LocalEngine`: child processes of this process.
//! - `SshEngine`: detached processes on remote hosts over multiplexed SSH connections.
//! - `ProcessEngine`: local or SSH depending on whether the target node is this host.
//! - `SimulatedEngine`: export mode, commands are written to a script instead of run.
//!
//! Other resource managers plug in by implementing the trait.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::BuiltCommand;
use crate::config::{EngineConfig, EngineKind};
use crate::error::Result;
use crate::node::NodeDescription;

mod local;
mod process;
mod simulated;
mod ssh;

pub use local::LocalEngine;
pub use process::ProcessEngine;
pub use simulated::SimulatedEngine;
pub use ssh::{parse_remote_status, SshEngine, SshPool};

/// Backend view of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Suspended,
    Done,
    Failed,
    Undetermined,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Suspend,
    Resume,
    Terminate,
}

impl ControlAction {
    /// Signal delivered to the job's process group.
    pub fn signal(self) -> &'static str {
        match self {
            Self::Suspend => "STOP",
            Self::Resume => "CONT",
            Self::Terminate => "TERM",
        }
    }
}

/// Where and how a command is launched.
#[derive(Debug, Clone)]
pub struct LaunchHandle {
    pub job_name: String,
    pub node: NodeDescription,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait SessionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_handle(&self, job_name: &str, node: &NodeDescription) -> LaunchHandle {
        LaunchHandle {
            job_name: job_name.to_string(),
            node: node.clone(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Whether launched jobs wait in a backend queue before running.
    fn queues_jobs(&self) -> bool {
        false
    }

    /// Starts the command and returns the backend job id.
    async fn launch(&self, handle: LaunchHandle, command: &BuiltCommand) -> Result<String>;

    /// Fails with `InvalidState` when the job cannot take the action in its current state and
    /// with `NoActiveSession` when the backend does not know the job.
    async fn control(&self, job_id: &str, action: ControlAction) -> Result<()>;

    async fn query_status(&self, job_id: &str) -> Result<JobState>;

    async fn capture_output(&self, job_id: &str) -> Result<String>;

    async fn exit_code(&self, job_id: &str) -> Result<Option<i32>>;

    /// Releases output buffers and bookkeeping held for the job.
    async fn cleanup(&self, job_id: &str) -> Result<()>;
}

/// Names under which this machine may appear in the node inventory.
#[derive(Debug, Clone)]
pub struct LocalHosts(HashSet<String>);

impl LocalHosts {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// Loopback names, the configured master host and the system hostname.
    pub fn detect(master_host: Option<&str>) -> Self {
        let mut names: HashSet<String> = ["localhost", "127.0.0.1", "::1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(master) = master_host {
            names.insert(master.to_string());
        }
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            names.insert(hostname);
        }
        if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
            names.insert(hostname.trim().to_string());
        }
        names.remove("");
        Self(names)
    }

    pub fn is_local(&self, hostname: &str) -> bool {
        self.0.contains(hostname)
    }
}

pub fn build_engine(config: &EngineConfig, pool: Arc<SshPool>) -> Arc<dyn SessionEngine> {
    let engine: Arc<dyn SessionEngine> = match config.engine {
        EngineKind::Local => Arc::new(LocalEngine::new()),
        EngineKind::Ssh => Arc::new(SshEngine::new(pool, config.remote_work_dir.clone())),
        EngineKind::Process => Arc::new(ProcessEngine::new(
            LocalHosts::detect(config.master_host.as_deref()),
            pool,
            config.remote_work_dir.clone(),
        )),
        EngineKind::Simulated => Arc::new(SimulatedEngine::new(config.export_file.clone())),
    };
    tracing::info!(engine = engine.name(), "Session engine ready");
    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hosts() {
        let hosts = LocalHosts::detect(Some("master.eo"));
        assert!(hosts.is_local("localhost"));
        assert!(hosts.is_local("master.eo"));
        assert!(!hosts.is_local("worker-7.eo"));
        assert!(!hosts.is_local(""));
    }
}
