use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ControlAction, JobState, LaunchHandle, LocalEngine, LocalHosts, SessionEngine, SshEngine, SshPool};
use crate::command::BuiltCommand;
use crate::error::{ExecError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Local,
    Remote,
}

/// Launches on this machine when the node is local and over SSH otherwise.
pub struct ProcessEngine {
    local_hosts: LocalHosts,
    local: LocalEngine,
    remote: SshEngine,
    routes: Mutex<HashMap<String, Route>>,
}

impl ProcessEngine {
    pub fn new(local_hosts: LocalHosts, pool: Arc<SshPool>, remote_work_dir: impl Into<String>) -> Self {
        Self {
            local_hosts,
            local: LocalEngine::new(),
            remote: SshEngine::new(pool, remote_work_dir),
            routes: Mutex::new(HashMap::new()),
        }
    }

    async fn engine(&self, job_id: &str) -> Result<&dyn SessionEngine> {
        match self.routes.lock().await.get(job_id) {
            Some(Route::Local) => Ok(&self.local),
            Some(Route::Remote) => Ok(&self.remote),
            None => Err(ExecError::NoActiveSession(job_id.to_string())),
        }
    }
}

#[async_trait]
impl SessionEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, handle: LaunchHandle, command: &BuiltCommand) -> Result<String> {
        let (route, job_id) = if self.local_hosts.is_local(&handle.node.hostname) {
            (Route::Local, self.local.launch(handle, command).await?)
        } else {
            (Route::Remote, self.remote.launch(handle, command).await?)
        };
        self.routes.lock().await.insert(job_id.clone(), route);
        Ok(job_id)
    }

    async fn control(&self, job_id: &str, action: ControlAction) -> Result<()> {
        self.engine(job_id).await?.control(job_id, action).await
    }

    async fn query_status(&self, job_id: &str) -> Result<JobState> {
        self.engine(job_id).await?.query_status(job_id).await
    }

    async fn capture_output(&self, job_id: &str) -> Result<String> {
        self.engine(job_id).await?.capture_output(job_id).await
    }

    async fn exit_code(&self, job_id: &str) -> Result<Option<i32>> {
        self.engine(job_id).await?.exit_code(job_id).await
    }

    async fn cleanup(&self, job_id: &str) -> Result<()> {
        let engine = self.engine(job_id).await?;
        engine.cleanup(job_id).await?;
        self.routes.lock().await.remove(job_id);
        Ok(())
    }
}
