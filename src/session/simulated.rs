use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ControlAction, JobState, LaunchHandle, SessionEngine};
use crate::command::BuiltCommand;
use crate::error::{ExecError, Result};

/// Records commands instead of running them. Every job completes as soon as it is launched.
pub struct SimulatedEngine {
    export_file: Option<PathBuf>,
    script: Mutex<Vec<String>>,
    jobs: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
}

impl SimulatedEngine {
    pub fn new(export_file: Option<PathBuf>) -> Self {
        Self {
            export_file,
            script: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Lines recorded so far, in launch order.
    pub async fn script(&self) -> Vec<String> {
        self.script.lock().await.clone()
    }

    async fn known(&self, job_id: &str) -> Result<()> {
        if self.jobs.lock().await.contains_key(job_id) {
            Ok(())
        } else {
            Err(ExecError::NoActiveSession(job_id.to_string()))
        }
    }
}

#[async_trait]
impl SessionEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn launch(&self, handle: LaunchHandle, command: &BuiltCommand) -> Result<String> {
        let entry = format!(
            "# {} on {}\n{}\n",
            handle.job_name,
            handle.node.hostname,
            command.command_line()
        );
        if let Some(path) = &self.export_file {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await?;
        }
        self.script.lock().await.push(entry);

        let job_id = format!("sim-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(job_id = %job_id, job_name = %handle.job_name, "Recorded command");
        self.jobs.lock().await.insert(job_id.clone(), handle.job_name);
        Ok(job_id)
    }

    async fn control(&self, job_id: &str, _action: ControlAction) -> Result<()> {
        self.known(job_id).await?;
        Err(ExecError::InvalidState(format!(
            "simulated job {} already finished",
            job_id
        )))
    }

    async fn query_status(&self, job_id: &str) -> Result<JobState> {
        self.known(job_id).await?;
        Ok(JobState::Done)
    }

    async fn capture_output(&self, job_id: &str) -> Result<String> {
        self.known(job_id).await?;
        Ok(String::new())
    }

    async fn exit_code(&self, job_id: &str) -> Result<Option<i32>> {
        self.known(job_id).await?;
        Ok(Some(0))
    }

    async fn cleanup(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Flavor, NodeDescription};

    #[tokio::test]
    async fn test_export_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        let engine = SimulatedEngine::new(Some(path.clone()));
        let node = NodeDescription::new("w1", Flavor::default());
        let command = BuiltCommand::new("echo", vec!["a b".into()]);
        let job_id = engine
            .launch(engine.create_handle("task-1", &node), &command)
            .await
            .unwrap();
        assert_eq!(engine.query_status(&job_id).await.unwrap(), JobState::Done);
        assert_eq!(engine.exit_code(&job_id).await.unwrap(), Some(0));
        assert!(matches!(
            engine.control(&job_id, ControlAction::Suspend).await,
            Err(ExecError::InvalidState(_))
        ));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "# task-1 on w1\necho 'a b'\n");
        assert_eq!(engine.script().await, vec![written]);
    }
}
