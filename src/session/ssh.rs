use std::collections::HashMap;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use openssh::{KnownHosts, Session};
use tokio::sync::Mutex;

use super::{ControlAction, JobState, LaunchHandle, SessionEngine};
use crate::command::{shell_quote, BuiltCommand};
use crate::error::{ExecError, Result};
use crate::node::NodeDescription;

/// One multiplexed SSH connection per destination, opened on first use.
#[derive(Default)]
pub struct SshPool {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SshPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session(&self, node: &NodeDescription) -> Result<Arc<Session>> {
        let destination = node.destination();
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&destination) {
            return Ok(Arc::clone(session));
        }
        let session = match Session::connect_mux(&destination, KnownHosts::Add).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(host = %destination, error = ?e, "Failed to connect to host");
                return Err(e.into());
            }
        };
        tracing::info!(host = %destination, "Connected to host");
        sessions.insert(destination, Arc::clone(&session));
        Ok(session)
    }

    /// Runs a shell script on the node and collects its output.
    pub async fn run(&self, node: &NodeDescription, script: &str) -> Result<Output> {
        let session = self.session(node).await?;
        let mut cmd = session.command("sh");
        cmd.arg("-c").raw_arg(shell_quote(script).into_owned());
        Ok(cmd.output().await?)
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (host, session) in sessions {
            tracing::info!(host = %host, "Terminating connection");
            match Arc::try_unwrap(session) {
                Ok(session) => {
                    if let Err(e) = session.close().await {
                        tracing::warn!(host = %host, error = %e, "Error while terminating");
                    }
                }
                // Still borrowed by an in-flight command; dropping the last clone closes it.
                Err(_) => tracing::debug!(host = %host, "Connection still in use"),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteJob {
    node: NodeDescription,
    pid: u32,
    /// Path prefix of the job's `.out` and `.exit` files.
    stem: String,
}

/// Runs commands as detached process groups on remote hosts.
///
/// Output goes to `<stem>.out` and the exit status to `<stem>.exit` in the remote work
/// directory, so jobs survive a dropped connection and are polled with short scripts.
pub struct SshEngine {
    pool: Arc<SshPool>,
    work_dir: String,
    jobs: Mutex<HashMap<String, RemoteJob>>,
}

impl SshEngine {
    pub fn new(pool: Arc<SshPool>, work_dir: impl Into<String>) -> Self {
        Self {
            pool,
            work_dir: work_dir.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    async fn job(&self, job_id: &str) -> Result<RemoteJob> {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ExecError::NoActiveSession(job_id.to_string()))
    }

    async fn run(&self, node: &NodeDescription, script: &str) -> Result<String> {
        let output = self.pool.run(node, script).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn signal(&self, job: &RemoteJob, action: ControlAction) -> Result<()> {
        let script = format!("kill -s {} -- -{}", action.signal(), job.pid);
        let output = self.pool.run(&job.node, &script).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ExecError::InvalidState(format!(
                "failed to deliver SIG{} to {} on {}: {}",
                action.signal(),
                job.pid,
                job.node.hostname,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn launch_script(handle: &LaunchHandle, command: &BuiltCommand, work_dir: &str, stem: &str) -> String {
    let mut inner = String::new();
    if let Some(dir) = &handle.working_dir {
        inner.push_str(&format!("cd {} && ", shell_quote(&dir.to_string_lossy())));
    }
    for (key, value) in &handle.env {
        inner.push_str(&format!("export {}={}; ", key, shell_quote(value)));
    }
    inner.push_str(&command.command_line());
    inner.push_str(&format!("; echo $? > {}.exit", stem));
    format!(
        "mkdir -p {wd} || exit 1; setsid nohup sh -c {inner} > {stem}.out 2>&1 < /dev/null & echo $!",
        wd = shell_quote(work_dir),
        inner = shell_quote(&inner),
        stem = stem,
    )
}

fn status_script(job: &RemoteJob) -> String {
    format!(
        "if [ -f {s}.exit ]; then echo exit $(cat {s}.exit); \
         else ps -o stat= -p {pid} || {{ [ -f {s}.exit ] && echo exit $(cat {s}.exit) || echo gone; }}; fi",
        s = job.stem,
        pid = job.pid
    )
}

/// Interprets the output of the remote status script.
pub fn parse_remote_status(output: &str) -> JobState {
    let output = output.trim();
    if let Some(code) = output.strip_prefix("exit") {
        return match code.trim().parse::<i32>() {
            Ok(0) => JobState::Done,
            Ok(_) => JobState::Failed,
            Err(_) => JobState::Undetermined,
        };
    }
    match output.chars().next() {
        None => JobState::Undetermined,
        Some(_) if output == "gone" => JobState::Failed,
        Some('T') => JobState::Suspended,
        Some(_) => JobState::Running,
    }
}

#[async_trait]
impl SessionEngine for SshEngine {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn launch(&self, handle: LaunchHandle, command: &BuiltCommand) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let stem = format!("{}/{}", self.work_dir.trim_end_matches('/'), id);
        let script = launch_script(&handle, command, &self.work_dir, &stem);
        let output = self.pool.run(&handle.node, &script).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = match stdout.trim().parse::<u32>() {
            Ok(pid) if output.status.success() => pid,
            _ => {
                return Err(ExecError::Submission(format!(
                    "failed to launch on {}: {}",
                    handle.node.hostname,
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        };
        let job_id = format!("ssh-{}", id);
        tracing::info!(
            job_id = %job_id,
            job_name = %handle.job_name,
            host = %handle.node.hostname,
            pid,
            "Launched remote process"
        );
        self.jobs.lock().await.insert(
            job_id.clone(),
            RemoteJob {
                node: handle.node,
                pid,
                stem,
            },
        );
        Ok(job_id)
    }

    async fn control(&self, job_id: &str, action: ControlAction) -> Result<()> {
        let job = self.job(job_id).await?;
        let state = parse_remote_status(&self.run(&job.node, &status_script(&job)).await?);
        match (state, action) {
            (JobState::Done | JobState::Failed, _) => {
                return Err(ExecError::InvalidState(format!(
                    "job {} already finished",
                    job_id
                )))
            }
            (JobState::Suspended, ControlAction::Suspend) => {
                return Err(ExecError::InvalidState(format!(
                    "job {} is already suspended",
                    job_id
                )))
            }
            (JobState::Suspended, _) | (_, ControlAction::Suspend) => {}
            (_, ControlAction::Resume) => {
                return Err(ExecError::InvalidState(format!(
                    "job {} is not suspended",
                    job_id
                )))
            }
            (_, ControlAction::Terminate) => {}
        }
        self.signal(&job, action).await?;
        if action == ControlAction::Terminate && state == JobState::Suspended {
            self.signal(&job, ControlAction::Resume).await?;
        }
        tracing::debug!(job_id, ?action, "Control action delivered");
        Ok(())
    }

    async fn query_status(&self, job_id: &str) -> Result<JobState> {
        let job = self.job(job_id).await?;
        let output = self.run(&job.node, &status_script(&job)).await?;
        Ok(parse_remote_status(&output))
    }

    async fn capture_output(&self, job_id: &str) -> Result<String> {
        let job = self.job(job_id).await?;
        self.run(&job.node, &format!("cat {}.out 2>/dev/null", job.stem))
            .await
    }

    async fn exit_code(&self, job_id: &str) -> Result<Option<i32>> {
        let job = self.job(job_id).await?;
        let output = self
            .run(&job.node, &format!("cat {}.exit 2>/dev/null", job.stem))
            .await?;
        Ok(output.trim().parse().ok())
    }

    async fn cleanup(&self, job_id: &str) -> Result<()> {
        let job = match self.jobs.lock().await.remove(job_id) {
            Some(job) => job,
            None => return Ok(()),
        };
        self.run(&job.node, &format!("rm -f {s}.out {s}.exit", s = job.stem))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Flavor;
    use std::path::PathBuf;

    #[test]
    fn test_parse_remote_status() {
        assert_eq!(parse_remote_status("exit 0\n"), JobState::Done);
        assert_eq!(parse_remote_status("exit 137"), JobState::Failed);
        assert_eq!(parse_remote_status("gone"), JobState::Failed);
        assert_eq!(parse_remote_status("T\n"), JobState::Suspended);
        assert_eq!(parse_remote_status("Ss"), JobState::Running);
        assert_eq!(parse_remote_status("R+"), JobState::Running);
        assert_eq!(parse_remote_status(""), JobState::Undetermined);
        assert_eq!(parse_remote_status("exit ?"), JobState::Undetermined);
    }

    #[test]
    fn test_launch_script() {
        let handle = LaunchHandle {
            job_name: "task-3".into(),
            node: NodeDescription::new("w1", Flavor::default()),
            working_dir: Some(PathBuf::from("/data/ws")),
            env: vec![("EOFLOW_TASK".into(), "task 3".into())],
        };
        let command = BuiltCommand::new("gdalinfo", vec!["in.tif".into()]);
        let script = launch_script(&handle, &command, "/tmp/eoflow", "/tmp/eoflow/abc");
        assert!(script.starts_with("mkdir -p /tmp/eoflow || exit 1; setsid nohup sh -c '"));
        assert!(script.contains("cd /data/ws && export EOFLOW_TASK="));
        assert!(script.contains("gdalinfo in.tif; echo $? > /tmp/eoflow/abc.exit"));
        assert!(script.ends_with("> /tmp/eoflow/abc.out 2>&1 < /dev/null & echo $!"));
    }
}
