use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::{ControlAction, JobState, LaunchHandle, SessionEngine};
use crate::command::BuiltCommand;
use crate::error::{ExecError, Result};

/// How long output pipes may stay open after the process exited. Background children that
/// inherited them can keep them open indefinitely.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

struct LocalJob {
    child: Child,
    pid: u32,
    output: Arc<Mutex<String>>,
    pumps: Vec<JoinHandle<()>>,
    suspended: bool,
    exit: Option<ExitStatus>,
}

impl LocalJob {
    fn refresh(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }
}

/// Runs commands as child processes of this process, each in its own process group.
#[derive(Default)]
pub struct LocalEngine {
    jobs: AsyncMutex<HashMap<String, LocalJob>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn signal_group(pid: u32, signal: &str) -> Result<()> {
    let status = Command::new("kill")
        .arg("-s")
        .arg(signal)
        .arg("--")
        .arg(format!("-{}", pid))
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(ExecError::InvalidState(format!(
            "failed to deliver SIG{} to process group {} ({})",
            signal, pid, status
        )))
    }
}

#[async_trait]
impl SessionEngine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, handle: LaunchHandle, command: &BuiltCommand) -> Result<String> {
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .envs(handle.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &handle.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            ExecError::Submission(format!("failed to spawn '{}': {}", command.executable, e))
        })?;
        let pid = child.id().ok_or_else(|| {
            ExecError::Submission(format!("'{}' exited before it got a pid", command))
        })?;

        let output = Arc::new(Mutex::new(String::new()));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Arc::clone(&output))));
        }

        let job_id = format!("local-{}", pid);
        tracing::info!(job_id = %job_id, job_name = %handle.job_name, "Launched local process");
        self.jobs.lock().await.insert(
            job_id.clone(),
            LocalJob {
                child,
                pid,
                output,
                pumps,
                suspended: false,
                exit: None,
            },
        );
        Ok(job_id)
    }

    async fn control(&self, job_id: &str, action: ControlAction) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ExecError::NoActiveSession(job_id.to_string()))?;
        if let Some(status) = job.refresh()? {
            return Err(ExecError::InvalidState(format!(
                "job {} already finished ({})",
                job_id, status
            )));
        }
        match action {
            ControlAction::Suspend => {
                if job.suspended {
                    return Err(ExecError::InvalidState(format!(
                        "job {} is already suspended",
                        job_id
                    )));
                }
                signal_group(job.pid, action.signal()).await?;
                job.suspended = true;
            }
            ControlAction::Resume => {
                if !job.suspended {
                    return Err(ExecError::InvalidState(format!(
                        "job {} is not suspended",
                        job_id
                    )));
                }
                signal_group(job.pid, action.signal()).await?;
                job.suspended = false;
            }
            ControlAction::Terminate => {
                signal_group(job.pid, action.signal()).await?;
                if job.suspended {
                    // Stopped processes only act on TERM once continued.
                    signal_group(job.pid, ControlAction::Resume.signal()).await?;
                    job.suspended = false;
                }
            }
        }
        tracing::debug!(job_id, ?action, "Control action delivered");
        Ok(())
    }

    async fn query_status(&self, job_id: &str) -> Result<JobState> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ExecError::NoActiveSession(job_id.to_string()))?;
        Ok(match job.refresh()? {
            Some(status) if status.success() => JobState::Done,
            Some(_) => JobState::Failed,
            None if job.suspended => JobState::Suspended,
            None => JobState::Running,
        })
    }

    async fn capture_output(&self, job_id: &str) -> Result<String> {
        let (output, pumps) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| ExecError::NoActiveSession(job_id.to_string()))?;
            let pumps: Vec<_> = match job.refresh()? {
                Some(_) => job.pumps.drain(..).collect(),
                None => Vec::new(),
            };
            (Arc::clone(&job.output), pumps)
        };

        // Drain the pipes once the process is gone, without holding up other jobs.
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
        for mut pump in pumps {
            if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
                tracing::debug!(job_id, "Output pipe still open after exit, giving up on it");
                pump.abort();
            }
        }
        let output = output.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(output.clone())
    }

    async fn exit_code(&self, job_id: &str) -> Result<Option<i32>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ExecError::NoActiveSession(job_id.to_string()))?;
        Ok(job.refresh()?.and_then(|status| status.code()))
    }

    async fn cleanup(&self, job_id: &str) -> Result<()> {
        if let Some(mut job) = self.jobs.lock().await.remove(job_id) {
            if job.refresh()?.is_none() {
                tracing::warn!(job_id, "Cleaning up a job that is still running");
            }
            for pump in job.pumps.drain(..) {
                pump.abort();
            }
        }
        Ok(())
    }
}

/// Appends a stream to the captured output line by line.
async fn pump<R: AsyncRead + Unpin>(stream: R, output: Arc<Mutex<String>>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(reader.buffer().len());
    loop {
        buf.clear();
        if let Err(e) = read_until2(&mut reader, b'\r', b'\n', &mut buf).await {
            tracing::warn!(error = %e, "Failed to read process output");
            break;
        }
        // An empty buffer means that EOF was reached.
        if buf.is_empty() {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
        output.push_str(line.trim_end_matches(['\r', '\n']));
        output.push('\n');
    }
}

/// Reads into `buf` until either delimiter (included) or EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::node::{Flavor, NodeDescription};

    fn handle(engine: &LocalEngine) -> LaunchHandle {
        engine.create_handle("test", &NodeDescription::new("localhost", Flavor::default()))
    }

    async fn wait_for(engine: &LocalEngine, job_id: &str, state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.query_status(job_id).await.unwrap() != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {} never reached {}", job_id, state));
    }

    #[tokio::test]
    async fn test_run_and_capture() {
        let engine = LocalEngine::new();
        let command = BuiltCommand::new(
            "sh",
            vec!["-c".into(), "echo hello; echo oops 1>&2".into()],
        );
        let job_id = engine.launch(handle(&engine), &command).await.unwrap();
        wait_for(&engine, &job_id, JobState::Done).await;
        let output = engine.capture_output(&job_id).await.unwrap();
        assert!(output.contains("hello\n"));
        assert!(output.contains("oops\n"));
        assert_eq!(engine.exit_code(&job_id).await.unwrap(), Some(0));
        engine.cleanup(&job_id).await.unwrap();
        assert!(matches!(
            engine.query_status(&job_id).await,
            Err(ExecError::NoActiveSession(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_with_background_child_does_not_block() {
        let engine = LocalEngine::new();
        let command = BuiltCommand::new("sh", vec!["-c".into(), "sleep 20 & echo hi".into()]);
        let job_id = engine.launch(handle(&engine), &command).await.unwrap();
        wait_for(&engine, &job_id, JobState::Done).await;

        let capture = engine.capture_output(&job_id);
        let other = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::time::timeout(Duration::from_secs(1), engine.query_status("local-999999")).await
        };
        let (output, other) = tokio::join!(
            tokio::time::timeout(OUTPUT_DRAIN + Duration::from_secs(3), capture),
            other
        );
        assert!(output.unwrap().unwrap().contains("hi\n"));
        assert!(matches!(other, Ok(Err(ExecError::NoActiveSession(_)))));

        // Pumps are gone, so a second capture returns at once.
        let again = tokio::time::timeout(Duration::from_millis(500), engine.capture_output(&job_id));
        assert!(again.await.unwrap().unwrap().contains("hi\n"));

        let pid: u32 = job_id.trim_start_matches("local-").parse().unwrap();
        let _ = signal_group(pid, "KILL").await;
        engine.cleanup(&job_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_exit_code() {
        let engine = LocalEngine::new();
        let command = BuiltCommand::new("sh", vec!["-c".into(), "exit 3".into()]);
        let job_id = engine.launch(handle(&engine), &command).await.unwrap();
        wait_for(&engine, &job_id, JobState::Failed).await;
        assert_eq!(engine.exit_code(&job_id).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_submission_error() {
        let engine = LocalEngine::new();
        let command = BuiltCommand::new("/definitely/not/a/binary", vec![]);
        assert!(matches!(
            engine.launch(handle(&engine), &command).await,
            Err(ExecError::Submission(_))
        ));
    }

    #[tokio::test]
    async fn test_suspend_resume_terminate() {
        let engine = LocalEngine::new();
        let command = BuiltCommand::new("sleep", vec!["30".into()]);
        let job_id = engine.launch(handle(&engine), &command).await.unwrap();
        assert!(matches!(
            engine.control(&job_id, ControlAction::Resume).await,
            Err(ExecError::InvalidState(_))
        ));
        engine
            .control(&job_id, ControlAction::Suspend)
            .await
            .unwrap();
        assert_eq!(
            engine.query_status(&job_id).await.unwrap(),
            JobState::Suspended
        );
        engine.control(&job_id, ControlAction::Resume).await.unwrap();
        assert_eq!(engine.query_status(&job_id).await.unwrap(), JobState::Running);
        engine
            .control(&job_id, ControlAction::Terminate)
            .await
            .unwrap();
        wait_for(&engine, &job_id, JobState::Failed).await;
        assert!(matches!(
            engine.control(&job_id, ControlAction::Suspend).await,
            Err(ExecError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let engine = LocalEngine::new();
        assert!(matches!(
            engine.control("local-1", ControlAction::Resume).await,
            Err(ExecError::NoActiveSession(_))
        ));
    }
}
