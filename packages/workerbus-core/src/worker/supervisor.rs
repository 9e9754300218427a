//! Process supervisor for the worker.
//!
//! Owns spawning, writing to and killing the single worker process. Output
//! is delivered to the owner as [`SupervisorEvent`]s over one channel so
//! stdout lines and the exit report arrive in a single ordered stream.

use super::framer::LineFramer;
use crate::error::{BusError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How the worker process is launched.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable to run
    pub program: PathBuf,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory for the process (inherits ours when `None`)
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables on top of the inherited environment
    pub env: HashMap<String, String>,

    /// How long to wait for stdout to drain after the process exits before
    /// reporting the exit. Responses written just before exit must not be
    /// lost to a race with the exit report.
    pub drain_timeout: Duration,

    /// How long a completed job key suppresses repeated completions
    pub completion_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["-m".to_string(), "worker".to_string()],
            working_dir: None,
            env: HashMap::new(),
            drain_timeout: Duration::from_millis(500),
            completion_window: super::dedup::DEFAULT_COMPLETION_WINDOW,
        }
    }
}

/// Readiness of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    NotReady,
    Ready,
}

/// Output of a running worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// One complete line from stdout
    Line(String),
    /// The process with this generation exited
    Exited { generation: u64, code: Option<i32> },
}

struct RunningWorker {
    generation: u64,
    pid: Option<u32>,
    stdin: ChildStdin,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Supervises the worker process.
pub struct ProcessSupervisor {
    config: WorkerConfig,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    running: Option<RunningWorker>,
    generation: u64,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiver its events are delivered on.
    pub fn new(config: WorkerConfig) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                events_tx,
                running: None,
                generation: 0,
            },
            events_rx,
        )
    }

    /// A process being killed is still running but no longer ready.
    pub fn state(&self) -> ReadyState {
        match &self.running {
            Some(running) if running.kill_tx.is_some() => ReadyState::Ready,
            _ => ReadyState::NotReady,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadyState::Ready
    }

    /// Whether a process exists whose exit has not been reported yet.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Generation of the live process, if any.
    pub fn generation(&self) -> Option<u64> {
        self.running.as_ref().map(|r| r.generation)
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }

    /// Spawn the worker unless one is already running.
    ///
    /// Returns `true` if a new process was spawned.
    pub fn start(&mut self) -> Result<bool> {
        if self.running.is_some() {
            debug!("[worker] start requested but process already running");
            return Ok(false);
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        info!(
            program = %self.config.program.display(),
            args = ?self.config.args,
            "[worker] starting process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| BusError::StartFailed(format!("{}: {}", self.config.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BusError::StartFailed("failed to get stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BusError::StartFailed("failed to get stdout handle".to_string()))?;
        let stderr = child.stderr.take();

        self.generation += 1;
        let generation = self.generation;
        let pid = child.id();

        let stdout_task = spawn_stdout_task(stdout, self.events_tx.clone());
        if let Some(stderr) = stderr {
            spawn_stderr_task(stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let events_tx = self.events_tx.clone();
        let drain_timeout = self.config.drain_timeout;

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    info!(generation, "[worker] killing process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // Let stdout drain so responses written right before exit are delivered first.
            if tokio::time::timeout(drain_timeout, stdout_task).await.is_err() {
                warn!(generation, "[worker] stdout did not close after exit");
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(generation, "[worker] error waiting for process: {}", e);
                    None
                }
            };
            info!(generation, ?code, "[worker] process exited");
            let _ = events_tx.send(SupervisorEvent::Exited { generation, code });
        });

        info!(generation, ?pid, "[worker] process spawned");
        self.running = Some(RunningWorker {
            generation,
            pid,
            stdin,
            kill_tx: Some(kill_tx),
        });
        Ok(true)
    }

    /// Write one whole line to the worker's stdin and flush it.
    pub async fn write(&mut self, line: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(BusError::NotReady);
        }
        let running = self.running.as_mut().ok_or(BusError::NotReady)?;

        running
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BusError::WriteFailed(e.to_string()))?;
        running
            .stdin
            .flush()
            .await
            .map_err(|e| BusError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Record an exit report. Returns `true` if it concerned the live process,
    /// which is then forgotten. Reports from older generations are ignored.
    pub fn handle_exit(&mut self, generation: u64) -> bool {
        match &self.running {
            Some(running) if running.generation == generation => {
                self.running = None;
                true
            }
            _ => false,
        }
    }

    /// Ask the live process to die. The exit is reported as a normal
    /// [`SupervisorEvent::Exited`].
    pub fn kill(&mut self) {
        if let Some(running) = self.running.as_mut() {
            if let Some(kill_tx) = running.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
    }
}

fn spawn_stdout_task(
    mut stdout: ChildStdout,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut framer = LineFramer::new();
        let mut buf = vec![0u8; 8192];

        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        if tx.send(SupervisorEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("[worker] stdout read error: {}", e);
                    break;
                }
            }
        }

        if let Some(line) = framer.finish() {
            let _ = tx.send(SupervisorEvent::Line(line));
        }
    })
}

fn spawn_stderr_task(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                warn!("[worker stderr] {}", line.trim_end());
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> WorkerConfig {
        WorkerConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.program, PathBuf::from("python3"));
        assert_eq!(config.drain_timeout, Duration::from_millis(500));
        assert_eq!(config.completion_window, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_write_before_start_is_not_ready() {
        let (mut supervisor, _rx) = ProcessSupervisor::new(shell("cat"));
        assert_eq!(supervisor.state(), ReadyState::NotReady);
        assert_eq!(supervisor.write("x\n").await, Err(BusError::NotReady));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_echoes_lines() {
        let (mut supervisor, mut rx) = ProcessSupervisor::new(shell("cat"));
        assert!(supervisor.start().unwrap());
        assert!(!supervisor.start().unwrap());
        assert_eq!(supervisor.generation(), Some(1));

        supervisor.write("{\"id\":1}\n").await.unwrap();
        assert_eq!(rx.recv().await, Some(SupervisorEvent::Line("{\"id\":1}".to_string())));

        supervisor.kill();
        assert_eq!(
            rx.recv().await,
            Some(SupervisorEvent::Exited {
                generation: 1,
                code: None
            })
        );
        assert!(supervisor.handle_exit(1));
        assert_eq!(supervisor.state(), ReadyState::NotReady);
    }

    #[tokio::test]
    async fn test_output_before_exit_is_delivered_first() {
        let (mut supervisor, mut rx) = ProcessSupervisor::new(shell("echo first; echo second; exit 3"));
        supervisor.start().unwrap();

        assert_eq!(rx.recv().await, Some(SupervisorEvent::Line("first".to_string())));
        assert_eq!(rx.recv().await, Some(SupervisorEvent::Line("second".to_string())));
        assert_eq!(
            rx.recv().await,
            Some(SupervisorEvent::Exited {
                generation: 1,
                code: Some(3)
            })
        );
    }

    #[tokio::test]
    async fn test_killed_process_runs_until_exit_is_reported() {
        let (mut supervisor, mut rx) = ProcessSupervisor::new(shell("cat"));
        supervisor.start().unwrap();
        assert!(supervisor.is_ready());

        supervisor.kill();
        assert!(supervisor.is_running());
        assert!(!supervisor.is_ready());
        assert_eq!(supervisor.write("x\n").await, Err(BusError::NotReady));

        assert!(matches!(rx.recv().await, Some(SupervisorEvent::Exited { generation: 1, .. })));
        assert!(supervisor.handle_exit(1));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stale_exit_is_ignored() {
        let (mut supervisor, _rx) = ProcessSupervisor::new(shell("cat"));
        supervisor.start().unwrap();
        assert!(!supervisor.handle_exit(0));
        assert!(supervisor.is_ready());
        supervisor.kill();
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let config = WorkerConfig {
            program: PathBuf::from("/nonexistent/workerbus-test-binary"),
            args: Vec::new(),
            ..WorkerConfig::default()
        };
        let (mut supervisor, _rx) = ProcessSupervisor::new(config);
        assert!(matches!(supervisor.start(), Err(BusError::StartFailed(_))));
        assert_eq!(supervisor.state(), ReadyState::NotReady);
    }
}
