//! Process management layer
//!
//! Runs an external program to completion while streaming its stdout and
//! stderr line by line to installed handlers. The child is owned by a wait
//! task which publishes the exit through a watch channel, so waiting and
//! stopping only need a shared reference.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
// warn! is used in non-unix code blocks
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

/// Time granted to the output monitors to drain after the child exited
const MONITOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM on unix, force kill elsewhere
    Graceful,
    /// Kill immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited (on its own or because it was stopped)
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code for a normal exit, `None` when the process died abnormally
    pub code: Option<i32>,
    /// Whether `stop()` was requested before the process ended
    pub terminated: bool,
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

// ============================================================================
// Output Monitoring Trait
// ============================================================================

type LineHandler = Box<dyn Fn(String) + Send + Sync>;

/// Trait for receiving the output of an external process line by line
pub trait OutputMonitor: Send + Sync {
    /// Install a handler for stdout lines, replacing any previous one
    fn on_stdout_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;

    /// Install a handler for stderr lines, replacing any previous one
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("Process supervision ended without an exit status")]
    ExitStatusLost,
}

/// Trait for managing an external process that runs to completion
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Spawn the process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Ask the process to terminate; the exit is still reported by `wait`
    async fn stop(&self, mode: StopMode) -> Result<(), Self::Error>;

    /// Wait until the process has exited and all of its output was delivered
    async fn wait(&self) -> Result<ProcessExit, Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;
}

/// Manages a child process spawned via Command
pub struct ChildProcessManager {
    program: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    environment: Vec<(String, String)>,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    stdout_handler: Option<LineHandler>,
    stderr_handler: Option<LineHandler>,

    /// Waits for the child, drains the monitors and publishes the exit
    wait_task: Option<JoinHandle<()>>,
    exit_rx: Option<watch::Receiver<Option<ProcessExit>>>,

    kill: Arc<Notify>,
    stop_requested: Arc<AtomicBool>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `program` - The executable to run
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            working_directory: working_dir,
            environment: Vec::new(),
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdout_handler: None,
            stderr_handler: None,
            wait_task: None,
            exit_rx: None,
            kill: Arc::new(Notify::new()),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Extra environment variables for the child, on top of the inherited ones
    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    /// Full command line, for logging
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Spawn a task reading lines from one of the child's pipes
    ///
    /// Always drains the pipe so the child never blocks on a full buffer.
    fn spawn_line_monitor<R>(
        stream: R,
        handler: Option<LineHandler>,
        name: &'static str,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting {} monitoring (handler: {})",
                name,
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: {} EOF reached", name);
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim_end_matches(['\r', '\n']).to_string();
                        if let Some(ref handler) = handler {
                            handler(line_content);
                        } else {
                            trace!("ChildProcessManager: {} drained: {}", name, line_content);
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from {}: {}", name, e);
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the wait task that owns the child until it exits
    fn spawn_wait_task(&mut self, mut child: Child, monitors: Vec<JoinHandle<()>>, pid: u32) {
        let state = Arc::clone(&self.state);
        let kill = Arc::clone(&self.kill);
        let stop_requested = Arc::clone(&self.stop_requested);
        let (exit_tx, exit_rx) = watch::channel(None);
        self.exit_rx = Some(exit_rx);

        let task = tokio::spawn(async move {
            trace!("ChildProcessManager: Starting wait task for PID {}", pid);

            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.notified() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill process {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            for monitor in monitors {
                let abort = monitor.abort_handle();
                if tokio::time::timeout(MONITOR_DRAIN_TIMEOUT, monitor)
                    .await
                    .is_err()
                {
                    debug!("Output of process {} still open after exit", pid);
                    abort.abort();
                }
            }

            let code = match status {
                Ok(exit_status) => {
                    info!("Process PID {} exited with status: {}", pid, exit_status);
                    exit_status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    None
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }

            let _ = exit_tx.send(Some(ProcessExit {
                code,
                terminated: stop_requested.load(Ordering::SeqCst),
            }));
        });

        self.wait_task = Some(task);
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.get_state() != ProcessState::NotStarted {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {}", self.command_line());

        let mut command_builder = Command::new(&self.program);
        command_builder
            .args(&self.args)
            .envs(self.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn()?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::Io(io::Error::other(
                "Failed to get process ID",
            )));
        };
        info!("Process started with PID: {}", pid);

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Running { pid };

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        let monitors = vec![
            Self::spawn_line_monitor(stdout, self.stdout_handler.take(), "stdout"),
            Self::spawn_line_monitor(stderr, self.stderr_handler.take(), "stderr"),
        ];

        self.spawn_wait_task(child, monitors, pid);
        Ok(())
    }

    async fn stop(&self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };
        self.stop_requested.store(true, Ordering::SeqCst);

        match mode {
            #[cfg(unix)]
            StopMode::Graceful => {
                info!("Gracefully stopping process with PID: {}", pid);
                // SAFETY: plain signal delivery to a pid we spawned and still supervise
                if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                    info!("Sent SIGTERM to process {}", pid);
                } else {
                    self.kill.notify_one();
                }
            }
            #[cfg(not(unix))]
            StopMode::Graceful => {
                warn!("Graceful termination unavailable, killing process {}", pid);
                self.kill.notify_one();
            }
            StopMode::Force => {
                info!("Force killing process with PID: {}", pid);
                self.kill.notify_one();
            }
        }

        Ok(())
    }

    async fn wait(&self) -> Result<ProcessExit, Self::Error> {
        let mut exit_rx = self.exit_rx.clone().ok_or(ProcessError::NotStarted)?;
        let exit = exit_rx
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| ProcessError::ExitStatusLost)?;
        (*exit).ok_or(ProcessError::ExitStatusLost)
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }
}

impl OutputMonitor for ChildProcessManager {
    fn on_stdout_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stdout_handler = Some(Box::new(handler));
    }

    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill.notify_one();
        }
    }
}
