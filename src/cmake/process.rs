//! Supervision of a single `cmake` configure run
//!
//! Output is forwarded line by line as [`ProcessEvent`]s. Stdout goes through
//! the progress parser, stderr through the diagnostic parser. Cancellation is
//! polled on a fixed interval; a cancelled run is terminated and reported as
//! [`RunOutcome::Canceled`].

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cmake::output_parser::{
    CMakeDiagnosticParser, OutputEvent, OutputLineParser, ParserChain, ProgressParser,
};
use crate::cmake::parameters::BuildDirParameters;
use crate::io::{
    ChildProcessManager, OutputMonitor, ProcessError, ProcessExit, ProcessManager, StopMode,
};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// A cancelled run still alive this long after SIGTERM is killed
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Exit code reported when no exit code is available
pub const NO_EXIT_CODE: i32 = -1;

/// Everything a configure run reports to the build-system output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// A line written by the runner itself
    Message(String),
    Parsed(OutputEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed { code: i32 },
    Canceled,
    Crashed,
    /// Preconditions failed, no process was spawned
    NotStarted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failed { code } => *code,
            RunOutcome::Canceled | RunOutcome::Crashed | RunOutcome::NotStarted => NO_EXIT_CODE,
        }
    }

    /// Line appended to the output log when the run did not succeed
    pub fn message(&self) -> Option<String> {
        match self {
            RunOutcome::Success | RunOutcome::NotStarted => None,
            RunOutcome::Failed { code } => {
                Some(format!("CMake process exited with exit code {code}."))
            }
            RunOutcome::Canceled => Some("CMake process was canceled by the user.".to_string()),
            RunOutcome::Crashed => Some("CMake process crashed.".to_string()),
        }
    }

    /// Classify how a started process ended
    pub fn from_exit(exit: Result<ProcessExit, ProcessError>, cancel_requested: bool) -> Self {
        match exit {
            Ok(ProcessExit { code: Some(0), .. }) => RunOutcome::Success,
            Ok(exit) if cancel_requested || exit.terminated => RunOutcome::Canceled,
            Ok(ProcessExit {
                code: Some(code), ..
            }) => RunOutcome::Failed { code },
            Ok(ProcessExit { code: None, .. }) | Err(_) => RunOutcome::Crashed,
        }
    }
}

/// Runs cmake for one configure cycle
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigureRunner: Send + Sync {
    /// Configure `parameters.build_directory` with `arguments`, terminating
    /// the process once `cancel` fires
    async fn run(
        &self,
        parameters: &BuildDirParameters,
        arguments: &[String],
        cancel: CancellationToken,
    ) -> RunOutcome;
}

/// [`ConfigureRunner`] spawning the real cmake executable
pub struct CMakeProcess {
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl CMakeProcess {
    pub fn new(events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self { events }
    }

    fn message(&self, text: String) {
        info!(target: "cmake_sync::process", "{}", text);
        let _ = self.events.send(ProcessEvent::Message(text));
    }

    async fn execute(
        &self,
        parameters: &BuildDirParameters,
        arguments: &[String],
        cancel: CancellationToken,
    ) -> RunOutcome {
        let Some(executable) = parameters.cmake_executable() else {
            self.message("No CMake tool set up.".to_string());
            return RunOutcome::NotStarted;
        };
        let build_directory = &parameters.build_directory;

        if !build_directory.is_dir() {
            self.message(format!(
                "The build directory \"{}\" does not exist",
                build_directory.display()
            ));
            return RunOutcome::NotStarted;
        }

        if !same_device(executable, build_directory) {
            self.message(format!(
                "CMake executable \"{}\" and build directory \"{}\" must be on the same device.",
                executable.display(),
                build_directory.display()
            ));
            return RunOutcome::NotStarted;
        }

        let mut args = vec![
            "-S".to_string(),
            parameters.source_directory.display().to_string(),
            "-B".to_string(),
            build_directory.display().to_string(),
        ];
        args.extend(parameters.generator_arguments());
        args.extend(arguments.iter().cloned());

        let mut process =
            ChildProcessManager::new(executable, args, Some(build_directory.clone()))
                .with_environment(parameters.environment.clone());

        let stdout_events = self.events.clone();
        let progress = Mutex::new(ProgressParser::default());
        process.on_stdout_line(move |line| {
            let parsed = progress
                .lock()
                .ok()
                .and_then(|mut parser| parser.parse_line(&line));
            let _ = stdout_events.send(ProcessEvent::Stdout(line));
            if let Some(event) = parsed {
                let _ = stdout_events.send(ProcessEvent::Parsed(event));
            }
        });

        let diagnostics = Arc::new(Mutex::new(
            ParserChain::new().with(CMakeDiagnosticParser::default()),
        ));
        let stderr_events = self.events.clone();
        let stderr_parsers = Arc::clone(&diagnostics);
        process.on_stderr_line(move |line| {
            warn!(target: "cmake_sync::process", "cmake: {}", line);
            let parsed = stderr_parsers
                .lock()
                .map(|mut chain| chain.parse_line(&line))
                .unwrap_or_default();
            let _ = stderr_events.send(ProcessEvent::Stderr(line));
            for event in parsed {
                let _ = stderr_events.send(ProcessEvent::Parsed(event));
            }
        });

        self.message(format!(
            "Running {} in {}.",
            process.command_line(),
            build_directory.display()
        ));
        let started = Instant::now();

        if let Err(e) = process.start().await {
            self.message(format!("The process failed to start: {e}"));
            return RunOutcome::NotStarted;
        }

        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        let mut cancel_requested = false;
        let mut terminated_at: Option<Instant> = None;
        let mut killed = false;
        let exit = loop {
            tokio::select! {
                exit = process.wait() => break exit,
                _ = ticker.tick() => {
                    if !cancel_requested && cancel.is_cancelled() {
                        cancel_requested = true;
                        terminated_at = Some(Instant::now());
                        debug!(target: "cmake_sync::process", "Terminating cancelled cmake run");
                        if let Err(e) = process.stop(StopMode::Graceful).await {
                            warn!(target: "cmake_sync::process", "Failed to stop cmake: {}", e);
                        }
                    } else if !killed
                        && terminated_at.is_some_and(|at| at.elapsed() >= KILL_GRACE_PERIOD)
                    {
                        killed = true;
                        warn!(target: "cmake_sync::process", "cmake ignored SIGTERM, killing it");
                        if let Err(e) = process.stop(StopMode::Force).await {
                            warn!(target: "cmake_sync::process", "Failed to kill cmake: {}", e);
                        }
                    }
                }
            }
        };

        if let Ok(mut chain) = diagnostics.lock() {
            for event in chain.flush() {
                let _ = self.events.send(ProcessEvent::Parsed(event));
            }
        }

        let outcome = RunOutcome::from_exit(exit, cancel_requested);
        if let Some(text) = outcome.message() {
            self.message(text);
        }
        self.message(format!(
            "Elapsed time: {}.",
            format_elapsed(started.elapsed())
        ));
        outcome
    }
}

#[async_trait]
impl ConfigureRunner for CMakeProcess {
    async fn run(
        &self,
        parameters: &BuildDirParameters,
        arguments: &[String],
        cancel: CancellationToken,
    ) -> RunOutcome {
        self.execute(parameters, arguments, cancel).await
    }
}

/// `scheme://host` prefix of a path on a remote device, `None` for local paths
fn device_of(path: &Path) -> Option<String> {
    let text = path.to_str()?;
    let (scheme, rest) = text.split_once("://")?;
    let host = rest.split('/').next().unwrap_or_default();
    Some(format!("{scheme}://{host}"))
}

fn same_device(executable: &Path, build_directory: &Path) -> bool {
    match device_of(executable) {
        None => true,
        remote => remote == device_of(build_directory),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmake::output_parser::Severity;
    use crate::cmake::tool::CMakeTool;
    use std::path::PathBuf;

    fn collect(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn messages(events: &[ProcessEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Message(m) => Some(m.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_outcome_classification() {
        let exit = |code, terminated| Ok(ProcessExit { code, terminated });

        assert_eq!(RunOutcome::from_exit(exit(Some(0), false), false), RunOutcome::Success);
        assert_eq!(
            RunOutcome::from_exit(exit(Some(1), false), false),
            RunOutcome::Failed { code: 1 }
        );
        assert_eq!(RunOutcome::from_exit(exit(None, true), true), RunOutcome::Canceled);
        assert_eq!(RunOutcome::from_exit(exit(Some(143), false), true), RunOutcome::Canceled);
        assert_eq!(RunOutcome::from_exit(exit(None, false), false), RunOutcome::Crashed);
        assert_eq!(
            RunOutcome::from_exit(Err(ProcessError::ExitStatusLost), false),
            RunOutcome::Crashed
        );
    }

    #[test]
    fn test_outcome_codes_and_messages() {
        assert_eq!(RunOutcome::Success.exit_code(), 0);
        assert_eq!(RunOutcome::Failed { code: 2 }.exit_code(), 2);
        assert_ne!(RunOutcome::Canceled.exit_code(), 0);
        assert_ne!(RunOutcome::Crashed.exit_code(), 0);
        assert_eq!(RunOutcome::NotStarted.exit_code(), NO_EXIT_CODE);

        assert_eq!(RunOutcome::Success.message(), None);
        assert_eq!(
            RunOutcome::Failed { code: 2 }.message().as_deref(),
            Some("CMake process exited with exit code 2.")
        );
        assert_eq!(
            RunOutcome::Canceled.message().as_deref(),
            Some("CMake process was canceled by the user.")
        );
        assert_eq!(
            RunOutcome::Crashed.message().as_deref(),
            Some("CMake process crashed.")
        );
    }

    #[test]
    fn test_device_check() {
        assert!(same_device(Path::new("/usr/bin/cmake"), Path::new("/build")));
        assert!(!same_device(
            Path::new("docker://builder/usr/bin/cmake"),
            Path::new("/build")
        ));
        assert!(same_device(
            Path::new("ssh://host/usr/bin/cmake"),
            Path::new("ssh://host/home/me/build")
        ));
        assert_eq!(format_elapsed(Duration::from_secs(75)), "01:15");
    }

    #[tokio::test]
    async fn test_missing_build_directory_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(CMakeTool::new("default", "/usr/bin/cmake"));
        let parameters =
            BuildDirParameters::new(dir.path(), dir.path().join("missing"), Some(tool));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = CMakeProcess::new(tx);
        let outcome = runner
            .run(&parameters, &[], CancellationToken::new())
            .await;

        assert_eq!(outcome, RunOutcome::NotStarted);
        assert_eq!(outcome.exit_code(), NO_EXIT_CODE);
        let events = collect(&mut rx);
        assert_eq!(messages(&events).len(), 1);
        assert!(messages(&events)[0].contains("does not exist"));
    }

    #[tokio::test]
    async fn test_remote_executable_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(CMakeTool::new("remote", "ssh://builder/usr/bin/cmake"));
        let parameters = BuildDirParameters::new(dir.path(), dir.path(), Some(tool));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = CMakeProcess::new(tx)
            .run(&parameters, &[], CancellationToken::new())
            .await;

        assert_eq!(outcome, RunOutcome::NotStarted);
        assert!(messages(&collect(&mut rx))[0].contains("must be on the same device"));
    }

    #[cfg(unix)]
    fn fake_cmake(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-cmake.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_reports_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cmake(
            dir.path(),
            "echo '-- Configuring incomplete, errors occurred!'\n\
             echo 'CMake Error at CMakeLists.txt:3 (project):' >&2\n\
             echo '  boom' >&2\n\
             exit 3",
        );
        let tool = Arc::new(CMakeTool::new("fake", script));
        let parameters = BuildDirParameters::new(dir.path(), dir.path(), Some(tool));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = CMakeProcess::new(tx);
        let outcome = runner
            .run(&parameters, &["-DFOO=1".to_string()], CancellationToken::new())
            .await;

        assert_eq!(outcome, RunOutcome::Failed { code: 3 });
        assert_eq!(outcome.exit_code(), 3);

        let events = collect(&mut rx);
        assert!(messages(&events)[0].starts_with("Running "));
        assert!(messages(&events)[0].contains("-DFOO=1"));
        assert!(messages(&events).contains(&"CMake process exited with exit code 3."));
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessEvent::Parsed(OutputEvent::Diagnostic(d))
                if d.severity == Severity::Error && d.message == "boom" && d.line == Some(3)
        )));
        assert!(events.iter().any(|e| matches!(e, ProcessEvent::Stderr(l) if l == "  boom")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_run() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cmake(dir.path(), "exec sleep 30");
        let tool = Arc::new(CMakeTool::new("fake", script));
        let parameters = BuildDirParameters::new(dir.path(), dir.path(), Some(tool));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = CMakeProcess::new(tx);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(&parameters, &[], cancel),
        )
        .await
        .expect("cancelled run should finish");

        assert_eq!(outcome, RunOutcome::Canceled);
        assert!(messages(&collect(&mut rx)).contains(&"CMake process was canceled by the user."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_run_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cmake(dir.path(), "trap '' TERM\nexec sleep 60");
        let tool = Arc::new(CMakeTool::new("fake", script));
        let parameters = BuildDirParameters::new(dir.path(), dir.path(), Some(tool));

        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = CMakeProcess::new(tx);
        let cancel = CancellationToken::new();

        // Give the script time to install its trap
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            runner.run(&parameters, &[], cancel),
        )
        .await
        .expect("stubborn run should be killed");

        assert_eq!(outcome, RunOutcome::Canceled);
        assert!(started.elapsed() >= KILL_GRACE_PERIOD);
    }
}
