//! Top-level coordination of one build directory
//!
//! [`BuildSystem`] runs a file-system scan of the source directory next to a
//! [`Reader`] parse and publishes a merged [`ProjectModel`] once both are
//! done. A failed parse still publishes a model built from the scan alone.
//!
//! Requests are debounced and their [`ReparseFlags`] accumulate until the
//! parse is dispatched. All state changes happen inside
//! [`BuildSystem::next_event`], which the owner polls.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::cmake::config_item::CMakeConfig;
use crate::cmake::ctest::{self, TestCaseInfo};
use crate::cmake::error::{BuildSystemError, CMakeError};
use crate::cmake::parameters::BuildDirParameters;
use crate::cmake::process::{CMakeProcess, ConfigureRunner, ProcessEvent};
use crate::cmake::reader::{Reader, ReaderEvent};
use crate::file_api::model::TargetType;
use crate::file_api::parser::{REPLY_BACKUP_DIR, reply_directory};
use crate::file_api::tree::{FileType, add_cmake_lists, add_file_system_nodes};
use crate::file_api::{CMakeBuildTarget, LibrarySearchPolicy, ProjectNode, RawProjectPart};
use crate::io::file_system::{clean_path, remove_path};
use crate::io::{ChildProcessManager, OutputMonitor, ProcessManager};
use crate::log_timing;
use crate::project::{ProjectError, ScanOptions, TreeScanner};

pub const RESTORED_FROM_BACKUP_WARNING: &str =
    "CMake configuration failed. The backup of the previous configuration has been restored.";
pub const FAILED_TO_LOAD_WARNING: &str = "Failed to load project";

/// Requirements a parse request adds to the next dispatched parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReparseFlags(u8);

impl ReparseFlags {
    pub const DEFAULT: Self = Self(0);
    pub const FORCE_CMAKE_RUN: Self = Self(1);
    pub const FORCE_INITIAL_CONFIGURATION: Self = Self(1 << 1);
    pub const FORCE_EXTRA_CONFIGURATION: Self = Self(1 << 2);
    /// Skip the debounce delay
    pub const URGENT: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

}

impl BitOr for ReparseFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReparseFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ReparseFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for ReparseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<NONE>");
        }
        let names: Vec<&str> = [
            (Self::FORCE_CMAKE_RUN, "FORCE_CMAKE_RUN"),
            (Self::FORCE_INITIAL_CONFIGURATION, "FORCE_INITIAL_CONFIGURATION"),
            (Self::FORCE_EXTRA_CONFIGURATION, "FORCE_EXTRA_CONFIGURATION"),
            (Self::URGENT, "URGENT"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        f.write_str(&names.join(" | "))
    }
}

#[derive(Debug, Clone)]
pub struct BuildSystemSettings {
    /// Debounce delay for requests without [`ReparseFlags::URGENT`]
    pub parse_delay: Duration,
    pub library_search_policy: LibrarySearchPolicy,
    pub scan_options: ScanOptions,
}

impl Default for BuildSystemSettings {
    fn default() -> Self {
        Self {
            parse_delay: Duration::from_secs(1),
            library_search_policy: LibrarySearchPolicy::default(),
            scan_options: ScanOptions::default(),
        }
    }
}

/// Notifications for the owner of a [`BuildSystem`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSystemEvent {
    ParsingStarted,
    /// cmake is about to run
    ConfigurationStarted,
    Output(ProcessEvent),
    /// A model was published; `success` is false for the fallback model
    Updated { success: bool },
    Warning(String),
    Error(String),
    ConfigurationCleared,
    TestInformationUpdated,
}

/// Runnable executable target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppTarget {
    pub display_name: String,
    pub build_key: String,
    pub target_file_path: Option<PathBuf>,
    pub project_file_path: PathBuf,
    pub working_directory: PathBuf,
    pub uses_terminal: bool,
    pub is_runnable: bool,
    pub library_search_paths: Vec<PathBuf>,
}

/// Published state of the project
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectModel {
    pub display_name: String,
    pub root: Option<ProjectNode>,
    pub build_targets: Vec<CMakeBuildTarget>,
    pub project_parts: Vec<RawProjectPart>,
    pub configuration: CMakeConfig,
    pub tests: Vec<TestCaseInfo>,
    pub ctest_path: Option<PathBuf>,
    pub project_files_to_watch: Vec<PathBuf>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

type ScanResult = Result<Vec<ProjectNode>, ProjectError>;
type TestListResult = Result<Vec<TestCaseInfo>, CMakeError>;

struct ScanJob {
    cancel: CancellationToken,
    handle: JoinHandle<ScanResult>,
}

async fn wait_for_scan(scan: &mut Option<ScanJob>) -> Result<ScanResult, JoinError> {
    match scan {
        Some(job) => (&mut job.handle).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_tests(
    job: &mut Option<JoinHandle<TestListResult>>,
) -> Result<TestListResult, JoinError> {
    match job {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_for_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Targets every generator provides, listed before the project's own
pub fn special_targets(
    all_caps: bool,
    build_directory: &Path,
    source_directory: &Path,
) -> Vec<CMakeBuildTarget> {
    let names = if all_caps {
        ["ALL_BUILD", "clean", "INSTALL", "RUN_TESTS"]
    } else {
        ["all", "clean", "install", "test"]
    };
    names
        .into_iter()
        .map(|name| CMakeBuildTarget {
            title: name.to_string(),
            working_directory: build_directory.to_path_buf(),
            source_directory: source_directory.to_path_buf(),
            ..Default::default()
        })
        .collect()
}

/// Helper targets generated by AUTOMOC and friends
fn filtered_out_target(target: &CMakeBuildTarget) -> bool {
    target.title.ends_with("_autogen") || target.title.ends_with("_autogen_timestamp_deps")
}

/// Read a `CMakeCache.txt`
pub fn parse_cmake_cache_txt(cache_file: &Path) -> Result<CMakeConfig, CMakeError> {
    if !cache_file.exists() {
        return Err(CMakeError::CacheNotFound {
            path: cache_file.to_path_buf(),
        });
    }
    CMakeConfig::from_file(cache_file)
}

pub struct BuildSystem {
    settings: BuildSystemSettings,
    parameters: BuildDirParameters,
    reader: Reader,

    reparse_flags: ReparseFlags,
    parse_deadline: Option<tokio::time::Instant>,

    waiting_for_parse: bool,
    waiting_for_scan: bool,
    combined_scan_and_parse_result: bool,
    restored_from_backup: bool,
    is_handling_error: bool,

    scan: Option<ScanJob>,
    scanned_files: Vec<ProjectNode>,
    test_job: Option<JoinHandle<TestListResult>>,

    model: ProjectModel,

    output_sender: mpsc::UnboundedSender<ProcessEvent>,
    output: mpsc::UnboundedReceiver<ProcessEvent>,
    events: VecDeque<BuildSystemEvent>,
}

impl BuildSystem {
    /// Build system running the real cmake executable
    pub fn new(settings: BuildSystemSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let runner = Arc::new(CMakeProcess::new(sender.clone()));
        Self::with_runner(settings, runner, sender, receiver)
    }

    /// Build system with a custom configure runner whose output arrives on
    /// `output`
    pub fn with_runner(
        settings: BuildSystemSettings,
        runner: Arc<dyn ConfigureRunner>,
        output_sender: mpsc::UnboundedSender<ProcessEvent>,
        output: mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> Self {
        let reader = Reader::new(runner, settings.library_search_policy.clone());
        Self {
            settings,
            parameters: BuildDirParameters::default(),
            reader,
            reparse_flags: ReparseFlags::DEFAULT,
            parse_deadline: None,
            waiting_for_parse: false,
            waiting_for_scan: false,
            combined_scan_and_parse_result: false,
            restored_from_backup: false,
            is_handling_error: false,
            scan: None,
            scanned_files: Vec::new(),
            test_job: None,
            model: ProjectModel::default(),
            output_sender,
            output,
            events: VecDeque::new(),
        }
    }

    pub fn parameters(&self) -> &BuildDirParameters {
        &self.parameters
    }

    pub fn model(&self) -> &ProjectModel {
        &self.model
    }

    /// Return the accumulated flags and reset them
    pub fn take_reparse_flags(&mut self) -> ReparseFlags {
        std::mem::take(&mut self.reparse_flags)
    }

    pub fn is_parsing(&self) -> bool {
        self.waiting_for_parse || self.reader.is_parsing()
    }

    pub fn is_multi_config(&self) -> bool {
        self.reader.is_multi_config()
    }

    /// Exit code of the last configure run, 0 before the first one
    pub fn last_cmake_exit_code(&self) -> i32 {
        self.reader.last_cmake_exit_code()
    }

    /// Store `parameters` and schedule a parse with `flags` added
    pub fn set_parameters_and_request_parse(
        &mut self,
        parameters: BuildDirParameters,
        flags: ReparseFlags,
    ) -> Result<(), BuildSystemError> {
        if let Err(e) = Self::check_parameters(&parameters) {
            self.set_error(e.to_string());
            return Err(e);
        }

        debug!(
            target: "cmake_sync::build_system",
            "Parse requested for {} with {}",
            parameters.build_directory.display(),
            flags
        );
        self.parameters = parameters;
        self.reparse_flags |= flags;
        self.reader.set_parameters(self.parameters.clone());

        if flags.contains(ReparseFlags::URGENT) {
            self.request_parse();
        } else {
            self.request_delayed_parse();
        }
        Ok(())
    }

    fn check_parameters(parameters: &BuildDirParameters) -> Result<(), BuildSystemError> {
        let tool = parameters
            .cmake_tool
            .as_deref()
            .ok_or(BuildSystemError::NoCMakeTool)?;
        if !tool.has_file_api() {
            return Err(BuildSystemError::NoFileApi {
                executable: tool.executable().to_path_buf(),
                version: tool.full_version().to_string(),
            });
        }
        if !parameters.is_valid() {
            return Err(BuildSystemError::InvalidParameters);
        }
        std::fs::create_dir_all(&parameters.build_directory).map_err(|source| {
            BuildSystemError::CreateBuildDirectory {
                path: parameters.build_directory.clone(),
                source,
            }
        })
    }

    /// Point at another build directory, taking its build type from an
    /// existing cache
    pub fn set_build_directory(
        &mut self,
        build_directory: impl Into<PathBuf>,
    ) -> Result<(), BuildSystemError> {
        let mut parameters = self.parameters.clone();
        parameters.build_directory = build_directory.into();

        let flags = match parse_cmake_cache_txt(&parameters.cmake_cache_txt()) {
            Ok(cache) => {
                if let Some(build_type) = cache.value_of("CMAKE_BUILD_TYPE")
                    && !build_type.is_empty()
                {
                    parameters.cmake_build_type = build_type.to_string();
                }
                ReparseFlags::DEFAULT
            }
            Err(_) => ReparseFlags::FORCE_CMAKE_RUN | ReparseFlags::FORCE_INITIAL_CONFIGURATION,
        };
        self.set_parameters_and_request_parse(parameters, flags)
    }

    fn request_parse(&mut self) {
        self.parse_deadline = Some(tokio::time::Instant::now());
    }

    fn request_delayed_parse(&mut self) {
        let now = tokio::time::Instant::now();
        self.parse_deadline = Some(match self.parse_deadline {
            // An urgent request already waiting stays urgent
            Some(deadline) if deadline <= now => deadline,
            _ => now + self.settings.parse_delay,
        });
    }

    /// Wait for the next notification, driving scheduled work meanwhile
    ///
    /// Returns `None` once nothing is scheduled, running or watched.
    pub async fn next_event(&mut self) -> Option<BuildSystemEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.parse_deadline.is_none()
                && self.scan.is_none()
                && self.test_job.is_none()
                && !self.reader.is_parsing()
                && !self.reader.is_watching()
            {
                return None;
            }

            let reader_active = self.reader.is_parsing() || self.reader.is_watching();
            tokio::select! {
                biased;

                Some(event) = self.output.recv() => {
                    self.events.push_back(BuildSystemEvent::Output(event));
                }
                _ = wait_for_deadline(self.parse_deadline) => {
                    self.parse_deadline = None;
                    self.trigger_parsing();
                }
                event = self.reader.next_event(), if reader_active => {
                    if let Some(event) = event {
                        self.handle_reader_event(event);
                    }
                }
                result = wait_for_scan(&mut self.scan) => {
                    self.scan = None;
                    self.handle_tree_scanning_finished(result);
                }
                result = wait_for_tests(&mut self.test_job) => {
                    self.test_job = None;
                    self.handle_test_listing(result);
                }
            }
        }
    }

    /// Drain output that arrived outside of [`next_event`](Self::next_event)
    pub fn take_output(&mut self) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.output.try_recv() {
            events.push(event);
        }
        events
    }

    fn trigger_parsing(&mut self) {
        info!(
            target: "cmake_sync::build_system",
            "Parsing {} (flags: {})",
            self.parameters.build_directory.display(),
            self.reparse_flags
        );
        if self.is_parsing() {
            self.stop_parsing_and_clear_state();
        }

        let mut flags = self.take_reparse_flags();
        self.events.push_back(BuildSystemEvent::ParsingStarted);
        self.model.error = None;
        self.model.warnings.clear();
        self.waiting_for_parse = true;
        self.combined_scan_and_parse_result = true;

        if !self.parameters.cmake_cache_txt().exists() {
            flags |= ReparseFlags::FORCE_INITIAL_CONFIGURATION | ReparseFlags::FORCE_CMAKE_RUN;
        }
        if !self.parameters.configuration_changes_arguments.is_empty() {
            flags |= ReparseFlags::FORCE_CMAKE_RUN | ReparseFlags::FORCE_EXTRA_CONFIGURATION;
        }
        debug!(target: "cmake_sync::build_system", "Dispatching parse with {}", flags);

        self.start_tree_scan();
        self.reader.parse(
            flags.contains(ReparseFlags::FORCE_CMAKE_RUN),
            flags.contains(ReparseFlags::FORCE_INITIAL_CONFIGURATION),
            flags.contains(ReparseFlags::FORCE_EXTRA_CONFIGURATION),
        );
    }

    fn start_tree_scan(&mut self) {
        if let Some(job) = self.scan.take() {
            job.cancel.cancel();
            job.handle.abort();
        }

        let source = self.parameters.source_directory.clone();
        let build = &self.parameters.build_directory;
        let mut options = self.settings.scan_options.clone();
        if build.starts_with(&source) {
            options = options.excluding(build.clone());
        }

        let cancel = CancellationToken::new();
        let handle = TreeScanner::new(options).spawn(source, cancel.clone());
        self.scan = Some(ScanJob { cancel, handle });
        self.waiting_for_scan = true;
    }

    fn stop_parsing_and_clear_state(&mut self) {
        debug!(target: "cmake_sync::build_system", "Stopping parse in flight");
        self.reader.stop();
        self.reader.reset_data();
        if let Some(job) = self.scan.take() {
            job.cancel.cancel();
            job.handle.abort();
        }
        self.waiting_for_parse = false;
        self.waiting_for_scan = false;
    }

    fn handle_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::ConfigurationStarted => {
                self.events.push_back(BuildSystemEvent::ConfigurationStarted);
            }
            ReaderEvent::DataAvailable {
                restored_from_backup,
            } => self.handle_parsing_succeeded(restored_from_backup),
            ReaderEvent::ErrorOccurred(message) => self.handle_parsing_failed(message),
            ReaderEvent::Dirty => self.become_dirty(),
        }
    }

    fn handle_tree_scanning_finished(&mut self, result: Result<ScanResult, JoinError>) {
        self.scanned_files = match result {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                warn!(target: "cmake_sync::build_system", "Tree scan failed: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!(target: "cmake_sync::build_system", "Tree scan task failed: {}", e);
                Vec::new()
            }
        };
        debug!(
            target: "cmake_sync::build_system",
            "Tree scan found {} files",
            self.scanned_files.len()
        );
        self.waiting_for_scan = false;
        self.combine_scan_and_parse();
    }

    fn handle_parsing_succeeded(&mut self, restored_from_backup: bool) {
        if !self.waiting_for_parse {
            return;
        }

        let mut targets = special_targets(
            self.reader.uses_all_caps_targets(),
            &self.parameters.build_directory,
            &self.parameters.source_directory,
        );
        targets.extend(self.reader.take_build_targets());
        self.model.build_targets = targets;

        match self.update_cmake_configuration() {
            Some(error) => self.set_error(error),
            None => self.consume_configuration_changes(),
        }
        self.model.ctest_path = self.reader.ctest_path();

        self.waiting_for_parse = false;
        self.restored_from_backup = restored_from_backup;
        self.combine_scan_and_parse();
    }

    /// Pending cache changes reached the cache; later parses must not
    /// configure again because of them
    fn consume_configuration_changes(&mut self) {
        if self.parameters.configuration_changes_arguments.is_empty() {
            return;
        }
        debug!(
            target: "cmake_sync::build_system",
            "Configuration changes applied: {:?}",
            self.parameters.configuration_changes_arguments
        );
        self.parameters.configuration_changes_arguments.clear();
    }

    fn handle_parsing_failed(&mut self, message: String) {
        if !self.waiting_for_parse {
            return;
        }

        self.set_error(message);
        self.update_cmake_configuration();
        self.model.ctest_path = None;

        self.waiting_for_parse = false;
        self.combined_scan_and_parse_result = false;
        self.is_handling_error = true;
        self.combine_scan_and_parse();
    }

    /// Take the parsed cache; after a failed run, pending changes that did
    /// not reach the cache are kept on top of it
    fn update_cmake_configuration(&mut self) -> Option<String> {
        let (mut configuration, error) = self.reader.take_parsed_configuration();
        for item in configuration.iter_mut() {
            item.in_cmake_cache = true;
        }

        if error.is_some() {
            let (changes, _) =
                CMakeConfig::from_arguments(self.parameters.configuration_changes_arguments.as_slice());
            for item in changes {
                if !item.is_initial && !configuration.contains_key(&item.key) {
                    configuration.push(item);
                }
            }
        }

        self.model.configuration = configuration;
        error
    }

    fn combine_scan_and_parse(&mut self) {
        if self.waiting_for_parse || self.waiting_for_scan {
            return;
        }
        let started = Instant::now();

        if self.combined_scan_and_parse_result {
            self.update_project_data();
            if self.restored_from_backup {
                self.add_warning(RESTORED_FROM_BACKUP_WARNING.to_string());
            }
            self.reader.reset_data();
            self.model.tests.clear();
            self.publish(true);
            self.run_ctest();
        } else {
            self.update_fallback_project_data();
            self.add_warning(FAILED_TO_LOAD_WARNING.to_string());
            self.reader.reset_data();
            self.is_handling_error = false;
            self.publish(false);
        }

        self.scanned_files.clear();
        log_timing!(Level::DEBUG, "combine_scan_and_parse", started.elapsed());
    }

    fn publish(&mut self, success: bool) {
        self.model.updated_at = Some(Utc::now());
        info!(
            target: "cmake_sync::build_system",
            "Project model updated (success: {}, {} targets)",
            success,
            self.model.build_targets.len()
        );
        self.events.push_back(BuildSystemEvent::Updated { success });
    }

    fn update_project_data(&mut self) {
        self.model.project_files_to_watch = self.reader.project_files_to_watch();

        if let Some(mut root) = self.reader.take_root_project_node() {
            add_file_system_nodes(&mut root, &self.scanned_files);
            self.model.display_name = root.display_name.clone();
            self.model.root = Some(root);
        }
        self.model.project_parts = self.reader.create_raw_project_parts();
    }

    /// Tree from the scan alone
    fn update_fallback_project_data(&mut self) {
        let source = &self.parameters.source_directory;
        let display_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        let mut root = ProjectNode::project(source.clone(), display_name.clone());

        if let Some(top) = self.reader.top_cmake_file() {
            add_cmake_lists(&mut root, vec![ProjectNode::file(top, FileType::Project, false)]);
        }
        add_file_system_nodes(&mut root, &self.scanned_files);

        self.model.display_name = display_name;
        self.model.root = Some(root);
        self.model.project_parts.clear();
        self.model.project_files_to_watch = self.reader.project_files_to_watch();
    }

    fn run_ctest(&mut self) {
        let ctest = match (&self.model.error, &self.model.ctest_path) {
            (None, Some(ctest)) => ctest.clone(),
            _ => {
                self.events
                    .push_back(BuildSystemEvent::TestInformationUpdated);
                return;
            }
        };

        let build = self.parameters.build_directory.clone();
        let environment = self.parameters.environment.clone();
        self.test_job = Some(tokio::spawn(async move {
            ctest::list_tests(&ctest, &build, &environment).await
        }));
    }

    fn handle_test_listing(&mut self, result: Result<TestListResult, JoinError>) {
        self.model.tests = match result {
            Ok(Ok(tests)) => tests,
            Ok(Err(e)) => {
                warn!(target: "cmake_sync::build_system", "Listing tests failed: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!(target: "cmake_sync::build_system", "Test listing task failed: {}", e);
                Vec::new()
            }
        };
        debug!(
            target: "cmake_sync::build_system",
            "{} tests known",
            self.model.tests.len()
        );
        self.events
            .push_back(BuildSystemEvent::TestInformationUpdated);
    }

    fn set_error(&mut self, message: String) {
        warn!(target: "cmake_sync::build_system", "{}", message);
        self.model.error = Some(message.clone());
        self.events.push_back(BuildSystemEvent::Error(message));
    }

    fn add_warning(&mut self, message: String) {
        warn!(target: "cmake_sync::build_system", "{}", message);
        self.model.warnings.push(message.clone());
        self.events.push_back(BuildSystemEvent::Warning(message));
    }

    /// Configure now; the source tree is rescanned alongside, as for every
    /// parse
    pub fn run_cmake(&mut self) -> Result<(), BuildSystemError> {
        self.request_with(ReparseFlags::FORCE_CMAKE_RUN | ReparseFlags::URGENT)
    }

    pub fn run_cmake_with_extra_arguments(&mut self) -> Result<(), BuildSystemError> {
        self.request_with(
            ReparseFlags::FORCE_CMAKE_RUN
                | ReparseFlags::FORCE_EXTRA_CONFIGURATION
                | ReparseFlags::URGENT,
        )
    }

    /// Run cmake if pending changes or a missing build directory call for
    /// it; returns whether a run was requested
    pub fn persist_cmake_state(&mut self) -> Result<bool, BuildSystemError> {
        let mut flags = ReparseFlags::DEFAULT;
        if !self.parameters.configuration_changes_arguments.is_empty() {
            flags |= ReparseFlags::FORCE_EXTRA_CONFIGURATION;
        }
        if !self.parameters.build_directory.exists() {
            flags |= ReparseFlags::FORCE_INITIAL_CONFIGURATION;
        }
        if flags.is_empty() {
            return Ok(false);
        }

        info!(target: "cmake_sync::build_system", "Persisting CMake state ({})", flags);
        self.request_with(ReparseFlags::URGENT | ReparseFlags::FORCE_CMAKE_RUN | flags)?;
        Ok(true)
    }

    fn request_with(&mut self, flags: ReparseFlags) -> Result<(), BuildSystemError> {
        self.set_parameters_and_request_parse(self.parameters.clone(), flags)
    }

    pub fn stop_cmake_run(&mut self) {
        debug!(target: "cmake_sync::build_system", "Stopping cmake run");
        self.reader.stop_cmake_run();
    }

    /// React to an externally changed reply
    pub fn become_dirty(&mut self) {
        if self.is_parsing() {
            return;
        }
        info!(target: "cmake_sync::build_system", "Reply changed, reparsing");
        if let Err(e) = self.request_with(ReparseFlags::DEFAULT) {
            warn!(target: "cmake_sync::build_system", "Reparse refused: {}", e);
        }
    }

    /// Delete the cache and the file-API replies
    pub fn clear_cmake_cache(&mut self) -> Result<(), BuildSystemError> {
        if !self.parameters.is_valid() {
            return Err(BuildSystemError::InvalidParameters);
        }
        if self.is_handling_error {
            return Err(BuildSystemError::HandlingError);
        }

        self.stop_parsing_and_clear_state();

        let build = &self.parameters.build_directory;
        let paths = [
            build.join("CMakeCache.txt"),
            build.join("CMakeCache.txt.prev"),
            build.join("CMakeFiles"),
            reply_directory(build),
            build.join(REPLY_BACKUP_DIR),
        ];
        for path in &paths {
            match remove_path(path) {
                Ok(true) => debug!(target: "cmake_sync::build_system", "Removed {}", path.display()),
                Ok(false) => {}
                Err(e) => {
                    warn!(target: "cmake_sync::build_system", "Failed to remove {}: {}", path.display(), e)
                }
            }
        }

        info!(target: "cmake_sync::build_system", "CMake cache cleared in {}", build.display());
        self.events.push_back(BuildSystemEvent::ConfigurationCleared);
        Ok(())
    }

    /// Run `cmake --build <build> --target <target>`; returns whether it
    /// succeeded
    ///
    /// Output lines are delivered by [`next_event`](Self::next_event) or
    /// [`take_output`](Self::take_output).
    pub async fn build_cmake_target(&mut self, target: &str) -> Result<bool, BuildSystemError> {
        if target.is_empty() {
            return Err(BuildSystemError::EmptyTargetName);
        }
        let executable = self
            .parameters
            .cmake_executable()
            .ok_or(BuildSystemError::NoCMakeTool)?
            .to_path_buf();

        let build = self.parameters.build_directory.clone();
        let mut args = vec![
            "--build".to_string(),
            build.display().to_string(),
            "--target".to_string(),
            target.to_string(),
        ];
        if self.reader.is_multi_config() && !self.parameters.cmake_build_type.is_empty() {
            args.push("--config".to_string());
            args.push(self.parameters.cmake_build_type.clone());
        }

        let mut process = ChildProcessManager::new(executable, args, Some(build))
            .with_environment(self.parameters.environment.clone());
        let stdout = self.output_sender.clone();
        process.on_stdout_line(move |line| {
            let _ = stdout.send(ProcessEvent::Stdout(line));
        });
        let stderr = self.output_sender.clone();
        process.on_stderr_line(move |line| {
            let _ = stderr.send(ProcessEvent::Stderr(line));
        });

        info!(target: "cmake_sync::build_system", "Building: {}", process.command_line());
        let _ = self
            .output_sender
            .send(ProcessEvent::Message(format!("Running {}", process.command_line())));

        let started = Instant::now();
        process.start().await?;
        let exit = process.wait().await?;
        log_timing!(Level::INFO, "build_cmake_target", started.elapsed());
        Ok(exit.is_success())
    }

    /// Executables that can be run, without generated helper targets
    pub fn app_targets(&self) -> Vec<AppTarget> {
        let project_file_path = clean_path(&self.parameters.source_directory.join("CMakeLists.txt"));
        self.model
            .build_targets
            .iter()
            .filter(|target| {
                target.target_type == TargetType::Executable && !filtered_out_target(target)
            })
            .map(|target| AppTarget {
                display_name: target.title.clone(),
                build_key: target.title.clone(),
                target_file_path: target.executable.clone(),
                project_file_path: project_file_path.clone(),
                working_directory: target.working_directory.clone(),
                uses_terminal: !target.links_to_qt_gui,
                is_runnable: target.qtc_runnable,
                library_search_paths: target.library_directories.clone(),
            })
            .collect()
    }

    pub fn build_target_titles(&self) -> Vec<String> {
        self.model
            .build_targets
            .iter()
            .filter(|target| !filtered_out_target(target))
            .map(|target| target.title.clone())
            .collect()
    }

    /// ctest executable and arguments running `tests` with `options`
    pub fn command_line_for_tests(
        &self,
        tests: &[String],
        options: &[String],
    ) -> Option<(PathBuf, Vec<String>)> {
        let ctest = self.model.ctest_path.clone()?;
        Some((
            ctest,
            ctest::arguments_for_tests(&self.model.tests, tests, options),
        ))
    }
}

impl Drop for BuildSystem {
    fn drop(&mut self) {
        if let Some(job) = self.scan.take() {
            job.cancel.cancel();
            job.handle.abort();
        }
        if let Some(job) = self.test_job.take() {
            job.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmake::process::{MockConfigureRunner, RunOutcome};
    use crate::cmake::tool::CMakeTool;
    use crate::file_api::tree::OTHER_FILES_FOLDER;
    use crate::test_utils::{FixtureOptions, write_reply_fixture, write_source_tree};

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    const CAPABILITIES: &str = r#"{
        "fileApi": {
            "requests": [
                {"kind": "codemodel", "version": [{"major": 2, "minor": 4}]},
                {"kind": "cache", "version": [{"major": 2, "minor": 0}]},
                {"kind": "cmakeFiles", "version": [{"major": 1, "minor": 0}]}
            ]
        },
        "generators": [{"name": "Ninja"}],
        "version": {"major": 3, "minor": 27, "patch": 4, "string": "3.27.4"}
    }"#;

    fn tool() -> Arc<CMakeTool> {
        let mut tool = CMakeTool::new("default", "/usr/bin/cmake");
        tool.parse_capabilities(CAPABILITIES).unwrap();
        Arc::new(tool)
    }

    fn build_system(runner: MockConfigureRunner) -> BuildSystem {
        let (sender, receiver) = mpsc::unbounded_channel();
        let settings = BuildSystemSettings {
            parse_delay: Duration::from_millis(10),
            library_search_policy: LibrarySearchPolicy::permissive(),
            scan_options: ScanOptions::default(),
        };
        BuildSystem::with_runner(settings, Arc::new(runner), sender, receiver)
    }

    /// Events up to and including the next `Updated`
    async fn until_updated(build_system: &mut BuildSystem) -> Vec<BuildSystemEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), build_system.next_event())
                .await
                .expect("build system event")
                .expect("build system has work");
            let done = matches!(event, BuildSystemEvent::Updated { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[test]
    fn test_reparse_flags() {
        let mut flags = ReparseFlags::DEFAULT;
        assert!(flags.is_empty());
        assert_eq!(flags.to_string(), "<NONE>");

        flags |= ReparseFlags::FORCE_CMAKE_RUN;
        flags |= ReparseFlags::URGENT;
        assert!(flags.contains(ReparseFlags::FORCE_CMAKE_RUN));
        assert!(!flags.contains(ReparseFlags::FORCE_EXTRA_CONFIGURATION));
        assert_eq!(flags.to_string(), "FORCE_CMAKE_RUN | URGENT");
        assert_eq!(flags & ReparseFlags::URGENT, ReparseFlags::URGENT);
    }

    #[tokio::test]
    async fn test_flags_accumulate_until_taken() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let build = dir.path().join("build");
        write_source_tree(&source);

        let mut bs = build_system(MockConfigureRunner::new());
        let parameters = BuildDirParameters::new(&source, &build, Some(tool()));
        bs.set_parameters_and_request_parse(parameters.clone(), ReparseFlags::FORCE_CMAKE_RUN)
            .unwrap();
        bs.set_parameters_and_request_parse(parameters, ReparseFlags::FORCE_EXTRA_CONFIGURATION)
            .unwrap();

        assert!(build.is_dir());
        assert_eq!(
            bs.take_reparse_flags(),
            ReparseFlags::FORCE_CMAKE_RUN | ReparseFlags::FORCE_EXTRA_CONFIGURATION
        );
        assert!(bs.take_reparse_flags().is_empty());
    }

    #[tokio::test]
    async fn test_run_requests_add_their_flags() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        write_source_tree(&source);

        let mut bs = build_system(MockConfigureRunner::new());
        bs.set_parameters_and_request_parse(
            BuildDirParameters::new(&source, dir.path().join("build"), Some(tool())),
            ReparseFlags::DEFAULT,
        )
        .unwrap();
        bs.take_reparse_flags();

        bs.run_cmake().unwrap();
        assert_eq!(
            bs.take_reparse_flags(),
            ReparseFlags::FORCE_CMAKE_RUN | ReparseFlags::URGENT
        );
        bs.run_cmake_with_extra_arguments().unwrap();
        assert_eq!(
            bs.take_reparse_flags(),
            ReparseFlags::FORCE_CMAKE_RUN
                | ReparseFlags::FORCE_EXTRA_CONFIGURATION
                | ReparseFlags::URGENT
        );
    }

    #[tokio::test]
    async fn test_refuses_unusable_tool() {
        let mut bs = build_system(MockConfigureRunner::new());

        let result = bs.set_parameters_and_request_parse(
            BuildDirParameters::new("/src", "/build", None),
            ReparseFlags::DEFAULT,
        );
        assert!(matches!(result, Err(BuildSystemError::NoCMakeTool)));

        let bare = Arc::new(CMakeTool::new("bare", "/usr/bin/cmake"));
        let result = bs.set_parameters_and_request_parse(
            BuildDirParameters::new("/src", "/build", Some(bare)),
            ReparseFlags::DEFAULT,
        );
        assert!(matches!(result, Err(BuildSystemError::NoFileApi { .. })));

        assert!(matches!(
            bs.next_event().await,
            Some(BuildSystemEvent::Error(ref m)) if m.contains("CMake tool")
        ));
        assert!(matches!(bs.next_event().await, Some(BuildSystemEvent::Error(_))));
        assert_eq!(bs.next_event().await, None);
    }

    #[tokio::test]
    async fn test_successful_parse_publishes_merged_model() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let build = dir.path().join("build");
        write_reply_fixture(&source, &build, &FixtureOptions::default());
        std::fs::write(source.join("NOTES.txt"), "notes").unwrap();

        let mut runner = MockConfigureRunner::new();
        runner.expect_run().times(0);
        let mut bs = build_system(runner);

        let parameters = BuildDirParameters::new(&source, &build, Some(tool()))
            .with_build_type("Debug");
        bs.set_parameters_and_request_parse(parameters, ReparseFlags::DEFAULT)
            .unwrap();

        let events = until_updated(&mut bs).await;
        assert_eq!(events.first(), Some(&BuildSystemEvent::ParsingStarted));
        assert_eq!(
            events.last(),
            Some(&BuildSystemEvent::Updated { success: true })
        );
        assert!(!events.contains(&BuildSystemEvent::ConfigurationStarted));
        assert!(!bs.is_parsing());

        let model = bs.model();
        assert_eq!(model.error, None);
        assert!(model.warnings.is_empty());
        assert!(model.updated_at.is_some());
        assert!(!model.project_parts.is_empty());
        assert_eq!(model.configuration.value_of("CMAKE_BUILD_TYPE"), Some("Debug"));
        assert!(model.configuration.iter().all(|item| item.in_cmake_cache));

        assert_eq!(
            bs.build_target_titles(),
            vec!["all", "clean", "install", "test", "app", "core"]
        );
        assert_eq!(model.build_targets[0].working_directory, build);

        let root = model.root.as_ref().unwrap();
        let other = root.child_by_name(OTHER_FILES_FOLDER).unwrap();
        assert!(other.file_paths().contains(&source.join("NOTES.txt")));

        let apps = bs.app_targets();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].display_name, "app");
        assert_eq!(apps[0].project_file_path, source.join("CMakeLists.txt"));
    }

    #[tokio::test]
    async fn test_failed_parse_publishes_fallback_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("demo");
        let build = dir.path().join("build");
        write_source_tree(&source);

        let mut runner = MockConfigureRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _, _| RunOutcome::Failed { code: 1 });
        let mut bs = build_system(runner);

        let parameters = BuildDirParameters::new(&source, &build, Some(tool()));
        bs.set_parameters_and_request_parse(parameters, ReparseFlags::URGENT)
            .unwrap();

        let events = until_updated(&mut bs).await;
        // No cache yet, so cmake has to run
        assert!(events.contains(&BuildSystemEvent::ConfigurationStarted));
        assert!(events.iter().any(|e| matches!(e, BuildSystemEvent::Error(_))));
        assert!(events.contains(&BuildSystemEvent::Warning(FAILED_TO_LOAD_WARNING.to_string())));
        assert_eq!(
            events.last(),
            Some(&BuildSystemEvent::Updated { success: false })
        );

        let model = bs.model();
        assert!(model.error.is_some());
        assert!(model.ctest_path.is_none());
        assert!(model.project_parts.is_empty());
        let root = model.root.as_ref().unwrap();
        assert_eq!(root.display_name, "demo");
        assert!(root.known_paths().contains(&source.join("main.cpp")));

        // Fallback published, the cache may be cleared again
        assert!(bs.clear_cmake_cache().is_ok());
    }

    #[tokio::test]
    async fn test_clear_cmake_cache_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let build = dir.path().join("build");
        write_reply_fixture(&source, &build, &FixtureOptions::default());
        std::fs::write(build.join("CMakeCache.txt.prev"), "").unwrap();
        std::fs::create_dir_all(build.join("CMakeFiles/3.27.4")).unwrap();
        std::fs::create_dir_all(build.join(REPLY_BACKUP_DIR)).unwrap();

        let mut bs = build_system(MockConfigureRunner::new());
        bs.set_parameters_and_request_parse(
            BuildDirParameters::new(&source, &build, Some(tool())),
            ReparseFlags::DEFAULT,
        )
        .unwrap();
        bs.clear_cmake_cache().unwrap();

        assert!(!build.join("CMakeCache.txt").exists());
        assert!(!build.join("CMakeCache.txt.prev").exists());
        assert!(!build.join("CMakeFiles").exists());
        assert!(!reply_directory(&build).exists());
        assert!(!build.join(REPLY_BACKUP_DIR).exists());
        assert!(source.join("CMakeLists.txt").exists());
        assert_eq!(
            bs.next_event().await,
            Some(BuildSystemEvent::ConfigurationCleared)
        );
    }

    #[tokio::test]
    async fn test_build_target_requires_name() {
        let mut bs = build_system(MockConfigureRunner::new());
        assert!(matches!(
            bs.build_cmake_target("").await,
            Err(BuildSystemError::EmptyTargetName)
        ));
        assert!(matches!(
            bs.build_cmake_target("app").await,
            Err(BuildSystemError::NoCMakeTool)
        ));
    }

    #[tokio::test]
    async fn test_persist_cmake_state_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let build = dir.path().join("build");
        write_reply_fixture(&source, &build, &FixtureOptions::default());

        let mut bs = build_system(MockConfigureRunner::new());
        bs.set_parameters_and_request_parse(
            BuildDirParameters::new(&source, &build, Some(tool())),
            ReparseFlags::DEFAULT,
        )
        .unwrap();
        bs.take_reparse_flags();
        assert!(!bs.persist_cmake_state().unwrap());
        assert!(bs.take_reparse_flags().is_empty());
    }

    #[tokio::test]
    async fn test_configuration_changes_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let build = dir.path().join("build");
        write_reply_fixture(&source, &build, &FixtureOptions::default());

        let mut runner = MockConfigureRunner::new();
        let (reply_source, reply_build) = (source.clone(), build.clone());
        runner
            .expect_run()
            .withf(|_, arguments, _| arguments.len() == 1 && arguments[0] == "-DFOO=1")
            .times(1)
            .returning(move |_, _, _| {
                write_reply_fixture(&reply_source, &reply_build, &FixtureOptions::default());
                RunOutcome::Success
            });
        let mut bs = build_system(runner);

        let mut parameters = BuildDirParameters::new(&source, &build, Some(tool()))
            .with_build_type("Debug");
        parameters.configuration_changes_arguments = vec!["-DFOO=1".to_string()];
        bs.set_parameters_and_request_parse(parameters, ReparseFlags::URGENT)
            .unwrap();

        let events = until_updated(&mut bs).await;
        assert!(events.contains(&BuildSystemEvent::ConfigurationStarted));
        assert_eq!(
            events.last(),
            Some(&BuildSystemEvent::Updated { success: true })
        );
        assert!(bs.parameters().configuration_changes_arguments.is_empty());
        assert!(!bs.persist_cmake_state().unwrap());

        // A reparse from a changed reply reads it without configuring
        bs.become_dirty();
        let events = until_updated(&mut bs).await;
        assert!(!events.contains(&BuildSystemEvent::ConfigurationStarted));
        assert_eq!(
            events.last(),
            Some(&BuildSystemEvent::Updated { success: true })
        );
        assert_eq!(bs.model().error, None);
    }

    #[test]
    fn test_special_targets() {
        let names = |all_caps| {
            special_targets(all_caps, Path::new("/b"), Path::new("/s"))
                .into_iter()
                .map(|t| t.title)
                .collect::<Vec<_>>()
        };
        assert_eq!(names(false), vec!["all", "clean", "install", "test"]);
        assert_eq!(names(true), vec!["ALL_BUILD", "clean", "INSTALL", "RUN_TESTS"]);
    }

    #[test]
    fn test_filtered_out_targets() {
        let target = |title: &str| CMakeBuildTarget {
            title: title.to_string(),
            ..Default::default()
        };
        assert!(filtered_out_target(&target("app_autogen")));
        assert!(filtered_out_target(&target("app_autogen_timestamp_deps")));
        assert!(!filtered_out_target(&target("autogen_tool")));
    }

    #[test]
    fn test_parse_cmake_cache_txt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("CMakeCache.txt");
        assert!(matches!(
            parse_cmake_cache_txt(&cache),
            Err(CMakeError::CacheNotFound { .. })
        ));

        std::fs::write(&cache, "CMAKE_BUILD_TYPE:STRING=Release\n").unwrap();
        let config = parse_cmake_cache_txt(&cache).unwrap();
        assert_eq!(config.value_of("CMAKE_BUILD_TYPE"), Some("Release"));
    }

    #[cfg(feature = "cmake-integration-tests")]
    mod integration {
        use super::*;
        use crate::test_utils::get_test_cmake_path;
        use crate::test_utils::integration::TestProject;

        #[tokio::test]
        async fn test_configure_real_project() {
            let project = TestProject::new().unwrap();
            let mut tool = CMakeTool::new("system", get_test_cmake_path());
            tool.probe().await.unwrap();

            let mut bs = BuildSystem::new(BuildSystemSettings::default());
            let parameters =
                BuildDirParameters::new(&project.source_dir, &project.build_dir, Some(Arc::new(tool)))
                    .with_build_type("Debug");
            bs.set_parameters_and_request_parse(parameters, ReparseFlags::URGENT)
                .unwrap();

            let mut success = None;
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_secs(120), bs.next_event()).await
            {
                if let BuildSystemEvent::Updated { success: s } = event {
                    success = Some(s);
                    break;
                }
            }
            assert_eq!(success, Some(true), "error: {:?}", bs.model().error);

            let titles = bs.build_target_titles();
            assert!(titles.contains(&"app".to_string()));
            assert!(titles.contains(&"core".to_string()));
            assert!(bs.build_cmake_target("core").await.unwrap());
        }
    }
}
