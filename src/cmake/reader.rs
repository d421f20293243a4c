//! File API reader for one build directory
//!
//! A parse cycle optionally runs cmake (guarded by a backup of the previous
//! reply and cache), then reads the newest reply on a blocking worker. The
//! cycle runs as a spawned task; its result comes back through
//! [`Reader::next_event`], which is the only place parsed state is written.
//!
//! Every cycle ends with exactly one [`ReaderEvent::DataAvailable`] or
//! [`ReaderEvent::ErrorOccurred`] unless it is stopped first.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::cmake::config_item::CMakeConfig;
use crate::cmake::parameters::BuildDirParameters;
use crate::cmake::process::ConfigureRunner;
use crate::file_api::model::{CMakeFileInfo, CMakeFileSet, ExtractedData};
use crate::file_api::parser::{
    PARSING_CANCELED, REPLY_BACKUP_DIR, query_file_paths, reply_directory,
    scan_for_reply_file_in,
};
use crate::file_api::{
    CMakeBuildTarget, LibrarySearchPolicy, ProjectNode, RawProjectPart, extract_data, parse_data,
    scan_for_reply_file, setup_file_api,
};
use crate::io::file_system::{copy_if_different, remove_path};
use crate::io::{DirectoryWatcher, FileSystemTrait, RealFileSystem};
use crate::log_timing;

/// Settings file written into the build directory before each cmake run
pub const SETTINGS_FILE: &str = "qtcsettings.cmake";
const SETTINGS_HEADER: &str = "# This file is managed by cmake-sync, do not edit!\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// cmake is about to run
    ConfigurationStarted,
    DataAvailable { restored_from_backup: bool },
    ErrorOccurred(String),
    /// A reply newer than the last parsed one appeared
    Dirty,
}

/// Why a parse cycle has to run cmake first, if at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDecision {
    Forced,
    ExtraArguments,
    NoReplyFile,
    CMakeFileChanged(PathBuf),
    QueryFileChanged(PathBuf),
    UpToDate,
}

impl RunDecision {
    pub fn must_run(&self) -> bool {
        !matches!(self, RunDecision::UpToDate)
    }
}

/// Decide whether cmake has to run before the reply can be parsed
///
/// Checked in order: a forced run, pending arguments, a missing reply, a
/// tracked non-generated CMake file newer than the reply (only when the tool
/// auto-runs), a query file newer than the reply.
pub fn must_run_cmake(
    fs: &impl FileSystemTrait,
    build_directory: &Path,
    cmake_files: &CMakeFileSet,
    auto_run: bool,
    has_arguments: bool,
    force: bool,
) -> RunDecision {
    if force {
        return RunDecision::Forced;
    }
    if has_arguments {
        return RunDecision::ExtraArguments;
    }

    let Some(reply_time) = scan_for_reply_file_in(fs, build_directory)
        .and_then(|reply| fs.modified(&reply))
    else {
        return RunDecision::NoReplyFile;
    };

    if auto_run
        && let Some(changed) = cmake_files
            .iter()
            .filter(|info| !info.is_generated)
            .find(|info| fs.modified(&info.path).is_some_and(|t| t > reply_time))
    {
        return RunDecision::CMakeFileChanged(changed.path.clone());
    }

    if let Some(query) = query_file_paths(build_directory)
        .into_iter()
        .find(|query| fs.modified(query).is_some_and(|t| t > reply_time))
    {
        return RunDecision::QueryFileChanged(query);
    }

    RunDecision::UpToDate
}

/// Arguments for the next cmake run
pub fn cmake_arguments(
    parameters: &BuildDirParameters,
    force_initial: bool,
    force_extra: bool,
) -> Vec<String> {
    let mut arguments = Vec::new();
    if force_initial {
        arguments.extend(parameters.initial_cmake_arguments.iter().cloned());
    }
    if force_extra {
        arguments.extend(parameters.configuration_changes_arguments.iter().cloned());
        arguments.extend(parameters.additional_cmake_arguments.iter().cloned());
    }
    arguments
}

/// Move the reply directory aside and copy the cache, or the reverse
///
/// Failures are logged; a failed backup never blocks the run.
pub fn make_backup_configuration(build_directory: &Path, store: bool) {
    let mut reply = reply_directory(build_directory);
    let mut reply_prev = build_directory.join(REPLY_BACKUP_DIR);
    if !store {
        std::mem::swap(&mut reply, &mut reply_prev);
    }

    if reply.exists() {
        if let Err(e) = remove_path(&reply_prev) {
            warn!(target: "cmake_sync::reader", "Failed to remove \"{}\": {}", reply_prev.display(), e);
        }
        if let Err(e) = std::fs::rename(&reply, &reply_prev) {
            warn!(
                target: "cmake_sync::reader",
                "Failed to rename \"{}\" to \"{}\": {}",
                reply.display(),
                reply_prev.display(),
                e
            );
        }
    }

    let mut cache = build_directory.join("CMakeCache.txt");
    let mut cache_prev = build_directory.join("CMakeCache.txt.prev");
    if !store {
        std::mem::swap(&mut cache, &mut cache_prev);
    }

    if cache.exists()
        && let Err(e) = copy_if_different(&cache, &cache_prev)
    {
        warn!(
            target: "cmake_sync::reader",
            "Failed to copy \"{}\" to \"{}\": {}",
            cache.display(),
            cache_prev.display(),
            e
        );
    }
}

/// Write the `-D`/`-U` arguments as cache commands into the settings file
pub fn write_configuration_into_build_directory(
    build_directory: &Path,
    arguments: &[String],
) -> io::Result<()> {
    std::fs::create_dir_all(build_directory)?;

    let (config, unknown) = CMakeConfig::from_arguments(arguments);
    if !unknown.is_empty() {
        debug!(target: "cmake_sync::reader", "Not written to settings: {:?}", unknown);
    }
    let lines: Vec<String> = config.iter().map(|item| item.to_cmake_set_line()).collect();

    let mut contents = String::from(SETTINGS_HEADER);
    contents.push_str(&lines.join("\n"));
    std::fs::write(build_directory.join(SETTINGS_FILE), contents)
}

struct CycleInput {
    parameters: BuildDirParameters,
    arguments: Vec<String>,
    run_cmake: bool,
    runner: Arc<dyn ConfigureRunner>,
    policy: LibrarySearchPolicy,
    cancel: CancellationToken,
    process_cancel: CancellationToken,
}

struct CycleOutput {
    /// Exit code of the cmake run, `None` when cmake did not run
    exit_code: Option<i32>,
    restored_from_backup: bool,
    reply_timestamp: Option<SystemTime>,
    data: ExtractedData,
    error: Option<String>,
}

struct Cycle {
    cancel: CancellationToken,
    process_cancel: CancellationToken,
    handle: JoinHandle<CycleOutput>,
}

async fn run_cycle(input: CycleInput) -> CycleOutput {
    let CycleInput {
        parameters,
        arguments,
        run_cmake,
        runner,
        policy,
        cancel,
        process_cancel,
    } = input;
    let build_directory = parameters.build_directory.clone();

    let mut exit_code = None;
    let mut restored_from_backup = false;
    if run_cmake {
        make_backup_configuration(&build_directory, true);
        if let Err(e) = write_configuration_into_build_directory(&build_directory, &arguments) {
            warn!(target: "cmake_sync::reader", "Failed to write {}: {}", SETTINGS_FILE, e);
        }

        let code = runner
            .run(&parameters, &arguments, process_cancel)
            .await
            .exit_code();
        if code != 0 {
            info!(target: "cmake_sync::reader", "cmake failed with {}, restoring backup", code);
            make_backup_configuration(&build_directory, false);
            restored_from_backup = true;
        }
        if let Err(e) = setup_file_api(&build_directory) {
            warn!(target: "cmake_sync::reader", "{}", e);
        }
        exit_code = Some(code);
    }

    let cancelled = |exit_code| CycleOutput {
        exit_code,
        restored_from_backup,
        reply_timestamp: None,
        data: ExtractedData::default(),
        error: Some(PARSING_CANCELED.to_string()),
    };
    if cancel.is_cancelled() {
        return cancelled(exit_code);
    }

    let reply_file = scan_for_reply_file(&build_directory);
    let reply_timestamp = reply_file
        .as_deref()
        .and_then(|reply| RealFileSystem.modified(reply));

    let source_directory = parameters.source_directory.clone();
    let build_type = parameters.cmake_build_type.clone();
    let parse_cancel = cancel.clone();
    let parsed = tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let Some(reply_file) = reply_file else {
            return (
                ExtractedData::default(),
                Some("No CMake file API reply found in the build directory.".to_string()),
            );
        };
        let (data, error) = parse_data(&reply_file, &source_directory, &build_type, &parse_cancel);
        let result = match error {
            None => (
                extract_data(data, &source_directory, &build_directory, &policy),
                None,
            ),
            Some(message) => (
                ExtractedData {
                    cache: data.cache,
                    ..Default::default()
                },
                Some(message),
            ),
        };
        log_timing!(Level::INFO, "parse_file_api_reply", started.elapsed());
        result
    })
    .await;

    match parsed {
        Ok((data, error)) => CycleOutput {
            exit_code,
            restored_from_backup,
            reply_timestamp,
            data,
            error,
        },
        Err(e) if e.is_cancelled() => cancelled(exit_code),
        Err(e) => CycleOutput {
            exit_code,
            restored_from_backup,
            reply_timestamp,
            data: ExtractedData::default(),
            error: Some(format!("Parsing the CMake reply failed: {e}")),
        },
    }
}

async fn wait_for_cycle(cycle: &mut Option<Cycle>) -> Result<CycleOutput, JoinError> {
    match cycle {
        Some(cycle) => (&mut cycle.handle).await,
        None => std::future::pending().await,
    }
}

async fn next_watch_change(watcher: &mut Option<DirectoryWatcher>) -> Option<Vec<PathBuf>> {
    match watcher {
        Some(watcher) => watcher.next_change().await,
        None => std::future::pending().await,
    }
}

pub struct Reader {
    parameters: BuildDirParameters,
    runner: Arc<dyn ConfigureRunner>,
    policy: LibrarySearchPolicy,

    cache: CMakeConfig,
    cmake_files: CMakeFileSet,
    build_targets: Vec<CMakeBuildTarget>,
    project_parts: Vec<RawProjectPart>,
    root_project_node: Option<ProjectNode>,
    ctest_path: String,
    is_multi_config: bool,
    uses_all_caps_targets: bool,

    last_cmake_exit_code: i32,
    last_reply_timestamp: Option<SystemTime>,

    cycle: Option<Cycle>,
    watcher: Option<DirectoryWatcher>,
    pending: VecDeque<ReaderEvent>,
}

impl Reader {
    pub fn new(runner: Arc<dyn ConfigureRunner>, policy: LibrarySearchPolicy) -> Self {
        Self {
            parameters: BuildDirParameters::default(),
            runner,
            policy,
            cache: CMakeConfig::new(),
            cmake_files: CMakeFileSet::new(),
            build_targets: Vec::new(),
            project_parts: Vec::new(),
            root_project_node: None,
            ctest_path: String::new(),
            is_multi_config: false,
            uses_all_caps_targets: false,
            last_cmake_exit_code: 0,
            last_reply_timestamp: None,
            cycle: None,
            watcher: None,
            pending: VecDeque::new(),
        }
    }

    pub fn set_parameters(&mut self, parameters: BuildDirParameters) {
        let build_changed = parameters.build_directory != self.parameters.build_directory;
        self.parameters = parameters;
        debug!(
            target: "cmake_sync::reader",
            "Parameters set for {}",
            self.parameters.build_directory.display()
        );

        match setup_file_api(&self.parameters.build_directory) {
            Ok(()) if build_changed || self.watcher.is_none() => self.watch_reply_directory(),
            Ok(()) => {}
            Err(e) => warn!(target: "cmake_sync::reader", "{}", e),
        }
        self.reset_data();
    }

    fn watch_reply_directory(&mut self) {
        let reply_dir = reply_directory(&self.parameters.build_directory);
        self.watcher = match DirectoryWatcher::new(&reply_dir) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(target: "cmake_sync::reader", "Cannot watch {}: {}", reply_dir.display(), e);
                None
            }
        };
    }

    /// Start a parse cycle, replacing any cycle still in flight
    pub fn parse(&mut self, force_cmake_run: bool, force_initial: bool, force_extra: bool) {
        self.stop();

        let arguments = cmake_arguments(&self.parameters, force_initial, force_extra);
        let decision = must_run_cmake(
            &RealFileSystem,
            &self.parameters.build_directory,
            &self.cmake_files,
            self.parameters.is_auto_run(),
            !arguments.is_empty(),
            force_cmake_run,
        );
        info!(
            target: "cmake_sync::reader",
            "Parse requested (force run: {}, initial: {}, extra: {}): {:?}",
            force_cmake_run,
            force_initial,
            force_extra,
            decision
        );

        let run_cmake = decision.must_run();
        if run_cmake {
            self.pending.push_back(ReaderEvent::ConfigurationStarted);
        }

        let cancel = CancellationToken::new();
        let process_cancel = cancel.child_token();
        let handle = tokio::spawn(run_cycle(CycleInput {
            parameters: self.parameters.clone(),
            arguments,
            run_cmake,
            runner: Arc::clone(&self.runner),
            policy: self.policy.clone(),
            cancel: cancel.clone(),
            process_cancel: process_cancel.clone(),
        }));

        self.cycle = Some(Cycle {
            cancel,
            process_cancel,
            handle,
        });
    }

    /// Abandon the cycle in flight; it will not report
    pub fn stop(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            debug!(target: "cmake_sync::reader", "Stopping parse cycle");
            cycle.cancel.cancel();
            cycle.handle.abort();
        }
        self.pending.clear();
    }

    /// Terminate a running cmake; the cycle still reports its outcome
    pub fn stop_cmake_run(&mut self) {
        if let Some(cycle) = &self.cycle {
            cycle.process_cancel.cancel();
        }
    }

    pub fn is_parsing(&self) -> bool {
        self.cycle.is_some()
    }

    /// Whether the reply directory is watched for outside changes
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Wait for the next notification
    ///
    /// Returns `None` when there is neither a cycle in flight nor a watched
    /// reply directory.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.cycle.is_none() && self.watcher.is_none() {
                return None;
            }

            tokio::select! {
                result = wait_for_cycle(&mut self.cycle) => {
                    self.cycle = None;
                    return Some(self.finish_cycle(result));
                }
                change = next_watch_change(&mut self.watcher) => {
                    match change {
                        None => self.watcher = None,
                        Some(_) => {
                            if self.reply_directory_changed() {
                                return Some(ReaderEvent::Dirty);
                            }
                        }
                    }
                }
            }
        }
    }

    fn reply_directory_changed(&self) -> bool {
        if self.is_parsing() {
            return false;
        }
        let Some(last) = self.last_reply_timestamp else {
            return false;
        };
        scan_for_reply_file(&self.parameters.build_directory)
            .and_then(|reply| RealFileSystem.modified(&reply))
            .is_some_and(|modified| modified > last)
    }

    fn finish_cycle(&mut self, result: Result<CycleOutput, JoinError>) -> ReaderEvent {
        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => {
                return ReaderEvent::ErrorOccurred(PARSING_CANCELED.to_string());
            }
            Err(e) => return ReaderEvent::ErrorOccurred(format!("Parse cycle failed: {e}")),
        };

        if let Some(code) = output.exit_code {
            self.last_cmake_exit_code = code;
            // cmake replaced the watched directory
            self.watch_reply_directory();
        }
        if output.reply_timestamp.is_some() {
            self.last_reply_timestamp = output.reply_timestamp;
        }

        let ExtractedData {
            cache,
            cmake_files,
            build_targets,
            project_parts,
            root_project_node,
            ctest_path,
            is_multi_config,
            uses_all_caps_targets,
        } = output.data;

        self.cache = cache;
        if !cmake_files.is_empty() {
            self.cmake_files = cmake_files;
        }
        self.build_targets = build_targets;
        self.project_parts = project_parts;
        self.root_project_node = root_project_node;
        self.ctest_path = ctest_path;
        self.is_multi_config = is_multi_config;
        self.uses_all_caps_targets = uses_all_caps_targets;

        match output.error {
            Some(message) => {
                warn!(target: "cmake_sync::reader", "{}", message);
                ReaderEvent::ErrorOccurred(message)
            }
            None => {
                info!(
                    target: "cmake_sync::reader",
                    "Parsed {} targets (restored from backup: {})",
                    self.build_targets.len(),
                    output.restored_from_backup
                );
                ReaderEvent::DataAvailable {
                    restored_from_backup: output.restored_from_backup,
                }
            }
        }
    }

    pub fn reset_data(&mut self) {
        self.cmake_files.clear();
        if !self.parameters.source_directory.as_os_str().is_empty() {
            self.cmake_files.insert(CMakeFileInfo::cmake_lists(
                self.parameters.source_directory.join("CMakeLists.txt"),
            ));
        }
        self.cache = CMakeConfig::new();
        self.build_targets.clear();
        self.project_parts.clear();
        self.root_project_node = None;
    }

    pub fn take_build_targets(&mut self) -> Vec<CMakeBuildTarget> {
        std::mem::take(&mut self.build_targets)
    }

    /// The parsed cache, with an error when the last cmake run failed
    pub fn take_parsed_configuration(&mut self) -> (CMakeConfig, Option<String>) {
        let error = (self.last_cmake_exit_code != 0).then(|| {
            format!("CMake returned error code: {}", self.last_cmake_exit_code)
        });
        (std::mem::take(&mut self.cache), error)
    }

    pub fn create_raw_project_parts(&mut self) -> Vec<RawProjectPart> {
        std::mem::take(&mut self.project_parts)
    }

    pub fn take_root_project_node(&mut self) -> Option<ProjectNode> {
        self.root_project_node.take()
    }

    /// Non-generated CMake inputs; editing one calls for a new configure run
    pub fn project_files_to_watch(&self) -> Vec<PathBuf> {
        self.cmake_files
            .iter()
            .filter(|info| !info.is_generated)
            .map(|info| info.path.clone())
            .collect()
    }

    /// The single known CMake file, if there is exactly one
    pub fn top_cmake_file(&self) -> Option<PathBuf> {
        if self.cmake_files.len() == 1 {
            self.cmake_files.first().map(|info| info.path.clone())
        } else {
            None
        }
    }

    pub fn ctest_path(&self) -> Option<PathBuf> {
        (self.last_cmake_exit_code == 0 && !self.ctest_path.is_empty())
            .then(|| PathBuf::from(&self.ctest_path))
    }

    pub fn is_multi_config(&self) -> bool {
        self.is_multi_config
    }

    pub fn uses_all_caps_targets(&self) -> bool {
        self.uses_all_caps_targets
    }

    pub fn last_cmake_exit_code(&self) -> i32 {
        self.last_cmake_exit_code
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stop();
    }
}
