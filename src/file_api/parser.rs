//! Reading CMake file API reply objects
//!
//! Every reader returns what it could extract together with an optional
//! human-readable error. Malformed entries are skipped and reported rather
//! than aborting the whole document. Index cross references are validated
//! before any of the data is trusted.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cmake::config_item::{CMakeConfig, CMakeConfigItem, CacheEntryType};
use crate::cmake::tool::Version;
use crate::file_api::error::FileApiError;
use crate::file_api::model::{
    ArchiveInfo, BacktraceGraph, BacktraceNode, CMakeFileInfo, CompileInfo, Configuration,
    DefineInfo, DependencyInfo, Directory, FileApiData, FragmentInfo, HeaderPath, IncludeInfo,
    InstallDestination, LinkInfo, Macro, Project, ReplyFileContents, ReplyObject, SourceInfo,
    Target, TargetDetails,
};
use crate::io::file_system::{FileSystemTrait, RealFileSystem, resolve_path};

pub const REPLY_DIR: &str = ".cmake/api/v1/reply";
pub const REPLY_BACKUP_DIR: &str = ".cmake/api/v1/reply.prev";
pub const QUERY_DIR: &str = ".cmake/api/v1/query";
pub const QUERY_FILE_NAMES: [&str; 3] = ["cache-v2", "codemodel-v2", "cmakeFiles-v1"];

const INVALID_CODEMODEL: &str = "Invalid codemodel file generated by CMake";
pub const PARSING_CANCELED: &str = "CMake parsing was cancelled.";

// ============================================================================
// Helpers
// ============================================================================

fn read_json_file(path: Option<&Path>) -> Value {
    let Some(path) = path else {
        return Value::Null;
    };
    debug!("read_json_file: {}", path.display());
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            debug!("{} is not valid JSON: {}", path.display(), e);
            Value::Null
        }),
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            Value::Null
        }
    }
}

fn str_field<'a>(obj: &'a Value, key: &str) -> &'a str {
    obj.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn int_field(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_none_or(|o| o.is_empty())
}

/// `(major, minor)` of an object's `version`, `-1` for missing parts
fn object_version(obj: &Value) -> (i64, i64) {
    let version = obj.get("version").unwrap_or(&Value::Null);
    (
        int_field(version, "major").unwrap_or(-1),
        int_field(version, "minor").unwrap_or(-1),
    )
}

/// Kind and major version must match; the minor version is not checked
fn check_json_object(obj: &Value, kind: &str, major: i64) -> bool {
    str_field(obj, "kind") == kind && object_version(obj).0 == major
}

/// `-1` or absent means "none"; any other negative value can never be in bounds
fn optional_index(value: Option<i64>) -> Option<usize> {
    match value {
        None | Some(-1) => None,
        Some(i) => Some(usize::try_from(i).unwrap_or(usize::MAX)),
    }
}

/// Absent or negative indices are mapped out of bounds
fn required_index(value: Option<i64>) -> usize {
    value
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(usize::MAX)
}

fn index_list(value: Option<&Value>) -> Vec<usize> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| required_index(v.as_i64()))
                .collect()
        })
        .unwrap_or_default()
}

fn in_bounds(index: usize, len: usize) -> bool {
    index < len
}

fn optional_in_bounds(index: Option<usize>, len: usize) -> bool {
    index.is_none_or(|i| i < len)
}

// ============================================================================
// Reply file
// ============================================================================

/// Read an `index-*.json` reply file
pub fn read_reply_file(path: &Path) -> (ReplyFileContents, Option<String>) {
    const INVALID_REPLY: &str = "Invalid reply file created by CMake.";

    let document = read_json_file(Some(path));
    let mut result = ReplyFileContents::default();
    if is_empty_object(&document) {
        return (result, Some(INVALID_REPLY.to_string()));
    }

    let cmake = document.get("cmake").unwrap_or(&Value::Null);
    let paths = cmake.get("paths").unwrap_or(&Value::Null);
    result.cmake_executable = str_field(paths, "cmake").to_string();
    result.ctest_executable = str_field(paths, "ctest").to_string();
    result.cmake_root = str_field(paths, "root").to_string();

    let generator = cmake.get("generator").unwrap_or(&Value::Null);
    result.generator = str_field(generator, "name").to_string();
    result.is_multi_config = generator
        .get("multiConfig")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let version = cmake.get("version").unwrap_or(&Value::Null);
    let component = |key| {
        int_field(version, key)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    result.cmake_version = Version::new(component("major"), component("minor"), component("patch"));

    let mut had_invalid_object = false;
    let objects = document
        .get("objects")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for object in objects {
        let reply = ReplyObject {
            kind: str_field(object, "kind").to_string(),
            file: str_field(object, "jsonFile").to_string(),
            version: object_version(object),
        };
        if reply.kind.is_empty()
            || reply.file.is_empty()
            || reply.version.0 == -1
            || reply.version.1 == -1
        {
            had_invalid_object = true;
        } else {
            result.replies.push(reply);
        }
    }

    let invalid = result.generator.is_empty()
        || result.cmake_executable.is_empty()
        || result.cmake_root.is_empty()
        || result.replies.is_empty()
        || had_invalid_object;
    (result, invalid.then(|| INVALID_REPLY.to_string()))
}

// ============================================================================
// Cache file
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawNameValue {
    name: String,
    value: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCacheEntry {
    name: String,
    value: String,
    #[serde(rename = "type")]
    entry_type: String,
    properties: Vec<RawNameValue>,
}

/// Read a `cache-v2` reply object
pub fn read_cache_file(path: Option<&Path>) -> (CMakeConfig, Option<String>) {
    let root = read_json_file(path);
    if !check_json_object(&root, "cache", 2) {
        return (
            CMakeConfig::new(),
            Some("Invalid cache file generated by CMake.".to_string()),
        );
    }

    let entries = root
        .get("entries")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut result = CMakeConfig::new();
    for entry in entries {
        let raw: RawCacheEntry = serde_json::from_value(entry.clone()).unwrap_or_default();
        let mut item = CMakeConfigItem::new(
            raw.name,
            CacheEntryType::from_type_string(&raw.entry_type),
            raw.value,
        );
        for property in raw.properties {
            match property.name.as_str() {
                "ADVANCED" => {
                    item.is_advanced = CMakeConfigItem::to_bool(&property.value) == Some(true);
                }
                "HELPSTRING" => item.documentation = property.value,
                "STRINGS" => {
                    item.values = property.value.split(';').map(str::to_string).collect();
                }
                _ => {}
            }
        }
        result.push(item);
    }
    (result, None)
}

// ============================================================================
// CMake files
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawCMakeInput {
    path: String,
    is_c_make: bool,
    is_generated: bool,
    is_external: bool,
}

/// Read a `cmakeFiles-v1` reply object; relative paths are resolved against `source_dir`
pub fn read_cmake_files_file(
    path: Option<&Path>,
    source_dir: &Path,
) -> (Vec<CMakeFileInfo>, Option<String>) {
    let root = read_json_file(path);
    if !check_json_object(&root, "cmakeFiles", 1) {
        return (
            Vec::new(),
            Some("Invalid cmakeFiles file generated by CMake.".to_string()),
        );
    }

    let inputs = root
        .get("inputs")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let result = inputs
        .iter()
        .map(|input| {
            let raw: RawCMakeInput = serde_json::from_value(input.clone()).unwrap_or_default();
            let path = resolve_path(source_dir, &raw.path);
            let is_cmake_lists_txt = path
                .file_name()
                .is_some_and(|name| name == "CMakeLists.txt");
            CMakeFileInfo {
                path,
                is_cmake: raw.is_c_make,
                is_cmake_lists_txt,
                is_generated: raw.is_generated,
                is_external: raw.is_external,
            }
        })
        .collect();
    (result, None)
}

// ============================================================================
// Codemodel file
// ============================================================================

fn codemodel_error(detail: &str) -> String {
    format!("{INVALID_CODEMODEL}: {detail}")
}

fn extract_directories(directories: &[Value], error: &mut Option<String>) -> Vec<Directory> {
    if directories.is_empty() {
        *error = Some(codemodel_error("No directories."));
        return Vec::new();
    }

    let mut result = Vec::new();
    for obj in directories {
        if is_empty_object(obj) {
            *error = Some(codemodel_error("Empty directory object."));
            continue;
        }
        result.push(Directory {
            source_path: str_field(obj, "source").to_string(),
            build_path: str_field(obj, "build").to_string(),
            parent: optional_index(int_field(obj, "parentIndex")),
            project: required_index(int_field(obj, "projectIndex")),
            children: index_list(obj.get("childIndexes")),
            targets: index_list(obj.get("targetIndexes")),
            has_install_rule: obj
                .get("hasInstallRule")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }
    result
}

fn extract_projects(projects: &[Value], error: &mut Option<String>) -> Vec<Project> {
    if projects.is_empty() {
        *error = Some(codemodel_error("No projects."));
        return Vec::new();
    }

    let mut result = Vec::new();
    for obj in projects {
        if is_empty_object(obj) {
            debug!("Empty project skipped!");
            *error = Some(codemodel_error("Empty project object."));
            continue;
        }
        let project = Project {
            name: str_field(obj, "name").to_string(),
            parent: optional_index(int_field(obj, "parentIndex")),
            children: index_list(obj.get("childIndexes")),
            directories: index_list(obj.get("directoryIndexes")),
            targets: index_list(obj.get("targetIndexes")),
        };
        if project.directories.is_empty() {
            debug!("Invalid project skipped!");
            *error = Some(codemodel_error("Broken project data."));
            continue;
        }
        debug!("Project read: {} {:?}", project.name, project.directories);
        result.push(project);
    }
    result
}

fn extract_targets(targets: &[Value], error: &mut Option<String>) -> Vec<Target> {
    let mut result = Vec::new();
    for obj in targets {
        if is_empty_object(obj) {
            *error = Some(codemodel_error("Empty target object."));
            continue;
        }
        let name = str_field(obj, "name");
        let id = str_field(obj, "id");
        let json_file = str_field(obj, "jsonFile");
        let directory = optional_index(int_field(obj, "directoryIndex"));
        let project = optional_index(int_field(obj, "projectIndex"));

        match (directory, project) {
            (Some(directory), Some(project))
                if !name.is_empty() && !id.is_empty() && !json_file.is_empty() =>
            {
                result.push(Target {
                    name: name.to_string(),
                    id: id.to_string(),
                    directory,
                    project,
                    json_file: json_file.to_string(),
                });
            }
            _ => *error = Some(codemodel_error("Broken target data.")),
        }
    }
    result
}

/// Check every cross reference of a configuration
///
/// Accepts iff all indices are in bounds and there is exactly one top-level
/// directory and exactly one top-level project.
pub fn validate_indexes(config: &Configuration) -> bool {
    let directory_count = config.directories.len();
    let project_count = config.projects.len();
    let target_count = config.targets.len();

    let mut top_level_count = 0;
    for d in &config.directories {
        if d.parent.is_none() {
            top_level_count += 1;
        }
        if !optional_in_bounds(d.parent, directory_count) {
            warn!("Directory {}: parent index {:?} is broken.", d.source_path, d.parent);
            return false;
        }
        if !in_bounds(d.project, project_count) {
            warn!("Directory {}: project index {} is broken.", d.source_path, d.project);
            return false;
        }
        if d.children.iter().any(|&c| !in_bounds(c, directory_count)) {
            warn!("Directory {}: A child index {:?} is broken.", d.source_path, d.children);
            return false;
        }
        if d.targets.iter().any(|&t| !in_bounds(t, target_count)) {
            warn!("Directory {}: A target index {:?} is broken.", d.source_path, d.targets);
            return false;
        }
    }
    if top_level_count != 1 {
        warn!(
            "Directories: Invalid number of top level directories, {} (expected: 1).",
            top_level_count
        );
        return false;
    }

    top_level_count = 0;
    for p in &config.projects {
        if p.parent.is_none() {
            top_level_count += 1;
        }
        if !optional_in_bounds(p.parent, project_count) {
            warn!("Project {}: parent index {:?} is broken.", p.name, p.parent);
            return false;
        }
        if p.children.iter().any(|&c| !in_bounds(c, project_count)) {
            warn!("Project {}: A child index {:?} is broken.", p.name, p.children);
            return false;
        }
        if p.targets.iter().any(|&t| !in_bounds(t, target_count)) {
            warn!("Project {}: A target index {:?} is broken.", p.name, p.targets);
            return false;
        }
        if p.directories.iter().any(|&d| !in_bounds(d, directory_count)) {
            warn!("Project {}: A directory index {:?} is broken.", p.name, p.directories);
            return false;
        }
    }
    if top_level_count != 1 {
        warn!(
            "Projects: Invalid number of top level projects, {} (expected: 1).",
            top_level_count
        );
        return false;
    }

    for t in &config.targets {
        if !in_bounds(t.directory, directory_count) {
            warn!("Target {}: directory index {} is broken.", t.name, t.directory);
            return false;
        }
        if !in_bounds(t.project, project_count) {
            warn!("Target {}: project index {} is broken.", t.name, t.project);
            return false;
        }
    }
    true
}

fn extract_configurations(
    configurations: &[Value],
    error: &mut Option<String>,
) -> Vec<Configuration> {
    if configurations.is_empty() {
        *error = Some(codemodel_error("No configurations."));
        return Vec::new();
    }

    let array = |obj: &Value, key: &str| -> Vec<Value> {
        obj.get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    let mut result = Vec::new();
    for obj in configurations {
        if is_empty_object(obj) {
            *error = Some(codemodel_error("Empty configuration object."));
            continue;
        }
        let config = Configuration {
            name: str_field(obj, "name").to_string(),
            directories: extract_directories(&array(obj, "directories"), error),
            projects: extract_projects(&array(obj, "projects"), error),
            targets: extract_targets(&array(obj, "targets"), error),
        };

        if !validate_indexes(&config) {
            *error = Some(codemodel_error(
                "Broken indexes in directories, projects, or targets.",
            ));
            return Vec::new();
        }
        result.push(config);
    }
    result
}

/// Read a `codemodel-v2` reply object
pub fn read_codemodel_file(path: Option<&Path>) -> (Vec<Configuration>, Option<String>) {
    let root = read_json_file(path);
    if !check_json_object(&root, "codemodel", 2) {
        return (Vec::new(), Some(format!("{INVALID_CODEMODEL}.")));
    }

    let configurations = root
        .get("configurations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut error = None;
    let result = extract_configurations(configurations, &mut error);
    (result, error)
}

// ============================================================================
// Target files
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawName {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawPath {
    path: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawPaths {
    source: String,
    build: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDestination {
    path: String,
    backtrace: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawInstall {
    prefix: RawPath,
    destinations: Vec<RawDestination>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawFragment {
    fragment: String,
    role: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawLink {
    language: String,
    lto: bool,
    sysroot: RawPath,
    command_fragments: Vec<RawFragment>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawArchive {
    lto: bool,
    command_fragments: Vec<RawFragment>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDependency {
    id: String,
    backtrace: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawSource {
    path: String,
    compile_group_index: Option<i64>,
    source_group_index: Option<i64>,
    backtrace: Option<i64>,
    is_generated: bool,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawInclude {
    path: String,
    is_system: bool,
    backtrace: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDefine {
    define: String,
    backtrace: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawCompileGroup {
    source_indexes: Vec<Option<i64>>,
    language: String,
    compile_command_fragments: Vec<RawFragment>,
    includes: Vec<RawInclude>,
    defines: Vec<RawDefine>,
    sysroot: RawPath,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBacktraceNode {
    file: Option<i64>,
    line: Option<i64>,
    command: Option<i64>,
    parent: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBacktraceGraph {
    files: Vec<String>,
    commands: Vec<String>,
    nodes: Vec<RawBacktraceNode>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawTargetDetails {
    name: String,
    id: String,
    #[serde(rename = "type")]
    target_type: String,
    backtrace: Option<i64>,
    folder: RawName,
    paths: RawPaths,
    name_on_disk: String,
    artifacts: Vec<RawPath>,
    is_generator_provided: bool,
    install: RawInstall,
    link: Option<RawLink>,
    archive: Option<RawArchive>,
    dependencies: Vec<RawDependency>,
    sources: Vec<RawSource>,
    source_groups: Vec<RawName>,
    compile_groups: Vec<RawCompileGroup>,
    backtrace_graph: RawBacktraceGraph,
}

fn fragments(raw: Vec<RawFragment>) -> Vec<FragmentInfo> {
    raw.into_iter()
        .map(|f| FragmentInfo {
            fragment: f.fragment,
            role: f.role,
        })
        .collect()
}

impl From<RawTargetDetails> for TargetDetails {
    fn from(raw: RawTargetDetails) -> Self {
        TargetDetails {
            name: raw.name,
            id: raw.id,
            target_type: raw.target_type,
            folder_target_property: raw.folder.name,
            source_dir: raw.paths.source,
            build_dir: raw.paths.build,
            backtrace: optional_index(raw.backtrace),
            name_on_disk: raw.name_on_disk,
            artifacts: raw.artifacts.into_iter().map(|a| a.path).collect(),
            is_generator_provided: raw.is_generator_provided,
            install_prefix: raw.install.prefix.path,
            install_destinations: raw
                .install
                .destinations
                .into_iter()
                .map(|d| InstallDestination {
                    path: d.path,
                    backtrace: optional_index(d.backtrace),
                })
                .collect(),
            link: raw.link.map(|l| LinkInfo {
                language: l.language,
                fragments: fragments(l.command_fragments),
                is_lto: l.lto,
                sysroot: l.sysroot.path,
            }),
            archive: raw.archive.map(|a| ArchiveInfo {
                fragments: fragments(a.command_fragments),
                is_lto: a.lto,
            }),
            dependencies: raw
                .dependencies
                .into_iter()
                .map(|d| DependencyInfo {
                    target_id: d.id,
                    backtrace: optional_index(d.backtrace),
                })
                .collect(),
            sources: raw
                .sources
                .into_iter()
                .map(|s| SourceInfo {
                    path: s.path,
                    compile_group: optional_index(s.compile_group_index),
                    source_group: optional_index(s.source_group_index),
                    backtrace: optional_index(s.backtrace),
                    is_generated: s.is_generated,
                })
                .collect(),
            source_groups: raw.source_groups.into_iter().map(|g| g.name).collect(),
            compile_groups: raw
                .compile_groups
                .into_iter()
                .map(|cg| CompileInfo {
                    sources: cg.source_indexes.into_iter().map(required_index).collect(),
                    language: cg.language,
                    fragments: cg
                        .compile_command_fragments
                        .into_iter()
                        .map(|f| f.fragment)
                        .collect(),
                    includes: cg
                        .includes
                        .into_iter()
                        .map(|i| IncludeInfo {
                            path: HeaderPath::detect(&i.path, i.is_system),
                            backtrace: optional_index(i.backtrace),
                        })
                        .collect(),
                    defines: cg
                        .defines
                        .into_iter()
                        .map(|d| DefineInfo {
                            define: Macro::from_key_value(&d.define),
                            backtrace: optional_index(d.backtrace),
                        })
                        .collect(),
                    sysroot: cg.sysroot.path,
                })
                .collect(),
            backtrace_graph: BacktraceGraph {
                files: raw.backtrace_graph.files,
                commands: raw.backtrace_graph.commands,
                nodes: raw
                    .backtrace_graph
                    .nodes
                    .into_iter()
                    .map(|n| BacktraceNode {
                        file: required_index(n.file),
                        line: n.line.unwrap_or(-1),
                        command: optional_index(n.command),
                        parent: optional_index(n.parent),
                    })
                    .collect(),
            },
        }
    }
}

/// Check the internal consistency of a backtrace forest
///
/// Returns the node count, or `None` when an index is out of bounds or a
/// non-empty graph has no top-level node.
pub fn validate_backtrace_graph(graph: &BacktraceGraph) -> Option<usize> {
    let file_count = graph.files.len();
    let command_count = graph.commands.len();
    let node_count = graph.nodes.len();

    let mut top_level_count = 0;
    for n in &graph.nodes {
        if n.parent.is_none() {
            top_level_count += 1;
        }
        if !in_bounds(n.file, file_count) {
            warn!("BacktraceNode: file index {} is broken.", n.file);
            return None;
        }
        if !optional_in_bounds(n.command, command_count) {
            warn!("BacktraceNode: command index {:?} is broken.", n.command);
            return None;
        }
        if !optional_in_bounds(n.parent, node_count) {
            warn!("BacktraceNode: parent index {:?} is broken.", n.parent);
            return None;
        }
    }

    if top_level_count == 0 && node_count > 0 {
        warn!("BacktraceNode: Invalid number of top level nodes {}", top_level_count);
        return None;
    }
    Some(node_count)
}

/// Check all indices of a target file against its own tables
pub fn validate_target_details(t: &TargetDetails) -> bool {
    let Some(backtrace_count) = validate_backtrace_graph(&t.backtrace_graph) else {
        return false;
    };
    let sources_count = t.sources.len();
    let source_groups_count = t.source_groups.len();
    let compile_groups_count = t.compile_groups.len();

    if !optional_in_bounds(t.backtrace, backtrace_count) {
        warn!("TargetDetails {}: backtrace index {:?} is broken.", t.name, t.backtrace);
        return false;
    }
    for d in &t.install_destinations {
        if !optional_in_bounds(d.backtrace, backtrace_count) {
            warn!(
                "TargetDetails {}: backtrace index {:?} of install destination is broken.",
                t.name, d.backtrace
            );
            return false;
        }
    }
    for d in &t.dependencies {
        if !optional_in_bounds(d.backtrace, backtrace_count) {
            warn!(
                "TargetDetails {}: backtrace index {:?} of dependency is broken.",
                t.name, d.backtrace
            );
            return false;
        }
    }
    for s in &t.sources {
        if !optional_in_bounds(s.compile_group, compile_groups_count) {
            warn!(
                "TargetDetails {}: compile group index {:?} of source info is broken.",
                t.name, s.compile_group
            );
            return false;
        }
        if !optional_in_bounds(s.source_group, source_groups_count) {
            warn!(
                "TargetDetails {}: source group index {:?} of source info is broken.",
                t.name, s.source_group
            );
            return false;
        }
        if !optional_in_bounds(s.backtrace, backtrace_count) {
            warn!(
                "TargetDetails {}: backtrace index {:?} of source info is broken.",
                t.name, s.backtrace
            );
            return false;
        }
    }
    for cg in &t.compile_groups {
        if let Some(s) = cg.sources.iter().find(|&&s| !in_bounds(s, sources_count)) {
            warn!(
                "TargetDetails {}: sources index {} of compile group is broken.",
                t.name, s
            );
            return false;
        }
        if cg
            .includes
            .iter()
            .any(|i| !optional_in_bounds(i.backtrace, backtrace_count))
        {
            warn!(
                "TargetDetails {}: includes/backtrace index of compile group is broken.",
                t.name
            );
            return false;
        }
        if cg
            .defines
            .iter()
            .any(|d| !optional_in_bounds(d.backtrace, backtrace_count))
        {
            warn!(
                "TargetDetails {}: defines/backtrace index of compile group is broken.",
                t.name
            );
            return false;
        }
    }
    true
}

/// Read and validate a `target-*.json` reply object
pub fn read_target_file(path: &Path) -> (TargetDetails, Option<String>) {
    const MISSING_INFORMATION: &str = "Invalid target file: Information is missing.";

    let root = read_json_file(Some(path));
    let raw: RawTargetDetails = match serde_json::from_value(root) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("Target file {} does not deserialize: {}", path.display(), e);
            return (
                TargetDetails::default(),
                Some(MISSING_INFORMATION.to_string()),
            );
        }
    };
    if raw.name.is_empty() || raw.id.is_empty() || raw.target_type.is_empty() {
        return (
            TargetDetails::default(),
            Some(MISSING_INFORMATION.to_string()),
        );
    }

    let details = TargetDetails::from(raw);
    if !validate_target_details(&details) {
        return (
            details,
            Some(
                "Invalid target file generated by CMake: Broken indexes in target details."
                    .to_string(),
            ),
        );
    }
    (details, None)
}

// ============================================================================
// Whole reply
// ============================================================================

fn unique_target_files(config: &Configuration) -> Vec<&str> {
    let mut known_ids = HashSet::new();
    config
        .targets
        .iter()
        .filter(|t| known_ids.insert(t.id.as_str()))
        .map(|t| t.json_file.as_str())
        .collect()
}

fn no_configuration_message(requested: &str, available: &[&str], multi_config: bool) -> String {
    let names = available.join(", ");
    if multi_config {
        format!(
            "No \"{requested}\" CMake configuration found. Available configurations: \"{names}\".\n\
             Make sure that CMAKE_CONFIGURATION_TYPES variable contains the \"Build type\" field."
        )
    } else {
        format!(
            "No \"{requested}\" CMake configuration found. Available configuration: \"{names}\".\n\
             Make sure that CMAKE_BUILD_TYPE variable matches the \"Build type\" field."
        )
    }
}

/// Read a complete reply directory for one build type
///
/// `build_type` selects the codemodel configuration (case-insensitive); the
/// placeholder `Build` selects the unnamed configuration.
pub fn parse_data(
    reply_file_path: &Path,
    source_dir: &Path,
    build_type: &str,
    cancel: &CancellationToken,
) -> (FileApiData, Option<String>) {
    let canceled = || {
        cancel
            .is_cancelled()
            .then(|| (FileApiData::default(), Some(PARSING_CANCELED.to_string())))
    };
    let build_type = if build_type == "Build" { "" } else { build_type };
    let reply_dir = reply_file_path.parent().unwrap_or(Path::new(""));

    let mut error: Option<String> = None;
    let mut record = |e: Option<String>| {
        if e.is_some() {
            error = e;
        }
    };
    let mut result = FileApiData::default();

    let (reply_file, e) = read_reply_file(reply_file_path);
    record(e);
    result.reply_file = reply_file;
    if let Some(c) = canceled() {
        return c;
    }

    let (cache, e) = read_cache_file(result.reply_file.json_file("cache", reply_dir).as_deref());
    record(e);
    result.cache = cache;
    if let Some(c) = canceled() {
        return c;
    }

    let (cmake_files, e) = read_cmake_files_file(
        result
            .reply_file
            .json_file("cmakeFiles", reply_dir)
            .as_deref(),
        source_dir,
    );
    record(e);
    result.cmake_files = cmake_files;
    if let Some(c) = canceled() {
        return c;
    }

    let (code_models, e) =
        read_codemodel_file(result.reply_file.json_file("codemodel", reply_dir).as_deref());
    record(e);

    if code_models.is_empty() {
        return (result, Some("No CMake configuration found!".to_string()));
    }

    let Some(selected) = code_models
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(build_type))
    else {
        let available: Vec<&str> = code_models.iter().map(|c| c.name.as_str()).collect();
        let message =
            no_configuration_message(build_type, &available, result.reply_file.is_multi_config);
        return (result, Some(message));
    };
    result.codemodel = code_models.into_iter().nth(selected).unwrap_or_default();
    if let Some(c) = canceled() {
        return c;
    }

    let target_files: Vec<PathBuf> = unique_target_files(&result.codemodel)
        .into_iter()
        .map(|file| reply_dir.join(file))
        .collect();
    for target_file in target_files {
        if let Some(c) = canceled() {
            return c;
        }
        let (details, e) = read_target_file(&target_file);
        match e {
            None => result.target_details.push(details),
            Some(message) => {
                warn!(
                    "Failed to retrieve target data from cmake fileapi: {}",
                    message
                );
                record(Some(message));
            }
        }
    }

    (result, error)
}

// ============================================================================
// Reply directory handling
// ============================================================================

pub fn reply_directory(build_dir: &Path) -> PathBuf {
    build_dir.join(REPLY_DIR)
}

/// Paths of the query marker files requesting the reply kinds we read
pub fn query_file_paths(build_dir: &Path) -> Vec<PathBuf> {
    let query_dir = build_dir.join(QUERY_DIR);
    QUERY_FILE_NAMES
        .iter()
        .map(|name| query_dir.join(name))
        .collect()
}

/// The newest `index-*.json` file of the reply directory
pub fn scan_for_reply_file_in(fs: &impl FileSystemTrait, build_dir: &Path) -> Option<PathBuf> {
    let reply_dir = reply_directory(build_dir);
    let names = fs.list_dir(&reply_dir).ok()?;
    names
        .into_iter()
        .filter(|name| name.starts_with("index-") && name.ends_with(".json"))
        .map(|name| reply_dir.join(name))
        .filter(|path| fs.metadata(path).is_ok_and(|m| !m.is_dir))
        .max()
}

pub fn scan_for_reply_file(build_dir: &Path) -> Option<PathBuf> {
    scan_for_reply_file_in(&RealFileSystem, build_dir)
}

/// Create the reply directory (so it can be watched) and the query marker files
///
/// Existing query files are left untouched so their timestamps stay meaningful.
pub fn setup_file_api(build_dir: &Path) -> Result<(), FileApiError> {
    let setup_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FileApiError::Setup { path, source }
    };

    let reply_dir = reply_directory(build_dir);
    std::fs::create_dir_all(&reply_dir).map_err(setup_error(&reply_dir))?;

    let query_dir = build_dir.join(QUERY_DIR);
    std::fs::create_dir_all(&query_dir).map_err(setup_error(&query_dir))?;

    for query_file in query_file_paths(build_dir) {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&query_file)
            .map_err(setup_error(&query_file))?;
    }
    Ok(())
}
