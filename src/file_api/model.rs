//! Typed structures for CMake file API replies and the project model built from them
//!
//! Cross references inside the codemodel and target files are kept as arena
//! indices. `None` stands for CMake's `-1` ("no parent", "no backtrace");
//! every index is bounds-checked by the parser before anything dereferences it.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::cmake::config_item::CMakeConfig;
use crate::cmake::tool::Version;
use crate::file_api::tree::ProjectNode;

// ============================================================================
// Reply index
// ============================================================================

/// One entry of the `objects` array of an `index-*.json` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyObject {
    pub kind: String,
    pub file: String,
    pub version: (i64, i64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplyFileContents {
    pub generator: String,
    pub is_multi_config: bool,
    pub cmake_executable: String,
    pub ctest_executable: String,
    pub cmake_root: String,
    pub cmake_version: Version,
    pub replies: Vec<ReplyObject>,
}

impl ReplyFileContents {
    /// Absolute path of the reply object of the given kind
    pub fn json_file(&self, kind: &str, reply_dir: &Path) -> Option<PathBuf> {
        self.replies
            .iter()
            .find(|r| r.kind == kind)
            .filter(|r| !r.file.is_empty())
            .map(|r| reply_dir.join(&r.file))
    }
}

// ============================================================================
// Codemodel
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    pub source_path: String,
    pub build_path: String,
    pub parent: Option<usize>,
    pub project: usize,
    pub children: Vec<usize>,
    pub targets: Vec<usize>,
    pub has_install_rule: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub directories: Vec<usize>,
    pub targets: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub id: String,
    pub directory: usize,
    pub project: usize,
    pub json_file: String,
}

/// One build configuration of the codemodel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub name: String,
    pub directories: Vec<Directory>,
    pub projects: Vec<Project>,
    pub targets: Vec<Target>,
}

// ============================================================================
// Target details
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallDestination {
    pub path: String,
    pub backtrace: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentInfo {
    pub fragment: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub language: String,
    pub fragments: Vec<FragmentInfo>,
    pub is_lto: bool,
    pub sysroot: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub fragments: Vec<FragmentInfo>,
    pub is_lto: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyInfo {
    pub target_id: String,
    pub backtrace: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub path: String,
    pub compile_group: Option<usize>,
    pub source_group: Option<usize>,
    pub backtrace: Option<usize>,
    pub is_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeInfo {
    pub path: HeaderPath,
    pub backtrace: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefineInfo {
    pub define: Macro,
    pub backtrace: Option<usize>,
}

/// A compile group: sources sharing one set of flags for one language
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileInfo {
    pub sources: Vec<usize>,
    pub language: String,
    pub fragments: Vec<String>,
    pub includes: Vec<IncludeInfo>,
    pub defines: Vec<DefineInfo>,
    pub sysroot: String,
}

/// A node of the backtrace forest; `file` and `command` index into the graph's tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacktraceNode {
    pub file: usize,
    pub line: i64,
    pub command: Option<usize>,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacktraceGraph {
    pub files: Vec<String>,
    pub commands: Vec<String>,
    pub nodes: Vec<BacktraceNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDetails {
    pub name: String,
    pub id: String,
    pub target_type: String,
    pub folder_target_property: String,
    pub source_dir: String,
    pub build_dir: String,
    pub backtrace: Option<usize>,
    pub name_on_disk: String,
    pub artifacts: Vec<String>,
    pub is_generator_provided: bool,
    pub install_prefix: String,
    pub install_destinations: Vec<InstallDestination>,
    pub link: Option<LinkInfo>,
    pub archive: Option<ArchiveInfo>,
    pub dependencies: Vec<DependencyInfo>,
    pub sources: Vec<SourceInfo>,
    pub source_groups: Vec<String>,
    pub compile_groups: Vec<CompileInfo>,
    pub backtrace_graph: BacktraceGraph,
}

// ============================================================================
// CMake input files
// ============================================================================

/// A file CMake read while configuring; identity is the path alone
#[derive(Debug, Clone, Default, Serialize)]
pub struct CMakeFileInfo {
    pub path: PathBuf,
    pub is_cmake: bool,
    pub is_cmake_lists_txt: bool,
    pub is_generated: bool,
    pub is_external: bool,
}

impl CMakeFileInfo {
    pub fn cmake_lists(path: PathBuf) -> Self {
        Self {
            path,
            is_cmake_lists_txt: true,
            ..Default::default()
        }
    }
}

impl PartialEq for CMakeFileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for CMakeFileInfo {}

impl Hash for CMakeFileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl PartialOrd for CMakeFileInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CMakeFileInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

pub type CMakeFileSet = BTreeSet<CMakeFileInfo>;

/// Everything read from one reply directory for the selected configuration
#[derive(Debug, Clone, Default)]
pub struct FileApiData {
    pub reply_file: ReplyFileContents,
    pub cache: CMakeConfig,
    pub cmake_files: Vec<CMakeFileInfo>,
    pub codemodel: Configuration,
    pub target_details: Vec<TargetDetails>,
}

// ============================================================================
// Project model
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum HeaderPathType {
    #[default]
    User,
    System,
    Framework,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HeaderPath {
    pub path: String,
    pub kind: HeaderPathType,
}

impl HeaderPath {
    /// Classify an include directory; `Foo.framework` directories become
    /// framework search paths for their parent
    pub fn detect(path: &str, is_system: bool) -> Self {
        let trimmed = path.trim_end_matches('/');
        if let Some(stem) = trimmed.strip_suffix(".framework")
            && let Some(slash) = stem.rfind('/')
        {
            return Self {
                path: trimmed[..slash].to_string(),
                kind: HeaderPathType::Framework,
            };
        }
        Self {
            path: path.to_string(),
            kind: if is_system {
                HeaderPathType::System
            } else {
                HeaderPathType::User
            },
        }
    }
}

/// A preprocessor definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Macro {
    pub key: String,
    pub value: String,
}

impl Macro {
    /// Parse `KEY=VALUE`; a bare `KEY` is defined to `1`
    pub fn from_key_value(text: &str) -> Self {
        match text.split_once('=') {
            Some((key, value)) => Self {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            },
            None => Self {
                key: text.trim().to_string(),
                value: "1".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum TargetType {
    Executable,
    StaticLibrary,
    DynamicLibrary,
    ObjectLibrary,
    #[default]
    Utility,
}

impl TargetType {
    pub fn from_cmake_type(value: &str) -> Self {
        match value {
            "EXECUTABLE" => TargetType::Executable,
            "STATIC_LIBRARY" => TargetType::StaticLibrary,
            "OBJECT_LIBRARY" => TargetType::ObjectLibrary,
            "MODULE_LIBRARY" | "SHARED_LIBRARY" => TargetType::DynamicLibrary,
            _ => TargetType::Utility,
        }
    }
}

/// Where in the CMake sources a fact about a target originates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LocationInfo {
    /// The CMake command, e.g. `add_executable`
    pub display_name: String,
    pub path: PathBuf,
    pub line: i64,
    pub priority: u32,
}

pub type Backtrace = Vec<LocationInfo>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CMakeBuildTarget {
    pub title: String,
    pub executable: Option<PathBuf>,
    pub target_type: TargetType,
    pub working_directory: PathBuf,
    pub source_directory: PathBuf,
    pub links_to_qt_gui: bool,
    pub qtc_runnable: bool,
    pub library_directories: Vec<PathBuf>,
    pub backtrace: Backtrace,
    pub dependency_definitions: Vec<Backtrace>,
    pub source_definitions: Vec<Backtrace>,
    pub include_definitions: Vec<Backtrace>,
    pub define_definitions: Vec<Backtrace>,
    pub install_definitions: Vec<Backtrace>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BuildTargetType {
    Executable,
    #[default]
    Library,
}

/// Compilation-database-like description of one compile group
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawProjectPart {
    pub display_name: String,
    pub project_file: PathBuf,
    pub build_system_target: String,
    pub build_target_type: BuildTargetType,
    pub language: String,
    pub files: Vec<PathBuf>,
    pub macros: Vec<Macro>,
    pub header_paths: Vec<HeaderPath>,
    pub precompiled_headers: Vec<PathBuf>,
    pub command_line_flags: Vec<String>,
}

/// Result of turning [`FileApiData`] into the project model
#[derive(Debug, Clone, Default)]
pub struct ExtractedData {
    pub cache: CMakeConfig,
    pub cmake_files: CMakeFileSet,
    pub build_targets: Vec<CMakeBuildTarget>,
    pub project_parts: Vec<RawProjectPart>,
    pub root_project_node: Option<ProjectNode>,
    pub ctest_path: String,
    pub is_multi_config: bool,
    pub uses_all_caps_targets: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_from_key_value() {
        assert_eq!(
            Macro::from_key_value("VERSION=\"1.2\""),
            Macro {
                key: "VERSION".to_string(),
                value: "\"1.2\"".to_string()
            }
        );
        assert_eq!(Macro::from_key_value("NDEBUG").value, "1");
        assert_eq!(Macro::from_key_value("EMPTY=").value, "");
    }

    #[test]
    fn test_header_path_detection() {
        let user = HeaderPath::detect("/src/include", false);
        assert_eq!(user.kind, HeaderPathType::User);

        let system = HeaderPath::detect("/usr/include/qt", true);
        assert_eq!(system.kind, HeaderPathType::System);

        let framework = HeaderPath::detect("/Library/Frameworks/QtCore.framework", true);
        assert_eq!(framework.kind, HeaderPathType::Framework);
        assert_eq!(framework.path, "/Library/Frameworks");
    }

    #[test]
    fn test_target_type_mapping() {
        assert_eq!(TargetType::from_cmake_type("EXECUTABLE"), TargetType::Executable);
        assert_eq!(
            TargetType::from_cmake_type("MODULE_LIBRARY"),
            TargetType::DynamicLibrary
        );
        assert_eq!(
            TargetType::from_cmake_type("INTERFACE_LIBRARY"),
            TargetType::Utility
        );
    }

    #[test]
    fn test_cmake_file_info_is_unique_by_path() {
        let mut set = CMakeFileSet::new();
        set.insert(CMakeFileInfo::cmake_lists(PathBuf::from("/src/CMakeLists.txt")));
        set.insert(CMakeFileInfo {
            path: PathBuf::from("/src/CMakeLists.txt"),
            is_generated: true,
            ..Default::default()
        });
        assert_eq!(set.len(), 1);
        assert!(set.iter().next().unwrap().is_cmake_lists_txt);
    }

    #[test]
    fn test_reply_json_file_lookup() {
        let reply = ReplyFileContents {
            replies: vec![ReplyObject {
                kind: "cache".to_string(),
                file: "cache-v2-abc.json".to_string(),
                version: (2, 0),
            }],
            ..Default::default()
        };
        let dir = Path::new("/build/.cmake/api/v1/reply");
        assert_eq!(
            reply.json_file("cache", dir),
            Some(dir.join("cache-v2-abc.json"))
        );
        assert_eq!(reply.json_file("codemodel", dir), None);
    }
}
