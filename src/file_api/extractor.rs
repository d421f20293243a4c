//! Turning validated reply data into the project model
//!
//! Build targets, code model project parts, the CMake input-file set and the
//! project tree are all derived here from a [`FileApiData`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::cmake::tool::Version;
use crate::file_api::model::{
    Backtrace, BacktraceGraph, BuildTargetType, CMakeBuildTarget, CMakeFileInfo, CMakeFileSet,
    Configuration, ExtractedData, FileApiData, LocationInfo, RawProjectPart, TargetDetails,
    TargetType,
};
use crate::file_api::tree::{
    self, BUILD_DIRECTORY_FOLDER, CMakeFileNodes, DEFAULT_FOLDER_PRIORITY, FileType,
    OTHER_LOCATIONS_FOLDER, ProjectNode,
};
use crate::io::file_system::{clean_path, copy_if_different, resolve_path};

// ============================================================================
// Library search policy
// ============================================================================

/// Which linker search directories are reported for executables
#[derive(Debug, Clone, PartialEq)]
pub struct LibrarySearchPolicy {
    /// Directories dropped together with everything below them (standard system search paths)
    pub excluded_prefixes: Vec<PathBuf>,
    pub exclude_system_dirs: bool,
    /// Also report `../bin` next to a `lib` directory (DLLs live there on Windows)
    pub probe_bin_next_to_lib: bool,
}

impl LibrarySearchPolicy {
    /// Report every existing directory unchanged
    #[cfg(test)]
    pub fn permissive() -> Self {
        Self {
            excluded_prefixes: Vec::new(),
            exclude_system_dirs: false,
            probe_bin_next_to_lib: false,
        }
    }

    fn is_excluded(&self, dir: &Path) -> bool {
        self.exclude_system_dirs
            && self
                .excluded_prefixes
                .iter()
                .any(|prefix| dir.starts_with(prefix))
    }
}

impl Default for LibrarySearchPolicy {
    fn default() -> Self {
        Self {
            excluded_prefixes: ["/lib", "/lib64", "/usr/lib", "/usr/lib64", "/usr/local/lib"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            exclude_system_dirs: cfg!(target_os = "linux"),
            probe_bin_next_to_lib: cfg!(windows),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Strictly below `parent`
fn is_child_of(path: &Path, parent: &Path) -> bool {
    path != parent && path.starts_with(parent)
}

fn common_path(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

fn split_fragment(fragment: &str) -> Vec<String> {
    shell_words::split(fragment).unwrap_or_else(|e| {
        debug!("Cannot split fragment {:?}: {}", fragment, e);
        fragment.split_whitespace().map(str::to_string).collect()
    })
}

fn split_fragments(fragments: &[String]) -> Vec<String> {
    fragments.iter().flat_map(|f| split_fragment(f)).collect()
}

/// CMake precompiled-header sources are generated at configure time
pub fn is_pch_file(build_dir: &Path, path: &Path) -> bool {
    is_child_of(path, build_dir)
        && path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("cmake_pch"))
}

fn is_header_for_language(path: &Path, language: &str) -> bool {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match language {
        "C" => extension == "h",
        "CXX" => matches!(extension, "h" | "hh" | "hpp" | "hxx" | "h++" | "H"),
        _ => false,
    }
}

// ============================================================================
// CMake input files
// ============================================================================

/// Deduplicate CMake inputs by absolute path and sort them into tree buckets
///
/// CMake's own installation files are kept in the set but get no tree node.
pub fn extract_cmake_files_data(
    cmake_files: &[CMakeFileInfo],
    source_dir: &Path,
    build_dir: &Path,
) -> (CMakeFileSet, CMakeFileNodes) {
    let mut set = CMakeFileSet::new();
    let mut nodes = CMakeFileNodes::default();

    for info in cmake_files {
        let path = resolve_path(source_dir, &info.path.to_string_lossy());
        let absolute = CMakeFileInfo {
            path: path.clone(),
            ..info.clone()
        };
        if !set.insert(absolute) {
            continue;
        }
        if info.is_cmake && !info.is_cmake_lists_txt {
            continue;
        }

        let node = ProjectNode::file(
            path.clone(),
            FileType::Project,
            info.is_generated && !info.is_cmake_lists_txt,
        );
        if info.is_cmake_lists_txt {
            nodes.cmake_lists.push(node);
        } else if is_child_of(&path, source_dir) {
            nodes.source.push(node);
        } else if is_child_of(&path, build_dir) {
            nodes.build.push(node);
        } else {
            nodes.other.push(node);
        }
    }
    (set, nodes)
}

// ============================================================================
// Backtraces
// ============================================================================

/// Walk a backtrace from `index` to its root, one entry per node with a command
pub fn extract_backtrace_information(
    graph: &BacktraceGraph,
    source_dir: &Path,
    index: Option<usize>,
    priority: u32,
) -> Backtrace {
    let mut info = Vec::new();
    let mut current = index;
    let mut steps = 0;
    while let Some(i) = current {
        steps += 1;
        if steps > graph.nodes.len() {
            warn!("Backtrace starting at node {:?} does not terminate", index);
            break;
        }
        let Some(node) = graph.nodes.get(i) else {
            break;
        };
        current = node.parent;

        let Some(file) = graph.files.get(node.file) else {
            break;
        };
        let Some(command_index) = node.command else {
            continue;
        };
        let Some(command) = graph.commands.get(command_index) else {
            break;
        };
        info.push(LocationInfo {
            display_name: command.clone(),
            path: resolve_path(source_dir, file),
            line: node.line,
            priority,
        });
    }
    info
}

// ============================================================================
// Build targets
// ============================================================================

fn library_directories(
    t: &TargetDetails,
    build_dir: &Path,
    target_build_dir: &Path,
    libraries_relative_to_build_dir: bool,
    policy: &LibrarySearchPolicy,
) -> Vec<PathBuf> {
    let Some(link) = &t.link else {
        return Vec::new();
    };
    let base = if libraries_relative_to_build_dir {
        build_dir
    } else {
        target_build_dir
    };

    let mut search_paths: Vec<PathBuf> = Vec::new();
    for f in link.fragments.iter().filter(|f| f.role != "flags") {
        for part in split_fragment(&f.fragment) {
            let mut part = part.as_str();
            if f.role == "libraryPath" {
                if let Some(rest) = part.strip_prefix("-LIBPATH:") {
                    part = rest;
                } else if let Some(rest) = part.strip_prefix("-L") {
                    part = rest;
                }
            }
            // Linker flags smuggled in as libraries
            if part.starts_with('-') || part.is_empty() {
                continue;
            }

            let mut dir = resolve_path(base, part);
            if f.role == "libraries" {
                dir = dir.parent().map(Path::to_path_buf).unwrap_or_default();
            }
            if dir.as_os_str().is_empty() || !dir.is_dir() || policy.is_excluded(&dir) {
                continue;
            }

            if policy.probe_bin_next_to_lib
                && dir.file_name().is_some_and(|n| n == "lib")
                && let Some(parent) = dir.parent()
            {
                let bin = parent.join("bin");
                search_paths.push(dir.clone());
                if bin.is_dir() {
                    search_paths.push(bin);
                }
                continue;
            }
            search_paths.push(dir);
        }
    }

    let mut seen = HashSet::new();
    search_paths.retain(|p| seen.insert(p.clone()));
    search_paths
}

/// One [`CMakeBuildTarget`] per target file
pub fn generate_build_targets(
    details: &[TargetDetails],
    source_dir: &Path,
    build_dir: &Path,
    libraries_relative_to_build_dir: bool,
    policy: &LibrarySearchPolicy,
) -> Vec<CMakeBuildTarget> {
    details
        .iter()
        .map(|t| {
            let current_build_dir = resolve_path(build_dir, &t.build_dir);
            let graph = &t.backtrace_graph;
            let backtrace =
                |index, priority| extract_backtrace_information(graph, source_dir, index, priority);

            let executable = t.artifacts.first().map(|a| resolve_path(build_dir, a));
            let working_directory = executable
                .as_ref()
                .and_then(|e| e.parent())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| current_build_dir.clone());

            let mut target = CMakeBuildTarget {
                title: t.name.clone(),
                target_type: TargetType::from_cmake_type(&t.target_type),
                working_directory,
                source_directory: resolve_path(source_dir, &t.source_dir),
                backtrace: backtrace(t.backtrace, 0),
                dependency_definitions: t
                    .dependencies
                    .iter()
                    .map(|d| backtrace(d.backtrace, 100))
                    .collect(),
                source_definitions: t
                    .sources
                    .iter()
                    .map(|s| backtrace(s.backtrace, 200))
                    .collect(),
                include_definitions: t
                    .compile_groups
                    .iter()
                    .flat_map(|cg| cg.includes.iter())
                    .map(|i| backtrace(i.backtrace, 300))
                    .collect(),
                define_definitions: t
                    .compile_groups
                    .iter()
                    .flat_map(|cg| cg.defines.iter())
                    .map(|d| backtrace(d.backtrace, 400))
                    .collect(),
                install_definitions: t
                    .install_destinations
                    .iter()
                    .map(|d| backtrace(d.backtrace, 500))
                    .collect(),
                executable,
                ..Default::default()
            };

            if target.target_type == TargetType::Executable {
                target.links_to_qt_gui = t.link.as_ref().is_some_and(|link| {
                    link.fragments.iter().any(|f| {
                        f.role == "libraries"
                            && ["QtGui", "Qt5Gui", "Qt6Gui"]
                                .iter()
                                .any(|qt| f.fragment.contains(qt))
                    })
                });
                target.qtc_runnable = t.folder_target_property == "qtc_runnable";
                target.library_directories = library_directories(
                    t,
                    build_dir,
                    &current_build_dir,
                    libraries_relative_to_build_dir,
                    policy,
                );
            }
            target
        })
        .collect()
}

// ============================================================================
// Project parts
// ============================================================================

/// Drop the command line options that make a compiler consume CMake's PCH
fn remove_pch_flags(fragments: &mut Vec<String>, header: &str) {
    let sequences: [Vec<String>; 5] = [
        vec![
            "-Xclang".into(),
            "-include-pch".into(),
            "-Xclang".into(),
            format!("{header}.gch"),
        ],
        vec![
            "-Xclang".into(),
            "-include-pch".into(),
            "-Xclang".into(),
            format!("{header}.pch"),
        ],
        vec![
            "-Xclang".into(),
            "-include".into(),
            "-Xclang".into(),
            header.to_string(),
        ],
        vec!["-include".into(), header.to_string()],
        vec!["/FI".into(), header.to_string()],
    ];
    for sequence in &sequences {
        if let Some(position) = fragments
            .windows(sequence.len())
            .position(|window| window == sequence.as_slice())
        {
            fragments.drain(position..position + sequence.len());
        }
    }
}

/// One code model part per C, C++ or CUDA compile group
pub fn generate_raw_project_parts(
    details: &[TargetDetails],
    source_dir: &Path,
    build_dir: &Path,
) -> Vec<RawProjectPart> {
    let mut parts = Vec::new();

    for t in details {
        let need_postfix = t.compile_groups.len() > 1;
        for (count, cg) in t.compile_groups.iter().enumerate() {
            if !matches!(cg.language.as_str(), "C" | "CXX" | "CUDA") {
                continue;
            }

            // Custom targets listing only headers would confuse the code model
            let only_headers = cg.sources.iter().all(|&i| {
                t.sources.get(i).is_some_and(|s| {
                    FileType::from_path(Path::new(&s.path)) == FileType::Header
                })
            });
            if cg.defines.is_empty() && cg.includes.is_empty() && only_headers {
                warn!(
                    "Not reporting all-header compile group of target {} to code model.",
                    t.name
                );
                continue;
            }

            let (ending, qtc_pch_file) = match cg.language.as_str() {
                "C" => ("/cmake_pch.hpp", "qtc_cmake_pch.hpp"),
                "CXX" => ("/cmake_pch.hxx", "qtc_cmake_pch.hxx"),
                _ => ("", ""),
            };

            let mut fragments = split_fragments(&cg.fragments);

            let mut sources: Vec<PathBuf> = cg
                .sources
                .iter()
                .filter_map(|&i| t.sources.get(i))
                .filter(|s| !s.is_generated)
                .map(|s| resolve_path(source_dir, &s.path))
                .collect();

            if !sources.iter().any(|p| is_pch_file(build_dir, p)) {
                sources.extend(
                    t.sources
                        .iter()
                        .filter(|s| !s.is_generated)
                        .filter(|s| is_header_for_language(Path::new(&s.path), &cg.language))
                        .map(|s| resolve_path(source_dir, &s.path)),
                );
            }
            let files = sources
                .into_iter()
                .filter(|p| !is_pch_file(build_dir, p))
                .collect();

            let mut precompiled_headers = Vec::new();
            let pch_source = (!ending.is_empty())
                .then(|| t.sources.iter().find(|s| s.path.ends_with(ending)))
                .flatten();
            if let Some(pch_source) = pch_source {
                let header = clean_path(&source_dir.join(&pch_source.path));
                remove_pch_flags(&mut fragments, &header.to_string_lossy());

                if let Some(parent) = header.parent() {
                    let copy = parent.join(qtc_pch_file);
                    if let Err(e) = copy_if_different(&header, &copy) {
                        warn!("Cannot copy {} to {}: {}", header.display(), copy.display(), e);
                    }
                    precompiled_headers.push(copy);
                }
            }

            let postfix = if need_postfix {
                format!("_cg{}", count + 1)
            } else {
                String::new()
            };
            parts.push(RawProjectPart {
                display_name: format!("{}{}", t.id, postfix),
                project_file: resolve_path(source_dir, &t.source_dir).join("CMakeLists.txt"),
                build_system_target: t.name.clone(),
                build_target_type: if t.target_type == "EXECUTABLE" {
                    BuildTargetType::Executable
                } else {
                    BuildTargetType::Library
                },
                language: cg.language.clone(),
                files,
                macros: cg.defines.iter().map(|d| d.define.clone()).collect(),
                header_paths: cg.includes.iter().map(|i| i.path.clone()).collect(),
                precompiled_headers,
                command_line_flags: fragments,
            });
        }
    }
    parts
}

// ============================================================================
// Project tree
// ============================================================================

fn directory_source_dir(config: &Configuration, source_dir: &Path, index: usize) -> PathBuf {
    config
        .directories
        .get(index)
        .map(|d| resolve_path(source_dir, &d.source_path))
        .unwrap_or_default()
}

fn directory_build_dir(config: &Configuration, build_dir: &Path, index: usize) -> PathBuf {
    config
        .directories
        .get(index)
        .map(|d| resolve_path(build_dir, &d.build_path))
        .unwrap_or_default()
}

/// Descend into (creating as needed) the virtual folders of a `\`-separated source group name
fn source_group_node<'a>(
    target_root: &'a mut ProjectNode,
    group_name: &str,
    base_dir: &Path,
) -> &'a mut ProjectNode {
    let mut current = target_root;
    if group_name.is_empty() {
        return current;
    }
    for part in group_name.split('\\') {
        let index = match current
            .children
            .iter()
            .position(|c| !c.is_file() && c.display_name == part)
        {
            Some(index) => index,
            None => {
                current.add_node(ProjectNode::virtual_folder(
                    base_dir,
                    part,
                    DEFAULT_FOLDER_PRIORITY + 5,
                    true,
                ));
                current.children.len() - 1
            }
        };
        current = &mut current.children[index];
    }
    current
}

fn add_compile_groups(
    target_root: &mut ProjectNode,
    top_source_dir: &Path,
    source_dir: &Path,
    build_dir: &Path,
    t: &TargetDetails,
) {
    let in_source_build = source_dir == build_dir;
    let mut already_listed = target_root.known_paths();

    let mut build_nodes = Vec::new();
    let mut other_nodes = Vec::new();
    let mut group_nodes: Vec<Vec<ProjectNode>> = vec![Vec::new(); t.source_groups.len()];

    for s in &t.sources {
        let path = resolve_path(top_source_dir, &s.path);
        if !already_listed.insert(path.clone()) {
            continue;
        }
        let generated = s.is_generated || is_pch_file(build_dir, &path);
        let node = ProjectNode::source_file(path.clone(), generated);

        if is_child_of(&path, build_dir) && !in_source_build {
            build_nodes.push(node);
        } else if is_child_of(&path, source_dir)
            && let Some(group) = s.source_group.and_then(|g| group_nodes.get_mut(g))
        {
            group.push(node);
        } else {
            other_nodes.push(node);
        }
    }

    for (name, nodes) in t.source_groups.iter().zip(group_nodes) {
        let Some(base_dir) = nodes
            .iter()
            .map(|n| n.path.parent().map(Path::to_path_buf).unwrap_or_default())
            .reduce(|base, dir| common_path(&base, &dir))
        else {
            continue;
        };
        source_group_node(target_root, name, &base_dir).add_nested_nodes(nodes, Some(&base_dir));
    }

    tree::add_virtual_folder(target_root, build_dir, 100, BUILD_DIRECTORY_FOLDER, build_nodes);
    tree::add_virtual_folder(target_root, Path::new(""), 10, OTHER_LOCATIONS_FOLDER, other_nodes);
}

/// Build the project tree: CMakeLists.txt files, sub-projects, targets and CMake inputs
pub fn generate_root_project_node(
    codemodel: &Configuration,
    target_details: &[TargetDetails],
    cmake_nodes: CMakeFileNodes,
    source_dir: &Path,
    build_dir: &Path,
) -> ProjectNode {
    let top_level_name = codemodel
        .projects
        .iter()
        .find(|p| p.parent.is_none())
        .map(|p| p.name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            source_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
    let mut root = ProjectNode::project(source_dir, top_level_name);

    let CMakeFileNodes {
        cmake_lists,
        source,
        build,
        other,
    } = cmake_nodes;
    let index = tree::add_cmake_lists(&mut root, cmake_lists);

    for p in codemodel.projects.iter().filter(|p| p.parent.is_some()) {
        let Some(&first_directory) = p.directories.first() else {
            continue;
        };
        let dir = directory_source_dir(codemodel, source_dir, first_directory);
        tree::create_project_node(&mut root, &index, &dir, &p.name);
    }

    let details_by_id: HashMap<&str, &TargetDetails> =
        target_details.iter().map(|t| (t.id.as_str(), t)).collect();
    let default_details = TargetDetails::default();
    for t in &codemodel.targets {
        let details = details_by_id
            .get(t.id.as_str())
            .copied()
            .unwrap_or(&default_details);
        let dir = directory_source_dir(codemodel, source_dir, t.directory);
        let target_build_dir = directory_build_dir(codemodel, build_dir, t.directory);

        let Some(node) = tree::create_target_node(&mut root, &index, &dir, &t.name) else {
            debug!("No CMakeLists.txt node for target {} in {}", t.name, dir.display());
            continue;
        };
        if let tree::NodeKind::Target {
            target_type,
            artifacts,
            build_directory,
            ..
        } = &mut node.kind
        {
            *target_type = TargetType::from_cmake_type(&details.target_type);
            *artifacts = details
                .artifacts
                .iter()
                .map(|a| resolve_path(build_dir, a))
                .collect();
            *build_directory = target_build_dir.clone();
        }
        add_compile_groups(node, source_dir, &dir, &target_build_dir, details);
    }

    if !source.is_empty() || !build.is_empty() || !other.is_empty() {
        tree::add_cmake_inputs(&mut root, source_dir, build_dir, source, build, other);
    }
    root
}

/// Attach each target's deduplicated definition sites to its tree node
pub fn setup_location_info_for_targets(root: &mut ProjectNode, targets: &[CMakeBuildTarget]) {
    for t in targets {
        let Some(node) = root.find_target_mut(&t.title) else {
            continue;
        };

        let mut locations = HashSet::new();
        let mut result = Vec::new();
        let mut dedup = |bt: &Backtrace| {
            for info in bt {
                if locations.insert((info.path.clone(), info.line)) {
                    result.push(info.clone());
                }
            }
        };

        dedup(&t.backtrace);
        for group in [
            &t.dependency_definitions,
            &t.include_definitions,
            &t.define_definitions,
            &t.source_definitions,
            &t.install_definitions,
        ] {
            group.iter().for_each(&mut dedup);
        }
        node.set_location_info(result);
    }
}

/// Derive the whole project model from one parsed reply
pub fn extract_data(
    data: FileApiData,
    source_dir: &Path,
    build_dir: &Path,
    policy: &LibrarySearchPolicy,
) -> ExtractedData {
    let FileApiData {
        reply_file,
        cache,
        cmake_files,
        codemodel,
        target_details,
    } = data;

    let (cmake_file_set, cmake_nodes) =
        extract_cmake_files_data(&cmake_files, source_dir, build_dir);

    let libraries_relative_to_build_dir = reply_file.generator.starts_with("Ninja")
        && reply_file.cmake_version >= Version::new(3, 20, 5);

    let build_targets = generate_build_targets(
        &target_details,
        source_dir,
        build_dir,
        libraries_relative_to_build_dir,
        policy,
    );
    let project_parts = generate_raw_project_parts(&target_details, source_dir, build_dir);

    let mut root = generate_root_project_node(
        &codemodel,
        &target_details,
        cmake_nodes,
        source_dir,
        build_dir,
    );
    setup_location_info_for_targets(&mut root, &build_targets);

    ExtractedData {
        cache,
        cmake_files: cmake_file_set,
        build_targets,
        project_parts,
        root_project_node: Some(root),
        ctest_path: reply_file.ctest_executable,
        is_multi_config: reply_file.is_multi_config,
        uses_all_caps_targets: reply_file.is_multi_config
            && reply_file.generator != "Ninja Multi-Config",
    }
}
