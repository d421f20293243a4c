//! Project tree produced from the codemodel
//!
//! A tree of owned nodes: the root project, `CMakeLists.txt`-bearing
//! directories, sub-projects, targets with their source groups, and virtual
//! folders collecting files that live outside the source tree.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::file_api::model::{LocationInfo, TargetType};

pub const BUILD_DIRECTORY_FOLDER: &str = "<Build Directory>";
pub const OTHER_LOCATIONS_FOLDER: &str = "<Other Locations>";
pub const SOURCE_DIRECTORY_FOLDER: &str = "<Source Directory>";
pub const CMAKE_MODULES_FOLDER: &str = "CMake Modules";
pub const OTHER_FILES_FOLDER: &str = "<Other Files>";

pub const DEFAULT_FOLDER_PRIORITY: i32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    Source,
    Header,
    Project,
    Unknown,
}

impl FileType {
    pub fn from_path(path: &Path) -> Self {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return FileType::Unknown;
        };
        if name == "CMakeLists.txt" {
            return FileType::Project;
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "c" | "cc" | "cpp" | "cxx" | "c++" | "cp" | "cu" | "m" | "mm" => FileType::Source,
            "h" | "hh" | "hpp" | "hxx" | "h++" | "cuh" | "inl" | "tpp" | "txx" => {
                FileType::Header
            }
            "cmake" => FileType::Project,
            _ => FileType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeKind {
    Project,
    Target {
        build_key: String,
        target_type: TargetType,
        artifacts: Vec<PathBuf>,
        build_directory: PathBuf,
        location_info: Vec<LocationInfo>,
    },
    VirtualFolder {
        priority: i32,
        is_source_group: bool,
    },
    Folder,
    File {
        file_type: FileType,
        is_generated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectNode {
    pub path: PathBuf,
    pub display_name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProjectNode>,
}

fn default_display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl ProjectNode {
    pub fn project(path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            display_name: display_name.into(),
            kind: NodeKind::Project,
            children: Vec::new(),
        }
    }

    pub fn folder(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            display_name: default_display_name(&path),
            path,
            kind: NodeKind::Folder,
            children: Vec::new(),
        }
    }

    pub fn virtual_folder(
        path: impl Into<PathBuf>,
        display_name: impl Into<String>,
        priority: i32,
        is_source_group: bool,
    ) -> Self {
        Self {
            path: path.into(),
            display_name: display_name.into(),
            kind: NodeKind::VirtualFolder {
                priority,
                is_source_group,
            },
            children: Vec::new(),
        }
    }

    pub fn file(path: impl Into<PathBuf>, file_type: FileType, is_generated: bool) -> Self {
        let path = path.into();
        Self {
            display_name: default_display_name(&path),
            path,
            kind: NodeKind::File {
                file_type,
                is_generated,
            },
            children: Vec::new(),
        }
    }

    /// A file node typed by its extension
    pub fn source_file(path: impl Into<PathBuf>, is_generated: bool) -> Self {
        let path = path.into();
        let file_type = FileType::from_path(&path);
        Self::file(path, file_type, is_generated)
    }

    pub fn target(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: directory.into(),
            display_name: name.clone(),
            kind: NodeKind::Target {
                build_key: name,
                target_type: TargetType::Utility,
                artifacts: Vec::new(),
                build_directory: PathBuf::new(),
                location_info: Vec::new(),
            },
            children: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_generated(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::File {
                is_generated: true,
                ..
            }
        )
    }

    pub fn build_key(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Target { build_key, .. } => Some(build_key),
            _ => None,
        }
    }

    pub fn add_node(&mut self, node: ProjectNode) {
        self.children.push(node);
    }

    /// Every node of the subtree, depth first, self included
    pub fn for_each_node<'a>(&'a self, f: &mut impl FnMut(&'a ProjectNode)) {
        f(self);
        for child in &self.children {
            child.for_each_node(f);
        }
    }

    /// Paths of all nodes in the subtree
    pub fn known_paths(&self) -> HashSet<PathBuf> {
        let mut paths = HashSet::new();
        self.for_each_node(&mut |n| {
            paths.insert(n.path.clone());
        });
        paths
    }

    /// Paths of all file nodes in the subtree
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.for_each_node(&mut |n| {
            if n.is_file() {
                files.push(n.path.clone());
            }
        });
        files
    }

    pub fn find_target_mut(&mut self, key: &str) -> Option<&mut ProjectNode> {
        if self.build_key() == Some(key) {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_target_mut(key))
    }

    pub fn child_by_name(&self, display_name: &str) -> Option<&ProjectNode> {
        self.children
            .iter()
            .find(|c| c.display_name == display_name)
    }

    /// Walk (creating as needed) the folder chain from `base` down to `dir`
    fn folder_for(
        &mut self,
        dir: &Path,
        base: &Path,
        make_folder: &mut impl FnMut(&Path) -> ProjectNode,
    ) -> &mut ProjectNode {
        let Ok(relative) = dir.strip_prefix(base) else {
            return self;
        };
        let mut current = self;
        let mut path = base.to_path_buf();
        for component in relative.components() {
            path.push(component);
            let index = match current
                .children
                .iter()
                .position(|c| !c.is_file() && c.path == path)
            {
                Some(index) => index,
                None => {
                    current.children.push(make_folder(&path));
                    current.children.len() - 1
                }
            };
            current = &mut current.children[index];
        }
        current
    }

    /// Insert file nodes below this node, creating intermediate folders
    /// relative to `base` (this node's path when `None`)
    pub fn add_nested_nodes_with(
        &mut self,
        files: Vec<ProjectNode>,
        base: Option<&Path>,
        mut make_folder: impl FnMut(&Path) -> ProjectNode,
    ) {
        let base = base.map(Path::to_path_buf).unwrap_or_else(|| self.path.clone());
        for file in files {
            let dir = file.path.parent().map(Path::to_path_buf).unwrap_or_default();
            self.folder_for(&dir, &base, &mut make_folder).add_node(file);
        }
    }

    pub fn add_nested_nodes(&mut self, files: Vec<ProjectNode>, base: Option<&Path>) {
        self.add_nested_nodes_with(files, base, |path| ProjectNode::folder(path));
    }

    /// Merge chains of plain folders that contain nothing but one sub-folder
    pub fn compress(&mut self) {
        if matches!(self.kind, NodeKind::Folder) {
            while self.children.len() == 1 && matches!(self.children[0].kind, NodeKind::Folder) {
                let Some(child) = self.children.pop() else {
                    break;
                };
                self.display_name = Path::new(&self.display_name)
                    .join(&child.display_name)
                    .display()
                    .to_string();
                self.path = child.path;
                self.children = child.children;
            }
        }
        for child in &mut self.children {
            child.compress();
        }
    }

    pub fn set_location_info(&mut self, info: Vec<LocationInfo>) {
        if let NodeKind::Target { location_info, .. } = &mut self.kind {
            *location_info = info;
        }
    }
}

// ============================================================================
// Tree assembly helpers
// ============================================================================

/// Files CMake read, bucketed by where they live
#[derive(Debug, Default)]
pub struct CMakeFileNodes {
    pub cmake_lists: Vec<ProjectNode>,
    pub source: Vec<ProjectNode>,
    pub build: Vec<ProjectNode>,
    pub other: Vec<ProjectNode>,
}

/// Path of the node holding `CMakeLists.txt` for each directory, expressed as
/// the chain of child indices from the root
pub type CMakeListsIndex = HashMap<PathBuf, Vec<usize>>;

fn index_nodes(node: &ProjectNode, trail: &mut Vec<usize>, result: &mut CMakeListsIndex) {
    for (i, child) in node.children.iter().enumerate() {
        trail.push(i);
        if matches!(child.kind, NodeKind::Project) && !result.contains_key(&child.path) {
            result.insert(child.path.clone(), trail.clone());
        }
        index_nodes(child, trail, result);
        trail.pop();
    }
}

/// Place the `CMakeLists.txt` files below `root`; every directory holding one
/// becomes a project node
pub fn add_cmake_lists(root: &mut ProjectNode, cmake_lists: Vec<ProjectNode>) -> CMakeListsIndex {
    let cmake_dirs: HashSet<PathBuf> = cmake_lists
        .iter()
        .filter_map(|n| n.path.parent().map(Path::to_path_buf))
        .collect();

    root.add_nested_nodes_with(cmake_lists, None, |path| {
        if cmake_dirs.contains(path) {
            ProjectNode::project(path, default_display_name(path))
        } else {
            ProjectNode::folder(path)
        }
    });
    root.compress();

    let mut index = CMakeListsIndex::new();
    index.insert(root.path.clone(), Vec::new());
    index_nodes(root, &mut Vec::new(), &mut index);
    index
}

pub fn node_at<'a>(root: &'a mut ProjectNode, trail: &[usize]) -> Option<&'a mut ProjectNode> {
    let mut current = root;
    for &i in trail {
        current = current.children.get_mut(i)?;
    }
    Some(current)
}

/// Add (or rename) a sub-project node below the `CMakeLists.txt` node of `dir`
pub fn create_project_node(
    root: &mut ProjectNode,
    index: &CMakeListsIndex,
    dir: &Path,
    display_name: &str,
) {
    let parent = match index.get(dir) {
        Some(trail) => node_at(root, trail),
        None => None,
    };
    let Some(parent) = parent else {
        tracing::debug!("No CMakeLists.txt node for project {} in {}", display_name, dir.display());
        return;
    };
    let project_path = dir.join(format!(".project::{display_name}"));
    match parent
        .children
        .iter_mut()
        .find(|c| matches!(c.kind, NodeKind::Project) && c.path == project_path)
    {
        Some(existing) => existing.display_name = display_name.to_string(),
        None => parent.add_node(ProjectNode::project(project_path, display_name)),
    }
}

/// The target node for `name` below the `CMakeLists.txt` node of `dir`
pub fn create_target_node<'a>(
    root: &'a mut ProjectNode,
    index: &CMakeListsIndex,
    dir: &Path,
    name: &str,
) -> Option<&'a mut ProjectNode> {
    let parent = node_at(root, index.get(dir)?)?;
    let position = match parent
        .children
        .iter()
        .position(|c| c.build_key() == Some(name))
    {
        Some(position) => position,
        None => {
            parent.add_node(ProjectNode::target(dir, name));
            parent.children.len() - 1
        }
    };
    parent.children.get_mut(position)
}

/// Add `files` to `base`, inside a named virtual folder unless the name is empty
pub fn add_virtual_folder(
    base: &mut ProjectNode,
    base_path: &Path,
    priority: i32,
    display_name: &str,
    files: Vec<ProjectNode>,
) {
    if files.is_empty() {
        return;
    }
    let folder = if display_name.is_empty() {
        base
    } else {
        base.add_node(ProjectNode::virtual_folder(
            base_path,
            display_name,
            priority,
            false,
        ));
        let last = base.children.len() - 1;
        &mut base.children[last]
    };
    folder.add_nested_nodes(files, None);
    for child in &mut folder.children {
        child.compress();
    }
}

/// Group CMake input files that are not `CMakeLists.txt` into a "CMake Modules" folder
pub fn add_cmake_inputs(
    root: &mut ProjectNode,
    source_dir: &Path,
    build_dir: &Path,
    source: Vec<ProjectNode>,
    build: Vec<ProjectNode>,
    other: Vec<ProjectNode>,
) {
    let known = root.known_paths();
    let unknown = |nodes: Vec<ProjectNode>| -> Vec<ProjectNode> {
        nodes
            .into_iter()
            .filter(|n| !known.contains(&n.path))
            .collect()
    };

    let mut modules = ProjectNode::virtual_folder(
        root.path.clone(),
        CMAKE_MODULES_FOLDER,
        DEFAULT_FOLDER_PRIORITY - 5,
        false,
    );
    add_virtual_folder(&mut modules, source_dir, 1000, SOURCE_DIRECTORY_FOLDER, unknown(source));
    add_virtual_folder(&mut modules, build_dir, 100, BUILD_DIRECTORY_FOLDER, unknown(build));
    add_virtual_folder(&mut modules, Path::new(""), 10, OTHER_LOCATIONS_FOLDER, unknown(other));
    root.add_node(modules);
}

/// Add scanned files CMake does not know about under an "<Other Files>" folder
pub fn add_file_system_nodes(root: &mut ProjectNode, scanned: &[ProjectNode]) {
    let known = root.known_paths();
    let mut folder = ProjectNode::virtual_folder(
        root.path.clone(),
        OTHER_FILES_FOLDER,
        DEFAULT_FOLDER_PRIORITY - 6,
        false,
    );
    let files: Vec<ProjectNode> = scanned
        .iter()
        .filter(|n| !n.is_generated() && !known.contains(&n.path))
        .cloned()
        .collect();
    if files.is_empty() {
        return;
    }
    folder.add_nested_nodes(files, None);
    for child in &mut folder.children {
        child.compress();
    }
    root.add_node(folder);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_path() {
        assert_eq!(FileType::from_path(Path::new("/s/main.cpp")), FileType::Source);
        assert_eq!(FileType::from_path(Path::new("/s/lib.H")), FileType::Header);
        assert_eq!(FileType::from_path(Path::new("/s/CMakeLists.txt")), FileType::Project);
        assert_eq!(FileType::from_path(Path::new("/s/Find.cmake")), FileType::Project);
        assert_eq!(FileType::from_path(Path::new("/s/README.md")), FileType::Unknown);
    }

    #[test]
    fn test_nested_nodes_and_compress() {
        let mut root = ProjectNode::project("/src", "demo");
        root.add_nested_nodes(
            vec![
                ProjectNode::source_file("/src/a/b/c/one.cpp", false),
                ProjectNode::source_file("/src/a/b/c/two.cpp", false),
                ProjectNode::source_file("/src/top.cpp", false),
            ],
            None,
        );
        root.compress();

        assert_eq!(root.children.len(), 2);
        let folder = root.child_by_name("a/b/c").unwrap();
        assert_eq!(folder.path, PathBuf::from("/src/a/b/c"));
        assert_eq!(folder.children.len(), 2);
        assert!(root.child_by_name("top.cpp").unwrap().is_file());
    }

    #[test]
    fn test_add_cmake_lists_indexes_directories() {
        let mut root = ProjectNode::project("/src", "demo");
        let index = add_cmake_lists(
            &mut root,
            vec![
                ProjectNode::file("/src/CMakeLists.txt", FileType::Project, false),
                ProjectNode::file("/src/libs/core/CMakeLists.txt", FileType::Project, false),
            ],
        );

        assert!(index.contains_key(Path::new("/src")));
        assert!(index.contains_key(Path::new("/src/libs/core")));

        let target = create_target_node(&mut root, &index, Path::new("/src/libs/core"), "core")
            .unwrap();
        assert_eq!(target.build_key(), Some("core"));

        // The same target is found again rather than duplicated
        create_target_node(&mut root, &index, Path::new("/src/libs/core"), "core").unwrap();
        let mut count = 0;
        root.for_each_node(&mut |n| {
            if n.build_key() == Some("core") {
                count += 1;
            }
        });
        assert_eq!(count, 1);

        assert!(create_target_node(&mut root, &index, Path::new("/elsewhere"), "x").is_none());
    }

    #[test]
    fn test_create_project_node_renames_existing() {
        let mut root = ProjectNode::project("/src", "demo");
        let index = add_cmake_lists(
            &mut root,
            vec![ProjectNode::file("/src/CMakeLists.txt", FileType::Project, false)],
        );
        create_project_node(&mut root, &index, Path::new("/src"), "sub");
        create_project_node(&mut root, &index, Path::new("/src"), "sub");
        let projects = root
            .children
            .iter()
            .filter(|c| matches!(c.kind, NodeKind::Project))
            .count();
        assert_eq!(projects, 1);
    }

    #[test]
    fn test_cmake_inputs_skip_known_files() {
        let mut root = ProjectNode::project("/src", "demo");
        root.add_node(ProjectNode::file("/src/cmake/Known.cmake", FileType::Project, false));
        add_cmake_inputs(
            &mut root,
            Path::new("/src"),
            Path::new("/build"),
            vec![
                ProjectNode::file("/src/cmake/Known.cmake", FileType::Project, false),
                ProjectNode::file("/src/cmake/Helpers.cmake", FileType::Project, false),
            ],
            vec![ProjectNode::file("/build/gen.cmake", FileType::Project, true)],
            Vec::new(),
        );

        let modules = root.child_by_name(CMAKE_MODULES_FOLDER).unwrap();
        assert_eq!(modules.children.len(), 2);
        let source = modules.child_by_name(SOURCE_DIRECTORY_FOLDER).unwrap();
        assert_eq!(source.file_paths(), vec![PathBuf::from("/src/cmake/Helpers.cmake")]);
        assert!(modules.child_by_name(OTHER_LOCATIONS_FOLDER).is_none());
    }

    #[test]
    fn test_file_system_nodes_only_unknown_files() {
        let mut root = ProjectNode::project("/src", "demo");
        root.add_node(ProjectNode::source_file("/src/main.cpp", false));
        add_file_system_nodes(
            &mut root,
            &[
                ProjectNode::source_file("/src/main.cpp", false),
                ProjectNode::source_file("/src/docs/notes.md", false),
                ProjectNode::source_file("/src/gen.cpp", true),
            ],
        );
        let other = root.child_by_name(OTHER_FILES_FOLDER).unwrap();
        assert_eq!(other.file_paths(), vec![PathBuf::from("/src/docs/notes.md")]);
    }

    #[test]
    fn test_serializes_node_kind_tag() {
        let node = ProjectNode::source_file("/src/main.cpp", false);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["node"], "file");
        assert_eq!(json["file_type"], "Source");
        assert!(json.get("children").is_none());
    }
}
