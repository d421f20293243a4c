use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::file_api::tree::{FileType, ProjectNode};
use crate::project::ProjectError;

/// Extensions of build products that never belong into the project tree
const BINARY_EXTENSIONS: &[&str] = &[
    "a", "o", "obj", "lib", "so", "dll", "dylib", "exe", "pdb", "ilk", "exp", "pch", "gch",
];

/// Options for configuring tree scanning behavior
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Skip hidden files and directories (starting with '.')
    pub skip_hidden: bool,

    /// Follow symbolic links during traversal
    pub follow_symlinks: bool,

    /// Directories not descended into, e.g. a build directory below the sources
    pub excluded_directories: Vec<PathBuf>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            skip_hidden: true,
            follow_symlinks: false,
            excluded_directories: Vec::new(),
        }
    }
}

impl ScanOptions {
    pub fn excluding(mut self, directory: impl Into<PathBuf>) -> Self {
        self.excluded_directories.push(directory.into());
        self
    }
}

/// Collects the files below a project directory as file nodes
#[derive(Debug, Clone, Default)]
pub struct TreeScanner {
    options: ScanOptions,
}

impl TreeScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Whether a file is left out of the tree
    pub fn is_ignored(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                BINARY_EXTENSIONS
                    .iter()
                    .any(|binary| binary.eq_ignore_ascii_case(ext))
            })
    }

    /// Walk `root` and return one file node per file found
    ///
    /// The walk checks `cancel` between entries.
    pub fn scan(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProjectNode>, ProjectError> {
        if !root.exists() {
            return Err(ProjectError::PathNotFound {
                path: root.to_string_lossy().to_string(),
            });
        }
        if !root.is_dir() {
            return Err(ProjectError::NotADirectory {
                path: root.to_string_lossy().to_string(),
            });
        }

        let excluded: HashSet<&Path> = self
            .options
            .excluded_directories
            .iter()
            .map(PathBuf::as_path)
            .collect();
        let skip_hidden = self.options.skip_hidden;

        let walker = WalkDir::new(root)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if skip_hidden && entry.file_name().to_string_lossy().starts_with('.') {
                    return false;
                }
                !(entry.file_type().is_dir() && excluded.contains(entry.path()))
            });

        let mut files = Vec::new();
        for entry in walker {
            if cancel.is_cancelled() {
                return Err(ProjectError::ScanCanceled {
                    path: root.to_string_lossy().to_string(),
                });
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Log the error but continue scanning
                    tracing::warn!("Failed to access directory entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_dir() || Self::is_ignored(entry.path()) {
                continue;
            }

            let path = entry.path().to_path_buf();
            let file_type = FileType::from_path(&path);
            files.push(ProjectNode::file(path, file_type, false));
        }

        tracing::debug!("Scanned {} files below {}", files.len(), root.display());
        Ok(files)
    }

    /// Run [`scan`](Self::scan) on the blocking pool
    pub fn spawn(
        self,
        root: PathBuf,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<Vec<ProjectNode>, ProjectError>> {
        tokio::task::spawn_blocking(move || self.scan(&root, &cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_source_tree;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn names(files: &[ProjectNode], root: &Path) -> Vec<String> {
        files
            .iter()
            .map(|n| n.path.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_scan_finds_sources_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_source_tree(root);
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(root.join("build")).unwrap();
        std::fs::write(root.join("build/CMakeCache.txt"), "").unwrap();
        std::fs::write(root.join("core/core.o"), "").unwrap();

        let scanner = TreeScanner::new(ScanOptions::default().excluding(root.join("build")));
        let files = scanner.scan(root, &CancellationToken::new()).unwrap();

        let mut found = names(&files, root);
        found.sort();
        assert_eq!(
            found,
            vec![
                "CMakeLists.txt",
                "README.md",
                "cmake/Warnings.cmake",
                "core/CMakeLists.txt",
                "core/core.cpp",
                "core/core.h",
                "main.cpp",
            ]
        );
        assert!(files.iter().all(|n| n.is_file() && !n.is_generated()));
    }

    #[test]
    fn test_scan_errors() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = TreeScanner::default();

        assert!(matches!(
            scanner.scan(&dir.path().join("missing"), &CancellationToken::new()),
            Err(ProjectError::PathNotFound { .. })
        ));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            scanner.scan(&file, &CancellationToken::new()),
            Err(ProjectError::NotADirectory { .. })
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            scanner.scan(dir.path(), &cancel),
            Err(ProjectError::ScanCanceled { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawned_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_source_tree(dir.path());

        let files = TreeScanner::default()
            .spawn(dir.path().to_path_buf(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(files.len(), 7);
    }

    #[test]
    fn test_binary_files_are_ignored() {
        assert!(TreeScanner::is_ignored(Path::new("/b/libcore.a")));
        assert!(TreeScanner::is_ignored(Path::new("/b/APP.EXE")));
        assert!(!TreeScanner::is_ignored(Path::new("/s/main.cpp")));
        assert!(!TreeScanner::is_ignored(Path::new("/s/Makefile")));
    }
}
