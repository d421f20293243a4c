//! File system abstraction layer
//!
//! Trait-based access to the few file system facts the staleness check needs
//! (modification times and directory listings), so that the decision can be
//! tested against an in-memory tree with controlled timestamps.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

// ============================================================================
// File Metadata
// ============================================================================

/// Simplified, testable alternative to std::fs::Metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    /// Last modification time
    pub modified: SystemTime,
    pub is_dir: bool,
}

impl FileMetadata {
    /// Convert from standard library metadata
    pub fn from_std_metadata(metadata: &std::fs::Metadata) -> Result<Self, io::Error> {
        Ok(Self {
            modified: metadata.modified()?,
            is_dir: metadata.is_dir(),
        })
    }
}

// ============================================================================
// File System Trait
// ============================================================================

/// Trait for file system operations
#[cfg_attr(test, mockall::automock)]
pub trait FileSystemTrait: Send + Sync {
    /// Get file metadata (modification time and kind)
    fn metadata(&self, path: &Path) -> Result<FileMetadata, io::Error>;

    /// Names of the direct entries of a directory
    fn list_dir(&self, path: &Path) -> Result<Vec<String>, io::Error>;

    /// Modification time, `None` when the path cannot be inspected
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.metadata(path).ok().map(|m| m.modified)
    }
}

// ============================================================================
// Real File System Implementation
// ============================================================================

/// Real file system implementation using std::fs
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystemTrait for RealFileSystem {
    fn metadata(&self, path: &Path) -> Result<FileMetadata, io::Error> {
        let metadata = std::fs::metadata(path)?;
        FileMetadata::from_std_metadata(&metadata)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, io::Error> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

// ============================================================================
// Helpers on the real file system
// ============================================================================

/// Copy `source` over `target` unless both already have identical contents
///
/// Returns whether a copy happened.
pub fn copy_if_different(source: &Path, target: &Path) -> Result<bool, io::Error> {
    let contents = std::fs::read(source)?;
    if let Ok(existing) = std::fs::read(target)
        && existing == contents
    {
        return Ok(false);
    }
    std::fs::write(target, contents)?;
    Ok(true)
}

/// Remove a file or a directory tree, treating a missing path as success
pub fn remove_path(path: &Path) -> Result<bool, io::Error> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` into the parent
pub fn clean_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push("..");
                }
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

/// Resolve `path` against `base` unless it is already absolute, then normalize
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        clean_path(path)
    } else {
        clean_path(&base.join(path))
    }
}

// ============================================================================
// Test File System Implementation
// ============================================================================

#[cfg(test)]
mod test_filesystem {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Modification time of every file
    type TestFileData = HashMap<PathBuf, SystemTime>;

    /// In-memory files; directories exist implicitly as ancestors of files
    #[derive(Clone)]
    pub struct TestFileSystem {
        state: Arc<Mutex<TestFileData>>,
    }

    impl TestFileSystem {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        /// Create the file or update its modification time
        pub fn touch<P: AsRef<Path>>(&self, path: P, modified: SystemTime) {
            let mut state = self.state.lock().unwrap();
            state.insert(path.as_ref().to_path_buf(), modified);
        }

        fn is_dir(&self, path: &Path) -> bool {
            let state = self.state.lock().unwrap();
            state
                .keys()
                .any(|file| file != path && file.starts_with(path))
        }
    }

    impl FileSystemTrait for TestFileSystem {
        fn metadata(&self, path: &Path) -> Result<FileMetadata, io::Error> {
            let file = self.state.lock().unwrap().get(path).copied();
            if let Some(modified) = file {
                return Ok(FileMetadata {
                    modified,
                    is_dir: false,
                });
            }
            if self.is_dir(path) {
                return Ok(FileMetadata {
                    modified: SystemTime::UNIX_EPOCH,
                    is_dir: true,
                });
            }
            Err(io::Error::new(io::ErrorKind::NotFound, "File not found"))
        }

        fn list_dir(&self, path: &Path) -> Result<Vec<String>, io::Error> {
            let state = self.state.lock().unwrap();
            let mut names: Vec<String> = state
                .keys()
                .filter_map(|file| file.strip_prefix(path).ok())
                .filter_map(|rest| rest.components().next())
                .map(|first| first.as_os_str().to_string_lossy().into_owned())
                .collect();
            if names.is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "Directory not found"));
            }
            names.sort();
            names.dedup();
            Ok(names)
        }
    }
}

#[cfg(test)]
pub use test_filesystem::TestFileSystem;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_test_filesystem_basic_operations() {
        let fs = TestFileSystem::new();
        let path = PathBuf::from("/build/CMakeCache.txt");
        let time = UNIX_EPOCH + Duration::from_secs(1000);

        assert_eq!(fs.modified(&path), None);

        fs.touch(&path, time);
        assert_eq!(fs.modified(&path), Some(time));
        assert!(!fs.metadata(&path).unwrap().is_dir);
        assert!(fs.metadata(Path::new("/build")).unwrap().is_dir);
    }

    #[test]
    fn test_test_filesystem_touch_and_list() {
        let fs = TestFileSystem::new();
        let reply = PathBuf::from("/build/.cmake/api/v1/reply");
        let t1 = UNIX_EPOCH + Duration::from_secs(1000);
        let t2 = UNIX_EPOCH + Duration::from_secs(2000);

        fs.touch(reply.join("index-a.json"), t1);
        fs.touch(reply.join("index-b.json"), t1);
        fs.touch(reply.join("index-a.json"), t2);

        assert_eq!(fs.modified(&reply.join("index-a.json")), Some(t2));
        assert_eq!(
            fs.list_dir(&reply).unwrap(),
            vec!["index-a.json", "index-b.json"]
        );
        assert_eq!(fs.list_dir(Path::new("/build")).unwrap(), vec![".cmake"]);
        assert!(fs.list_dir(Path::new("/nowhere")).is_err());
    }

    #[test]
    fn test_mock_filesystem() {
        use crate::file_api::parser::{reply_directory, scan_for_reply_file_in};

        let mut fs = MockFileSystemTrait::new();
        fs.expect_list_dir().returning(|_| {
            Ok(vec![
                "index-1.json".to_string(),
                "index-2.json".to_string(),
                "cache-v2.json".to_string(),
            ])
        });
        fs.expect_metadata().returning(|path| {
            Ok(FileMetadata {
                modified: UNIX_EPOCH,
                is_dir: path.ends_with("index-2.json"),
            })
        });

        let build = Path::new("/build");
        assert_eq!(
            scan_for_reply_file_in(&fs, build),
            Some(reply_directory(build).join("index-1.json"))
        );
    }

    #[test]
    fn test_real_filesystem_and_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let source = dir.path().join("CMakeCache.txt");
        let target = dir.path().join("CMakeCache.txt.prev");

        assert_eq!(fs.modified(&source), None);

        std::fs::write(&source, "A:BOOL=ON\n").unwrap();
        assert!(fs.modified(&source).is_some());
        assert!(fs.metadata(dir.path()).unwrap().is_dir);
        assert!(copy_if_different(&source, &target).unwrap());
        assert!(!copy_if_different(&source, &target).unwrap());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "A:BOOL=ON\n");

        let mut names = fs.list_dir(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec!["CMakeCache.txt", "CMakeCache.txt.prev"]);

        let sub = dir.path().join("CMakeFiles/nested");
        std::fs::create_dir_all(&sub).unwrap();
        assert!(remove_path(&dir.path().join("CMakeFiles")).unwrap());
        assert!(!remove_path(&dir.path().join("CMakeFiles")).unwrap());
        assert!(remove_path(&target).unwrap());
        assert!(!target.exists());
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            resolve_path(Path::new("/build"), "lib/../bin/app"),
            PathBuf::from("/build/bin/app")
        );
        assert_eq!(
            resolve_path(Path::new("/build"), "/abs/./x.cpp"),
            PathBuf::from("/abs/x.cpp")
        );
        assert_eq!(
            resolve_path(Path::new("/src"), "."),
            PathBuf::from("/src")
        );
    }
}
