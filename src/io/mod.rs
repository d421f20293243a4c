//! I/O layer - process supervision and file system access
//!
//! - **Process**: child process lifecycle with line-based output monitoring
//! - **File system**: a mockable view used by staleness checks, plus helpers
//! - **Watcher**: recursive directory change notifications

pub mod file_system;
pub mod process;
pub mod watcher;

pub use file_system::{FileSystemTrait, RealFileSystem};
pub use process::{
    ChildProcessManager, OutputMonitor, ProcessError, ProcessExit, ProcessManager, StopMode,
};
pub use watcher::DirectoryWatcher;
