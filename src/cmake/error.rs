use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CMakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CMakeCache.txt file not found: {path}")]
    CacheNotFound { path: PathBuf },

    #[error("Failed to open {path} for reading: {source}")]
    CacheUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run {executable}: {source}")]
    Launch {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{executable} -E capabilities exited with status {status}")]
    CapabilitiesFailed { executable: PathBuf, status: String },

    #[error("{executable} exited with status {status}")]
    CTestFailed { executable: PathBuf, status: String },

    #[error("Invalid capabilities output: {0}")]
    InvalidCapabilities(#[from] serde_json::Error),
}

/// Why the build system refused a request
#[derive(Debug, Error)]
pub enum BuildSystemError {
    #[error("The kit needs to define a CMake tool to parse this project.")]
    NoCMakeTool,

    #[error(
        "The CMake tool {executable} (version {version}) has no file-api support. Use CMake 3.14 or later."
    )]
    NoFileApi { executable: PathBuf, version: String },

    #[error("Source and build directory must be set")]
    InvalidParameters,

    #[error("Failed to create build directory \"{path}\": {source}")]
    CreateBuildDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A failed configuration is still being handled")]
    HandlingError,

    #[error("No build target name given")]
    EmptyTargetName,

    #[error("Build process failed: {0}")]
    Process(#[from] crate::io::ProcessError),
}
