//! Per-run configuration snapshot

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cmake::tool::CMakeTool;

/// Everything one configure run needs, captured when the run is requested
///
/// A new snapshot is built for every request; a running cycle keeps its own
/// clone, so later changes never leak into it.
#[derive(Debug, Clone, Default)]
pub struct BuildDirParameters {
    pub project_name: String,
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub cmake_build_type: String,
    pub environment: Vec<(String, String)>,

    pub generator: Option<String>,
    pub platform: Option<String>,
    pub toolset: Option<String>,

    /// Passed when the build directory is configured for the first time
    pub initial_cmake_arguments: Vec<String>,
    /// Pending `-D`/`-U` changes that still have to reach the cache
    pub configuration_changes_arguments: Vec<String>,
    pub additional_cmake_arguments: Vec<String>,

    pub cmake_tool: Option<Arc<CMakeTool>>,
}

impl BuildDirParameters {
    pub fn new(
        source_directory: impl Into<PathBuf>,
        build_directory: impl Into<PathBuf>,
        cmake_tool: Option<Arc<CMakeTool>>,
    ) -> Self {
        let source_directory = source_directory.into();
        let project_name = source_directory
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            project_name,
            source_directory,
            build_directory: build_directory.into(),
            cmake_tool,
            ..Default::default()
        }
    }

    pub fn with_build_type(mut self, build_type: impl Into<String>) -> Self {
        self.cmake_build_type = build_type.into();
        self
    }

    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = Some(generator.into());
        self
    }

    pub fn with_initial_arguments(mut self, arguments: Vec<String>) -> Self {
        self.initial_cmake_arguments = arguments;
        self
    }

    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    /// Non-empty source and build directory and a CMake tool to run
    pub fn is_valid(&self) -> bool {
        self.cmake_tool.is_some()
            && !self.source_directory.as_os_str().is_empty()
            && !self.build_directory.as_os_str().is_empty()
    }

    pub fn cmake_executable(&self) -> Option<&Path> {
        self.cmake_tool.as_deref().map(CMakeTool::executable)
    }

    /// Whether the tool may re-run cmake on its own when inputs changed
    pub fn is_auto_run(&self) -> bool {
        self.cmake_tool
            .as_deref()
            .is_some_and(CMakeTool::is_auto_run)
    }

    /// `-G`, `-A` and `-T` arguments for the configured generator
    pub fn generator_arguments(&self) -> Vec<String> {
        let mut arguments = Vec::new();
        for (flag, value) in [
            ("-G", &self.generator),
            ("-A", &self.platform),
            ("-T", &self.toolset),
        ] {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                arguments.push(flag.to_string());
                arguments.push(value.clone());
            }
        }
        arguments
    }

    pub fn cmake_cache_txt(&self) -> PathBuf {
        self.build_directory.join("CMakeCache.txt")
    }
}
