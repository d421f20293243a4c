//! Test utilities and global setup
//!
//! Provides centralized test logging configuration, reply-directory fixtures
//! that look like what CMake writes, and helpers for tests against a real
//! `cmake` binary.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, e.g.
    /// `RUST_LOG=cmake_sync::file_api=trace cargo test --features test-logging`
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info,notify=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Global test logging setup
///
/// Add this to any test module where you want automatic logging initialization.
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Get the cmake path for integration tests
///
/// Checks the CMAKE_PATH environment variable and falls back to "cmake".
#[cfg(all(test, feature = "cmake-integration-tests"))]
pub fn get_test_cmake_path() -> String {
    std::env::var("CMAKE_PATH").unwrap_or_else(|_| "cmake".to_string())
}

#[cfg(test)]
pub use fixtures::{FixtureOptions, write_json, write_reply_fixture, write_source_tree};

/// Reply directories shaped like CMake's output for a two-target project
#[cfg(test)]
pub mod fixtures {
    use serde_json::{Value, json};
    use std::fs;
    use std::path::{Path, PathBuf};

    use crate::file_api::parser::{reply_directory, setup_file_api};

    pub const APP_ID: &str = "app::@6890427a1f51a3e7e1df";
    pub const CORE_ID: &str = "core::@57c4dc4b2c3c8a4a0e0e";
    pub const INDEX_FILE: &str = "index-2024-01-01T00-00-00-0000.json";

    pub fn write_json(path: &Path, value: &Value) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    }

    fn write_text(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[derive(Debug, Clone)]
    pub struct FixtureOptions {
        pub configurations: Vec<String>,
        pub multi_config: bool,
        pub generator: String,
    }

    impl Default for FixtureOptions {
        fn default() -> Self {
            Self {
                configurations: vec!["Debug".to_string()],
                multi_config: false,
                generator: "Ninja".to_string(),
            }
        }
    }

    /// Sources of a project with an `app` executable and a `core` library
    pub fn write_source_tree(source: &Path) {
        write_text(
            &source.join("CMakeLists.txt"),
            "cmake_minimum_required(VERSION 3.20)\nproject(demo CXX)\n\
             include(cmake/Warnings.cmake)\nadd_subdirectory(core)\n\
             add_executable(app main.cpp)\ntarget_link_libraries(app core)\n",
        );
        write_text(&source.join("main.cpp"), "int main() { return 0; }\n");
        write_text(&source.join("cmake/Warnings.cmake"), "add_compile_options(-Wall)\n");
        write_text(
            &source.join("core/CMakeLists.txt"),
            "add_library(core STATIC core.cpp core.h)\n",
        );
        write_text(&source.join("core/core.cpp"), "#include \"core.h\"\n");
        write_text(&source.join("core/core.h"), "#pragma once\n");
        write_text(&source.join("README.md"), "demo\n");
    }

    fn codemodel_configuration(name: &str) -> Value {
        json!({
            "name": name,
            "directories": [
                {"source": ".", "build": ".", "childIndexes": [1], "projectIndex": 0, "targetIndexes": [0]},
                {"source": "core", "build": "core", "parentIndex": 0, "projectIndex": 0, "targetIndexes": [1]}
            ],
            "projects": [
                {"name": "demo", "directoryIndexes": [0, 1], "targetIndexes": [0, 1]}
            ],
            "targets": [
                {"name": "app", "id": APP_ID, "directoryIndex": 0, "projectIndex": 0,
                 "jsonFile": format!("target-app-{name}.json")},
                {"name": "core", "id": CORE_ID, "directoryIndex": 1, "projectIndex": 0,
                 "jsonFile": format!("target-core-{name}.json")}
            ]
        })
    }

    fn app_target(source: &Path) -> Value {
        json!({
            "name": "app",
            "id": APP_ID,
            "type": "EXECUTABLE",
            "backtrace": 1,
            "paths": {"source": ".", "build": "."},
            "nameOnDisk": "app",
            "artifacts": [{"path": "app"}],
            "link": {
                "language": "CXX",
                "commandFragments": [
                    {"fragment": "-O2", "role": "flags"},
                    {"fragment": "core/libcore.a", "role": "libraries"}
                ]
            },
            "dependencies": [{"id": CORE_ID, "backtrace": 2}],
            "sources": [
                {"path": "main.cpp", "compileGroupIndex": 0, "sourceGroupIndex": 0, "backtrace": 1}
            ],
            "sourceGroups": [{"name": "Source Files", "sourceIndexes": [0]}],
            "compileGroups": [{
                "language": "CXX",
                "sourceIndexes": [0],
                "compileCommandFragments": [{"fragment": "-g -Wall"}],
                "includes": [{"path": source.join("core").to_string_lossy(), "backtrace": 2}],
                "defines": [{"define": "APP_VERSION=2", "backtrace": 1}]
            }],
            "backtraceGraph": {
                "commands": ["add_executable", "target_link_libraries"],
                "files": ["CMakeLists.txt"],
                "nodes": [
                    {"file": 0},
                    {"file": 0, "line": 5, "command": 0, "parent": 0},
                    {"file": 0, "line": 6, "command": 1, "parent": 0}
                ]
            }
        })
    }

    fn core_target(source: &Path) -> Value {
        json!({
            "name": "core",
            "id": CORE_ID,
            "type": "STATIC_LIBRARY",
            "backtrace": 1,
            "paths": {"source": "core", "build": "core"},
            "nameOnDisk": "libcore.a",
            "artifacts": [{"path": "core/libcore.a"}],
            "archive": {},
            "sources": [
                {"path": "core/core.cpp", "compileGroupIndex": 0, "sourceGroupIndex": 0, "backtrace": 1},
                {"path": "core/core.h", "sourceGroupIndex": 1, "backtrace": 1}
            ],
            "sourceGroups": [
                {"name": "Source Files", "sourceIndexes": [0]},
                {"name": "Header Files", "sourceIndexes": [1]}
            ],
            "compileGroups": [{
                "language": "CXX",
                "sourceIndexes": [0],
                "includes": [{"path": source.join("core").to_string_lossy()}]
            }],
            "backtraceGraph": {
                "commands": ["add_library"],
                "files": ["core/CMakeLists.txt"],
                "nodes": [
                    {"file": 0},
                    {"file": 0, "line": 1, "command": 0, "parent": 0}
                ]
            }
        })
    }

    /// Write sources, query files, `CMakeCache.txt` and a complete reply
    /// directory, in that order so the reply is the newest artifact.
    /// Returns the path of the reply index file.
    pub fn write_reply_fixture(source: &Path, build: &Path, options: &FixtureOptions) -> PathBuf {
        write_source_tree(source);
        setup_file_api(build).unwrap();

        let build_type = options
            .configurations
            .first()
            .cloned()
            .unwrap_or_default();
        write_text(
            &build.join("CMakeCache.txt"),
            &format!(
                "# This is the CMakeCache file.\n\
                 //Choose the type of build.\n\
                 CMAKE_BUILD_TYPE:STRING={build_type}\n\
                 CMAKE_HOME_DIRECTORY:INTERNAL={}\n",
                source.display()
            ),
        );

        let reply = reply_directory(build);
        write_json(
            &reply.join("cache-v2-fixture.json"),
            &json!({
                "kind": "cache",
                "version": {"major": 2, "minor": 0},
                "entries": [
                    {"name": "CMAKE_BUILD_TYPE", "value": build_type, "type": "STRING",
                     "properties": [{"name": "HELPSTRING", "value": "Choose the type of build."}]},
                    {"name": "CMAKE_CXX_COMPILER", "value": "/usr/bin/c++", "type": "FILEPATH",
                     "properties": [{"name": "ADVANCED", "value": "1"}]}
                ]
            }),
        );
        write_json(
            &reply.join("cmakeFiles-v1-fixture.json"),
            &json!({
                "kind": "cmakeFiles",
                "version": {"major": 1, "minor": 0},
                "paths": {"source": source.to_string_lossy(), "build": build.to_string_lossy()},
                "inputs": [
                    {"path": "CMakeLists.txt"},
                    {"path": "cmake/Warnings.cmake"},
                    {"path": "core/CMakeLists.txt"},
                    {"path": build.join("CMakeFiles/3.27.4/CMakeSystem.cmake").to_string_lossy(),
                     "isGenerated": true},
                    {"path": "/usr/share/cmake-3.27/Modules/CMakeCXXInformation.cmake",
                     "isCMake": true, "isExternal": true}
                ]
            }),
        );

        let configurations: Vec<Value> = options
            .configurations
            .iter()
            .map(|name| codemodel_configuration(name))
            .collect();
        write_json(
            &reply.join("codemodel-v2-fixture.json"),
            &json!({
                "kind": "codemodel",
                "version": {"major": 2, "minor": 6},
                "paths": {"source": source.to_string_lossy(), "build": build.to_string_lossy()},
                "configurations": configurations
            }),
        );
        for name in &options.configurations {
            write_json(&reply.join(format!("target-app-{name}.json")), &app_target(source));
            write_json(&reply.join(format!("target-core-{name}.json")), &core_target(source));
        }

        let index = reply.join(INDEX_FILE);
        write_json(
            &index,
            &json!({
                "cmake": {
                    "generator": {"multiConfig": options.multi_config, "name": options.generator},
                    "paths": {
                        "cmake": "/usr/bin/cmake",
                        "cpack": "/usr/bin/cpack",
                        "ctest": "/usr/bin/ctest",
                        "root": "/usr/share/cmake-3.27"
                    },
                    "version": {"major": 3, "minor": 27, "patch": 4, "string": "3.27.4"}
                },
                "objects": [
                    {"jsonFile": "codemodel-v2-fixture.json", "kind": "codemodel",
                     "version": {"major": 2, "minor": 6}},
                    {"jsonFile": "cache-v2-fixture.json", "kind": "cache",
                     "version": {"major": 2, "minor": 0}},
                    {"jsonFile": "cmakeFiles-v1-fixture.json", "kind": "cmakeFiles",
                     "version": {"major": 1, "minor": 0}}
                ]
            }),
        );
        index
    }
}

/// Integration test helpers that configure a real CMake project
#[cfg(all(test, feature = "cmake-integration-tests"))]
pub mod integration {
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Source tree plus empty build directory, removed on drop
    pub struct TestProject {
        _temp_dir: TempDir,
        pub source_dir: PathBuf,
        pub build_dir: PathBuf,
    }

    impl TestProject {
        pub fn new() -> Result<Self, std::io::Error> {
            let temp_dir = TempDir::new()?;
            let source_dir = temp_dir.path().join("project");
            let build_dir = temp_dir.path().join("build-debug");
            super::fixtures::write_source_tree(&source_dir);
            std::fs::create_dir_all(&build_dir)?;
            Ok(Self {
                _temp_dir: temp_dir,
                source_dir,
                build_dir,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_api::parser::read_reply_file;

    #[test]
    fn test_reply_fixture_is_newest_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let build = dir.path().join("build");
        let index = write_reply_fixture(&source, &build, &FixtureOptions::default());

        assert!(source.join("core/core.h").is_file());
        assert!(build.join("CMakeCache.txt").is_file());
        let (_, error) = read_reply_file(&index);
        assert_eq!(error, None);

        let reply_time = std::fs::metadata(&index).unwrap().modified().unwrap();
        let lists_time = std::fs::metadata(source.join("CMakeLists.txt"))
            .unwrap()
            .modified()
            .unwrap();
        assert!(reply_time >= lists_time);
    }
}
