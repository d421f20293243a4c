//! Test discovery through `ctest --show-only=json-v1`

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::cmake::error::CMakeError;

/// A test registered with `add_test`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCaseInfo {
    pub name: String,
    /// 1-based position in the ctest listing, as used by `ctest -I`
    pub number: usize,
    /// CMake file that registered the test
    pub path: Option<PathBuf>,
    pub line: Option<i64>,
}

/// Run `ctest -N --show-only=json-v1` in the build directory
pub async fn list_tests(
    ctest: &Path,
    build_directory: &Path,
    environment: &[(String, String)],
) -> Result<Vec<TestCaseInfo>, CMakeError> {
    debug!(target: "cmake_sync::build_system", "Listing tests with {}", ctest.display());
    let output = Command::new(ctest)
        .args(["-N", "--show-only=json-v1"])
        .current_dir(build_directory)
        .envs(environment.iter().map(|(k, v)| (k, v)))
        .output()
        .await
        .map_err(|source| CMakeError::Launch {
            executable: ctest.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(CMakeError::CTestFailed {
            executable: ctest.to_path_buf(),
            status: output.status.to_string(),
        });
    }

    Ok(parse_test_listing(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse the JSON listing; unreadable input yields no tests
pub fn parse_test_listing(input: &str) -> Vec<TestCaseInfo> {
    let Ok(document) = serde_json::from_str::<Value>(input) else {
        return Vec::new();
    };
    let Some(root) = document.as_object() else {
        return Vec::new();
    };

    let graph = root.get("backtraceGraph");
    let files = graph
        .and_then(|g| g.get("files"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let nodes = graph
        .and_then(|g| g.get("nodes"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let Some(tests) = root.get("tests").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for (index, test) in tests.iter().enumerate() {
        let number = index + 1;
        if !test.is_object() {
            continue;
        }

        // Tests registered without a backtrace have no location
        let origin = test
            .get("backtrace")
            .and_then(Value::as_u64)
            .and_then(|bt| outermost_node(&nodes, bt as usize));

        let file = origin
            .and_then(|node| node.get("file"))
            .and_then(Value::as_u64);
        let line = origin.and_then(|node| node.get("line")).and_then(Value::as_i64);
        let path = file
            .and_then(|f| files.get(f as usize))
            .and_then(Value::as_str)
            .map(PathBuf::from);

        result.push(TestCaseInfo {
            name: test
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            number,
            path,
            line,
        });
    }
    result
}

/// Follow parent links up to the node without a parent, stopping on cycles
fn outermost_node(nodes: &[Value], start: usize) -> Option<&Value> {
    let mut seen = HashSet::new();
    let mut current = nodes.get(start)?;
    loop {
        let Some(parent) = current.get("parent").and_then(Value::as_u64) else {
            return Some(current);
        };
        let parent = parent as usize;
        if !seen.insert(parent) {
            return Some(current);
        }
        match nodes.get(parent) {
            Some(node) => current = node,
            None => return Some(current),
        }
    }
}

/// Arguments for running `tests` out of `known`
///
/// Running every known test (or none named) needs no selection; otherwise
/// the tests are picked by number with `-I 0,0,0,<n>...`.
pub fn arguments_for_tests(
    known: &[TestCaseInfo],
    tests: &[String],
    options: &[String],
) -> Vec<String> {
    let mut arguments = options.to_vec();
    let selected: BTreeSet<&str> = tests.iter().map(String::as_str).collect();
    let current: BTreeSet<&str> = known.iter().map(|t| t.name.as_str()).collect();
    if tests.is_empty() || selected == current {
        return arguments;
    }

    // start, end, stride, then explicit test numbers
    let mut numbers = String::from("0,0,0");
    for info in known.iter().filter(|t| selected.contains(t.name.as_str())) {
        numbers.push_str(&format!(",{}", info.number));
    }
    arguments.push("-I".to_string());
    arguments.push(numbers);
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{
        "kind": "ctestInfo",
        "version": { "major": 1, "minor": 0 },
        "backtraceGraph": {
            "commands": ["add_test", "my_add_test"],
            "files": ["/src/CMakeLists.txt", "/src/cmake/Testing.cmake"],
            "nodes": [
                { "file": 0 },
                { "file": 1, "command": 0, "line": 4, "parent": 2 },
                { "file": 0, "command": 1, "line": 17, "parent": 0 },
                { "file": 0, "command": 0, "line": 21, "parent": 3 }
            ]
        },
        "tests": [
            { "name": "unit", "backtrace": 1, "command": ["/build/unit"] },
            { "name": "smoke", "command": ["/build/smoke"] },
            { "name": "loop", "backtrace": 3 }
        ]
    }"#;

    #[test]
    fn test_parse_listing_resolves_outermost_location() {
        let tests = parse_test_listing(LISTING);
        assert_eq!(tests.len(), 3);

        assert_eq!(tests[0].name, "unit");
        assert_eq!(tests[0].number, 1);
        // node 1 -> node 2 -> node 0, which carries no line
        assert_eq!(tests[0].path, Some(PathBuf::from("/src/CMakeLists.txt")));
        assert_eq!(tests[0].line, None);

        assert_eq!(tests[1].name, "smoke");
        assert_eq!(tests[1].number, 2);
        assert_eq!(tests[1].path, None);
        assert_eq!(tests[1].line, None);
    }

    #[test]
    fn test_parse_listing_survives_cycles() {
        let tests = parse_test_listing(LISTING);
        // node 3 points at itself
        assert_eq!(tests[2].name, "loop");
        assert_eq!(tests[2].line, Some(21));
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        assert!(parse_test_listing("not json").is_empty());
        assert!(parse_test_listing("[]").is_empty());
        assert!(parse_test_listing("{}").is_empty());
    }

    #[test]
    fn test_arguments_for_tests_selection() {
        let known = parse_test_listing(LISTING);
        let options = vec!["--output-on-failure".to_string()];

        assert_eq!(arguments_for_tests(&known, &[], &options), options);

        let all: Vec<String> = ["loop", "smoke", "unit"].map(String::from).to_vec();
        assert_eq!(arguments_for_tests(&known, &all, &options), options);

        let some = vec!["unit".to_string(), "loop".to_string()];
        assert_eq!(
            arguments_for_tests(&known, &some, &options),
            vec!["--output-on-failure", "-I", "0,0,0,1,3"]
        );
    }
}
