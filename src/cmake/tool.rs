//! CMake executable description and registry
//!
//! A [`CMakeTool`] knows where the executable lives, whether it may be re-run
//! automatically when CMake input files change, and what `cmake -E capabilities`
//! reported about it (version, generators, file API request kinds).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cmake::error::CMakeError;

/// CMake version triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A generator reported by `cmake -E capabilities`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    pub name: String,
    #[serde(default)]
    pub extra_generators: Vec<String>,
    #[serde(default)]
    pub platform_support: bool,
    #[serde(default)]
    pub toolset_support: bool,
}

/// A file API request kind with the highest supported `(major, minor)` version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileApiCapability {
    pub kind: String,
    pub version: (i64, i64),
}

#[derive(Debug, Clone, Default)]
struct Introspection {
    version: Version,
    full_version: String,
    generators: Vec<Generator>,
    file_apis: Vec<FileApiCapability>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCapabilities {
    generators: Vec<Generator>,
    #[serde(rename = "fileApi")]
    file_api: RawFileApi,
    version: RawVersion,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawFileApi {
    requests: Vec<RawRequest>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawRequest {
    kind: Option<String>,
    version: Vec<RawRequestVersion>,
}

#[derive(Deserialize)]
struct RawRequestVersion {
    major: Option<i64>,
    minor: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawVersion {
    major: u32,
    minor: u32,
    patch: u32,
    string: String,
}

/// A CMake executable
#[derive(Debug, Clone)]
pub struct CMakeTool {
    id: String,
    executable: PathBuf,
    auto_run: bool,
    introspection: Option<Introspection>,
}

impl CMakeTool {
    pub fn new(id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            auto_run: true,
            introspection: None,
        }
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Whether the reader may re-run cmake when a CMake input file is newer than the reply
    pub fn is_auto_run(&self) -> bool {
        self.auto_run
    }

    pub fn is_introspected(&self) -> bool {
        self.introspection.is_some()
    }

    pub fn version(&self) -> Version {
        self.introspection
            .as_ref()
            .map(|i| i.version)
            .unwrap_or_default()
    }

    pub fn full_version(&self) -> &str {
        self.introspection
            .as_ref()
            .map(|i| i.full_version.as_str())
            .unwrap_or_default()
    }

    pub fn generators(&self) -> &[Generator] {
        self.introspection
            .as_ref()
            .map(|i| i.generators.as_slice())
            .unwrap_or_default()
    }

    pub fn file_apis(&self) -> &[FileApiCapability] {
        self.introspection
            .as_ref()
            .map(|i| i.file_apis.as_slice())
            .unwrap_or_default()
    }

    pub fn has_file_api(&self) -> bool {
        !self.file_apis().is_empty()
    }

    /// Run `cmake -E capabilities` and record the result
    pub async fn probe(&mut self) -> Result<(), CMakeError> {
        debug!("Probing capabilities of {}", self.executable.display());
        let output = Command::new(&self.executable)
            .args(["-E", "capabilities"])
            .output()
            .await
            .map_err(|source| CMakeError::Launch {
                executable: self.executable.clone(),
                source,
            })?;

        if !output.status.success() {
            self.introspection = None;
            return Err(CMakeError::CapabilitiesFailed {
                executable: self.executable.clone(),
                status: output.status.to_string(),
            });
        }

        self.parse_capabilities(&String::from_utf8_lossy(&output.stdout))?;
        info!(
            "CMake {} at {} (file API: {})",
            self.full_version(),
            self.executable.display(),
            self.has_file_api()
        );
        Ok(())
    }

    /// Parse the JSON document printed by `cmake -E capabilities`
    pub fn parse_capabilities(&mut self, input: &str) -> Result<(), CMakeError> {
        let raw: RawCapabilities = serde_json::from_str(input)?;

        let mut file_apis = Vec::new();
        for request in raw.file_api.requests {
            let mut highest = (-1i64, -1i64);
            for v in &request.version {
                let version = (v.major.unwrap_or(-1), v.minor.unwrap_or(-1));
                if version > highest {
                    highest = version;
                }
            }
            match request.kind {
                Some(kind) if highest.0 != -1 && highest.1 != -1 => {
                    file_apis.push(FileApiCapability {
                        kind,
                        version: highest,
                    });
                }
                _ => warn!("Ignoring incomplete file API request in capabilities"),
            }
        }

        let version = Version::new(raw.version.major, raw.version.minor, raw.version.patch);

        // 3.14 ships the file API without advertising it
        if version.major == 3 && version.minor == 14 {
            for (kind, v) in [("codemodel", (2, 0)), ("cache", (2, 0)), ("cmakefiles", (1, 0))] {
                file_apis.push(FileApiCapability {
                    kind: kind.to_string(),
                    version: v,
                });
            }
        }

        self.introspection = Some(Introspection {
            version,
            full_version: raw.version.string,
            generators: raw.generators,
            file_apis,
        });
        Ok(())
    }
}

/// Explicitly constructed set of known CMake tools
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<CMakeTool>>,
    default_id: Option<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; the first registered tool becomes the default
    pub fn register(&mut self, tool: CMakeTool) -> Arc<CMakeTool> {
        let id = tool.id().to_string();
        let tool = Arc::new(tool);
        if self.default_id.is_none() {
            self.default_id = Some(id.clone());
        }
        self.tools.insert(id, Arc::clone(&tool));
        tool
    }

    pub fn find_by_id(&self, id: &str) -> Option<Arc<CMakeTool>> {
        self.tools.get(id).cloned()
    }

    pub fn default_tool(&self) -> Option<Arc<CMakeTool>> {
        self.default_id
            .as_deref()
            .and_then(|id| self.find_by_id(id))
    }
}
