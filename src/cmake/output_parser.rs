//! Line parsers for the output of a cmake configure run
//!
//! Stderr carries the diagnostics (`CMake Error at file:line (command):`
//! followed by an indented description), stdout the `-- ...` progress lines.

use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One error or warning reported by cmake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    /// CMake command the diagnostic is attributed to, e.g. `add_executable`
    pub command: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConfigureProgress {
    ConfiguringDone,
    ConfiguringIncomplete,
    GeneratingDone,
    BuildFilesWritten(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutputEvent {
    Diagnostic(Diagnostic),
    Progress(ConfigureProgress),
}

/// Parser fed with output lines one at a time
pub trait OutputLineParser: Send {
    /// Consume a line, returning an event once one is complete
    fn parse_line(&mut self, line: &str) -> Option<OutputEvent>;

    /// Emit whatever is still buffered when the stream ended
    fn flush(&mut self) -> Option<OutputEvent> {
        None
    }
}

/// Runs every line through all parsers in order
#[derive(Default)]
pub struct ParserChain {
    parsers: Vec<Box<dyn OutputLineParser>>,
}

impl ParserChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, parser: impl OutputLineParser + 'static) -> Self {
        self.parsers.push(Box::new(parser));
        self
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<OutputEvent> {
        self.parsers
            .iter_mut()
            .filter_map(|parser| parser.parse_line(line))
            .collect()
    }

    pub fn flush(&mut self) -> Vec<OutputEvent> {
        self.parsers
            .iter_mut()
            .filter_map(|parser| parser.flush())
            .collect()
    }
}

/// Collects multi-line CMake diagnostics
pub struct CMakeDiagnosticParser {
    located_regex: Regex,
    in_file_regex: Regex,
    plain_regex: Regex,
    current: Option<Diagnostic>,
}

impl CMakeDiagnosticParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // CMake Warning (dev) at CMakeLists.txt:12 (find_package):
            located_regex: Regex::new(
                r"^CMake (Error|Warning|Deprecation Warning|Deprecation Error)(?: \(dev\))? at (.+):(\d+)(?: \((\w+)\))?:$",
            )?,

            // CMake Error in src/CMakeLists.txt:
            in_file_regex: Regex::new(r"^CMake (Error|Warning)(?: \(dev\))? in (.+):$")?,

            // CMake Error: The source directory "/x" does not exist.
            plain_regex: Regex::new(r"^CMake (Error|Warning)(?: \(dev\))?:\s*(.*)$")?,

            current: None,
        })
    }

    fn severity(kind: &str) -> Severity {
        if kind.ends_with("Error") {
            Severity::Error
        } else {
            Severity::Warning
        }
    }

    fn start(&mut self, diagnostic: Diagnostic) -> Option<OutputEvent> {
        let finished = self.finish();
        self.current = Some(diagnostic);
        finished
    }

    fn finish(&mut self) -> Option<OutputEvent> {
        let mut diagnostic = self.current.take()?;
        diagnostic.message = diagnostic.message.trim().to_string();
        Some(OutputEvent::Diagnostic(diagnostic))
    }
}

impl Default for CMakeDiagnosticParser {
    fn default() -> Self {
        Self::new().expect("Failed to compile regex patterns")
    }
}

impl OutputLineParser for CMakeDiagnosticParser {
    fn parse_line(&mut self, line: &str) -> Option<OutputEvent> {
        let line = line.trim_end();

        if let Some(captures) = self.located_regex.captures(line) {
            let severity = Self::severity(captures.get(1)?.as_str());
            let file = PathBuf::from(captures.get(2)?.as_str());
            let line_number = captures.get(3)?.as_str().parse().ok();
            let command = captures.get(4).map(|m| m.as_str().to_string());

            return self.start(Diagnostic {
                severity,
                file: Some(file),
                line: line_number,
                command,
                message: String::new(),
            });
        }

        if let Some(captures) = self.in_file_regex.captures(line) {
            let severity = Self::severity(captures.get(1)?.as_str());
            let file = PathBuf::from(captures.get(2)?.as_str());

            return self.start(Diagnostic {
                severity,
                file: Some(file),
                line: None,
                command: None,
                message: String::new(),
            });
        }

        if let Some(captures) = self.plain_regex.captures(line) {
            let severity = Self::severity(captures.get(1)?.as_str());
            let message = captures.get(2)?.as_str().to_string();

            return self.start(Diagnostic {
                severity,
                file: None,
                line: None,
                command: None,
                message,
            });
        }

        let current = self.current.as_mut()?;
        if line.is_empty() {
            return None;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if !current.message.is_empty() {
                current.message.push('\n');
            }
            current.message.push_str(line.trim());
            return None;
        }

        // Anything flush left ends the block
        self.finish()
    }

    fn flush(&mut self) -> Option<OutputEvent> {
        self.finish()
    }
}

/// Recognizes the `-- ...` status lines of a configure run
pub struct ProgressParser {
    configuring_done_regex: Regex,
    configuring_incomplete_regex: Regex,
    generating_done_regex: Regex,
    build_files_regex: Regex,
}

impl ProgressParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // -- Configuring done (0.4s)
            configuring_done_regex: Regex::new(r"^-- Configuring done\b")?,
            // -- Configuring incomplete, errors occurred!
            configuring_incomplete_regex: Regex::new(r"^-- Configuring incomplete\b")?,
            // -- Generating done (0.0s)
            generating_done_regex: Regex::new(r"^-- Generating done\b")?,
            // -- Build files have been written to: /path/to/build
            build_files_regex: Regex::new(r"^-- Build files have been written to: (.+)$")?,
        })
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new().expect("Failed to compile regex patterns")
    }
}

impl OutputLineParser for ProgressParser {
    fn parse_line(&mut self, line: &str) -> Option<OutputEvent> {
        let line = line.trim_end();

        let progress = if self.configuring_done_regex.is_match(line) {
            ConfigureProgress::ConfiguringDone
        } else if self.configuring_incomplete_regex.is_match(line) {
            ConfigureProgress::ConfiguringIncomplete
        } else if self.generating_done_regex.is_match(line) {
            ConfigureProgress::GeneratingDone
        } else if let Some(captures) = self.build_files_regex.captures(line) {
            ConfigureProgress::BuildFilesWritten(PathBuf::from(captures.get(1)?.as_str()))
        } else {
            return None;
        };

        Some(OutputEvent::Progress(progress))
    }
}
