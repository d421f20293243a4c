//! Tracing setup for the cmake-sync binary

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. "info" or "cmake_sync::reader=debug"
    pub level: String,
    /// Log file; stderr when unset
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `CMAKE_SYNC_LOG_FILE`, `CMAKE_SYNC_LOG_JSON` and
    /// `CMAKE_SYNC_LOG_UNIQUE`
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let unique = env_flag("CMAKE_SYNC_LOG_UNIQUE");
        let file_path = env::var("CMAKE_SYNC_LOG_FILE")
            .ok()
            .map(PathBuf::from)
            .map(|path| if unique { with_process_id(&path) } else { path });

        Self {
            level,
            file_path,
            json_format: env_flag("CMAKE_SYNC_LOG_JSON"),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| value == "true")
}

/// `sync.log` becomes `sync.<pid>.log`
fn with_process_id(path: &Path) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let mut name = stem.to_os_string();
    name.push(format!(".{}", std::process::id()));
    if let Some(extension) = path.extension() {
        name.push(".");
        name.push(extension);
    }
    path.with_file_name(name)
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let layer = if config.json_format {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .init();
    Ok(())
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_take_precedence() {
        let config = LogConfig::default()
            .with_overrides(Some("cmake_sync=trace".to_string()), Some("/tmp/sync.log".into()));
        assert_eq!(config.level, "cmake_sync=trace");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/sync.log")));

        let config = LogConfig::default().with_overrides(None, None);
        assert_eq!(config.level, "info");
        assert_eq!(config.file_path, None);
        assert!(!config.json_format);
    }

    #[test]
    fn test_unique_log_file_names() {
        let pid = std::process::id();
        assert_eq!(
            with_process_id(Path::new("/var/log/sync.log")),
            PathBuf::from(format!("/var/log/sync.{pid}.log"))
        );
        assert_eq!(
            with_process_id(Path::new("/var/log/sync")),
            PathBuf::from(format!("/var/log/sync.{pid}"))
        );
    }
}
