use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileApiError {
    #[error("Failed to set up CMake file API support in {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
