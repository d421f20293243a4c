//! Source tree scanning
//!
//! Runs next to the file API parse and supplies the files CMake does not know
//! about, or the whole tree when the parse fails.

pub mod error;
pub mod tree_scanner;

pub use error::ProjectError;
pub use tree_scanner::{ScanOptions, TreeScanner};
