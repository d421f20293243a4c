//! CMake file API support
//!
//! - [`parser`] reads and validates the reply objects CMake writes below
//!   `<build>/.cmake/api/v1/reply`
//! - [`extractor`] turns them into build targets, code model parts and a
//!   project tree ([`tree`])

pub mod error;
pub mod extractor;
pub mod model;
pub mod parser;
pub mod tree;

pub use extractor::{LibrarySearchPolicy, extract_data};
pub use model::{CMakeBuildTarget, RawProjectPart};
pub use parser::{parse_data, scan_for_reply_file, setup_file_api};
pub use tree::ProjectNode;
