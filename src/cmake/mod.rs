//! Driving cmake for one build directory
//!
//! - [`tool`] describes a cmake executable and its capabilities
//! - [`process`] supervises a configure run, [`output_parser`] reads its output
//! - [`reader`] runs parse cycles against the file API reply
//! - [`build_system`] coordinates parses, tree scans and test discovery

pub mod build_system;
pub mod config_item;
pub mod ctest;
pub mod error;
pub mod output_parser;
pub mod parameters;
pub mod process;
pub mod reader;
pub mod tool;

pub use build_system::{BuildSystem, BuildSystemEvent, BuildSystemSettings, ProjectModel, ReparseFlags};
pub use config_item::CMakeConfig;
pub use parameters::BuildDirParameters;
pub use process::ProcessEvent;
pub use tool::{CMakeTool, ToolRegistry};
