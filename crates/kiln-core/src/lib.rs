//! Core data model, configuration, and file-set utilities shared by every
//! kiln crate.

pub mod config;
pub mod files;
pub mod paths;
pub mod types;
