//! # dotclaw-platform
//!
//! Host-side platform services: the on-disk data layout, atomic JSON file
//! I/O with partial-write tolerance, and the environment allowlist that
//! scopes what containers may see.

pub mod env;
pub mod fs;
pub mod paths;

pub use paths::DataPaths;
