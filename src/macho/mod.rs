//! Mach-O file format handling.
//!
//! This module provides the structures and editors needed to read and rewrite
//! the dependency table (load commands) of thin and FAT Mach-O files.

mod constants;
mod context;
mod file;
mod structs;

pub use constants::*;
pub use context::*;
pub use file::*;
pub use structs::*;
