//! Small helpers for binary data and path handling.
//!
//! This module provides:
//! - Unaligned little-endian reads (byteorder)
//! - NUL-terminated string scanning (memchr)
//! - Power-of-two alignment arithmetic
//! - Leaf-name helpers shared by the asset and naming code

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Fast Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 4 > data.len()`.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..])
}

// =============================================================================
// C Strings
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` when there is no terminator.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Reads a NUL-terminated string starting at `offset`, lossily decoded.
///
/// Returns an empty string when `offset` is past the end of `data`.
pub fn read_cstr(data: &[u8], offset: usize) -> String {
    if offset >= data.len() {
        return String::new();
    }
    let bytes = &data[offset..];
    String::from_utf8_lossy(&bytes[..memchr_null(bytes)]).into_owned()
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
///
/// # Panics
///
/// Debug assertion fails if `alignment` is not a power of 2.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// Paths
// =============================================================================

/// Returns the final path component as a string, or an empty string.
pub fn leaf_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Returns the lower-cased extension of a path, or an empty string.
pub fn extension_lowercase(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}
