//! File-level access to thin and FAT Mach-O binaries.
//!
//! Every edit is applied to each architecture slice in turn. Slices keep their
//! size, so the FAT table never needs rewriting. Modified files are written to
//! a sibling temporary file and renamed over the original.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use super::constants::*;
use super::context::{Dependency, MachOContext};
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_u32_le_at;

/// Byte range of one architecture slice inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    /// Offset of the slice in the file
    pub offset: usize,
    /// Size of the slice in bytes
    pub size: usize,
}

/// Splits a file image into its architecture slices.
pub fn slice_ranges(data: &[u8]) -> Result<Vec<SliceRange>> {
    let Some(fat) = FatHeader::parse(data) else {
        if data.len() < 4 {
            return Err(Error::buffer_too_small(4, data.len()));
        }
        let magic = read_u32_le_at(data, 0);
        if !is_macho_magic(magic) {
            return Err(Error::InvalidMachoMagic(magic));
        }
        return Ok(vec![SliceRange {
            offset: 0,
            size: data.len(),
        }]);
    };

    let entry_size = fat.arch_size();
    let mut ranges = Vec::with_capacity(fat.nfat_arch as usize);

    for index in 0..fat.nfat_arch as usize {
        let entry_offset = FatHeader::SIZE + index * entry_size;
        let arch = data
            .get(entry_offset..)
            .and_then(|rest| FatArch::parse(rest, fat.is_64()))
            .ok_or_else(|| Error::parse(entry_offset, "truncated FAT arch table"))?;

        let offset = arch.offset as usize;
        let size = arch.size as usize;
        if offset.checked_add(size).map_or(true, |end| end > data.len()) {
            return Err(Error::parse(
                entry_offset,
                format!("FAT slice {index} ({offset:#x}+{size:#x}) exceeds file"),
            ));
        }

        ranges.push(SliceRange { offset, size });
    }

    if ranges.is_empty() {
        return Err(Error::parse(0, "FAT binary has no slices"));
    }

    Ok(ranges)
}

/// Returns true if the file at `path` starts with a Mach-O or FAT magic.
pub fn is_macho_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    is_macho_magic(u32::from_le_bytes(magic))
}

/// Lists the dependency entries of the first slice without copying the file.
///
/// Every slice of an injected binary carries the same entries, so the first
/// slice is representative.
pub fn read_dependencies(path: &Path) -> Result<Vec<Dependency>> {
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })?;

    let ranges = slice_ranges(&mmap)?;
    let first = ranges[0];
    let ctx = MachOContext::headers_only(&mmap[first.offset..first.offset + first.size])?;
    Ok(ctx.dependencies())
}

/// A thin or FAT Mach-O file loaded for editing.
#[derive(Debug)]
pub struct MachOFile {
    path: PathBuf,
    data: Vec<u8>,
    slices: Vec<SliceRange>,
    dirty: bool,
}

impl MachOFile {
    /// Reads and validates a Mach-O file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let slices = slice_ranges(&data)?;
        debug!("Opened {} ({} slice(s))", path.display(), slices.len());

        Ok(Self {
            path,
            data,
            slices,
            dirty: false,
        })
    }

    /// Returns the path this file was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the slice ranges.
    pub fn slices(&self) -> &[SliceRange] {
        &self.slices
    }

    /// Parses every slice.
    pub fn contexts(&self) -> Result<Vec<MachOContext>> {
        self.slices
            .iter()
            .map(|r| MachOContext::new(&self.data[r.offset..r.offset + r.size]))
            .collect()
    }

    /// Returns the dependency entries of the first slice.
    pub fn dependencies(&self) -> Result<Vec<Dependency>> {
        let first = self.slices[0];
        let ctx = MachOContext::headers_only(&self.data[first.offset..first.offset + first.size])?;
        Ok(ctx.dependencies())
    }

    /// Applies `edit` to every slice. Returns true if any slice changed.
    ///
    /// All slices are edited in memory before anything is stored, so an error
    /// in a later slice leaves the file buffer untouched.
    pub fn edit<F>(&mut self, mut edit: F) -> Result<bool>
    where
        F: FnMut(&mut MachOContext) -> Result<bool>,
    {
        let mut edited = Vec::with_capacity(self.slices.len());
        let mut changed = false;

        for range in &self.slices {
            let mut ctx = MachOContext::new(&self.data[range.offset..range.offset + range.size])?;
            if edit(&mut ctx)? {
                trace!(
                    "Edited slice {} at {:#x} ({} cmds)",
                    ctx.header.arch_name(),
                    range.offset,
                    ctx.header.ncmds
                );
                changed = true;
            }
            edited.push((*range, ctx));
        }

        if changed {
            for (range, ctx) in edited {
                self.data[range.offset..range.offset + range.size].copy_from_slice(ctx.as_bytes());
            }
            self.dirty = true;
        }

        Ok(changed)
    }

    /// Writes the file back if it was modified.
    ///
    /// The new content goes to a temporary file in the same directory, takes
    /// over the original permissions and is renamed into place. Ownership is
    /// not carried over.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        write_atomically(&self.path, &self.data)?;
        self.dirty = false;
        Ok(())
    }

    /// Returns the raw file image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Replaces `path` with `data` through a temporary sibling and a rename.
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let write_err = |e: std::io::Error| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(data).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(write_err)?;
    }

    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
