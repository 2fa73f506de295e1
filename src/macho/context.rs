//! Mach-O context for reading and modifying a single 64-bit slice.
//!
//! Edits never move segment data: new load commands are written into the
//! zero padding between the end of the load-command region and the first
//! section's file offset, and rewritten commands shift their successors
//! within that same region.

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_cstr;

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the slice
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<Section64>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }
}

// =============================================================================
// Dependencies
// =============================================================================

/// How a dependency entry asks dyld to load its library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// LC_LOAD_DYLIB
    Load,
    /// LC_LOAD_WEAK_DYLIB
    Weak,
    /// LC_REEXPORT_DYLIB
    Reexport,
    /// LC_LAZY_LOAD_DYLIB
    Lazy,
    /// LC_LOAD_UPWARD_DYLIB
    Upward,
}

impl DependencyKind {
    /// Maps a load command type to a dependency kind. `LC_ID_DYLIB` is not a
    /// dependency and maps to `None`.
    pub fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(Self::Load),
            LC_LOAD_WEAK_DYLIB => Some(Self::Weak),
            LC_REEXPORT_DYLIB => Some(Self::Reexport),
            LC_LAZY_LOAD_DYLIB => Some(Self::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(Self::Upward),
            _ => None,
        }
    }

    /// Returns the load command type for this kind.
    pub fn cmd(self) -> u32 {
        match self {
            Self::Load => LC_LOAD_DYLIB,
            Self::Weak => LC_LOAD_WEAK_DYLIB,
            Self::Reexport => LC_REEXPORT_DYLIB,
            Self::Lazy => LC_LAZY_LOAD_DYLIB,
            Self::Upward => LC_LOAD_UPWARD_DYLIB,
        }
    }

    /// Returns the kind used for a freshly inserted dependency.
    pub fn for_insert(weak: bool) -> Self {
        if weak {
            Self::Weak
        } else {
            Self::Load
        }
    }

    /// Returns the load command name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "LC_LOAD_DYLIB",
            Self::Weak => "LC_LOAD_WEAK_DYLIB",
            Self::Reexport => "LC_REEXPORT_DYLIB",
            Self::Lazy => "LC_LAZY_LOAD_DYLIB",
            Self::Upward => "LC_LOAD_UPWARD_DYLIB",
        }
    }
}

/// A dependency entry of a Mach-O image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// Install name as recorded in the load command
    pub name: String,
    /// Load command flavour
    pub kind: DependencyKind,
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// Only the commands the injector reads or edits are decoded; everything
/// else is carried as `Unknown` and moved byte-for-byte.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Dylib {
        command: DylibCommand,
        name: String,
        offset: usize,
    },
    Rpath {
        cmdsize: u32,
        path: String,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Dylib { offset, .. } => *offset,
            LoadCommandInfo::Rpath { offset, .. } => *offset,
            LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }

    /// Returns the load command size.
    pub fn size(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmdsize,
            LoadCommandInfo::Dylib { command, .. } => command.cmdsize,
            LoadCommandInfo::Rpath { cmdsize, .. } => *cmdsize,
            LoadCommandInfo::Unknown { cmdsize, .. } => *cmdsize,
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Context for working with one 64-bit little-endian Mach-O slice.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Mutable copy of the slice data
    pub data: Vec<u8>,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
}

impl MachOContext {
    /// Creates a new context from raw slice data (copied).
    pub fn new(data: &[u8]) -> Result<Self> {
        let header = Self::read_header(data)?;

        let mut ctx = Self {
            header,
            data: data.to_vec(),
            load_commands: Vec::new(),
        };

        ctx.parse_load_commands()?;

        Ok(ctx)
    }

    /// Creates a read-only context that copies only the header and the
    /// load-command region. Editing such a context is not supported.
    pub fn headers_only(data: &[u8]) -> Result<Self> {
        let header = Self::read_header(data)?;
        let end = (MachHeader64::SIZE + header.sizeofcmds as usize).min(data.len());
        Self::new(&data[..end])
    }

    fn read_header(data: &[u8]) -> Result<MachHeader64> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::BufferTooSmall {
                needed: MachHeader64::SIZE,
                available: data.len(),
            });
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;

        match header.magic {
            MH_MAGIC_64 => Ok(header),
            MH_MAGIC => Err(Error::UnsupportedMacho {
                reason: "32-bit slices are not supported".into(),
            }),
            MH_CIGAM | MH_CIGAM_64 => Err(Error::UnsupportedMacho {
                reason: "big-endian slices are not supported".into(),
            }),
            other => Err(Error::InvalidMachoMagic(other)),
        }
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;
        if end_offset > self.data.len() {
            return Err(Error::LoadCommandOverflow {
                offset: self.data.len(),
            });
        }

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset
                || offset + LoadCommand::SIZE > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            if lc.cmdsize < LoadCommand::SIZE as u32
                || offset + lc.cmdsize as usize > end_offset
                || offset + lc.cmdsize as usize > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &self.data[offset..offset + lc.cmdsize as usize];
            let cmd_info = self.parse_load_command(lc.cmd, cmd_data, offset)?;

            self.load_commands.push(cmd_info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(&self, cmd: u32, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        match cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut sect_offset = SegmentCommand64::SIZE;

                for _ in 0..seg.nsects {
                    let sect = data
                        .get(sect_offset..)
                        .and_then(|rest| Section64::read_from_prefix(rest).ok())
                        .ok_or_else(|| {
                            Error::parse(offset + sect_offset, "failed to parse section")
                        })?
                        .0;

                    sections.push(sect);
                    sect_offset += Section64::SIZE;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                let dylib = DylibCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse dylib command"))?
                    .0;

                Ok(LoadCommandInfo::Dylib {
                    command: dylib,
                    name: read_cstr(data, dylib.dylib.name_offset as usize),
                    offset,
                })
            }

            LC_RPATH => {
                let rpath = RpathCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse rpath command"))?
                    .0;

                Ok(LoadCommandInfo::Rpath {
                    cmdsize: rpath.cmdsize,
                    path: read_cstr(data, rpath.path_offset as usize),
                    offset,
                })
            }

            _ => {
                let lc = LoadCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                    .0;

                Ok(LoadCommandInfo::Unknown {
                    cmd,
                    cmdsize: lc.cmdsize,
                    offset,
                })
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns the dependency entries in load-command order.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.load_commands
            .iter()
            .filter_map(|lc| match lc {
                LoadCommandInfo::Dylib { command, name, .. } => {
                    DependencyKind::from_cmd(command.cmd).map(|kind| Dependency {
                        name: name.clone(),
                        kind,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Returns the install name of this image, if it is a dylib.
    pub fn install_name(&self) -> Option<&str> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name, .. } if command.cmd == LC_ID_DYLIB => {
                Some(name.as_str())
            }
            _ => None,
        })
    }

    /// Returns an iterator over the runtime search paths.
    pub fn rpaths(&self) -> impl Iterator<Item = &str> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Rpath { path, .. } = lc {
                Some(path.as_str())
            } else {
                None
            }
        })
    }

    /// Returns true if the slice carries a code signature.
    pub fn has_code_signature(&self) -> bool {
        self.load_commands
            .iter()
            .any(|lc| matches!(lc, LoadCommandInfo::Unknown { cmd, .. } if *cmd == LC_CODE_SIGNATURE))
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    pub fn is_arm64e(&self) -> bool {
        self.header.is_arm64e()
    }

    /// Returns the end of the load-command region.
    #[inline]
    pub fn load_commands_end(&self) -> usize {
        MachHeader64::SIZE + self.header.sizeofcmds as usize
    }

    /// Returns the first file offset occupied by segment or section content,
    /// which bounds how far the load-command region may grow.
    pub fn load_command_limit(&self) -> usize {
        let mut limit = self.data.len();
        for seg in self.segments() {
            if seg.command.fileoff > 0 && seg.command.filesize > 0 {
                limit = limit.min(seg.command.fileoff as usize);
            }
            for sect in &seg.sections {
                if sect.offset > 0 {
                    limit = limit.min(sect.offset as usize);
                }
            }
        }
        limit
    }

    /// Returns the available space for new load commands.
    pub fn available_load_command_space(&self) -> usize {
        self.load_command_limit()
            .saturating_sub(self.load_commands_end())
    }

    // =========================================================================
    // Edits
    // =========================================================================

    /// Appends a dependency entry. Returns `false` without touching the slice
    /// when an entry with the same name already exists.
    pub fn add_dylib(&mut self, name: &str, weak: bool) -> Result<bool> {
        if self.dependencies().iter().any(|dep| dep.name == name) {
            return Ok(false);
        }

        let bytes = DylibCommand::encode(DependencyKind::for_insert(weak).cmd(), name);
        let at = self.load_commands_end();
        self.splice_commands(at, 0, &bytes, 1)?;
        Ok(true)
    }

    /// Renames the first dependency entry called `from`, keeping its kind,
    /// timestamp and versions. Returns `false` if there is no such entry.
    pub fn rename_dylib(&mut self, from: &str, to: &str) -> Result<bool> {
        let Some((command, offset)) = self.find_dependency(from) else {
            return Ok(false);
        };
        if from == to {
            return Ok(true);
        }

        let mut bytes = DylibCommand::encode(command.cmd, to);
        let mut rebuilt = DylibCommand::read_from_prefix(&bytes)
            .map_err(|_| Error::parse(offset, "failed to encode dylib command"))?
            .0;
        rebuilt.dylib.timestamp = command.dylib.timestamp;
        rebuilt.dylib.current_version = command.dylib.current_version;
        rebuilt.dylib.compatibility_version = command.dylib.compatibility_version;
        bytes[..DylibCommand::SIZE].copy_from_slice(rebuilt.as_bytes());

        self.splice_commands(offset, command.cmdsize as usize, &bytes, 0)?;
        Ok(true)
    }

    /// Removes the first dependency entry called `name`. Returns `false` if
    /// there is no such entry.
    pub fn remove_dylib(&mut self, name: &str) -> Result<bool> {
        let Some((command, offset)) = self.find_dependency(name) else {
            return Ok(false);
        };
        self.splice_commands(offset, command.cmdsize as usize, &[], -1)?;
        Ok(true)
    }

    /// Appends an `LC_RPATH` entry unless an identical one exists.
    pub fn add_rpath(&mut self, path: &str) -> Result<bool> {
        if self.rpaths().any(|existing| existing == path) {
            return Ok(false);
        }

        let bytes = RpathCommand::encode(path);
        let at = self.load_commands_end();
        self.splice_commands(at, 0, &bytes, 1)?;
        Ok(true)
    }

    fn find_dependency(&self, name: &str) -> Option<(DylibCommand, usize)> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib {
                command,
                name: existing,
                offset,
            } if existing == name && DependencyKind::from_cmd(command.cmd).is_some() => {
                Some((*command, *offset))
            }
            _ => None,
        })
    }

    /// Replaces `remove` bytes at `at` inside the load-command region with
    /// `insert`, then rewrites the header and re-parses.
    ///
    /// Growth must land on zero padding below [`Self::load_command_limit`].
    fn splice_commands(
        &mut self,
        at: usize,
        remove: usize,
        insert: &[u8],
        ncmds_delta: i32,
    ) -> Result<()> {
        let start = MachHeader64::SIZE;
        let end = self.load_commands_end();
        if at < start || at + remove > end {
            return Err(Error::LoadCommandOverflow { offset: at });
        }

        let new_size = self.header.sizeofcmds as usize - remove + insert.len();
        let limit = self.load_command_limit();
        let available = limit.saturating_sub(start);
        if new_size > available {
            return Err(Error::InsufficientLoadCommandSpace {
                needed: new_size - (end - start),
                available: limit.saturating_sub(end),
            });
        }

        let new_end = start + new_size;
        if new_end > end && self.data[end..new_end].iter().any(|&b| b != 0) {
            return Err(Error::InsufficientLoadCommandSpace {
                needed: new_end - end,
                available: self.data[end..new_end].iter().take_while(|&&b| b == 0).count(),
            });
        }

        let mut region = Vec::with_capacity(new_size);
        region.extend_from_slice(&self.data[start..at]);
        region.extend_from_slice(insert);
        region.extend_from_slice(&self.data[at + remove..end]);

        self.data[start..end.max(new_end)].fill(0);
        self.data[start..new_end].copy_from_slice(&region);

        self.header.ncmds = self.header.ncmds.saturating_add_signed(ncmds_delta);
        self.header.sizeofcmds = new_size as u32;
        self.sync_header()?;

        self.load_commands.clear();
        self.parse_load_commands()
    }

    // =========================================================================
    // Raw Access
    // =========================================================================

    /// Writes data at the specified offset.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.data.len() {
            return Err(Error::BufferTooSmall {
                needed: offset + data.len(),
                available: self.data.len(),
            });
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes a structure at the specified offset.
    pub fn write_struct<T: IntoBytes + Immutable>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<()> {
        self.write_at(offset, value.as_bytes())
    }

    /// Updates the header in the data buffer.
    pub fn sync_header(&mut self) -> Result<()> {
        let header = self.header;
        self.write_struct(0, &header)
    }

    /// Returns the raw data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
