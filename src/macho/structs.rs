//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files. Thin slices are
//! little-endian and read through zerocopy; FAT headers are big-endian and
//! decoded with byteorder.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::util::align_up;

// =============================================================================
// Header Structures
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true if this is a valid 64-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Returns true if this is an ARM64 binary.
    #[inline]
    pub fn is_arm64(&self) -> bool {
        self.cputype == CPU_TYPE_ARM64
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    #[inline]
    pub fn is_arm64e(&self) -> bool {
        self.is_arm64() && (self.cpusubtype & 0xFF) == CPU_SUBTYPE_ARM64E
    }

    /// Returns the parsed header flags. Unknown bits are dropped.
    #[inline]
    pub fn header_flags(&self) -> MachOFlags {
        MachOFlags::from_bits_truncate(self.flags)
    }

    /// Returns the architecture as a string.
    pub fn arch_name(&self) -> &'static str {
        match self.cputype {
            CPU_TYPE_ARM64 => {
                if self.is_arm64e() {
                    "arm64e"
                } else {
                    "arm64"
                }
            }
            CPU_TYPE_X86_64 => "x86_64",
            CPU_TYPE_ARM => "arm",
            CPU_TYPE_X86 => "i386",
            _ => "unknown",
        }
    }

    /// Returns a short name for the file type.
    pub fn filetype_name(&self) -> &'static str {
        match self.filetype {
            MH_OBJECT => "object",
            MH_EXECUTE => "execute",
            MH_DYLIB => "dylib",
            MH_BUNDLE => "bundle",
            _ => "other",
        }
    }
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 0,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Command
// =============================================================================

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        let end = self.segname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.segname[..end]).unwrap_or("")
    }

    /// Sets the segment name from a string.
    pub fn set_name(&mut self, name: &str) {
        self.segname = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(16);
        self.segname[..len].copy_from_slice(&bytes[..len]);
    }
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

/// 64-bit section.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (for runtime use)
    pub reserved1: u32,
    /// Reserved (for runtime use)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section entry.
    pub const SIZE: usize = 80;

    /// Returns the section name as a string.
    pub fn name(&self) -> &str {
        let end = self.sectname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.sectname[..end]).unwrap_or("")
    }

    /// Sets the section name from a string.
    pub fn set_name(&mut self, name: &str) {
        self.sectname = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(16);
        self.sectname[..len].copy_from_slice(&bytes[..len]);
    }
}

// =============================================================================
// Dylib Command
// =============================================================================

/// Dylib reference (shared by several load commands).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Dylib {
    /// Library's path name offset
    pub name_offset: u32,
    /// Library's build timestamp
    pub timestamp: u32,
    /// Library's current version number
    pub current_version: u32,
    /// Library's compatibility version number
    pub compatibility_version: u32,
}

/// Dylib load command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// LC_LOAD_DYLIB, LC_ID_DYLIB, etc.
    pub cmd: u32,
    /// Total size (includes path string)
    pub cmdsize: u32,
    /// Library identification
    pub dylib: Dylib,
}

impl DylibCommand {
    /// Minimum size of this command (without path string).
    pub const SIZE: usize = 24;

    /// Encodes a complete dylib command carrying `name`, padded to 8 bytes.
    ///
    /// Timestamp and versions are written as `2` / `0x10000` / `0x10000`, the
    /// values ld64 uses for libraries linked without explicit versions.
    pub fn encode(cmd: u32, name: &str) -> Vec<u8> {
        encode_with_path(
            Self {
                cmd,
                cmdsize: 0,
                dylib: Dylib {
                    name_offset: Self::SIZE as u32,
                    timestamp: 2,
                    current_version: 0x10000,
                    compatibility_version: 0x10000,
                },
            },
            Self::SIZE,
            name,
            |c, size| c.cmdsize = size,
        )
    }
}

// =============================================================================
// Rpath Command
// =============================================================================

/// Runpath load command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RpathCommand {
    /// LC_RPATH
    pub cmd: u32,
    /// Total size (includes path string)
    pub cmdsize: u32,
    /// Offset of the path string
    pub path_offset: u32,
}

impl RpathCommand {
    /// Size of this command (without path string).
    pub const SIZE: usize = 12;

    /// Encodes a complete rpath command carrying `path`, padded to 8 bytes.
    pub fn encode(path: &str) -> Vec<u8> {
        encode_with_path(
            Self {
                cmd: LC_RPATH,
                cmdsize: 0,
                path_offset: Self::SIZE as u32,
            },
            Self::SIZE,
            path,
            |c, size| c.cmdsize = size,
        )
    }
}

/// Lays out `fixed` followed by a NUL-terminated `path`, padded to 8 bytes,
/// and patches the command size through `set_size`.
fn encode_with_path<T, F>(mut fixed: T, fixed_size: usize, path: &str, set_size: F) -> Vec<u8>
where
    T: IntoBytes + Immutable,
    F: FnOnce(&mut T, u32),
{
    let total = align_up((fixed_size + path.len() + 1) as u64, 8) as usize;
    set_size(&mut fixed, total as u32);

    let mut out = vec![0u8; total];
    out[..fixed_size].copy_from_slice(fixed.as_bytes());
    out[fixed_size..fixed_size + path.len()].copy_from_slice(path.as_bytes());
    out
}

// =============================================================================
// FAT Headers
// =============================================================================

/// FAT (universal) binary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatHeader {
    /// FAT_MAGIC or FAT_MAGIC_64
    pub magic: u32,
    /// Number of architecture slices
    pub nfat_arch: u32,
}

impl FatHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 8;

    /// Decodes a big-endian FAT header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let magic = BigEndian::read_u32(data);
        if magic != FAT_MAGIC && magic != FAT_MAGIC_64 {
            return None;
        }
        Some(Self {
            magic,
            nfat_arch: BigEndian::read_u32(&data[4..]),
        })
    }

    /// Returns true if the slice table uses 64-bit offsets.
    #[inline]
    pub fn is_64(&self) -> bool {
        self.magic == FAT_MAGIC_64
    }

    /// Returns the size of one slice table entry.
    #[inline]
    pub fn arch_size(&self) -> usize {
        if self.is_64() {
            FatArch::SIZE_64
        } else {
            FatArch::SIZE
        }
    }
}

/// One slice entry of a FAT binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type of the slice
    pub cputype: u32,
    /// CPU subtype of the slice
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    /// Size of a 32-bit slice entry.
    pub const SIZE: usize = 20;
    /// Size of a 64-bit slice entry.
    pub const SIZE_64: usize = 32;

    /// Decodes a big-endian slice entry.
    pub fn parse(data: &[u8], is_64: bool) -> Option<Self> {
        if is_64 {
            if data.len() < Self::SIZE_64 {
                return None;
            }
            Some(Self {
                cputype: BigEndian::read_u32(data),
                cpusubtype: BigEndian::read_u32(&data[4..]),
                offset: BigEndian::read_u64(&data[8..]),
                size: BigEndian::read_u64(&data[16..]),
                align: BigEndian::read_u32(&data[24..]),
            })
        } else {
            if data.len() < Self::SIZE {
                return None;
            }
            Some(Self {
                cputype: BigEndian::read_u32(data),
                cpusubtype: BigEndian::read_u32(&data[4..]),
                offset: BigEndian::read_u32(&data[8..]) as u64,
                size: BigEndian::read_u32(&data[12..]) as u64,
                align: BigEndian::read_u32(&data[16..]),
            })
        }
    }
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for MachHeader64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MachO {{ arch: {}, type: {}, cmds: {}, flags: {:#x} }}",
            self.arch_name(),
            self.filetype_name(),
            self.ncmds,
            self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dylib_command_padding() {
        let cmd = DylibCommand::encode(LC_LOAD_DYLIB, "@rpath/libFoo.dylib");
        // 24 + 19 + NUL = 44 -> 48
        assert_eq!(cmd.len(), 48);
        let header = DylibCommand::read_from_prefix(&cmd).unwrap().0;
        assert_eq!(header.cmdsize, 48);
        assert_eq!(header.dylib.name_offset, 24);
        assert_eq!(&cmd[24..43], b"@rpath/libFoo.dylib");
        assert!(cmd[43..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rpath_command_padding() {
        let cmd = RpathCommand::encode("@executable_path/Frameworks");
        assert_eq!(cmd.len() % 8, 0);
        let header = RpathCommand::read_from_prefix(&cmd).unwrap().0;
        assert_eq!(header.cmd, LC_RPATH);
        assert_eq!(header.cmdsize as usize, cmd.len());
    }

    #[test]
    fn test_fat_header_parse() {
        let mut data = [0u8; 8 + 20];
        BigEndian::write_u32(&mut data, FAT_MAGIC);
        BigEndian::write_u32(&mut data[4..], 1);
        BigEndian::write_u32(&mut data[8..], CPU_TYPE_ARM64);
        BigEndian::write_u32(&mut data[16..], 0x4000);
        BigEndian::write_u32(&mut data[20..], 0x8000);
        BigEndian::write_u32(&mut data[24..], 14);

        let header = FatHeader::parse(&data).unwrap();
        assert_eq!(header.nfat_arch, 1);
        assert!(!header.is_64());

        let arch = FatArch::parse(&data[8..], false).unwrap();
        assert_eq!(arch.cputype, CPU_TYPE_ARM64);
        assert_eq!(arch.offset, 0x4000);
        assert_eq!(arch.size, 0x8000);
        assert_eq!(arch.align, 14);
    }
}
