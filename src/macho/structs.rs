//! Mach-O binary structures.
//!
//! These structures match the on-disk format of 32-bit ARM Mach-O files.
//! All fields are little-endian except the fat archive records, which are
//! big-endian and therefore parsed field-by-field rather than via zerocopy.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::util::{cstr_prefix, read_u32_le};

// =============================================================================
// Header
// =============================================================================

/// 32-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader {
    /// Magic number (MH_MAGIC)
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
}

impl MachHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;

    /// Returns true if this is a valid 32-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC
    }

    /// Returns true if this is an ARM binary.
    #[inline]
    pub fn is_arm(&self) -> bool {
        self.cputype == CPU_TYPE_ARM
    }
}

impl Default for MachHeader {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC,
            cputype: 0,
            cpusubtype: 0,
            filetype: 0,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
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

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u32,
    /// Virtual memory size
    pub vmsize: u32,
    /// File offset
    pub fileoff: u32,
    /// Amount of file to map
    pub filesize: u32,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 56;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        std::str::from_utf8(cstr_prefix(&self.segname)).unwrap_or("")
    }

    /// Sets the segment name from a string.
    pub fn set_name(&mut self, name: &str) {
        self.segname = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(16);
        self.segname[..len].copy_from_slice(&bytes[..len]);
    }
}

impl Default for SegmentCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT,
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

// =============================================================================
// Symbol Table Commands
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Symbol table offset
    pub symoff: u32,
    /// Number of symbol table entries
    pub nsyms: u32,
    /// String table offset
    pub stroff: u32,
    /// String table size in bytes
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for SymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SYMTAB,
            cmdsize: Self::SIZE as u32,
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        }
    }
}

/// Dynamic symbol table command.
///
/// Only the externally-defined partition matters to this loader; the other
/// table-of-contents fields are carried for layout fidelity.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Index of local symbols
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of externally defined symbols
    pub iextdefsym: u32,
    /// Number of externally defined symbols
    pub nextdefsym: u32,
    /// Index of undefined symbols
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// File offset to table of contents
    pub tocoff: u32,
    /// Number of entries in table of contents
    pub ntoc: u32,
    /// File offset to module table
    pub modtaboff: u32,
    /// Number of module table entries
    pub nmodtab: u32,
    /// Offset to referenced symbol table
    pub extrefsymoff: u32,
    /// Number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// File offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// Number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// Offset to external relocation entries
    pub extreloff: u32,
    /// Number of external relocation entries
    pub nextrel: u32,
    /// Offset to local relocation entries
    pub locreloff: u32,
    /// Number of local relocation entries
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;
}

impl Default for DysymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_DYSYMTAB,
            cmdsize: Self::SIZE as u32,
            ilocalsym: 0,
            nlocalsym: 0,
            iextdefsym: 0,
            nextdefsym: 0,
            iundefsym: 0,
            nundefsym: 0,
            tocoff: 0,
            ntoc: 0,
            modtaboff: 0,
            nmodtab: 0,
            extrefsymoff: 0,
            nextrefsyms: 0,
            indirectsymoff: 0,
            nindirectsyms: 0,
            extreloff: 0,
            nextrel: 0,
            locreloff: 0,
            nlocrel: 0,
        }
    }
}

/// 32-bit symbol table entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist {
    /// Index into string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Descriptor flags (Thumb bit lives here)
    pub n_desc: u16,
    /// Value (usually the symbol's address)
    pub n_value: u32,
}

impl Nlist {
    /// Size of an nlist entry.
    pub const SIZE: usize = 12;

    /// Returns true if this symbol is a Thumb-mode definition.
    #[inline]
    pub fn is_thumb(&self) -> bool {
        (self.n_desc & N_ARM_THUMB_DEF) != 0
    }
}

impl Default for Nlist {
    fn default() -> Self {
        Self {
            n_strx: 0,
            n_type: 0,
            n_sect: 0,
            n_desc: 0,
            n_value: 0,
        }
    }
}

// =============================================================================
// Fat Archive Records (big-endian)
// =============================================================================

/// Fat archive header, decoded from its big-endian on-disk form.
#[derive(Debug, Clone, Copy)]
pub struct FatHeader {
    /// FAT_MAGIC
    pub magic: u32,
    /// Number of architecture records that follow
    pub nfat_arch: u32,
}

impl FatHeader {
    /// Size of the fat header in bytes.
    pub const SIZE: usize = 8;

    /// Decodes a fat header from the start of `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() < Self::SIZE`.
    pub fn read_be(data: &[u8]) -> Self {
        Self {
            magic: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            nfat_arch: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        }
    }
}

/// One architecture record of a fat archive, decoded from big-endian.
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    /// CPU type of this slice
    pub cputype: u32,
    /// CPU subtype of this slice (0 matches any target)
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u32,
    /// Size of the slice in bytes
    pub size: u32,
    /// Alignment of the slice as a power of two
    pub align: u32,
}

impl FatArch {
    /// Size of an architecture record in bytes.
    pub const SIZE: usize = 20;

    /// Decodes an architecture record from the start of `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() < Self::SIZE`.
    pub fn read_be(data: &[u8]) -> Self {
        let be = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Self {
            cputype: be(0),
            cpusubtype: be(4),
            offset: be(8),
            size: be(12),
            align: be(16),
        }
    }
}

/// Reads the magic of a possibly-fat file: the native little-endian value,
/// which is compared against [`MH_MAGIC`] directly and against [`FAT_MAGIC`]
/// byte-swapped (fat headers are big-endian).
#[inline]
pub fn raw_magic(data: &[u8]) -> u32 {
    read_u32_le(data)
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for MachHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MachO {{ cpu: {}/{}, type: {:#x}, cmds: {}, flags: {:#x} }}",
            self.cputype, self.cpusubtype, self.filetype, self.ncmds, self.flags
        )
    }
}

impl fmt::Display for SegmentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment {{ name: \"{}\", vm: {:#x}+{:#x}, file: {:#x}+{:#x} }}",
            self.name(),
            self.vmaddr,
            self.vmsize,
            self.fileoff,
            self.filesize
        )
    }
}
