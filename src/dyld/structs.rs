//! Dyld shared cache binary structures.
//!
//! These structures match the on-disk format of ARM-era dyld shared caches
//! (the pre-subcache layout: one header, one mapping table, one image
//! directory). They are designed for zero-copy parsing via `zerocopy`.

use std::fmt;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::util::cstr_prefix;

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

/// Width of the architecture suffix at the end of the 16-byte magic field.
pub const DYLD_CACHE_ARCH_SUFFIX_LEN: usize = 7;

/// Recognized architecture suffixes and the CPU subtype each one implies.
pub const DYLD_CACHE_ARCH_SUFFIXES: &[(&[u8; DYLD_CACHE_ARCH_SUFFIX_LEN], u32)] =
    &[(b" armv7\0", 9), (b" armv6\0", 6)];

/// Ceiling on the mapping-table entry count of a sane cache.
pub const MAX_CACHE_MAPPINGS: u32 = 1000;

/// Ceiling on the image-directory entry count of a sane cache.
pub const MAX_CACHE_IMAGES: u32 = 1000;

/// Width of the fixed path field read for each image-directory entry.
pub const CACHE_IMAGE_PATH_LEN: usize = 128;

// =============================================================================
// Header
// =============================================================================

/// The dyld shared cache header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CacheHeader {
    /// Magic identifier, e.g. "dyld_v1   armv7"
    pub magic: [u8; 16],
    /// File offset of the first mapping record
    pub mapping_offset: u32,
    /// Number of mapping records
    pub mapping_count: u32,
    /// File offset of the first image-directory record
    pub images_offset: u32,
    /// Number of image-directory records
    pub images_count: u32,
    /// Base address of dyld when the cache was built
    pub dyld_base_address: u64,
}

impl CacheHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 40;

    /// Returns the magic's architecture suffix bytes.
    #[inline]
    pub fn arch_suffix(&self) -> &[u8] {
        &self.magic[16 - DYLD_CACHE_ARCH_SUFFIX_LEN..]
    }

    /// Maps the magic suffix to the CPU subtype it denotes, if recognized.
    pub fn arch_cpusubtype(&self) -> Option<u32> {
        DYLD_CACHE_ARCH_SUFFIXES
            .iter()
            .find(|(suffix, _)| self.arch_suffix() == *suffix as &[u8])
            .map(|&(_, subtype)| subtype)
    }
}

impl fmt::Display for CacheHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache {{ magic: \"{}\", mappings: {}, images: {} }}",
            String::from_utf8_lossy(cstr_prefix(&self.magic)),
            self.mapping_count,
            self.images_count
        )
    }
}

// =============================================================================
// Mapping Records
// =============================================================================

bitflags! {
    /// VM protection bits of a cache mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Readable
        const READ = 1;
        /// Writable
        const WRITE = 2;
        /// Executable
        const EXECUTE = 4;
    }
}

/// One mapping record: a contiguous (address, size, file offset) region.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CacheMapping {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
}

impl CacheMapping {
    /// Size of a mapping record.
    pub const SIZE: usize = 32;

    /// Initial protection as flags.
    #[inline]
    pub fn prot(&self) -> VmProt {
        VmProt::from_bits_truncate(self.init_prot)
    }
}

impl fmt::Display for CacheMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prot = self.prot();
        write!(
            f,
            "Mapping {{ vm: {:#x}+{:#x}, file: {:#x}, {}{}{} }}",
            self.address,
            self.size,
            self.file_offset,
            if prot.contains(VmProt::READ) { "r" } else { "-" },
            if prot.contains(VmProt::WRITE) { "w" } else { "-" },
            if prot.contains(VmProt::EXECUTE) { "x" } else { "-" },
        )
    }
}

// =============================================================================
// Image Directory Records
// =============================================================================

/// One image-directory record.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CacheImageInfo {
    /// Virtual address of the image's Mach-O header
    pub address: u64,
    /// Modification time of the source dylib
    pub mod_time: u64,
    /// Inode of the source dylib
    pub inode: u64,
    /// File offset of the image's path string
    pub path_file_offset: u32,
    /// Padding
    pub pad: u32,
}

impl CacheImageInfo {
    /// Size of an image record.
    pub const SIZE: usize = 32;
}
