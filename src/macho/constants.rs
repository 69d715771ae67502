//! Mach-O constants and flags for 32-bit ARM images.

// =============================================================================
// Magic Numbers
// =============================================================================

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// Fat archive magic. Fat headers are stored big-endian on disk.
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Kernel extension bundle
pub const MH_KEXT_BUNDLE: u32 = 0xB;

// =============================================================================
// Header Flags
// =============================================================================

/// The image's undefined references are prebound.
pub const MH_PREBOUND: u32 = 0x10;

// =============================================================================
// CPU Types / Subtypes
// =============================================================================

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;

/// Matches any subtype (as a target or in an architecture record).
pub const CPU_SUBTYPE_WILDCARD: u32 = 0;
/// ARMv6
pub const CPU_SUBTYPE_ARM_V6: u32 = 6;
/// ARMv7
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;

// =============================================================================
// Load Command Types
// =============================================================================

/// 32-bit segment command
pub const LC_SEGMENT: u32 = 0x1;
/// Symbol table command
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic symbol table command
pub const LC_DYSYMTAB: u32 = 0xB;
/// Compressed dyld info, and dyld refuses to fall back to the plain tables
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

// =============================================================================
// Symbol Descriptor Bits
// =============================================================================

/// The symbol is a definition of a Thumb function.
pub const N_ARM_THUMB_DEF: u16 = 0x0008;

// =============================================================================
// Layout
// =============================================================================

/// Header page size. The Mach-O header and its whole load-command stream
/// must fit inside the first page of the image.
pub const PAGE_SIZE: usize = 0x1000;
