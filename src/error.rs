//! Error types for the binary loader.
//!
//! Three families of failure exist: I/O errors (open/read/map/write, carrying
//! the underlying system error), format-validation errors (carrying the
//! offending value), and address-space errors (carrying the faulting range).
//! All of them abort the current load/scan/store; the only advisory condition
//! (lazy-bind symbol metadata) is logged, not raised.

use std::path::PathBuf;

use thiserror::Error;

use crate::binary::Range;

/// The main error type for load, translation, and store operations.
#[derive(Error, Debug)]
#[allow(missing_docs)] // Variant messages live in the #[error] attributes
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reserve the address window: {0}")]
    WindowReserve(#[source] std::io::Error),

    // ==================== Format Validation Errors ====================
    #[error("bad magic {0:#010x} (not a thin or fat Mach-O)")]
    InvalidMagic(u32),

    #[error("invalid dyld cache magic: expected 'dyld', got {0:02x?}")]
    InvalidCacheMagic([u8; 4]),

    #[error("unknown processor in cache magic: {0:?}")]
    UnknownCacheArch(String),

    #[error("wrong architecture: image is cputype {cputype} cpusubtype {cpusubtype}")]
    CpuMismatch { cputype: u32, cpusubtype: u32 },

    #[error("fat archive selection needs a concrete target subtype")]
    FatWildcardTarget,

    #[error("no matching architecture in fat archive ({count} slices)")]
    FatNoMatch { count: u32 },

    #[error("fat architecture table does not fit in the first page ({size} bytes)")]
    FatHeaderTooBig { size: usize },

    #[error("sizeofcmds {sizeofcmds} exceeds the header page")]
    CommandsTooBig { sizeofcmds: u32 },

    #[error("malformed load command at offset {offset:#x}")]
    BadLoadCommand { offset: usize },

    #[error("ridiculous number of symbols ({0})")]
    TooManySymbols(u32),

    #[error("bad external symbol partition ({iextdefsym}+{nextdefsym} of {nsyms} symbols)")]
    BadExternalSymbols {
        iextdefsym: u32,
        nextdefsym: u32,
        nsyms: u32,
    },

    #[error("insane string table index {strx} (table size {strsize})")]
    BadStringIndex { strx: u32, strsize: u32 },

    #[error("insane mapping count: {0}")]
    TooManyMappings(u32),

    #[error("insane image count: {0}")]
    TooManyImages(u32),

    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    // ==================== Address Space Errors ====================
    #[error("range {0} overflows the address window")]
    WindowOverflow(Range),

    #[error("address range {0} not contained in any segment")]
    AddrNotMapped(Range),

    #[error("offset range {0} not contained in any segment")]
    OffsetNotMapped(Range),

    #[error("address {addr:#x} not resident in the source address space")]
    NotResident { addr: u64 },

    #[error("source returned no data at {addr:#x}")]
    ReadStalled { addr: u64 },

    #[error("no Mach-O header found at any candidate address")]
    KernelNotFound,

    // ==================== Lookup Errors ====================
    #[error("no such segment: {name}")]
    SegmentNotFound { name: String },

    #[error("image not found in cache: {name}")]
    ImageNotFound { name: String },

    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },

    #[error("wanted symbol {name} but there is no symbol table")]
    NoSymbolTable { name: String },
}

/// A specialized Result type for loader operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a truncated-input error.
    #[inline]
    pub fn truncated(needed: usize, available: usize) -> Self {
        Error::Truncated { needed, available }
    }

    /// Creates a window overflow error for the given range.
    #[inline]
    pub fn window_overflow(start: u64, size: u64) -> Self {
        Error::WindowOverflow(Range { start, size })
    }
}
