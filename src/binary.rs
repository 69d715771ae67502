//! The central binary handle and its address-space translation layer.
//!
//! A [`Binary`] owns one fixed-size virtual-address window into which a load
//! operation (file, fat slice, dyld cache, live kernel, or pre-mapped bytes)
//! places segment contents. Every later access goes through a translator
//! that proves the requested range is fully contained in a segment before a
//! host slice is handed out; translation is all-or-nothing and a failed
//! containment check is fatal to the caller's operation, never clamped.

use std::cell::Cell;
use std::fmt;

use memmap2::MmapMut;
use tracing::warn;
use zerocopy::FromBytes;

use crate::dyld::CacheIndex;
use crate::error::{Error, Result};
use crate::macho::{
    DysymtabCommand, LoadCommand, MachHeader, Nlist, SymtabCommand, LC_DYLD_INFO_ONLY, LC_DYSYMTAB,
    LC_SYMTAB,
};
use crate::util;

// =============================================================================
// Window
// =============================================================================

/// Size of the reserved virtual-address window (2^28 bytes).
///
/// Every loaded image gets exactly one window; segment contents live at
/// `coordinate & (WINDOW_SIZE - 1)` inside it.
pub const WINDOW_SIZE: usize = 0x1000_0000;

/// Mask extracting a window offset from a virtual address or file offset.
const WINDOW_MASK: u64 = (WINDOW_SIZE as u64) - 1;

/// The reserved address window backing one loaded image.
///
/// Reserved as a private anonymous mapping so untouched pages cost nothing;
/// all access is through offset+width-validated slices, never raw pointers.
#[derive(Debug)]
pub(crate) struct Window {
    map: MmapMut,
}

impl Window {
    /// Reserves a fresh window.
    pub(crate) fn reserve() -> Result<Self> {
        let map = MmapMut::map_anon(WINDOW_SIZE).map_err(Error::WindowReserve)?;
        Ok(Self { map })
    }

    /// Validates that `(start, size)` fits inside the window and returns the
    /// window offset of `start`. This is the segment-independent check used
    /// for raw regions that carry no Mach-O segment metadata.
    pub(crate) fn checked_offset(start: u64, size: u64) -> Result<usize> {
        let woff = start & WINDOW_MASK;
        if size > WINDOW_SIZE as u64 || woff + size > WINDOW_SIZE as u64 {
            return Err(Error::window_overflow(start, size));
        }
        Ok(woff as usize)
    }

    /// Returns the window bytes at `[woff, woff + size)`.
    pub(crate) fn slice(&self, woff: usize, size: usize) -> Result<&[u8]> {
        if woff + size > WINDOW_SIZE {
            return Err(Error::window_overflow(woff as u64, size as u64));
        }
        Ok(&self.map[woff..woff + size])
    }

    /// Returns the window bytes at `[woff, woff + size)`, mutably.
    pub(crate) fn slice_mut(&mut self, woff: usize, size: usize) -> Result<&mut [u8]> {
        if woff + size > WINDOW_SIZE {
            return Err(Error::window_overflow(woff as u64, size as u64));
        }
        Ok(&mut self.map[woff..woff + size])
    }
}

// =============================================================================
// Ranges and Segments
// =============================================================================

/// A logical range: a start coordinate and a size, in either the
/// virtual-address or file-offset space of one binary.
///
/// A `Range` is never dereferenceable by itself; it has to pass through one
/// of the translators on [`Binary`] to become host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// Start coordinate (virtual address or file offset).
    pub start: u64,
    /// Size in bytes.
    pub size: u64,
}

impl Range {
    /// Creates a range.
    #[inline]
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Returns true if the range is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#x}, {:#x})", self.start, self.size)
    }
}

/// A named region of a loaded image with both a virtual-address extent and a
/// file-offset extent, enumerated from the load-command stream.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment name (16 bytes, null-padded).
    pub segname: [u8; 16],
    /// Virtual memory address.
    pub vmaddr: u64,
    /// Virtual memory size.
    pub vmsize: u64,
    /// File offset of the stored bytes.
    pub fileoff: u64,
    /// Number of stored bytes (the zero-filled tail beyond this is not
    /// addressable through the translators).
    pub filesize: u64,
}

impl Segment {
    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        std::str::from_utf8(util::cstr_prefix(&self.segname)).unwrap_or("")
    }
}

impl fmt::Display for Segment {
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

/// Coordinate space of a translation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Addr,
    Off,
}

impl Space {
    /// The segment's base coordinate in this space.
    #[inline]
    fn base(self, seg: &Segment) -> u64 {
        match self {
            Space::Addr => seg.vmaddr,
            Space::Off => seg.fileoff,
        }
    }

    #[inline]
    fn not_mapped(self, range: Range) -> Error {
        match self {
            Space::Addr => Error::AddrNotMapped(range),
            Space::Off => Error::OffsetNotMapped(range),
        }
    }
}

/// Returns true if `seg` fully contains `(start, size)` in `space`.
///
/// The stored size bounds containment in both spaces, so the zero-filled
/// tail of a segment never translates.
#[inline]
fn segment_covers(seg: &Segment, space: Space, start: u64, size: u64) -> bool {
    let base = space.base(seg);
    if base > start {
        return false;
    }
    let delta = start - base;
    delta <= seg.filesize && seg.filesize - delta >= size
}

// =============================================================================
// Symbol Table State
// =============================================================================

/// Symbol-table location recorded by the shared post-load pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SymbolTable {
    /// File offset of the nlist array.
    pub symoff: u64,
    /// Number of nlist entries.
    pub nsyms: u32,
    /// File offset of the string table.
    pub stroff: u64,
    /// Size of the string table in bytes.
    pub strsize: u32,
    /// First entry of the externally-defined sub-view.
    pub ext_first: u32,
    /// Number of entries in the externally-defined sub-view.
    pub ext_count: u32,
}

/// Sanity ceiling on the symbol count of any well-formed image.
const MAX_NSYMS: u32 = 0x0100_0000;

// =============================================================================
// Binary
// =============================================================================

/// A loaded, addressable binary image.
///
/// Exactly one load operation populates a `Binary`; afterwards its segment,
/// symbol, and (for caches) mapping state drive every translation, lookup,
/// and store. The handle exclusively owns its window and buffers.
#[derive(Debug)]
pub struct Binary {
    pub(crate) window: Window,
    /// CPU subtype that was actually loaded.
    pub(crate) cpusubtype: u32,
    /// Copy of the page holding the Mach-O header and load commands.
    pub(crate) header_page: Option<Vec<u8>>,
    /// Segments enumerated from the load-command stream.
    pub(crate) segments: Vec<Segment>,
    /// Single-slot memo of the last segment that satisfied a translation.
    /// An optimization hint only; a miss falls back to the full scan.
    pub(crate) last_seg: Cell<Option<usize>>,
    /// Symbol-table state from the shared post-load pass.
    pub(crate) symbols: Option<SymbolTable>,
    /// Dyld cache header and mapping table, when loaded from a cache.
    pub(crate) cache: Option<CacheIndex>,
}

impl Binary {
    /// Creates an empty handle with a freshly reserved window.
    pub(crate) fn with_window() -> Result<Self> {
        Ok(Self {
            window: Window::reserve()?,
            cpusubtype: 0,
            header_page: None,
            segments: Vec::new(),
            last_seg: Cell::new(None),
            symbols: None,
            cache: None,
        })
    }

    // =========================================================================
    // Range translation
    // =========================================================================

    /// Finds the segment fully containing `(start, size)` in `space`,
    /// probing the memo slot before scanning.
    fn find_segment(&self, space: Space, range: Range) -> Result<&Segment> {
        if let Some(idx) = self.last_seg.get() {
            if let Some(seg) = self.segments.get(idx) {
                if segment_covers(seg, space, range.start, range.size) {
                    return Ok(seg);
                }
            }
        }
        for (idx, seg) in self.segments.iter().enumerate() {
            if segment_covers(seg, space, range.start, range.size) {
                self.last_seg.set(Some(idx));
                return Ok(seg);
            }
        }
        Err(space.not_mapped(range))
    }

    /// Window offset of `start` within a segment that covers it. The final
    /// window-boundary check happens in the slice accessor.
    #[inline]
    fn window_offset(seg: &Segment, space: Space, start: u64) -> usize {
        let delta = start - space.base(seg);
        ((seg.vmaddr & WINDOW_MASK) + delta) as usize
    }

    fn resolve(&self, space: Space, range: Range) -> Result<&[u8]> {
        let seg = self.find_segment(space, range)?;
        let woff = Self::window_offset(seg, space, range.start);
        self.window.slice(woff, range.size as usize)
    }

    fn resolve_mut(&mut self, space: Space, range: Range) -> Result<&mut [u8]> {
        let seg = self.find_segment(space, range)?;
        let woff = Self::window_offset(seg, space, range.start);
        self.window.slice_mut(woff, range.size as usize)
    }

    /// Translates a virtual-address range to its bytes.
    ///
    /// Fatal unless some segment's stored bytes fully contain the range.
    pub fn resolve_addr(&self, range: Range) -> Result<&[u8]> {
        self.resolve(Space::Addr, range)
    }

    /// Translates a virtual-address range to its bytes, mutably.
    pub fn resolve_addr_mut(&mut self, range: Range) -> Result<&mut [u8]> {
        self.resolve_mut(Space::Addr, range)
    }

    /// Translates a file-offset range to its bytes.
    pub fn resolve_off(&self, range: Range) -> Result<&[u8]> {
        self.resolve(Space::Off, range)
    }

    /// Translates a file-offset range to its bytes, mutably.
    pub fn resolve_off_mut(&mut self, range: Range) -> Result<&mut [u8]> {
        self.resolve_mut(Space::Off, range)
    }

    /// Checks that a raw range fits inside the window, without consulting
    /// segments. Used for regions that carry no Mach-O segment metadata
    /// (dyld cache mappings).
    pub fn check_window(&self, range: Range) -> Result<()> {
        Window::checked_offset(range.start, range.size).map(|_| ())
    }

    /// Converts a virtual-address range to the equivalent file-offset range.
    pub fn addr_to_off(&self, range: Range) -> Result<Range> {
        let seg = self.find_segment(Space::Addr, range)?;
        Ok(Range::new(seg.fileoff + (range.start - seg.vmaddr), range.size))
    }

    /// Converts a file-offset range to the equivalent virtual-address range.
    pub fn off_to_addr(&self, range: Range) -> Result<Range> {
        let seg = self.find_segment(Space::Off, range)?;
        Ok(Range::new(seg.vmaddr + (range.start - seg.fileoff), range.size))
    }

    // =========================================================================
    // Segments
    // =========================================================================

    /// Returns the enumerated segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the address range of the named segment's stored bytes and
    /// primes the translation memo with it.
    pub fn segment_range(&self, name: &str) -> Result<Range> {
        for (idx, seg) in self.segments.iter().enumerate() {
            if seg.name() == name {
                self.last_seg.set(Some(idx));
                return Ok(Range::new(seg.vmaddr, seg.filesize));
            }
        }
        Err(Error::SegmentNotFound {
            name: name.to_string(),
        })
    }

    // =========================================================================
    // Header access
    // =========================================================================

    /// Returns the parsed Mach-O header, if an image has been selected.
    pub fn mach_header(&self) -> Option<MachHeader> {
        let page = self.header_page.as_deref()?;
        MachHeader::read_from_prefix(page).ok().map(|(h, _)| h)
    }

    /// CPU subtype of the image that was actually loaded.
    pub fn cpusubtype(&self) -> u32 {
        self.cpusubtype
    }

    /// Number of entries in the image's symbol table (0 when absent).
    pub fn symbol_count(&self) -> u32 {
        self.symbols.map(|s| s.nsyms).unwrap_or(0)
    }

    /// Number of entries in the external symbol sub-view (0 when absent).
    pub fn external_symbol_count(&self) -> u32 {
        self.symbols.map(|s| s.ext_count).unwrap_or(0)
    }

    // =========================================================================
    // Width-parameterized accessors
    // =========================================================================

    /// Reads a u8 at a virtual address.
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.resolve_addr(Range::new(addr, 1))?[0])
    }

    /// Reads a little-endian u16 at a virtual address.
    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        Ok(util::read_u16_le(self.resolve_addr(Range::new(addr, 2))?))
    }

    /// Reads a little-endian u32 at a virtual address.
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(util::read_u32_le(self.resolve_addr(Range::new(addr, 4))?))
    }

    /// Reads a little-endian u64 at a virtual address.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        Ok(util::read_u64_le(self.resolve_addr(Range::new(addr, 8))?))
    }

    /// Writes a u8 at a virtual address.
    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<()> {
        self.resolve_addr_mut(Range::new(addr, 1))?[0] = value;
        Ok(())
    }

    /// Writes a little-endian u16 at a virtual address.
    pub fn write_u16(&mut self, addr: u64, value: u16) -> Result<()> {
        util::write_u16_le(self.resolve_addr_mut(Range::new(addr, 2))?, value);
        Ok(())
    }

    /// Writes a little-endian u32 at a virtual address.
    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        util::write_u32_le(self.resolve_addr_mut(Range::new(addr, 4))?, value);
        Ok(())
    }

    /// Writes a little-endian u64 at a virtual address.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        util::write_u64_le(self.resolve_addr_mut(Range::new(addr, 8))?, value);
        Ok(())
    }

    // =========================================================================
    // Shared post-load symbol pass
    // =========================================================================

    /// Scans the load commands once and records symbol-table state: the
    /// nlist/string-table locations from `LC_SYMTAB` and the external
    /// partition from `LC_DYSYMTAB` (defaulting to the whole table when
    /// absent). Emits an advisory when compressed dyld info is present,
    /// since such images may have symbols invisible to the plain table.
    pub(crate) fn load_symbols(&mut self) -> Result<()> {
        let mut symtab: Option<SymtabCommand> = None;
        let mut dysymtab: Option<DysymtabCommand> = None;
        let mut fancy = false;

        {
            let page = self
                .header_page
                .as_deref()
                .ok_or_else(|| Error::truncated(MachHeader::SIZE, 0))?;
            for (cmd, body) in parse_load_commands(page)? {
                match cmd {
                    LC_SYMTAB => {
                        let sc = SymtabCommand::read_from_prefix(body)
                            .map_err(|_| Error::BadLoadCommand { offset: 0 })?
                            .0;
                        symtab = Some(sc);
                    }
                    LC_DYSYMTAB => {
                        let dc = DysymtabCommand::read_from_prefix(body)
                            .map_err(|_| Error::BadLoadCommand { offset: 0 })?
                            .0;
                        dysymtab = Some(dc);
                    }
                    LC_DYLD_INFO_ONLY => fancy = true,
                    _ => {}
                }
            }
        }

        if fancy {
            warn!("file is fancy, symbols might be missing");
        }

        let Some(sc) = symtab else {
            self.symbols = None;
            return Ok(());
        };

        if sc.nsyms >= MAX_NSYMS {
            return Err(Error::TooManySymbols(sc.nsyms));
        }

        // Both tables must translate in full or the load is abandoned.
        self.resolve_off(Range::new(
            sc.symoff as u64,
            sc.nsyms as u64 * Nlist::SIZE as u64,
        ))?;
        self.resolve_off(Range::new(sc.stroff as u64, sc.strsize as u64))?;

        let (ext_first, ext_count) = match dysymtab {
            Some(dc) => {
                if dc.iextdefsym >= sc.nsyms || dc.nextdefsym > sc.nsyms - dc.iextdefsym {
                    return Err(Error::BadExternalSymbols {
                        iextdefsym: dc.iextdefsym,
                        nextdefsym: dc.nextdefsym,
                        nsyms: sc.nsyms,
                    });
                }
                (dc.iextdefsym, dc.nextdefsym)
            }
            None => (0, sc.nsyms),
        };

        self.symbols = Some(SymbolTable {
            symoff: sc.symoff as u64,
            nsyms: sc.nsyms,
            stroff: sc.stroff as u64,
            strsize: sc.strsize,
            ext_first,
            ext_count,
        });
        Ok(())
    }
}

// =============================================================================
// Load Command Parsing
// =============================================================================

/// Parses the load-command stream out of a header page, yielding
/// `(cmd, command bytes)` pairs. The page must start with a Mach-O header
/// whose `sizeofcmds` has already been bounded to the page.
pub(crate) fn parse_load_commands(page: &[u8]) -> Result<Vec<(u32, &[u8])>> {
    let header = MachHeader::read_from_prefix(page)
        .map_err(|_| Error::truncated(MachHeader::SIZE, page.len()))?
        .0;

    let end = MachHeader::SIZE + header.sizeofcmds as usize;
    if end > page.len() {
        return Err(Error::CommandsTooBig {
            sizeofcmds: header.sizeofcmds,
        });
    }

    let mut commands = Vec::with_capacity(header.ncmds as usize);
    let mut offset = MachHeader::SIZE;
    for _ in 0..header.ncmds {
        if offset + LoadCommand::SIZE > end {
            return Err(Error::BadLoadCommand { offset });
        }
        let lc = LoadCommand::read_from_prefix(&page[offset..])
            .map_err(|_| Error::BadLoadCommand { offset })?
            .0;
        let cmdsize = lc.cmdsize as usize;
        if cmdsize < LoadCommand::SIZE || offset + cmdsize > end {
            return Err(Error::BadLoadCommand { offset });
        }
        commands.push((lc.cmd, &page[offset..offset + cmdsize]));
        offset += cmdsize;
    }
    Ok(commands)
}
