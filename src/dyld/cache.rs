//! Dyld shared cache loading and indexing.
//!
//! A cache load parses the header and mapping table, reserves the window,
//! and places every declared mapping at its window-relative address in one
//! eager, all-or-nothing step. Afterwards an embedded image can be selected
//! by name, which points the handle's Mach-O state at the image inside the
//! already-mapped cache window.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;
use zerocopy::FromBytes;

use super::structs::{
    CacheHeader, CacheImageInfo, CacheMapping, CACHE_IMAGE_PATH_LEN, DYLD_CACHE_MAGIC_PREFIX,
    MAX_CACHE_IMAGES, MAX_CACHE_MAPPINGS,
};
use crate::binary::{parse_load_commands, Binary, Range, Segment, Window};
use crate::error::{Error, Result};
use crate::kernel::{copy_span, MemorySource};
use crate::macho::{MachHeader, SegmentCommand, LC_SEGMENT, PAGE_SIZE};
use crate::util::cstr_prefix;

// =============================================================================
// Cache Index State
// =============================================================================

/// One entry of the cache's image directory.
#[derive(Debug, Clone)]
pub struct CacheImage {
    /// Virtual address of the image's Mach-O header.
    pub address: u64,
    /// Install path of the image (e.g. "/usr/lib/libSystem.B.dylib").
    pub path: String,
}

/// Parsed cache header, mapping table, and image directory.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    /// The cache header.
    pub header: CacheHeader,
    /// The mapping table (count capped at [`MAX_CACHE_MAPPINGS`]).
    pub mappings: Vec<CacheMapping>,
    /// The image directory (count capped at [`MAX_CACHE_IMAGES`]).
    pub images: Vec<CacheImage>,
}

/// How a cache's mapping contents are obtained.
pub enum CacheMode<'a> {
    /// Read every declared mapping out of the cache file itself.
    Fresh,
    /// The cache is resident in a live address space; every declared mapping
    /// is read (and thereby verified resident) through the given source.
    /// A non-resident mapping is fatal to the load.
    Resident(&'a dyn MemorySource),
}

// =============================================================================
// Cache Loading
// =============================================================================

/// Opens a dyld shared cache from a file.
pub fn open_cache<P: AsRef<Path>>(path: P, mode: CacheMode<'_>) -> Result<Binary> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!(path = %path.display(), size = mmap.len(), "opening dyld cache");
    open_cache_inner(&mmap, mode)
}

/// Opens a dyld shared cache from an already-in-memory buffer.
pub fn open_cache_bytes(data: &[u8]) -> Result<Binary> {
    open_cache_inner(data, CacheMode::Fresh)
}

fn open_cache_inner(data: &[u8], mode: CacheMode<'_>) -> Result<Binary> {
    if data.len() < CacheHeader::SIZE {
        return Err(Error::truncated(CacheHeader::SIZE, data.len()));
    }
    let header = CacheHeader::read_from_prefix(data)
        .map_err(|_| Error::truncated(CacheHeader::SIZE, data.len()))?
        .0;

    if &header.magic[..4] != DYLD_CACHE_MAGIC_PREFIX {
        return Err(Error::InvalidCacheMagic([
            header.magic[0],
            header.magic[1],
            header.magic[2],
            header.magic[3],
        ]));
    }
    let cpusubtype = header.arch_cpusubtype().ok_or_else(|| {
        Error::UnknownCacheArch(String::from_utf8_lossy(header.arch_suffix()).into_owned())
    })?;

    if header.mapping_count > MAX_CACHE_MAPPINGS {
        return Err(Error::TooManyMappings(header.mapping_count));
    }
    if header.images_count > MAX_CACHE_IMAGES {
        return Err(Error::TooManyImages(header.images_count));
    }

    let mappings = parse_mappings(data, &header)?;
    let images = parse_images(data, &header)?;

    let mut binary = Binary::with_window()?;
    for (i, mapping) in mappings.iter().enumerate() {
        let woff = Window::checked_offset(mapping.address, mapping.size)?;
        let dst = binary.window.slice_mut(woff, mapping.size as usize)?;
        match mode {
            CacheMode::Fresh => {
                let src_start = mapping.file_offset as usize;
                let src_end = src_start + mapping.size as usize;
                if src_end > data.len() {
                    return Err(Error::truncated(src_end, data.len()));
                }
                dst.copy_from_slice(&data[src_start..src_end]);
            }
            CacheMode::Resident(source) => {
                copy_span(source, mapping.address, dst)?;
            }
        }
        debug!(mapping = i, address = mapping.address, size = mapping.size, "mapped");
    }

    binary.cpusubtype = cpusubtype;
    binary.cache = Some(CacheIndex {
        header,
        mappings,
        images,
    });
    Ok(binary)
}

fn parse_mappings(data: &[u8], header: &CacheHeader) -> Result<Vec<CacheMapping>> {
    let offset = header.mapping_offset as usize;
    let end = offset + header.mapping_count as usize * CacheMapping::SIZE;
    if end > data.len() {
        return Err(Error::truncated(end, data.len()));
    }
    let mut mappings = Vec::with_capacity(header.mapping_count as usize);
    for i in 0..header.mapping_count as usize {
        let entry_offset = offset + i * CacheMapping::SIZE;
        let mapping = CacheMapping::read_from_prefix(&data[entry_offset..])
            .map_err(|_| Error::truncated(entry_offset + CacheMapping::SIZE, data.len()))?
            .0;
        mappings.push(mapping);
    }
    Ok(mappings)
}

fn parse_images(data: &[u8], header: &CacheHeader) -> Result<Vec<CacheImage>> {
    let offset = header.images_offset as usize;
    let end = offset + header.images_count as usize * CacheImageInfo::SIZE;
    if end > data.len() {
        return Err(Error::truncated(end, data.len()));
    }
    let mut images = Vec::with_capacity(header.images_count as usize);
    for i in 0..header.images_count as usize {
        let entry_offset = offset + i * CacheImageInfo::SIZE;
        let info = CacheImageInfo::read_from_prefix(&data[entry_offset..])
            .map_err(|_| Error::truncated(entry_offset + CacheImageInfo::SIZE, data.len()))?
            .0;

        // Each entry's path is a fixed-width field read by file offset.
        let path_start = info.path_file_offset as usize;
        if path_start >= data.len() {
            return Err(Error::truncated(path_start + 1, data.len()));
        }
        let path_end = (path_start + CACHE_IMAGE_PATH_LEN).min(data.len());
        let path = cstr_prefix(&data[path_start..path_end]);

        images.push(CacheImage {
            address: info.address,
            path: String::from_utf8_lossy(path).into_owned(),
        });
    }
    Ok(images)
}

// =============================================================================
// Embedded Image Selection
// =============================================================================

impl Binary {
    /// Selects an embedded Mach-O by exact install path, pointing this
    /// handle's header, segment, and symbol state at the image inside the
    /// already-mapped cache window.
    ///
    /// The image directory is scanned linearly; the first exact match wins;
    /// a full scan without a match is fatal.
    pub fn select_cache_image(&mut self, name: &str) -> Result<()> {
        let address = {
            let Some(cache) = &self.cache else {
                return Err(Error::ImageNotFound {
                    name: name.to_string(),
                });
            };
            cache
                .images
                .iter()
                .find(|img| img.path == name)
                .map(|img| img.address)
                .ok_or_else(|| Error::ImageNotFound {
                    name: name.to_string(),
                })?
        };

        // The header page must lie inside a declared mapping.
        let cache = self.cache.as_ref().expect("cache state checked above");
        let mapping = cache
            .mappings
            .iter()
            .find(|m| address >= m.address && address < m.address + m.size)
            .ok_or(Error::AddrNotMapped(Range::new(address, PAGE_SIZE as u64)))?;
        let avail = ((mapping.address + mapping.size - address) as usize).min(PAGE_SIZE);

        let woff = Window::checked_offset(address, avail as u64)?;
        let mut page = vec![0u8; PAGE_SIZE];
        page[..avail].copy_from_slice(self.window.slice(woff, avail)?);

        let header = MachHeader::read_from_prefix(&page[..])
            .map_err(|_| Error::truncated(MachHeader::SIZE, avail))?
            .0;
        if !header.is_valid() {
            return Err(Error::InvalidMagic(header.magic));
        }
        if header.sizeofcmds as usize > PAGE_SIZE - MachHeader::SIZE {
            return Err(Error::CommandsTooBig {
                sizeofcmds: header.sizeofcmds,
            });
        }

        let mut segments = Vec::new();
        for (cmd, body) in parse_load_commands(&page)? {
            if cmd != LC_SEGMENT {
                continue;
            }
            let sc = SegmentCommand::read_from_prefix(body)
                .map_err(|_| Error::BadLoadCommand { offset: 0 })?
                .0;
            segments.push(Segment {
                segname: sc.segname,
                vmaddr: sc.vmaddr as u64,
                vmsize: sc.vmsize as u64,
                fileoff: sc.fileoff as u64,
                filesize: sc.filesize as u64,
            });
        }

        debug!(name, address, segments = segments.len(), "selected cache image");
        self.segments = segments;
        self.last_seg.set(None);
        self.symbols = None;
        self.header_page = Some(page);
        self.load_symbols()
    }

    /// Returns the nth cache mapping as an address range, or `None` when the
    /// index is out of bounds or the binary is not a cache. Lets callers
    /// enumerate every mapped region without Mach-O segment semantics.
    pub fn cache_mapping(&self, n: usize) -> Option<Range> {
        self.cache
            .as_ref()?
            .mappings
            .get(n)
            .map(|m| Range::new(m.address, m.size))
    }

    /// Returns the parsed cache index, when loaded from a cache.
    pub fn cache_index(&self) -> Option<&CacheIndex> {
        self.cache.as_ref()
    }
}
