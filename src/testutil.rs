//! Synthetic image, archive, and address-space builders for tests.

use std::cell::Cell;

use zerocopy::IntoBytes;

use crate::dyld::{CacheHeader, CacheImageInfo, CacheMapping};
use crate::error::{Error, Result};
use crate::kernel::{MemorySource, ReadOutcome, MAX_TRANSFER};
use crate::macho::{
    DysymtabCommand, MachHeader, Nlist, SegmentCommand, SymtabCommand, FAT_MAGIC, MH_EXECUTE,
    MH_MAGIC, PAGE_SIZE,
};
use crate::util::write_u32_le;

// =============================================================================
// Thin Image Builder
// =============================================================================

/// Builds a synthetic 32-bit Mach-O image in memory.
pub(crate) struct ImageBuilder {
    header: MachHeader,
    commands: Vec<Vec<u8>>,
    segments: Vec<SegmentCommand>,
    chunks: Vec<(usize, Vec<u8>)>,
    reserved: Vec<(usize, usize)>,
    symtab_off: Option<usize>,
    corrupt_strx: Option<u32>,
    fill: bool,
    min_len: usize,
}

impl ImageBuilder {
    pub fn new(cputype: u32, cpusubtype: u32) -> Self {
        Self {
            header: MachHeader {
                magic: MH_MAGIC,
                cputype,
                cpusubtype,
                filetype: MH_EXECUTE,
                ncmds: 0,
                sizeofcmds: 0,
                flags: 0,
            },
            commands: Vec::new(),
            segments: Vec::new(),
            chunks: Vec::new(),
            reserved: Vec::new(),
            symtab_off: None,
            corrupt_strx: None,
            fill: false,
            min_len: 0,
        }
    }

    /// Appends an LC_SEGMENT command.
    pub fn add_segment(&mut self, name: &str, vmaddr: u32, vmsize: u32, fileoff: u32, filesize: u32) {
        let mut sc = SegmentCommand::default();
        sc.set_name(name);
        sc.vmaddr = vmaddr;
        sc.vmsize = vmsize;
        sc.fileoff = fileoff;
        sc.filesize = filesize;
        sc.maxprot = 7;
        sc.initprot = 5;
        self.commands.push(sc.as_bytes().to_vec());
        self.segments.push(sc);
        self.min_len = self.min_len.max((fileoff + filesize) as usize);
    }

    /// Places a data chunk after all current content, 16-byte aligned, and
    /// keeps the payload filler away from it.
    fn append_chunk(&mut self, bytes: Vec<u8>) -> usize {
        let off = (self.min_len.max(PAGE_SIZE) + 0xF) & !0xF;
        self.reserved.push((off, bytes.len()));
        self.min_len = off + bytes.len();
        self.chunks.push((off, bytes));
        off
    }

    /// Adds a sorted external symbol table: `(name, value, n_desc)` triples.
    pub fn add_symbols(&mut self, symbols: &[(&str, u32, u16)]) {
        self.add_symbols_partitioned(&[], symbols);
    }

    /// Adds a symbol table with a local prefix and an external partition
    /// described by an LC_DYSYMTAB command. The external slice must be
    /// sorted by name.
    pub fn add_symbols_partitioned(
        &mut self,
        locals: &[(&str, u32, u16)],
        externals: &[(&str, u32, u16)],
    ) {
        let mut strtab = vec![0u8];
        let mut nlists = Vec::new();
        for (name, value, desc) in locals.iter().chain(externals.iter()) {
            let strx = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            let entry = Nlist {
                n_strx: strx,
                n_type: 0x0F,
                n_sect: 1,
                n_desc: *desc,
                n_value: *value,
            };
            nlists.extend_from_slice(entry.as_bytes());
        }

        let nsyms = (locals.len() + externals.len()) as u32;
        let symoff = self.append_chunk(nlists);
        let stroff = self.append_chunk(strtab.clone());
        let linkedit_size = (self.min_len - symoff) as u32;
        self.add_segment(
            "__LINKEDIT",
            0x0080_0000,
            linkedit_size,
            symoff as u32,
            linkedit_size,
        );

        let sc = SymtabCommand {
            symoff: symoff as u32,
            nsyms,
            stroff: stroff as u32,
            strsize: strtab.len() as u32,
            ..Default::default()
        };
        self.commands.push(sc.as_bytes().to_vec());
        self.symtab_off = Some(symoff);

        if !locals.is_empty() {
            let dc = DysymtabCommand {
                ilocalsym: 0,
                nlocalsym: locals.len() as u32,
                iextdefsym: locals.len() as u32,
                nextdefsym: externals.len() as u32,
                ..Default::default()
            };
            self.commands.push(dc.as_bytes().to_vec());
        }
    }

    /// Overwrites the first symbol's string-table index at build time.
    pub fn corrupt_first_strx(&mut self, strx: u32) {
        self.corrupt_strx = Some(strx);
    }

    /// Fills every segment's file extent with deterministic non-zero bytes
    /// (skipping the header area and any placed chunks).
    pub fn fill_payload(&mut self) {
        self.fill = true;
    }

    fn command_bytes(&self) -> Vec<u8> {
        self.commands.concat()
    }

    /// Emits the header and load commands only.
    pub fn build_header(&self) -> Vec<u8> {
        let cmds = self.command_bytes();
        let mut header = self.header;
        header.ncmds = self.commands.len() as u32;
        header.sizeofcmds = cmds.len() as u32;
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(&cmds);
        out
    }

    /// Emits the whole image file.
    pub fn build(&self) -> Vec<u8> {
        let head = self.build_header();
        let mut file = vec![0u8; self.min_len.max(head.len())];

        if self.fill {
            for sc in &self.segments {
                let start = sc.fileoff as usize;
                let end = start + sc.filesize as usize;
                for pos in start..end {
                    if pos < head.len() {
                        continue;
                    }
                    if self.reserved.iter().any(|&(o, l)| pos >= o && pos < o + l) {
                        continue;
                    }
                    file[pos] = (pos as u8).wrapping_mul(31).wrapping_add(7);
                }
            }
        }

        for (off, bytes) in &self.chunks {
            file[*off..*off + bytes.len()].copy_from_slice(bytes);
        }
        if let (Some(symoff), Some(strx)) = (self.symtab_off, self.corrupt_strx) {
            write_u32_le(&mut file[symoff..symoff + 4], strx);
        }
        file[..head.len()].copy_from_slice(&head);
        file
    }
}

// =============================================================================
// Fat Archive Builder
// =============================================================================

/// Assembles a fat archive from `(cputype, cpusubtype, slice)` entries,
/// page-aligning each slice. Fat records are emitted big-endian.
pub(crate) fn fat_archive(entries: &[(u32, u32, &[u8])]) -> Vec<u8> {
    let mut table = Vec::new();
    table.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    table.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    let mut offset = PAGE_SIZE;
    let mut placements = Vec::new();
    for (cputype, cpusubtype, data) in entries {
        table.extend_from_slice(&cputype.to_be_bytes());
        table.extend_from_slice(&cpusubtype.to_be_bytes());
        table.extend_from_slice(&(offset as u32).to_be_bytes());
        table.extend_from_slice(&(data.len() as u32).to_be_bytes());
        table.extend_from_slice(&12u32.to_be_bytes());
        placements.push((offset, *data));
        offset += (data.len() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    }

    let mut out = vec![0u8; offset];
    out[..table.len()].copy_from_slice(&table);
    for (off, data) in placements {
        out[off..off + data.len()].copy_from_slice(data);
    }
    out
}

// =============================================================================
// Dyld Cache Builder
// =============================================================================

/// Builds a synthetic dyld shared cache file.
pub(crate) struct CacheBuilder {
    suffix: [u8; 7],
    mappings: Vec<CacheMapping>,
    images: Vec<(u64, String)>,
    content: Vec<(usize, Vec<u8>)>,
    min_size: usize,
}

impl CacheBuilder {
    pub fn new(suffix: &[u8; 7]) -> Self {
        Self {
            suffix: *suffix,
            mappings: Vec::new(),
            images: Vec::new(),
            content: Vec::new(),
            min_size: 0,
        }
    }

    pub fn add_mapping(&mut self, address: u64, size: u64, file_offset: u64) {
        self.mappings.push(CacheMapping {
            address,
            size,
            file_offset,
            max_prot: 7,
            init_prot: 5,
        });
        self.min_size = self.min_size.max((file_offset + size) as usize);
    }

    pub fn add_image(&mut self, address: u64, path: &str) {
        self.images.push((address, path.to_string()));
    }

    /// Writes raw bytes at a cache file offset.
    pub fn set_content(&mut self, offset: usize, bytes: &[u8]) {
        self.min_size = self.min_size.max(offset + bytes.len());
        self.content.push((offset, bytes.to_vec()));
    }

    pub fn ensure_size(&mut self, size: usize) {
        self.min_size = self.min_size.max(size);
    }

    pub fn build(&self) -> Vec<u8> {
        let mapping_offset = CacheHeader::SIZE;
        let images_offset = mapping_offset + self.mappings.len() * CacheMapping::SIZE;
        let mut path_offset = images_offset + self.images.len() * CacheImageInfo::SIZE;

        let mut magic = [0u8; 16];
        magic[..7].copy_from_slice(b"dyld_v1");
        magic[7..9].copy_from_slice(b"  ");
        magic[9..].copy_from_slice(&self.suffix);

        let header = CacheHeader {
            magic,
            mapping_offset: mapping_offset as u32,
            mapping_count: self.mappings.len() as u32,
            images_offset: images_offset as u32,
            images_count: self.images.len() as u32,
            dyld_base_address: 0,
        };

        let mut infos = Vec::new();
        let mut paths = Vec::new();
        for (address, path) in &self.images {
            let info = CacheImageInfo {
                address: *address,
                mod_time: 0,
                inode: 0,
                path_file_offset: path_offset as u32,
                pad: 0,
            };
            infos.push(info);
            paths.push((path_offset, path.as_bytes().to_vec()));
            path_offset += path.len() + 1;
        }

        let mut out = vec![0u8; self.min_size.max(path_offset)];
        out[..CacheHeader::SIZE].copy_from_slice(header.as_bytes());
        for (i, mapping) in self.mappings.iter().enumerate() {
            let off = mapping_offset + i * CacheMapping::SIZE;
            out[off..off + CacheMapping::SIZE].copy_from_slice(mapping.as_bytes());
        }
        for (i, info) in infos.iter().enumerate() {
            let off = images_offset + i * CacheImageInfo::SIZE;
            out[off..off + CacheImageInfo::SIZE].copy_from_slice(info.as_bytes());
        }
        for (off, bytes) in &paths {
            out[*off..*off + bytes.len()].copy_from_slice(bytes);
        }
        for (off, bytes) in &self.content {
            out[*off..*off + bytes.len()].copy_from_slice(bytes);
        }
        out
    }
}

// =============================================================================
// Simulated Address Space
// =============================================================================

/// A fake live address space for exercising probe/copy logic without any
/// privileged dependency.
pub(crate) struct FakeMemory {
    regions: Vec<(u64, Vec<u8>)>,
    max_transfer: usize,
    reads: Cell<usize>,
    fail_at: Option<u64>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            max_transfer: MAX_TRANSFER,
            reads: Cell::new(0),
            fail_at: None,
        }
    }

    /// Makes `data` resident at `address`.
    pub fn add_region(&mut self, address: u64, data: Vec<u8>) {
        self.regions.push((address, data));
    }

    /// Overrides the per-call transfer ceiling.
    pub fn set_max_transfer(&mut self, max: usize) {
        self.max_transfer = max;
    }

    /// Makes any read touching `address` fail with an I/O error.
    pub fn fail_at(&mut self, address: u64) {
        self.fail_at = Some(address);
    }

    /// Number of reads issued so far.
    pub fn read_count(&self) -> usize {
        self.reads.get()
    }
}

impl MemorySource for FakeMemory {
    fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.reads.set(self.reads.get() + 1);
        let want = buf.len().min(self.max_transfer);
        if let Some(fail) = self.fail_at {
            if addr <= fail && fail < addr + want as u64 {
                return Err(Error::Io(std::io::Error::other("simulated read fault")));
            }
        }
        for (base, data) in &self.regions {
            if addr >= *base && addr < base + data.len() as u64 {
                let off = (addr - base) as usize;
                let n = want.min(data.len() - off);
                buf[..n].copy_from_slice(&data[off..off + n]);
                return Ok(ReadOutcome::Data(n));
            }
        }
        Ok(ReadOutcome::NotResident)
    }
}
