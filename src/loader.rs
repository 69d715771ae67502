//! Image loading from files, fat archives, and pre-mapped bytes.
//!
//! A load validates the header against the configured [`CpuTarget`],
//! reserves the address window, and copies each segment's stored bytes to
//! its window-relative position. Any segment that would overflow the window,
//! any truncated source, and any CPU mismatch aborts the whole load; there
//! is no partially-loaded state.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;
use zerocopy::FromBytes;

use crate::arch::CpuTarget;
use crate::binary::{parse_load_commands, Binary, Segment, Window};
use crate::error::{Error, Result};
use crate::macho::{
    raw_magic, FatArch, FatHeader, MachHeader, SegmentCommand, FAT_MAGIC, LC_SEGMENT, MH_MAGIC,
    PAGE_SIZE,
};

/// Loads a thin or fat Mach-O from a file.
///
/// A fat archive is resolved to one slice first; the chosen slice's file
/// offset becomes the base of every file read.
pub fn load_file<P: AsRef<Path>>(path: P, target: CpuTarget) -> Result<Binary> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!(path = %path.display(), size = mmap.len(), "loading image");
    load_bytes(&mmap, target)
}

/// Loads a thin or fat Mach-O from an already-in-memory buffer.
pub fn load_bytes(data: &[u8], target: CpuTarget) -> Result<Binary> {
    if data.len() < 4 {
        return Err(Error::truncated(4, data.len()));
    }
    let magic = raw_magic(data);
    if magic == MH_MAGIC {
        load_thin(data, 0, target)
    } else if magic.swap_bytes() == FAT_MAGIC {
        let base = select_fat_slice(data, target)?;
        load_thin(data, base, target)
    } else {
        Err(Error::InvalidMagic(magic))
    }
}

/// Picks the file offset of the fat slice matching `target`.
///
/// Selection requires a concrete target subtype; the architecture table must
/// fit within the first page; the first matching entry in file order wins.
fn select_fat_slice(data: &[u8], target: CpuTarget) -> Result<usize> {
    if target.is_wildcard() {
        return Err(Error::FatWildcardTarget);
    }
    if data.len() < FatHeader::SIZE {
        return Err(Error::truncated(FatHeader::SIZE, data.len()));
    }
    let header = FatHeader::read_be(data);
    let table_size = FatHeader::SIZE + header.nfat_arch as usize * FatArch::SIZE;
    if table_size >= PAGE_SIZE {
        return Err(Error::FatHeaderTooBig { size: table_size });
    }
    if table_size > data.len() {
        return Err(Error::truncated(table_size, data.len()));
    }
    for i in 0..header.nfat_arch as usize {
        let arch = FatArch::read_be(&data[FatHeader::SIZE + i * FatArch::SIZE..]);
        if target.accepts_fat_arch(arch.cputype, arch.cpusubtype) {
            debug!(
                slice = i,
                offset = arch.offset,
                cpusubtype = arch.cpusubtype,
                "selected fat slice"
            );
            return Ok(arch.offset as usize);
        }
    }
    Err(Error::FatNoMatch {
        count: header.nfat_arch,
    })
}

/// Loads a thin image found at `base` within `data`.
fn load_thin(data: &[u8], base: usize, target: CpuTarget) -> Result<Binary> {
    if base + MachHeader::SIZE > data.len() {
        return Err(Error::truncated(base + MachHeader::SIZE, data.len()));
    }
    let header = MachHeader::read_from_prefix(&data[base..])
        .map_err(|_| Error::truncated(MachHeader::SIZE, data.len() - base))?
        .0;
    if !header.is_valid() {
        return Err(Error::InvalidMagic(header.magic));
    }
    if !target.accepts_thin(header.cputype, header.cpusubtype) {
        return Err(Error::CpuMismatch {
            cputype: header.cputype,
            cpusubtype: header.cpusubtype,
        });
    }
    if header.sizeofcmds as usize > PAGE_SIZE - MachHeader::SIZE {
        return Err(Error::CommandsTooBig {
            sizeofcmds: header.sizeofcmds,
        });
    }
    let cmds_end = base + MachHeader::SIZE + header.sizeofcmds as usize;
    if cmds_end > data.len() {
        return Err(Error::truncated(cmds_end, data.len()));
    }

    // The header page is copied out so the handle stays self-contained.
    let mut page = vec![0u8; PAGE_SIZE];
    let avail = (data.len() - base).min(PAGE_SIZE);
    page[..avail].copy_from_slice(&data[base..base + avail]);

    let mut binary = Binary::with_window()?;
    for (cmd, body) in parse_load_commands(&page)? {
        if cmd != LC_SEGMENT {
            continue;
        }
        let sc = SegmentCommand::read_from_prefix(body)
            .map_err(|_| Error::BadLoadCommand { offset: 0 })?
            .0;
        let mut segment = Segment {
            segname: sc.segname,
            vmaddr: sc.vmaddr as u64,
            vmsize: sc.vmsize as u64,
            fileoff: sc.fileoff as u64,
            filesize: sc.filesize as u64,
        };
        // Debug-only sections ship vmsize 0 with a nonzero filesize; they are
        // never mapped.
        if segment.vmsize == 0 {
            segment.filesize = 0;
        }
        if segment.filesize != 0 {
            let woff = Window::checked_offset(segment.vmaddr, segment.filesize)?;
            let src_start = base + segment.fileoff as usize;
            let src_end = src_start + segment.filesize as usize;
            if src_end > data.len() {
                return Err(Error::truncated(src_end, data.len()));
            }
            binary
                .window
                .slice_mut(woff, segment.filesize as usize)?
                .copy_from_slice(&data[src_start..src_end]);
        }
        binary.segments.push(segment);
    }

    binary.cpusubtype = header.cpusubtype;
    binary.header_page = Some(page);
    binary.load_symbols()?;
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::Range;
    use crate::macho::{CPU_SUBTYPE_ARM_V6, CPU_SUBTYPE_ARM_V7, CPU_TYPE_ARM};
    use crate::testutil::{fat_archive, ImageBuilder};

    /// A three-segment image: __TEXT stored at file offset 0, __DATA behind
    /// it, and a debug-only __CTF with zero virtual size.
    fn three_segment_image() -> Vec<u8> {
        let mut b = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7);
        b.add_segment("__TEXT", 0x1000, 0x2000, 0x0, 0x2000);
        b.add_segment("__DATA", 0x4000, 0x1000, 0x2000, 0x1000);
        b.add_segment("__CTF", 0x5000, 0x0, 0x3000, 0x100);
        b.fill_payload();
        b.build()
    }

    #[test]
    fn test_load_three_segments() {
        let data = three_segment_image();
        let binary = load_bytes(&data, CpuTarget::ARM_V7).unwrap();
        assert_eq!(binary.segments().len(), 3);
        assert_eq!(binary.cpusubtype(), CPU_SUBTYPE_ARM_V7);

        // A read at 0x1004 returns the bytes at file offset 4.
        let got = binary.resolve_addr(Range::new(0x1004, 4)).unwrap();
        assert_eq!(got, &data[4..8]);

        // Every segment's bytes are retrievable unchanged.
        let text = binary.resolve_addr(Range::new(0x1000, 0x2000)).unwrap();
        assert_eq!(text, &data[0..0x2000]);
        let dseg = binary.resolve_addr(Range::new(0x4000, 0x1000)).unwrap();
        assert_eq!(dseg, &data[0x2000..0x3000]);
    }

    #[test]
    fn test_zero_vmsize_forces_zero_filesize() {
        let data = three_segment_image();
        let binary = load_bytes(&data, CpuTarget::ARM_V7).unwrap();
        // vmsize 0 forces the stored size to 0, so nothing inside translates.
        let ctf = binary.segments().iter().find(|s| s.name() == "__CTF");
        assert_eq!(ctf.unwrap().filesize, 0);
        assert!(binary.resolve_addr(Range::new(0x5000, 4)).is_err());
        // Past __DATA's stored bytes is equally unreachable.
        assert!(binary.resolve_addr(Range::new(0x4800, 0x900)).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let data = vec![0x7F, b'E', b'L', b'F', 0, 0, 0, 0];
        match load_bytes(&data, CpuTarget::ARM_ANY) {
            Err(Error::InvalidMagic(m)) => assert_eq!(m, u32::from_le_bytes([0x7F, b'E', b'L', b'F'])),
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_cpu_mismatch_is_fatal() {
        let mut b = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6);
        b.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        b.fill_payload();
        let data = b.build();
        assert!(matches!(
            load_bytes(&data, CpuTarget::ARM_V7),
            Err(Error::CpuMismatch { .. })
        ));
        // Wildcard target accepts any subtype.
        assert!(load_bytes(&data, CpuTarget::ARM_ANY).is_ok());
    }

    #[test]
    fn test_oversized_commands() {
        let mut b = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7);
        b.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        b.fill_payload();
        let mut data = b.build();
        // sizeofcmds is at header offset 20.
        data[20..24].copy_from_slice(&0x2000u32.to_le_bytes());
        assert!(matches!(
            load_bytes(&data, CpuTarget::ARM_V7),
            Err(Error::CommandsTooBig { .. })
        ));
    }

    #[test]
    fn test_segment_overflowing_window_aborts() {
        let mut b = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7);
        // vmaddr near the top of the window so vmaddr+filesize crosses it.
        b.add_segment("__TEXT", 0x0FFF_F000, 0x2000, 0x0, 0x2000);
        b.fill_payload();
        let data = b.build();
        assert!(matches!(
            load_bytes(&data, CpuTarget::ARM_V7),
            Err(Error::WindowOverflow(_))
        ));
    }

    #[test]
    fn test_fat_selection_first_match_wins() {
        let mut v6 = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6);
        v6.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        v6.fill_payload();
        let mut v7 = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7);
        v7.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        v7.fill_payload();
        let v6_bytes = v6.build();
        let v7_bytes = v7.build();

        // Worked example: entries (12, 6) then (12, 9); target subtype 9
        // selects the second entry.
        let fat = fat_archive(&[
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6, &v6_bytes),
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, &v7_bytes),
        ]);
        let binary = load_bytes(&fat, CpuTarget::ARM_V7).unwrap();
        assert_eq!(binary.cpusubtype(), CPU_SUBTYPE_ARM_V7);
        // Later file-space reads are based at the chosen slice's offset: the
        // translated __TEXT bytes come from the v7 slice, not the archive head.
        let text = binary.resolve_addr(Range::new(0x1000, 0x1000)).unwrap();
        assert_eq!(text, &v7_bytes[0..0x1000]);

        // Reversed order, same target: position does not matter.
        let fat2 = fat_archive(&[
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, &v7_bytes),
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6, &v6_bytes),
        ]);
        let binary2 = load_bytes(&fat2, CpuTarget::ARM_V7).unwrap();
        assert_eq!(binary2.cpusubtype(), CPU_SUBTYPE_ARM_V7);

        // Two equally-acceptable slices: file order breaks the tie. A
        // wildcard-subtype slice matches any concrete target.
        let fat3 = fat_archive(&[
            (CPU_TYPE_ARM, 0, &v6_bytes),
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6, &v6_bytes),
        ]);
        let binary3 = load_bytes(&fat3, CpuTarget::ARM_V6).unwrap();
        assert_eq!(binary3.cpusubtype(), CPU_SUBTYPE_ARM_V6);
    }

    #[test]
    fn test_fat_wildcard_target_is_config_error() {
        let mut v7 = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7);
        v7.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        v7.fill_payload();
        let v7_bytes = v7.build();
        let fat = fat_archive(&[(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, &v7_bytes)]);
        assert!(matches!(
            load_bytes(&fat, CpuTarget::ARM_ANY),
            Err(Error::FatWildcardTarget)
        ));
    }

    #[test]
    fn test_fat_no_match() {
        let mut v6 = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6);
        v6.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        v6.fill_payload();
        let v6_bytes = v6.build();
        let fat = fat_archive(&[(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6, &v6_bytes)]);
        assert!(matches!(
            load_bytes(&fat, CpuTarget::ARM_V7),
            Err(Error::FatNoMatch { count: 1 })
        ));
    }

    #[test]
    fn test_truncated_segment_payload() {
        let mut b = ImageBuilder::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7);
        b.add_segment("__TEXT", 0x1000, 0x1000, 0x0, 0x1000);
        b.fill_payload();
        let data = b.build();
        assert!(matches!(
            load_bytes(&data[..0x800], CpuTarget::ARM_V7),
            Err(Error::Truncated { .. })
        ));
    }
}
