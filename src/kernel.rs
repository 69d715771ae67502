//! Live-kernel acquisition over a privileged, chunked memory-read channel.
//!
//! The running kernel is located by probing candidate addresses for the
//! Mach-O magic, then its whole image is copied out through bounded-size
//! reads into the handle's window. The privileged channel itself is an
//! external interface ([`MemorySource`]) so the probe and copy logic can be
//! exercised against a simulated address space.

use tracing::info;
use zerocopy::FromBytes;

use crate::binary::{parse_load_commands, Binary, Segment, Window};
use crate::error::{Error, Result};
use crate::macho::{MachHeader, SegmentCommand, LC_SEGMENT, MH_MAGIC, PAGE_SIZE};
use crate::util::read_u32_le;

/// Per-call transfer ceiling of the privileged read channel, in bytes.
///
/// A full-page read against a mapped-but-protected region fails where a
/// just-under-a-page read succeeds, so every transfer stays below the page.
pub const MAX_TRANSFER: usize = 0xFFF;

/// Outcome of one bounded read from a live address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The prefix of the buffer that was filled.
    Data(usize),
    /// The address is not resident; a probe advances to its next candidate.
    NotResident,
}

/// A restricted, chunked, privileged read channel into a live address space.
///
/// Implementations must fill at most [`MemorySource::max_transfer`] bytes per
/// call. Any failure other than non-residency is reported as an error and is
/// fatal to the operation issuing the read.
pub trait MemorySource {
    /// Per-call transfer ceiling in bytes.
    fn max_transfer(&self) -> usize {
        MAX_TRANSFER
    }

    /// Reads up to `buf.len()` bytes at `addr`.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<ReadOutcome>;
}

// Candidate enumeration: coarse-stride memory bases, then page stride
// within the first few pages above each base.
const PROBE_BASES: [u64; 2] = [0x8000_0000, 0xC000_0000];
const PROBE_PAGE_FIRST: u64 = 0x1000;
const PROBE_PAGE_LIMIT: u64 = 0x10000;

/// Copies `dst.len()` bytes starting at `addr` out of `source`, issuing
/// repeated reads no larger than the channel's per-call ceiling.
pub(crate) fn copy_span(source: &dyn MemorySource, addr: u64, dst: &mut [u8]) -> Result<()> {
    let max = source.max_transfer().min(MAX_TRANSFER);
    let mut addr = addr;
    let mut filled = 0usize;
    while filled < dst.len() {
        let chunk = (dst.len() - filled).min(max);
        match source.read(addr, &mut dst[filled..filled + chunk])? {
            ReadOutcome::Data(n) if n > 0 => {
                addr += n as u64;
                filled += n;
            }
            ReadOutcome::Data(_) => return Err(Error::ReadStalled { addr }),
            ReadOutcome::NotResident => return Err(Error::NotResident { addr }),
        }
    }
    Ok(())
}

/// Locates and snapshots the running kernel image.
///
/// Probes each candidate address with one bounded read: a non-resident
/// result advances to the next candidate, any other failure is fatal, and
/// exhausting every candidate is fatal. Once the header is found, the
/// image's extent is the maximum `vmaddr + filesize` over its segments and
/// that whole span is copied into the window at the same window-relative
/// position a file load would use, so downstream code is address-space
/// agnostic.
pub fn load_live_kernel(source: &dyn MemorySource) -> Result<Binary> {
    let max = source.max_transfer().min(MAX_TRANSFER);
    let mut probe = vec![0u8; max];

    let (mh_addr, got) = locate_header(source, &mut probe)?;
    info!("found running kernel at {mh_addr:#x}");

    // The header page is whatever the bounded probe read returned.
    let mut page = vec![0u8; PAGE_SIZE];
    let avail = got.min(PAGE_SIZE);
    page[..avail].copy_from_slice(&probe[..avail]);

    let header = MachHeader::read_from_prefix(&page[..])
        .map_err(|_| Error::truncated(MachHeader::SIZE, avail))?
        .0;
    if header.sizeofcmds as usize > avail.saturating_sub(MachHeader::SIZE) {
        return Err(Error::CommandsTooBig {
            sizeofcmds: header.sizeofcmds,
        });
    }

    let mut segments = Vec::new();
    let mut max_addr = mh_addr;
    for (cmd, body) in parse_load_commands(&page)? {
        if cmd != LC_SEGMENT {
            continue;
        }
        let sc = SegmentCommand::read_from_prefix(body)
            .map_err(|_| Error::BadLoadCommand { offset: 0 })?
            .0;
        let end = sc.vmaddr as u64 + sc.filesize as u64;
        if end > max_addr {
            max_addr = end;
        }
        segments.push(Segment {
            segname: sc.segname,
            vmaddr: sc.vmaddr as u64,
            vmsize: sc.vmsize as u64,
            fileoff: sc.fileoff as u64,
            filesize: sc.filesize as u64,
        });
    }

    // Copy the whole live span out through the capped channel. During the
    // copy a non-resident address is fatal; the probe phase is over.
    let span = max_addr - mh_addr;
    let woff = Window::checked_offset(mh_addr, span)?;
    let mut binary = Binary::with_window()?;
    copy_span(source, mh_addr, binary.window.slice_mut(woff, span as usize)?)?;

    binary.cpusubtype = header.cpusubtype;
    binary.header_page = Some(page);
    binary.segments = segments;
    binary.load_symbols()?;
    Ok(binary)
}

/// Probes candidate addresses for the Mach-O magic. Returns the header
/// address and the number of bytes the successful probe read.
fn locate_header(source: &dyn MemorySource, probe: &mut [u8]) -> Result<(u64, usize)> {
    for base in PROBE_BASES {
        let mut pagebase = PROBE_PAGE_FIRST;
        while pagebase < PROBE_PAGE_LIMIT {
            let candidate = base + pagebase;
            pagebase += 0x1000;
            match source.read(candidate, probe)? {
                ReadOutcome::NotResident => continue,
                ReadOutcome::Data(n) => {
                    if n >= 4 && read_u32_le(probe) == MH_MAGIC {
                        return Ok((candidate, n));
                    }
                }
            }
        }
    }
    Err(Error::KernelNotFound)
}
