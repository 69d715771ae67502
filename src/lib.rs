//! machload - a binary loader and address-space translation layer for
//! ARM-era Mach-O executables, fat archives, and dyld shared caches.
//!
//! This library turns raw bytes (a file, a fat-archive slice, a dyld-cache
//! mapping, or a live-kernel snapshot read over a privileged channel) into a
//! validated, randomly-addressable [`Binary`] with working virtual-address
//! and file-offset translation, symbol lookup, and segment store-back.
//!
//! # Features
//!
//! - Thin Mach-O loading with CPU-target validation
//! - Fat archive slice selection
//! - Dyld shared cache indexing and embedded image extraction
//! - Running-kernel acquisition through a chunked, capped read channel
//! - All-or-nothing range translation inside a fixed reserved window
//! - Binary search over the external symbol table with Thumb tagging
//!
//! # Example
//!
//! ```no_run
//! use machload::{load_file, CpuTarget};
//!
//! fn main() -> machload::Result<()> {
//!     let kernel = load_file("kernelcache.decrypted", CpuTarget::ARM_V7)?;
//!     let sysent = kernel.resolve_symbol("_sysent", false)?;
//!     println!("_sysent at {sysent:#x}");
//!     kernel.store("kernelcache.patched")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arch;
pub mod binary;
pub mod dyld;
pub mod error;
pub mod kernel;
pub mod loader;
pub mod macho;
mod store;
mod symbols;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types
pub use arch::CpuTarget;
pub use binary::{Binary, Range, Segment, WINDOW_SIZE};
pub use dyld::{open_cache, open_cache_bytes, CacheImage, CacheIndex, CacheMode};
pub use error::{Error, Result};
pub use kernel::{load_live_kernel, MemorySource, ReadOutcome, MAX_TRANSFER};
pub use loader::{load_bytes, load_file};
