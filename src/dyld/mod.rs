//! Dyld shared cache parsing, indexing, and embedded image selection.

pub mod cache;
pub mod structs;

pub use cache::{open_cache, open_cache_bytes, CacheImage, CacheIndex, CacheMode};
pub use structs::*;
