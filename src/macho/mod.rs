//! Mach-O on-disk structures and constants.

pub mod constants;
pub mod structs;

pub use constants::*;
pub use structs::*;
