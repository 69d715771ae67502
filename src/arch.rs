//! Target architecture configuration.
//!
//! The loader targets one device family per run. The desired CPU type and
//! subtype are explicit configuration passed into every file load, never
//! process-global state.

use std::fmt;
use std::str::FromStr;

use crate::macho::constants::*;

/// The CPU type/subtype a load operation must match.
///
/// A subtype of [`CPU_SUBTYPE_WILDCARD`] accepts any subtype in thin images,
/// but is a configuration error for fat archive selection (a fat archive
/// cannot be disambiguated without knowing which subtype is wanted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTarget {
    /// Desired CPU type (e.g. [`CPU_TYPE_ARM`]).
    pub cputype: u32,
    /// Desired CPU subtype, or [`CPU_SUBTYPE_WILDCARD`].
    pub cpusubtype: u32,
}

impl CpuTarget {
    /// Any ARM subtype.
    pub const ARM_ANY: Self = Self {
        cputype: CPU_TYPE_ARM,
        cpusubtype: CPU_SUBTYPE_WILDCARD,
    };

    /// ARMv6 (e.g. iPhone 2G/3G-era devices).
    pub const ARM_V6: Self = Self {
        cputype: CPU_TYPE_ARM,
        cpusubtype: CPU_SUBTYPE_ARM_V6,
    };

    /// ARMv7 (e.g. iPhone 3GS-era devices and later).
    pub const ARM_V7: Self = Self {
        cputype: CPU_TYPE_ARM,
        cpusubtype: CPU_SUBTYPE_ARM_V7,
    };

    /// Returns true if the configured subtype is the wildcard.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.cpusubtype == CPU_SUBTYPE_WILDCARD
    }

    /// Returns true if a thin image with the given type/subtype is loadable.
    ///
    /// The CPU type must match exactly. Subtypes only have to agree when both
    /// the image's and the target's subtype are concrete.
    #[inline]
    pub fn accepts_thin(&self, cputype: u32, cpusubtype: u32) -> bool {
        cputype == self.cputype
            && (cpusubtype == CPU_SUBTYPE_WILDCARD
                || self.is_wildcard()
                || cpusubtype == self.cpusubtype)
    }

    /// Returns true if a fat architecture record matches this target.
    ///
    /// The record's subtype may be the wildcard (matches anything) or must
    /// equal the target's. The caller must have rejected wildcard targets.
    #[inline]
    pub fn accepts_fat_arch(&self, cputype: u32, cpusubtype: u32) -> bool {
        cputype == self.cputype
            && (cpusubtype == CPU_SUBTYPE_WILDCARD || cpusubtype == self.cpusubtype)
    }
}

impl fmt::Display for CpuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.cputype, self.cpusubtype) {
            (CPU_TYPE_ARM, CPU_SUBTYPE_WILDCARD) => write!(f, "arm"),
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6) => write!(f, "armv6"),
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7) => write!(f, "armv7"),
            (t, s) => write!(f, "cpu({t},{s})"),
        }
    }
}

impl FromStr for CpuTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" => Ok(Self::ARM_ANY),
            "armv6" => Ok(Self::ARM_V6),
            "armv7" => Ok(Self::ARM_V7),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}
