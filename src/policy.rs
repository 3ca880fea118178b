//! Deciding whether a freshly returned region is worth marking mergeable.

use std::fmt;

use libc::{c_int, c_void};

use crate::config::Config;
use crate::ksmp_debug;

// Linux keeps the mapping type in the low nibble of the flags.
const MAP_TYPE: c_int = 0x0f;

/// Where a region came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Heap allocation or remap: mapping flags are not available.
    Unknown,
    /// Direct `mmap` call with these flags.
    Mapping(c_int),
}

impl Provenance {
    fn allows_merging(self) -> bool {
        match self {
            Provenance::Unknown => true,
            Provenance::Mapping(flags) => {
                flags & MAP_TYPE == libc::MAP_PRIVATE
                    && flags & libc::MAP_ANONYMOUS != 0
                    && flags & (libc::MAP_GROWSDOWN | libc::MAP_STACK) == 0
            }
        }
    }
}

/// A page-aligned span of address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The delegated call returned null or `MAP_FAILED`.
    Failed,
    /// Page-rounded length at or below the threshold.
    TooSmall(usize),
    /// Shared, file-backed or stack mapping.
    Filtered,
    Merge(Region),
}

/// Reasons the kernel refused a merge advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdviseError {
    pub errno: c_int,
}

impl fmt::Display for AdviseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "madvise(MADV_MERGEABLE) failed with errno {}", self.errno)
    }
}

impl std::error::Error for AdviseError {}

/// Something that can mark a region as a same-page merging candidate.
pub trait Advisor {
    fn advise_mergeable(&self, region: Region) -> Result<(), AdviseError>;
}

/// Issues `madvise(MADV_MERGEABLE)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Madvise;

impl Advisor for Madvise {
    fn advise_mergeable(&self, region: Region) -> Result<(), AdviseError> {
        let ret = unsafe {
            libc::madvise(
                region.start as *mut c_void,
                region.len,
                libc::MADV_MERGEABLE,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(AdviseError {
                errno: std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(0),
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergePolicy {
    page_size: usize,
    threshold: usize,
}

impl MergePolicy {
    pub const fn new(config: Config) -> Self {
        MergePolicy {
            page_size: config.page_size(),
            threshold: config.merge_threshold(),
        }
    }

    /// Decide, without side effects, what to do with `len` bytes returned at `address`.
    pub fn judge(&self, address: *mut c_void, len: usize, provenance: Provenance) -> Verdict {
        if address.is_null() || address == libc::MAP_FAILED {
            return Verdict::Failed;
        }
        let raw = address as usize;
        let start = raw & !(self.page_size - 1);
        let len = match len.checked_add(raw - start) {
            Some(len) => len,
            None => return Verdict::Failed,
        };
        if len <= self.threshold {
            Verdict::TooSmall(len)
        } else if provenance.allows_merging() {
            Verdict::Merge(Region { start, len })
        } else {
            Verdict::Filtered
        }
    }

    /// Judge the region and, if approved, advise the kernel.  Failures are only logged.
    pub fn evaluate<A: Advisor + ?Sized>(
        &self,
        advisor: &A,
        address: *mut c_void,
        len: usize,
        provenance: Provenance,
    ) -> Verdict {
        let verdict = self.judge(address, len, provenance);
        match verdict {
            Verdict::Merge(region) => match advisor.advise_mergeable(region) {
                Ok(()) => ksmp_debug!("sharing {} bytes from {:#x}", region.len, region.start),
                Err(_e) => ksmp_debug!("{}", _e),
            },
            Verdict::Filtered => ksmp_debug!("not sharing (flags filtered)"),
            Verdict::Failed | Verdict::TooSmall(_) => {}
        }
        verdict
    }
}
