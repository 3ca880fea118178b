//! Tunables fixed when the interposer initializes.

use std::ffi::CStr;
use std::fmt;

use crate::ksmp_debug;

/// Environment variable holding the merge threshold in bytes.
pub const MERGE_THRESHOLD_ENV: &CStr = c"KSMP_MERGE_THRESHOLD";

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Regions at or below this many bytes are not worth the kernel's bookkeeping.
pub const DEFAULT_MERGE_THRESHOLD: usize = 8 * DEFAULT_PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    // Always a positive power of two.
    page_size: usize,
    merge_threshold: usize,
}

impl Config {
    pub const DEFAULT: Config = Config {
        page_size: DEFAULT_PAGE_SIZE,
        merge_threshold: DEFAULT_MERGE_THRESHOLD,
    };

    /// A page size that is not a positive power of two is replaced by [`DEFAULT_PAGE_SIZE`].
    pub const fn new(page_size: usize, merge_threshold: usize) -> Config {
        Config {
            page_size: if page_size.is_power_of_two() {
                page_size
            } else {
                DEFAULT_PAGE_SIZE
            },
            merge_threshold,
        }
    }

    /// Read the page size from the platform and the threshold from `var`.
    ///
    /// # Safety
    ///
    /// Calls `libc::getenv`, which races with concurrent `setenv`.
    pub unsafe fn from_env(var: &CStr) -> Config {
        Config::new(
            page_size(),
            resolve_threshold(var).unwrap_or(DEFAULT_MERGE_THRESHOLD),
        )
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    pub const fn merge_threshold(&self) -> usize {
        self.merge_threshold
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}

/// Why a threshold value was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdError {
    Empty,
    Negative,
    /// Not a base-10 number, or trailing characters after it.
    Invalid,
}

impl fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdError::Empty => f.write_str("empty value"),
            ThresholdError::Negative => f.write_str("negative value"),
            ThresholdError::Invalid => f.write_str("not a base-10 integer"),
        }
    }
}

impl std::error::Error for ThresholdError {}

/// Parse a threshold in bytes.
///
/// Leading whitespace and a sign are accepted, trailing characters are not.  Values too
/// large for `usize` saturate to `usize::MAX`.
pub fn parse_threshold(raw: &[u8]) -> Result<usize, ThresholdError> {
    let trimmed = match raw.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &raw[start..],
        None => return Err(ThresholdError::Empty),
    };
    let (negative, digits) = match trimmed.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, trimmed),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ThresholdError::Invalid);
    }

    let mut value: usize = 0;
    let mut clamped = false;
    for digit in digits {
        match value
            .checked_mul(10)
            .and_then(|v| v.checked_add(usize::from(digit - b'0')))
        {
            Some(v) => value = v,
            None => {
                clamped = true;
                value = usize::MAX;
                break;
            }
        }
    }

    if negative && value != 0 {
        return Err(ThresholdError::Negative);
    }
    if clamped {
        ksmp_debug!("threshold clamped to {}", usize::MAX);
    }
    Ok(value)
}

/// Look `var` up in the environment and parse it as a threshold.
///
/// Returns `None` when the variable is unset or invalid; the caller falls back to its default.
///
/// # Safety
///
/// Calls `libc::getenv`.
pub unsafe fn resolve_threshold(var: &CStr) -> Option<usize> {
    let raw = libc::getenv(var.as_ptr());
    if raw.is_null() {
        return None;
    }
    let raw = CStr::from_ptr(raw).to_bytes();
    match parse_threshold(raw) {
        Ok(value) => Some(value),
        Err(_e) => {
            ksmp_debug!(
                "invalid environment variable {}={}: {}, a non-negative integer was expected",
                var.to_str().unwrap_or("?"),
                std::str::from_utf8(raw).unwrap_or("?"),
                _e
            );
            None
        }
    }
}

/// The platform page size, or [`DEFAULT_PAGE_SIZE`] if the platform reports nonsense.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}
