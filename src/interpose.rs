//! The interposed entry points.
//!
//! Each one makes sure the real primitives are known, delegates with the caller's exact
//! arguments, then shows the result to the [`MergePolicy`].  The returned pointer is never
//! altered.

use std::ffi::CStr;

use libc::{c_int, c_void, off_t, size_t};

use crate::config::Config;
use crate::init::{InitState, LazyInit};
use crate::ksmp_debug;
use crate::locate::{Locator, Primitives};
use crate::log;
use crate::policy::{Advisor, MergePolicy, Provenance, Verdict};

/// Process-wide state installed by the first call.
#[derive(Clone, Copy, Debug)]
pub struct Runtime {
    pub primitives: Primitives,
    pub config: Config,
}

/// The two shapes of an `mremap` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemapRequest {
    Ordinary,
    /// `MREMAP_FIXED`: the variadic target address is present.
    Fixed { new_address: *mut c_void },
}

impl RemapRequest {
    /// Inspect `flags`; `read_new_address` is only called when they promise a fifth argument.
    pub fn decode<F: FnOnce() -> *mut c_void>(flags: c_int, read_new_address: F) -> Self {
        if flags & libc::MREMAP_FIXED != 0 {
            RemapRequest::Fixed {
                new_address: read_new_address(),
            }
        } else {
            RemapRequest::Ordinary
        }
    }
}

/// Sits between a program and its allocation primitives.
///
/// `L` finds the real primitives, `A` carries out merge advisories.  The shared library holds a
/// single `Interposer<NextInLinkOrder, Madvise>` static behind its exported symbols.
pub struct Interposer<L, A> {
    runtime: LazyInit<Runtime>,
    locator: L,
    advisor: A,
    threshold_var: &'static CStr,
}

impl<L, A> Interposer<L, A> {
    /// `fallback` serves calls made while the interposer is still resolving the real primitives.
    pub const fn new(
        locator: L,
        advisor: A,
        fallback: Primitives,
        threshold_var: &'static CStr,
    ) -> Self {
        Interposer {
            runtime: LazyInit::new(Runtime {
                primitives: fallback,
                config: Config::DEFAULT,
            }),
            locator,
            advisor,
            threshold_var,
        }
    }

    pub fn state(&self) -> InitState {
        self.runtime.state()
    }

    pub fn advisor(&self) -> &A {
        &self.advisor
    }
}

impl<L: Locator, A: Advisor> Interposer<L, A> {
    /// Resolve the real primitives on first use.  Aborts the process if any is missing.
    #[inline]
    pub fn ensure_ready(&self) -> &Runtime {
        self.runtime.ensure_ready(|| self.setup())
    }

    fn setup(&self) -> Runtime {
        // Resolve everything before installing anything, so the table goes in whole.
        let primitives = match Primitives::resolve(&self.locator) {
            Ok(primitives) => primitives,
            Err(e) => match self.locator.last_error() {
                Some(reason) => log::fatal(format_args!(
                    "{}: {}",
                    e,
                    reason.to_str().unwrap_or("unknown error")
                )),
                None => log::fatal(format_args!("{}", e)),
            },
        };
        let config = unsafe { Config::from_env(self.threshold_var) };
        ksmp_debug!(
            "setup done, page size {}, merge threshold {}",
            config.page_size(),
            config.merge_threshold()
        );
        Runtime { primitives, config }
    }

    fn merge_if_profitable(
        &self,
        runtime: &Runtime,
        address: *mut c_void,
        len: usize,
        provenance: Provenance,
    ) -> Verdict {
        MergePolicy::new(runtime.config).evaluate(&self.advisor, address, len, provenance)
    }

    /// # Safety
    ///
    /// Same contract as `malloc(3)`.
    pub unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        let runtime = self.ensure_ready();
        let res = (runtime.primitives.malloc)(size);
        ksmp_debug!("malloc ({}) = {:p}", size, res);
        self.merge_if_profitable(runtime, res, size, Provenance::Unknown);
        res
    }

    /// # Safety
    ///
    /// Same contract as `calloc(3)`.
    pub unsafe fn calloc(&self, nmemb: size_t, size: size_t) -> *mut c_void {
        let runtime = self.ensure_ready();
        let res = (runtime.primitives.calloc)(nmemb, size);
        ksmp_debug!("calloc ({}, {}) = {:p}", nmemb, size, res);
        // A successful calloc proves the product fits.
        let len = nmemb.checked_mul(size).unwrap_or(0);
        self.merge_if_profitable(runtime, res, len, Provenance::Unknown);
        res
    }

    /// # Safety
    ///
    /// Same contract as `realloc(3)`.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        let runtime = self.ensure_ready();
        let res = (runtime.primitives.realloc)(ptr, size);
        ksmp_debug!("realloc ({:p}, {}) = {:p}", ptr, size, res);
        self.merge_if_profitable(runtime, res, size, Provenance::Unknown);
        res
    }

    /// # Safety
    ///
    /// Same contract as `mmap(2)`.
    pub unsafe fn mmap(
        &self,
        addr: *mut c_void,
        length: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void {
        let runtime = self.ensure_ready();
        let res = (runtime.primitives.mmap)(addr, length, prot, flags, fd, offset);
        ksmp_debug!(
            "mmap ({:p}, {}, {}, {}, {}, {}) = {:p}",
            addr,
            length,
            prot,
            flags,
            fd,
            offset,
            res
        );
        self.merge_if_profitable(runtime, res, length, Provenance::Mapping(flags));
        res
    }

    /// `read_new_address` fetches the optional fifth argument and is only called when `flags`
    /// include `MREMAP_FIXED`.
    ///
    /// # Safety
    ///
    /// Same contract as `mremap(2)`.
    pub unsafe fn mremap<F: FnOnce() -> *mut c_void>(
        &self,
        old_address: *mut c_void,
        old_size: size_t,
        new_size: size_t,
        flags: c_int,
        read_new_address: F,
    ) -> *mut c_void {
        let runtime = self.ensure_ready();
        let mremap = runtime.primitives.mremap;
        let res = match RemapRequest::decode(flags, read_new_address) {
            RemapRequest::Fixed { new_address } => {
                mremap(old_address, old_size, new_size, flags, new_address)
            }
            RemapRequest::Ordinary => mremap(old_address, old_size, new_size, flags),
        };
        ksmp_debug!(
            "mremap ({:p}, {}, {}, {}, ...) = {:p}",
            old_address,
            old_size,
            new_size,
            flags,
            res
        );
        self.merge_if_profitable(runtime, res, new_size, Provenance::Unknown);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_remap_leaves_varargs_alone() {
        let request = RemapRequest::decode(libc::MREMAP_MAYMOVE, || {
            panic!("read past the fixed arguments")
        });
        assert_eq!(request, RemapRequest::Ordinary);
    }

    #[test]
    fn fixed_remap_reads_target() {
        let target = 0x7000_0000_0000usize as *mut c_void;
        let request = RemapRequest::decode(libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED, || target);
        assert_eq!(
            request,
            RemapRequest::Fixed {
                new_address: target
            }
        );
    }
}
