//! Finding the allocation functions the program would have called without us.

use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::ptr::NonNull;

use libc::{c_int, c_void, off_t, size_t, RTLD_NEXT};

pub type MallocFunc = unsafe extern "C" fn(size: size_t) -> *mut c_void;
pub type CallocFunc = unsafe extern "C" fn(nmemb: size_t, size: size_t) -> *mut c_void;
pub type MmapFunc = unsafe extern "C" fn(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void;
pub type MremapFunc = unsafe extern "C" fn(
    old_address: *mut c_void,
    old_size: size_t,
    new_size: size_t,
    flags: c_int,
    ...
) -> *mut c_void;
pub type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;

/// The hooked allocation primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    Malloc,
    Calloc,
    Mmap,
    Mremap,
    Realloc,
}

impl Primitive {
    pub const ALL: [Primitive; 5] = [
        Primitive::Malloc,
        Primitive::Calloc,
        Primitive::Mmap,
        Primitive::Mremap,
        Primitive::Realloc,
    ];

    pub fn symbol(self) -> &'static CStr {
        match self {
            Primitive::Malloc => c"malloc",
            Primitive::Calloc => c"calloc",
            Primitive::Mmap => c"mmap",
            Primitive::Mremap => c"mremap",
            Primitive::Realloc => c"realloc",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol().to_str().unwrap_or("?"))
    }
}

/// A source of function addresses.
///
/// # Safety
///
/// An address returned for a [`Primitive`] must be a function with that primitive's C
/// signature.
pub unsafe trait Locator {
    fn locate(&self, symbol: &CStr) -> Option<NonNull<c_void>>;

    /// Explanation for the most recent failed lookup, if the source keeps one.
    fn last_error(&self) -> Option<&CStr> {
        None
    }
}

/// Looks a symbol up in the libraries loaded after this one: `dlsym(RTLD_NEXT, ...)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NextInLinkOrder;

unsafe impl Locator for NextInLinkOrder {
    fn locate(&self, symbol: &CStr) -> Option<NonNull<c_void>> {
        NonNull::new(unsafe { libc::dlsym(RTLD_NEXT, symbol.as_ptr()) })
    }

    fn last_error(&self) -> Option<&CStr> {
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(err) })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocateError {
    pub primitive: Primitive,
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to load {}", self.primitive)
    }
}

impl std::error::Error for LocateError {}

/// The complete set of real primitives the interposer delegates to.
#[derive(Clone, Copy, Debug)]
pub struct Primitives {
    pub malloc: MallocFunc,
    pub calloc: CallocFunc,
    pub mmap: MmapFunc,
    pub mremap: MremapFunc,
    pub realloc: ReallocFunc,
}

impl Primitives {
    /// Look up all five primitives.  Nothing is returned unless every lookup succeeds.
    pub fn resolve<L: Locator + ?Sized>(locator: &L) -> Result<Primitives, LocateError> {
        let find = |primitive: Primitive| {
            locator
                .locate(primitive.symbol())
                .map(NonNull::as_ptr)
                .ok_or(LocateError { primitive })
        };
        let malloc = find(Primitive::Malloc)?;
        let calloc = find(Primitive::Calloc)?;
        let mmap = find(Primitive::Mmap)?;
        let mremap = find(Primitive::Mremap)?;
        let realloc = find(Primitive::Realloc)?;

        // `Locator` guarantees each address has the matching signature.
        unsafe {
            Ok(Primitives {
                malloc: mem::transmute::<*mut c_void, MallocFunc>(malloc),
                calloc: mem::transmute::<*mut c_void, CallocFunc>(calloc),
                mmap: mem::transmute::<*mut c_void, MmapFunc>(mmap),
                mremap: mem::transmute::<*mut c_void, MremapFunc>(mremap),
                realloc: mem::transmute::<*mut c_void, ReallocFunc>(realloc),
            })
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod fallback {
    use super::*;

    extern "C" {
        fn __libc_malloc(size: size_t) -> *mut c_void;
        fn __libc_calloc(nmemb: size_t, size: size_t) -> *mut c_void;
        fn __libc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
    }

    unsafe extern "C" fn sys_mmap(
        addr: *mut c_void,
        length: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void {
        // -1 on failure, which is MAP_FAILED.
        libc::syscall(libc::SYS_mmap, addr, length, prot, flags, fd, offset) as *mut c_void
    }

    // Stands in for the variadic `mremap`: on the supported ABIs the optional fifth
    // argument travels in the same register as a fixed one, and is only read for
    // MREMAP_FIXED.
    unsafe extern "C" fn sys_mremap(
        old_address: *mut c_void,
        old_size: size_t,
        new_size: size_t,
        flags: c_int,
        new_address: *mut c_void,
    ) -> *mut c_void {
        let new_address = if flags & libc::MREMAP_FIXED != 0 {
            new_address
        } else {
            std::ptr::null_mut()
        };
        libc::syscall(
            libc::SYS_mremap,
            old_address,
            old_size,
            new_size,
            flags,
            new_address,
        ) as *mut c_void
    }

    impl Primitives {
        /// Primitives that are safe to call before [`Primitives::resolve`] has run: glibc's
        /// internal allocator entry points and raw system calls.
        pub const fn fallback() -> Primitives {
            Primitives {
                malloc: __libc_malloc,
                calloc: __libc_calloc,
                mmap: sys_mmap,
                mremap: unsafe {
                    mem::transmute::<
                        unsafe extern "C" fn(
                            *mut c_void,
                            size_t,
                            size_t,
                            c_int,
                            *mut c_void,
                        ) -> *mut c_void,
                        MremapFunc,
                    >(sys_mremap)
                },
                realloc: __libc_realloc,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Without(Primitive);

    unsafe impl Locator for Without {
        fn locate(&self, symbol: &CStr) -> Option<NonNull<c_void>> {
            if symbol == self.0.symbol() {
                None
            } else {
                NextInLinkOrder.locate(symbol)
            }
        }
    }

    #[test]
    fn resolves_from_next_library() {
        let primitives = Primitives::resolve(&NextInLinkOrder).unwrap();
        unsafe {
            let p = (primitives.malloc)(64);
            assert!(!p.is_null());
            let p = (primitives.realloc)(p, 128);
            assert!(!p.is_null());
            libc::free(p);
        }
    }

    #[test]
    fn any_missing_symbol_fails_the_whole_set() {
        for primitive in Primitive::ALL {
            let err = Primitives::resolve(&Without(primitive)).unwrap_err();
            assert_eq!(err.primitive, primitive);
            assert_eq!(err.to_string(), format!("failed to load {}", primitive));
        }
    }

    #[test]
    fn dlsym_reports_unknown_symbols() {
        assert!(NextInLinkOrder
            .locate(c"ksm_preload_no_such_symbol")
            .is_none());
        assert!(NextInLinkOrder.last_error().is_some());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn fallbacks_are_usable() {
        let fallback = Primitives::fallback();
        unsafe {
            let p = (fallback.calloc)(4, 16);
            assert!(!p.is_null());
            libc::free(p);

            let len = 4 * 4096;
            let m = (fallback.mmap)(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(m, libc::MAP_FAILED);
            let grown = (fallback.mremap)(m, len, 2 * len, libc::MREMAP_MAYMOVE);
            assert_ne!(grown, libc::MAP_FAILED);
            libc::munmap(grown, 2 * len);
        }
    }
}
