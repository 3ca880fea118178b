//! Companion crate to [`ksm_preload`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the program's allocation calls and mark large regions
//! as candidates for kernel same-page merging.

use ksm_preload::{Interposer, Madvise, NextInLinkOrder, Primitives, MERGE_THRESHOLD_ENV};
use libc::{c_int, c_void, off_t, size_t};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("mremap can only be interposed on x86_64 and aarch64");

static KSM: Interposer<NextInLinkOrder, Madvise> = Interposer::new(
    NextInLinkOrder,
    Madvise,
    Primitives::fallback(),
    MERGE_THRESHOLD_ENV,
);

/// Just like `malloc`, but large blocks are advised mergeable.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    KSM.malloc(size)
}

/// Just like `calloc`, but large blocks are advised mergeable.
///
/// # Safety
///
/// Same contract as `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    KSM.calloc(nmemb, size)
}

/// Just like `realloc`, but large blocks are advised mergeable.
///
/// # Safety
///
/// Same contract as `realloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    KSM.realloc(ptr, size)
}

/// Just like `mmap`, but large private anonymous mappings are advised mergeable.
///
/// # Safety
///
/// Same contract as `mmap(2)`.
#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    KSM.mmap(addr, length, prot, flags, fd, offset)
}

/// Just like `mremap`, but large results are advised mergeable.
///
/// C declares this as `mremap(void *, size_t, size_t, int, ...)`.  On x86-64 and AArch64 Linux a
/// variadic pointer argument arrives exactly where a fifth fixed one would, so `new_address`
/// holds the optional target; it is only looked at when `flags` include `MREMAP_FIXED`.
///
/// # Safety
///
/// Same contract as `mremap(2)`.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[no_mangle]
pub unsafe extern "C" fn mremap(
    old_address: *mut c_void,
    old_size: size_t,
    new_size: size_t,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    KSM.mremap(old_address, old_size, new_size, flags, || new_address)
}
