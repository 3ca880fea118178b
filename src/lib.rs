//! `ksm_preload` enables kernel same-page merging (KSM) for programs that were never written to
//! use it.  Linux only deduplicates memory that a process has marked with
//! `madvise(MADV_MERGEABLE)`; this crate does the marking on the program's behalf by sitting in
//! front of its allocation functions.
//!
//! ## Using `ksm_preload` via `LD_PRELOAD`
//!
//! The companion [`lib_ksm_preload`] crate builds `libksmp.so`, which exports `malloc`,
//! `calloc`, `realloc`, `mmap` and `mremap`.  Each call is forwarded to the implementation the
//! program would have used anyway, and regions larger than the merge threshold are advised
//! mergeable:
//!
//! ```bash
//! KSMP_MERGE_THRESHOLD=65536 LD_PRELOAD=libksmp.so ./my_program
//! ```
//!
//! The library has no other interface.  `KSMP_MERGE_THRESHOLD` is in bytes (default 32768);
//! regions no larger than the threshold are left alone, as are shared, file-backed and stack
//! mappings.  Build with `--features debug-log` to get one line on stderr per intercepted call
//! and per decision.
//!
//! KSM itself must be switched on (`echo 1 > /sys/kernel/mm/ksm/run`) before any merging
//! happens.
//!
//! ## The `ksmp` launcher
//!
//! A convenience only: `ksmp --threshold 65536 --stats -- ./my_program args...` sets the two
//! environment variables above, runs the program, and can print the kernel's KSM counters
//! ([`stats`]) afterwards.  It is a separate executable; nothing in the preloaded library
//! depends on it.

pub mod config;
pub mod init;
pub mod interpose;
pub mod locate;
pub mod log;
pub mod policy;
pub mod stats;
pub mod sync;

pub use config::{Config, MERGE_THRESHOLD_ENV};
pub use interpose::{Interposer, RemapRequest, Runtime};
pub use locate::{Locator, NextInLinkOrder, Primitive, Primitives};
pub use policy::{Advisor, Madvise, MergePolicy, Provenance, Region, Verdict};
pub use stats::KsmStats;
