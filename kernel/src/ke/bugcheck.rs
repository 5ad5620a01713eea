//! Kernel Bug Check Implementation
//!
//! This module implements KeBugCheck / KeBugCheckEx for the memory
//! manager. A bug check is raised when the kernel detects an
//! unrecoverable inconsistency: a page that belongs to the wrong cache,
//! a cache deleted while an area still maps it, a page freed twice.
//!
//! These are programming errors in a collaborator, never conditions a
//! caller can recover from. The bug check:
//!
//! 1. Records the STOP code and its four parameters
//! 2. Logs the STOP line at error level
//! 3. Aborts the running context (panics), never returning
//!
//! # Bug Check Codes
//!
//! Only the STOP codes the memory manager raises are defined here:
//! - MEMORY_MANAGEMENT (0x1A): generic memory manager inconsistency,
//!   parameter 1 carries one of the [`mm_subcodes`]
//! - PFN_LIST_CORRUPT (0x4E): the page frame database is corrupt
//!   (double free, freeing an owned page)

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Counter for bugchecks raised since boot
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Data of the most recent bug check - saved for debugging
static BUGCHECK_DATA: Mutex<Option<BugCheckData>> = Mutex::new(None);

/// Bug check information structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BugCheckData {
    /// The bug check code
    pub code: u32,
    /// First parameter
    pub parameter1: u64,
    /// Second parameter
    pub parameter2: u64,
    /// Third parameter
    pub parameter3: u64,
    /// Fourth parameter
    pub parameter4: u64,
}

// ============================================================================
// Bug Check Codes (STOP Codes)
// ============================================================================

pub mod codes {
    //! Bug check codes raised by the memory manager

    /// MEMORY_MANAGEMENT (0x1A)
    /// Parameter1: memory manager sub-code (see `mm_subcodes`)
    /// Parameter2-4: sub-code specific
    pub const MEMORY_MANAGEMENT: u32 = 0x0000001A;

    /// PFN_LIST_CORRUPT (0x4E)
    /// Parameter1: sub-code (see `mm_subcodes`)
    /// Parameter2: page frame number
    pub const PFN_LIST_CORRUPT: u32 = 0x0000004E;
}

pub mod mm_subcodes {
    //! Parameter 1 values for MEMORY_MANAGEMENT and PFN_LIST_CORRUPT

    /// A page found in a cache does not point back at that cache
    /// Parameter2: cache id, Parameter3: page, Parameter4: page owner
    pub const PAGE_CACHE_MISMATCH: u64 = 0x4101;

    /// A page was inserted although another cache still owns it
    /// Parameter2: cache id, Parameter3: page, Parameter4: current owner
    pub const PAGE_ALREADY_OWNED: u64 = 0x4102;

    /// Two pages were placed at the same cache offset
    /// Parameter2: cache id, Parameter3: page index, Parameter4: resident page
    pub const PAGE_OFFSET_OCCUPIED: u64 = 0x4103;

    /// A cache was deleted while areas or consumers still reference it
    /// Parameter2: cache id, Parameter3: area count, Parameter4: consumer count
    pub const CACHE_DELETED_WHILE_REFERENCED: u64 = 0x4104;

    /// A cache reference count dropped below zero
    /// Parameter2: cache id
    pub const CACHE_REFERENCE_UNDERFLOW: u64 = 0x4105;

    /// A page being discarded is still mapped or wired
    /// Parameter2: cache id, Parameter3: page, Parameter4: wired count
    pub const PAGE_STILL_IN_USE: u64 = 0x4106;

    /// The consumer/source links of two caches disagree
    /// Parameter2: cache id, Parameter3: other cache id
    pub const CACHE_LINK_CORRUPT: u64 = 0x4107;

    /// A cache was locked after it had been deleted
    /// Parameter2: cache id
    pub const CACHE_USED_AFTER_DELETE: u64 = 0x4108;

    /// A backing store hook was called that the store can never serve
    /// Parameter2: cache type, Parameter3: offset
    pub const STORE_HOOK_INVALID: u64 = 0x4109;

    /// A free page was freed again
    /// Parameter2: page frame number, Parameter3: page state
    pub const PAGE_DOUBLE_FREE: u64 = 0x0099;

    /// A page handed to the free list is still in use
    /// Parameter2: page frame number, Parameter3: owning cache
    pub const PAGE_FREED_WHILE_OWNED: u64 = 0x009A;

    /// A page frame number is outside the database
    /// Parameter2: page frame number, Parameter3: database size
    pub const PAGE_OUT_OF_RANGE: u64 = 0x009B;
}

/// Get a human-readable name for a bug check code
pub fn bugcheck_name(code: u32) -> &'static str {
    match code {
        codes::MEMORY_MANAGEMENT => "MEMORY_MANAGEMENT",
        codes::PFN_LIST_CORRUPT => "PFN_LIST_CORRUPT",
        _ => "UNKNOWN_BUGCHECK_CODE",
    }
}

/// Bug check with only a code
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Bug check with code and four parameters
///
/// Records the bug check data and aborts the current context.
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst);

    let data = BugCheckData {
        code,
        parameter1: p1,
        parameter2: p2,
        parameter3: p3,
        parameter4: p4,
    };
    *BUGCHECK_DATA.lock() = Some(data);

    log::error!(
        "*** STOP: {:#010X} ({:#018X}, {:#018X}, {:#018X}, {:#018X})",
        code, p1, p2, p3, p4
    );
    log::error!("*** {}", bugcheck_name(code));

    panic!(
        "*** STOP: {:#010X} {} ({:#X}, {:#X}, {:#X}, {:#X})",
        code,
        bugcheck_name(code),
        p1,
        p2,
        p3,
        p4
    );
}

/// Number of bug checks raised so far
pub fn bugcheck_count() -> u32 {
    BUGCHECK_COUNT.load(Ordering::SeqCst)
}

/// Get the data of the most recent bug check
pub fn get_bugcheck_data() -> Option<BugCheckData> {
    *BUGCHECK_DATA.lock()
}

// ============================================================================
// Convenience Macros
// ============================================================================

/// Trigger a bugcheck
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck::ke_bugcheck($code)
    };
    ($code:expr, $p1:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, 0, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr, $p4:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, $p4 as u64)
    };
}
