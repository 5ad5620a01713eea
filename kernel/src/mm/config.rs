//! Memory Manager Configuration
//!
//! Compile-time page geometry plus the runtime limits a `VmContext` is
//! created with.

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Default number of physical pages in a context
pub const DEFAULT_PAGE_COUNT: usize = 1024;

/// Default upper bound on live caches
pub const DEFAULT_MAX_CACHES: usize = 4096;

/// Page index of a byte offset
#[inline]
pub const fn page_index(offset: u64) -> u64 {
    offset >> PAGE_SHIFT
}

/// Byte offset of a page index
#[inline]
pub const fn page_offset(index: u64) -> u64 {
    index << PAGE_SHIFT
}

/// Number of pages needed to hold `size` bytes
#[inline]
pub const fn pages_for(size: u64) -> u64 {
    (size + PAGE_SIZE as u64 - 1) >> PAGE_SHIFT
}

/// Check if a byte offset or address is page aligned
#[inline]
pub const fn is_page_aligned(offset: u64) -> bool {
    offset & (PAGE_SIZE as u64 - 1) == 0
}

/// Runtime limits of a memory manager context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical pages in the page frame database
    pub page_count: usize,
    /// Bytes anonymous caches may reserve in total
    pub commit_limit: u64,
    /// Caches the registry accepts before creation fails
    pub max_caches: usize,
}

impl VmConfig {
    /// Configuration with `page_count` pages and a matching commit limit
    pub const fn with_pages(page_count: usize) -> Self {
        Self {
            page_count,
            commit_limit: (page_count * PAGE_SIZE) as u64,
            max_caches: DEFAULT_MAX_CACHES,
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::with_pages(DEFAULT_PAGE_COUNT)
    }
}
