//! Page Frame Number (PFN) Database
//!
//! The PFN database tracks the state of every physical page a memory
//! manager context owns. Each entry (`VmPage`) contains:
//! - Page state (free, clear, active, modified, etc.)
//! - Busy flags for pages being paged in or written back
//! - The owning cache and the page's offset in it
//! - Wired count and the list of areas mapping the page
//! - The page contents
//!
//! # Page States
//! - Free: Available for allocation
//! - Clear: Free and zero-filled
//! - Active: Owned by a cache and recently used
//! - Inactive: Owned by a cache, candidate for reclaim
//! - Modified: Contents differ from the backing store
//! - Cached: Clean copy of backing store data
//! - Wired: Pinned, can neither be reclaimed nor discarded
//! - Unused: Allocated but not yet placed in a cache
//!
//! # Ownership
//!
//! A page belongs to at most one cache at a time. The owner is recorded in
//! the page itself and only ever changed by a thread holding the owning
//! cache's lock, so anyone who locks a cache and then finds the page still
//! pointing at it knows the assignment is stable.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use spin::{Mutex, MutexGuard};

use crate::bugcheck;
use crate::ke::bugcheck::{codes, mm_subcodes};
use crate::mm::area::VmArea;
use crate::mm::cache::CacheId;
use crate::mm::config::PAGE_SIZE;
use crate::mm::error::{VmError, VmResult};

/// Raw owner value of a page no cache owns
const NO_OWNER: u32 = u32::MAX;

/// Handle of a page in the PFN database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl PageId {
    /// Index into the PFN database
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Page states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PageState {
    /// Page is on the free list
    #[default]
    Free = 0,
    /// Page is free and zero-filled
    Clear = 1,
    /// Page is owned and in use
    Active = 2,
    /// Page is owned but has not been used lately
    Inactive = 3,
    /// Page has data that must be written back
    Modified = 4,
    /// Page is a clean copy of its backing store
    Cached = 5,
    /// Page is pinned in memory
    Wired = 6,
    /// Page is allocated but not yet placed anywhere
    Unused = 7,
}

impl PageState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Clear,
            2 => Self::Active,
            3 => Self::Inactive,
            4 => Self::Modified,
            5 => Self::Cached,
            6 => Self::Wired,
            _ => Self::Unused,
        }
    }

    /// Check if the state is one of the free list states
    pub fn is_free(self) -> bool {
        matches!(self, Self::Free | Self::Clear)
    }
}

/// Page Frame Number database entry
///
/// One entry exists for each physical page of the context.
pub struct VmPage {
    /// Page frame number
    pfn: u32,
    /// Current `PageState`
    state: AtomicU8,
    /// Page is being paged in or written back
    busy: AtomicBool,
    /// Page is being written back; cleared by a truncation to ask the
    /// writer to free the page when it is done
    busy_writing: AtomicBool,
    /// Owning cache (raw `CacheId`)
    cache: AtomicU32,
    /// Page index inside the owning cache
    cache_offset: AtomicU64,
    /// Number of wirings
    wired_count: AtomicU16,
    /// Areas currently mapping the page
    mappings: Mutex<Vec<Arc<VmArea>>>,
    /// Page contents
    data: Mutex<Box<[u8]>>,
}

impl VmPage {
    fn new(pfn: u32) -> Self {
        Self {
            pfn,
            state: AtomicU8::new(PageState::Free as u8),
            busy: AtomicBool::new(false),
            busy_writing: AtomicBool::new(false),
            cache: AtomicU32::new(NO_OWNER),
            cache_offset: AtomicU64::new(0),
            wired_count: AtomicU16::new(0),
            mappings: Mutex::new(Vec::new()),
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    /// Page frame number
    #[inline]
    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    /// Handle of this page
    #[inline]
    pub fn id(&self) -> PageId {
        PageId(self.pfn)
    }

    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    #[inline]
    pub fn is_busy_writing(&self) -> bool {
        self.busy_writing.load(Ordering::Acquire)
    }

    pub fn set_busy_writing(&self, busy_writing: bool) {
        self.busy_writing.store(busy_writing, Ordering::Release);
    }

    /// Cache currently owning the page
    pub fn cache_id(&self) -> Option<CacheId> {
        match self.cache.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(CacheId(raw)),
        }
    }

    /// Record the owning cache; only the owner's lock holder may call this
    pub(crate) fn set_cache(&self, cache: Option<CacheId>) {
        let raw = cache.map_or(NO_OWNER, |id| id.0);
        self.cache.store(raw, Ordering::Release);
    }

    /// Page index inside the owning cache
    pub fn cache_offset(&self) -> u64 {
        self.cache_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_cache_offset(&self, page_index: u64) {
        self.cache_offset.store(page_index, Ordering::Release);
    }

    pub fn wired_count(&self) -> u16 {
        self.wired_count.load(Ordering::Acquire)
    }

    /// Pin the page in memory
    pub fn wire(&self) {
        self.wired_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one wiring
    pub fn unwire(&self) {
        let previous = self.wired_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_STILL_IN_USE,
                NO_OWNER,
                self.pfn,
                0
            );
        }
    }

    /// Check if any area maps the page
    pub fn is_mapped(&self) -> bool {
        !self.mappings.lock().is_empty()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    pub(crate) fn add_mapping(&self, area: Arc<VmArea>) {
        self.mappings.lock().push(area);
    }

    pub(crate) fn remove_mapping(&self, area: &VmArea) {
        self.mappings
            .lock()
            .retain(|mapped| !core::ptr::eq(Arc::as_ptr(mapped), area));
    }

    /// Detach the mapping list, leaving it empty
    pub(crate) fn take_mappings(&self) -> Vec<Arc<VmArea>> {
        core::mem::take(&mut *self.mappings.lock())
    }

    /// Access the page contents
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }
}

/// Free list heads
struct PageLists {
    free: Vec<PageId>,
    clear: Vec<PageId>,
}

/// Per-state page counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PfnStats {
    pub total_pages: u32,
    pub free_pages: u32,
    pub clear_pages: u32,
    pub active_pages: u32,
    pub inactive_pages: u32,
    pub modified_pages: u32,
    pub cached_pages: u32,
    pub wired_pages: u32,
    pub unused_pages: u32,
    pub busy_pages: u32,
    pub owned_pages: u32,
}

impl PfnStats {
    pub fn total_bytes(&self) -> u64 {
        self.total_pages as u64 * PAGE_SIZE as u64
    }

    pub fn free_bytes(&self) -> u64 {
        (self.free_pages + self.clear_pages) as u64 * PAGE_SIZE as u64
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes() - self.free_bytes()
    }
}

// ============================================================================
// PFN Database
// ============================================================================

/// The page frame database of one memory manager context
pub struct PfnDatabase {
    pages: Vec<VmPage>,
    lists: Mutex<PageLists>,
}

impl PfnDatabase {
    /// Create a database of `page_count` free pages
    pub fn new(page_count: usize) -> Self {
        let pages: Vec<VmPage> = (0..page_count as u32).map(VmPage::new).collect();
        // Fresh pages are zero-filled
        let clear = (0..page_count as u32).rev().map(PageId).collect();
        for page in &pages {
            page.set_state(PageState::Clear);
        }

        log::info!("[PFN] Page database initialized: {} pages", page_count);

        Self {
            pages,
            lists: Mutex::new(PageLists {
                free: Vec::new(),
                clear,
            }),
        }
    }

    /// Number of pages in the database
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Get a page entry by handle
    pub fn page(&self, id: PageId) -> &VmPage {
        match self.pages.get(id.index()) {
            Some(page) => page,
            None => bugcheck!(
                codes::PFN_LIST_CORRUPT,
                mm_subcodes::PAGE_OUT_OF_RANGE,
                id.0,
                self.pages.len()
            ),
        }
    }

    /// Allocate a page and put it into `state`
    ///
    /// The clear list is tried first; a page taken from the free list is
    /// zero-filled before it is handed out.
    pub fn allocate_page(&self, state: PageState) -> VmResult<PageId> {
        if state.is_free() {
            return Err(VmError::InvalidParameter);
        }

        let (id, needs_zeroing) = {
            let mut lists = self.lists.lock();
            if let Some(id) = lists.clear.pop() {
                (id, false)
            } else if let Some(id) = lists.free.pop() {
                (id, true)
            } else {
                log::warn!("[PFN] Out of pages");
                return Err(VmError::NoMemory);
            }
        };

        let page = self.page(id);
        if needs_zeroing {
            page.data().fill(0);
        }
        page.set_busy(false);
        page.set_busy_writing(false);
        page.set_state(state);

        log::trace!("[PFN] Allocated page {} ({})", id.0, mm_page_state_name(state));
        Ok(id)
    }

    /// Return a page to the free list
    ///
    /// The page must not be owned by a cache, mapped or wired.
    pub fn free_page(&self, id: PageId) {
        let page = self.page(id);
        let state = page.state();

        if state.is_free() {
            bugcheck!(
                codes::PFN_LIST_CORRUPT,
                mm_subcodes::PAGE_DOUBLE_FREE,
                id.0,
                state as u8
            );
        }
        if let Some(owner) = page.cache_id() {
            bugcheck!(
                codes::PFN_LIST_CORRUPT,
                mm_subcodes::PAGE_FREED_WHILE_OWNED,
                id.0,
                owner.0
            );
        }
        if page.is_mapped() || page.wired_count() > 0 {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_STILL_IN_USE,
                NO_OWNER,
                id.0,
                page.wired_count()
            );
        }

        page.set_busy(false);
        page.set_busy_writing(false);
        page.set_cache_offset(0);
        page.set_state(PageState::Free);
        self.lists.lock().free.push(id);

        log::trace!("[PFN] Freed page {}", id.0);
    }

    /// Zero every page on the free list and move it to the clear list
    ///
    /// Returns the number of pages cleared.
    pub fn zero_free_pages(&self) -> usize {
        let dirty = core::mem::take(&mut self.lists.lock().free);
        for &id in &dirty {
            let page = self.page(id);
            page.data().fill(0);
            page.set_state(PageState::Clear);
        }

        let count = dirty.len();
        self.lists.lock().clear.extend(dirty);
        count
    }

    /// Pages available for allocation
    pub fn available_pages(&self) -> usize {
        let lists = self.lists.lock();
        lists.free.len() + lists.clear.len()
    }

    /// Get per-state statistics by scanning the database
    pub fn stats(&self) -> PfnStats {
        let mut stats = PfnStats {
            total_pages: self.pages.len() as u32,
            ..PfnStats::default()
        };

        for page in &self.pages {
            match page.state() {
                PageState::Free => stats.free_pages += 1,
                PageState::Clear => stats.clear_pages += 1,
                PageState::Active => stats.active_pages += 1,
                PageState::Inactive => stats.inactive_pages += 1,
                PageState::Modified => stats.modified_pages += 1,
                PageState::Cached => stats.cached_pages += 1,
                PageState::Wired => stats.wired_pages += 1,
                PageState::Unused => stats.unused_pages += 1,
            }
            if page.is_busy() {
                stats.busy_pages += 1;
            }
            if page.cache_id().is_some() {
                stats.owned_pages += 1;
            }
        }

        stats
    }
}

/// Get state name
pub fn mm_page_state_name(state: PageState) -> &'static str {
    match state {
        PageState::Free => "Free",
        PageState::Clear => "Clear",
        PageState::Active => "Active",
        PageState::Inactive => "Inactive",
        PageState::Modified => "Modified",
        PageState::Cached => "Cached",
        PageState::Wired => "Wired",
        PageState::Unused => "Unused",
    }
}
