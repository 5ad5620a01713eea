//! Page ownership operations of a locked cache
//!
//! Inserting, removing and moving pages, plus the operations that drop
//! whole ranges of pages: resize, rebase, discard and flush.

use alloc::sync::Arc;

use super::events::PageEvents;
use super::{CacheState, LockedCache, VmCache};
use crate::bugcheck;
use crate::ke::bugcheck::{codes, mm_subcodes};
use crate::mm::area::mm_remove_all_page_mappings;
use crate::mm::config::{page_index, pages_for};
use crate::mm::error::{VmError, VmResult};
use crate::mm::pfn::{PageId, PageState, PfnDatabase};
use crate::mm::writeback::mm_write_modified_pages;

/// Move a page between two locked caches, keeping its offset
pub(super) fn move_page_between(
    pfn: &PfnDatabase,
    from: &VmCache,
    from_state: &mut CacheState,
    to: &VmCache,
    to_state: &mut CacheState,
    page: PageId,
) {
    let entry = pfn.page(page);
    let index = entry.cache_offset();

    if entry.cache_id() != Some(from.id) || from_state.pages.get(&index) != Some(&page) {
        bugcheck!(
            codes::MEMORY_MANAGEMENT,
            mm_subcodes::PAGE_CACHE_MISMATCH,
            from.id.0,
            page.0,
            entry.cache_id().map_or(u32::MAX, |id| id.0)
        );
    }
    if let Some(&resident) = to_state.pages.get(&index) {
        bugcheck!(
            codes::MEMORY_MANAGEMENT,
            mm_subcodes::PAGE_OFFSET_OCCUPIED,
            to.id.0,
            index,
            resident.0
        );
    }

    from_state.pages.remove(&index);
    to_state.pages.insert(index, page);
    entry.set_cache(Some(to.id));

    log::trace!(
        "[CACHE] Moved page {} (index {}) from cache {} to cache {}",
        page.0,
        index,
        from.id.0,
        to.id.0
    );
}

impl LockedCache {
    /// Look up the page at a byte offset
    pub fn lookup_page(&self, offset: u64) -> Option<PageId> {
        let page = *self.pages.get(&page_index(offset))?;

        let owner = self.cache.vm.pfn().page(page).cache_id();
        if owner != Some(self.id()) {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_CACHE_MISMATCH,
                self.id().0,
                page.0,
                owner.map_or(u32::MAX, |id| id.0)
            );
        }
        Some(page)
    }

    /// Insert an unowned page at a byte offset
    pub fn insert_page(&mut self, page: PageId, offset: u64) {
        let vm = Arc::clone(&self.cache.vm);
        let id = self.id();
        let entry = vm.pfn().page(page);
        let index = page_index(offset);

        if let Some(owner) = entry.cache_id() {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_ALREADY_OWNED,
                id.0,
                page.0,
                owner.0
            );
        }
        if let Some(&resident) = self.pages.get(&index) {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_OFFSET_OCCUPIED,
                id.0,
                index,
                resident.0
            );
        }

        entry.set_cache_offset(index);
        self.state_mut().pages.insert(index, page);
        entry.set_cache(Some(id));

        log::trace!("[CACHE] Inserted page {} at index {} into cache {}", page.0, index, id.0);
    }

    /// Detach a page from this cache without freeing it
    pub fn remove_page(&mut self, page: PageId) {
        let vm = Arc::clone(&self.cache.vm);
        let id = self.id();
        let entry = vm.pfn().page(page);
        let index = entry.cache_offset();

        if entry.cache_id() != Some(id) || self.pages.get(&index) != Some(&page) {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_CACHE_MISMATCH,
                id.0,
                page.0,
                entry.cache_id().map_or(u32::MAX, |owner| owner.0)
            );
        }

        self.state_mut().pages.remove(&index);
        entry.set_cache(None);

        log::trace!("[CACHE] Removed page {} from cache {}", page.0, id.0);
    }

    /// Move a page from `from` into this cache; both caches are locked
    pub fn move_page(&mut self, from: &mut LockedCache, page: PageId) {
        let vm = Arc::clone(&self.cache.vm);
        let (from_cache, from_state) = from.parts();
        let (to_cache, to_state) = self.parts();
        move_page_between(vm.pfn(), from_cache, from_state, to_cache, to_state, page);
    }

    /// Take over every page of `from`; this cache must be empty
    pub fn move_all_pages(&mut self, from: &mut LockedCache) {
        if !self.pages.is_empty() {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::PAGE_OFFSET_OCCUPIED,
                self.id().0,
                u64::MAX,
                self.pages.len()
            );
        }

        let vm = Arc::clone(&self.cache.vm);
        let id = self.id();
        let pages = core::mem::take(&mut from.state_mut().pages);

        // Page owners flip while page lookups are held off
        vm.caches().synchronized(|| {
            for &page in pages.values() {
                vm.pfn().page(page).set_cache(Some(id));
            }
        });

        log::debug!(
            "[CACHE] Moved {} pages from cache {} to cache {}",
            pages.len(),
            from.id().0,
            id.0
        );
        self.state_mut().pages = pages;
    }

    /// Change the end of the cache
    ///
    /// Shrinking frees every page beyond the new end, unmapping it from all
    /// areas first. Busy pages are waited for. A wired page beyond the new
    /// end makes the resize fail with `Busy` before anything changes.
    pub fn resize(&mut self, new_size: u64) -> VmResult<()> {
        let virtual_base = self.virtual_base;
        if new_size < virtual_base {
            return Err(VmError::InvalidParameter);
        }

        let old_page_count = pages_for(self.virtual_end);
        let new_page_count = pages_for(new_size);
        let shrinking = new_page_count < old_page_count;

        if shrinking {
            self.refuse_wired_pages(new_page_count, u64::MAX)?;
        }

        self.commit(new_size - virtual_base)?;

        if shrinking {
            let freed = self.free_page_range(new_page_count, u64::MAX);
            log::debug!(
                "[CACHE] Cache {} resized to {:#x}, {} pages freed",
                self.id().0,
                new_size,
                freed
            );
        }

        self.state_mut().virtual_end = new_size;
        Ok(())
    }

    /// Change the start of the cache
    ///
    /// The mirror of `resize`: every page below the new base is freed.
    pub fn rebase(&mut self, new_base: u64) -> VmResult<()> {
        let virtual_end = self.virtual_end;
        if new_base > virtual_end {
            return Err(VmError::InvalidParameter);
        }

        let base_page = page_index(new_base);
        let raising = new_base > self.virtual_base;

        if raising {
            self.refuse_wired_pages(0, base_page)?;
        }

        self.commit(virtual_end - new_base)?;

        if raising {
            let freed = self.free_page_range(0, base_page);
            log::debug!(
                "[CACHE] Cache {} rebased to {:#x}, {} pages freed",
                self.id().0,
                new_base,
                freed
            );
        }

        self.state_mut().virtual_base = new_base;
        Ok(())
    }

    /// Free the pages in `[offset, offset + size)` without changing the range
    pub fn discard(&mut self, offset: u64, size: u64) -> VmResult<()> {
        let start = page_index(offset);
        let end = pages_for(offset.saturating_add(size));

        self.refuse_wired_pages(start, end)?;
        let freed = self.free_page_range(start, end);

        log::debug!(
            "[CACHE] Cache {} discarded {:#x}+{:#x}, {} pages freed",
            self.id().0,
            offset,
            size,
            freed
        );
        Ok(())
    }

    /// Write back and free every page
    ///
    /// Fails with `Busy` if a page is wired or still mapped; nothing has
    /// been freed in that case unless the page changed during a wait.
    pub fn flush_and_remove_all_pages(&mut self) -> VmResult<()> {
        let vm = Arc::clone(&self.cache.vm);
        let pfn = vm.pfn();

        while !self.pages.is_empty() {
            let pinned = self.pages.values().copied().find(|&page| {
                let entry = pfn.page(page);
                !entry.is_busy() && (entry.wired_count() != 0 || entry.is_mapped())
            });
            if let Some(page) = pinned {
                log::warn!(
                    "[CACHE] Cache {} cannot be flushed: page {} in use",
                    self.id().0,
                    page.0
                );
                return Err(VmError::Busy);
            }

            mm_write_modified_pages(self)?;

            let mut cursor = 0;
            while let Some((index, page)) = self.next_page(cursor, u64::MAX) {
                cursor = index + 1;
                let entry = pfn.page(page);

                if entry.is_busy() {
                    self.wait_for_page_events_in_place(page, PageEvents::NOT_BUSY);
                    cursor = 0;
                    continue;
                }

                // Written back in the next round
                if entry.state() == PageState::Modified {
                    continue;
                }

                if entry.wired_count() != 0 || entry.is_mapped() {
                    return Err(VmError::Busy);
                }

                self.remove_page(page);
                pfn.free_page(page);
            }
        }

        Ok(())
    }

    /// First resident page with an index in `[start, end)`
    fn next_page(&self, start: u64, end: u64) -> Option<(u64, PageId)> {
        if start >= end {
            return None;
        }
        self.pages
            .range(start..end)
            .next()
            .map(|(&index, &page)| (index, page))
    }

    /// Fail with `Busy` if a page with an index in `[start, end)` is wired
    fn refuse_wired_pages(&self, start: u64, end: u64) -> VmResult<()> {
        if start >= end {
            return Ok(());
        }

        let pfn = self.cache.vm.pfn();
        let wired = self
            .pages
            .range(start..end)
            .find(|&(_, &page)| pfn.page(page).wired_count() != 0);

        match wired {
            Some((&index, &page)) => {
                log::warn!(
                    "[CACHE] Cache {}: wired page {} at index {} blocks truncation",
                    self.id().0,
                    page.0,
                    index
                );
                Err(VmError::Busy)
            }
            None => Ok(()),
        }
    }

    /// Unmap and free every page with an index in `[start, end)`
    ///
    /// Busy pages are waited for and the scan restarts. A page being
    /// written back is left to the writer, which frees it once the write
    /// completes. Returns the number of pages freed here.
    fn free_page_range(&mut self, start: u64, end: u64) -> usize {
        let vm = Arc::clone(&self.cache.vm);
        let pfn = vm.pfn();
        let mut freed = 0;
        let mut cursor = start;

        while let Some((index, page)) = self.next_page(cursor, end) {
            cursor = index + 1;
            let entry = pfn.page(page);

            if entry.is_busy() {
                if entry.is_busy_writing() {
                    entry.set_busy_writing(false);
                } else {
                    self.wait_for_page_events_in_place(page, PageEvents::NOT_BUSY);
                    cursor = start;
                }
                continue;
            }

            mm_remove_all_page_mappings(pfn, page);
            if entry.wired_count() != 0 {
                bugcheck!(
                    codes::MEMORY_MANAGEMENT,
                    mm_subcodes::PAGE_STILL_IN_USE,
                    self.id().0,
                    page.0,
                    entry.wired_count()
                );
            }

            self.remove_page(page);
            pfn.free_page(page);
            freed += 1;
        }

        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::area::{AreaProtection, VmArea};
    use crate::mm::cache::CacheFactory;
    use crate::mm::config::{VmConfig, PAGE_SIZE};
    use crate::mm::context::VmContext;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn setup(pages: u64) -> (Arc<VmContext>, Arc<VmCache>, alloc::vec::Vec<PageId>) {
        let vm = VmContext::new(VmConfig::with_pages(32));
        let cache = CacheFactory::create_anonymous_cache(&vm, false, 0, 0, false).unwrap();
        let mut ids = alloc::vec::Vec::new();
        {
            let mut locked = cache.lock();
            locked.resize(pages * PAGE).unwrap();
            for index in 0..pages {
                let page = vm.pfn().allocate_page(PageState::Active).unwrap();
                locked.insert_page(page, index * PAGE);
                ids.push(page);
            }
        }
        (vm, cache, ids)
    }

    #[test]
    fn test_insert_lookup_remove() {
        let (vm, cache, ids) = setup(2);
        let mut locked = cache.lock();

        assert_eq!(locked.page_count(), 2);
        assert_eq!(locked.lookup_page(PAGE + 100), Some(ids[1]));
        assert_eq!(locked.lookup_page(2 * PAGE), None);
        assert_eq!(vm.pfn().page(ids[1]).cache_offset(), 1);

        locked.remove_page(ids[0]);
        assert_eq!(locked.page_count(), 1);
        assert_eq!(locked.lookup_page(0), None);
        assert!(vm.pfn().page(ids[0]).cache_id().is_none());

        vm.pfn().free_page(ids[0]);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_insert_owned_page_bugchecks() {
        let (_vm, cache, ids) = setup(1);
        let mut locked = cache.lock();
        locked.insert_page(ids[0], 3 * PAGE);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_insert_occupied_offset_bugchecks() {
        let (vm, cache, _ids) = setup(1);
        let page = vm.pfn().allocate_page(PageState::Active).unwrap();
        let mut locked = cache.lock();
        locked.insert_page(page, 0);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_remove_foreign_page_bugchecks() {
        let (vm, cache, _ids) = setup(1);
        let stray = vm.pfn().allocate_page(PageState::Active).unwrap();
        let mut locked = cache.lock();
        locked.remove_page(stray);
    }

    #[test]
    fn test_move_page_and_move_all_pages() {
        let (vm, from, ids) = setup(3);
        let to = CacheFactory::create_anonymous_cache(&vm, false, 0, 0, false).unwrap();

        let mut locked_to = to.lock();
        let mut locked_from = from.lock();

        locked_to.move_page(&mut locked_from, ids[1]);
        assert_eq!(locked_to.lookup_page(PAGE), Some(ids[1]));
        assert_eq!(locked_from.lookup_page(PAGE), None);
        assert_eq!(vm.pfn().page(ids[1]).cache_id(), Some(to.id()));

        let other = CacheFactory::create_anonymous_cache(&vm, false, 0, 0, false).unwrap();
        let mut locked_other = other.lock();
        locked_other.move_all_pages(&mut locked_from);
        assert_eq!(locked_other.page_count(), 2);
        assert_eq!(locked_from.page_count(), 0);
        for page in [ids[0], ids[2]] {
            assert_eq!(vm.pfn().page(page).cache_id(), Some(other.id()));
        }
    }

    #[test]
    fn test_resize_grow_keeps_pages() {
        let (_vm, cache, _ids) = setup(2);
        let mut locked = cache.lock();
        locked.resize(8 * PAGE).unwrap();
        assert_eq!(locked.page_count(), 2);
        assert_eq!(locked.virtual_end(), 8 * PAGE);
        assert_eq!(locked.committed_size(), 8 * PAGE);
    }

    #[test]
    fn test_resize_refuses_wired_page() {
        let (vm, cache, ids) = setup(4);
        vm.pfn().page(ids[3]).wire();

        let mut locked = cache.lock();
        assert_eq!(locked.resize(2 * PAGE), Err(VmError::Busy));
        assert_eq!(locked.page_count(), 4);
        assert_eq!(locked.virtual_end(), 4 * PAGE);

        vm.pfn().page(ids[3]).unwire();
        locked.resize(2 * PAGE).unwrap();
        assert_eq!(locked.page_count(), 2);
    }

    #[test]
    fn test_resize_below_base_is_invalid() {
        let (_vm, cache, _ids) = setup(4);
        let mut locked = cache.lock();
        locked.rebase(2 * PAGE).unwrap();
        assert_eq!(locked.resize(PAGE), Err(VmError::InvalidParameter));
    }

    #[test]
    fn test_resize_leaves_busy_writing_page_to_writer() {
        let (vm, cache, ids) = setup(2);
        let entry = vm.pfn().page(ids[1]);
        entry.set_busy(true);
        entry.set_busy_writing(true);

        let mut locked = cache.lock();
        locked.resize(PAGE).unwrap();
        assert!(!entry.is_busy_writing());
        assert_eq!(locked.lookup_page(PAGE), Some(ids[1]));
        assert_eq!(locked.virtual_end(), PAGE);
    }

    #[test]
    fn test_rebase_frees_low_pages() {
        let (vm, cache, ids) = setup(4);
        let mut locked = cache.lock();

        locked.rebase(2 * PAGE).unwrap();
        assert_eq!(locked.virtual_base(), 2 * PAGE);
        assert_eq!(locked.page_count(), 2);
        assert_eq!(locked.committed_size(), 2 * PAGE);
        assert_eq!(vm.pfn().page(ids[0]).state(), PageState::Free);
        assert_eq!(locked.lookup_page(2 * PAGE), Some(ids[2]));
        assert_eq!(locked.rebase(8 * PAGE), Err(VmError::InvalidParameter));
    }

    #[test]
    fn test_discard_range() {
        let (vm, cache, ids) = setup(4);
        let area = VmArea::new(0x10_0000, 4 * PAGE, 0, AreaProtection::READ);
        area.map_page(vm.pfn(), 1, ids[1]).unwrap();

        let mut locked = cache.lock();
        locked.discard(PAGE, 2 * PAGE).unwrap();
        assert_eq!(locked.page_count(), 2);
        assert_eq!(locked.lookup_page(PAGE), None);
        assert_eq!(locked.lookup_page(2 * PAGE), None);
        assert_eq!(locked.virtual_end(), 4 * PAGE);
        assert_eq!(area.mapped_count(), 0);

        vm.pfn().page(ids[3]).wire();
        assert_eq!(locked.discard(3 * PAGE, PAGE), Err(VmError::Busy));
        vm.pfn().page(ids[3]).unwire();
    }

    #[test]
    fn test_flush_frees_clean_pages() {
        let (vm, cache, ids) = setup(3);
        {
            let mut locked = cache.lock();
            locked.set_temporary(false);
            locked.flush_and_remove_all_pages().unwrap();
            assert_eq!(locked.page_count(), 0);
        }
        for page in ids {
            assert_eq!(vm.pfn().page(page).state(), PageState::Free);
        }
    }

    #[test]
    fn test_flush_refuses_unwritable_modified_page() {
        let (vm, cache, ids) = setup(2);
        vm.pfn().page(ids[0]).set_state(PageState::Modified);

        let mut locked = cache.lock();
        assert_eq!(locked.flush_and_remove_all_pages(), Err(VmError::NotSupported));
        assert_eq!(locked.lookup_page(0), Some(ids[0]));
    }
}
