//! Modified Page Writer
//!
//! Writes the modified pages of a cache back to its store. Each page is
//! marked busy for the duration of its write and the cache lock is given
//! up while the store does the I/O; the cache is pinned by a reference
//! meanwhile so it can neither be merged away nor deleted.
//!
//! A truncation that hits a page under write-back clears the page's
//! `busy_writing` flag instead of waiting. The writer notices once it is
//! back and frees the page itself.

use alloc::vec::Vec;

use crate::mm::area::mm_remove_all_page_mappings;
use crate::mm::cache::{LockedCache, PageEvents};
use crate::mm::config::PAGE_SIZE;
use crate::mm::error::{VmError, VmResult};
use crate::mm::pfn::{PageId, PageState};

/// Write back every modified, non-busy page of a locked cache
///
/// Returns the number of pages written. Pages that fail to write stay
/// modified; the first error is returned after all pages were tried. A
/// modified page the store cannot write fails with `NotSupported`.
pub fn mm_write_modified_pages(cache: &mut LockedCache) -> VmResult<usize> {
    let vm = alloc::sync::Arc::clone(cache.cache().context());
    let pfn = vm.pfn();
    let id = cache.id();

    let candidates: Vec<(u64, PageId)> = cache
        .pages()
        .filter(|&(_, page)| {
            let entry = pfn.page(page);
            entry.state() == PageState::Modified && !entry.is_busy()
        })
        .collect();

    let mut written = 0;
    let mut first_error = None;

    for (index, page) in candidates {
        let entry = pfn.page(page);

        // The lock was dropped for earlier writes; the page may be gone
        let still_ours = entry.cache_id() == Some(id)
            && entry.cache_offset() == index
            && entry.state() == PageState::Modified
            && !entry.is_busy();
        if !still_ours {
            continue;
        }

        let offset = index * PAGE_SIZE as u64;
        let length = cache
            .virtual_end()
            .saturating_sub(offset)
            .min(PAGE_SIZE as u64) as usize;
        if length == 0 {
            // Nothing of the page is inside the cache; there is no data to keep
            entry.set_state(clean_state(entry.is_mapped()));
            continue;
        }

        if !cache.can_write_page(offset) {
            first_error.get_or_insert(VmError::NotSupported);
            continue;
        }

        entry.set_busy(true);
        entry.set_busy_writing(true);
        let data = entry.data()[..length].to_vec();

        let result = cache.write_unlocked(offset, &data);

        if !entry.is_busy_writing() {
            // Truncated while we were writing
            log::debug!(
                "[WRITEBACK] Page {} of cache {} truncated during write",
                page.0,
                id.0
            );
            mm_remove_all_page_mappings(pfn, page);
            cache.remove_page(page);
            entry.set_busy(false);
            pfn.free_page(page);
            cache.notify_page_events(page, PageEvents::NOT_BUSY);
            continue;
        }

        entry.set_busy_writing(false);
        match result {
            Ok(_) => {
                entry.set_state(clean_state(entry.is_mapped()));
                written += 1;
            }
            Err(error) => {
                log::warn!(
                    "[WRITEBACK] Writing page {} of cache {} failed: {}",
                    page.0,
                    id.0,
                    error
                );
                first_error.get_or_insert(error);
            }
        }
        cache.mark_page_unbusy(page);
    }

    if written > 0 {
        log::debug!("[WRITEBACK] Cache {}: {} pages written", id.0, written);
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(written),
    }
}

/// State of a page whose contents match its store
fn clean_state(mapped: bool) -> PageState {
    if mapped {
        PageState::Active
    } else {
        PageState::Cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::cache::{CacheFactory, MemoryVnode};
    use crate::mm::config::VmConfig;
    use crate::mm::context::VmContext;
    use core::sync::atomic::Ordering;

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_writes_modified_pages_only() {
        let vm = VmContext::new(VmConfig::with_pages(8));
        let vnode = MemoryVnode::new(2 * PAGE as usize);
        let cache = CacheFactory::create_vnode_cache(&vm, vnode.clone()).unwrap();

        let dirty = vm.pfn().allocate_page(PageState::Modified).unwrap();
        let clean = vm.pfn().allocate_page(PageState::Active).unwrap();
        vm.pfn().page(dirty).data().fill(0x5A);
        vm.pfn().page(clean).data().fill(0x11);

        let mut locked = cache.lock();
        locked.insert_page(dirty, 0);
        locked.insert_page(clean, PAGE);

        assert_eq!(mm_write_modified_pages(&mut locked), Ok(1));
        assert_eq!(vm.pfn().page(dirty).state(), PageState::Cached);
        assert!(!vm.pfn().page(dirty).is_busy());

        let data = vnode.data.lock().unwrap();
        assert!(data[..PAGE as usize].iter().all(|&b| b == 0x5A));
        assert!(data[PAGE as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_clipped_to_file_size() {
        let vm = VmContext::new(VmConfig::with_pages(8));
        let vnode = MemoryVnode::new(100);
        let cache = CacheFactory::create_vnode_cache(&vm, vnode.clone()).unwrap();
        let page = vm.pfn().allocate_page(PageState::Modified).unwrap();

        let mut locked = cache.lock();
        locked.insert_page(page, 0);
        assert_eq!(mm_write_modified_pages(&mut locked), Ok(1));
        assert_eq!(vnode.data.lock().unwrap().len(), 100);
    }

    #[test]
    fn test_failed_write_leaves_page_modified() {
        let vm = VmContext::new(VmConfig::with_pages(8));
        let vnode = MemoryVnode::new(PAGE as usize);
        vnode.fail_writes.store(true, Ordering::SeqCst);
        let cache = CacheFactory::create_vnode_cache(&vm, vnode.clone()).unwrap();
        let page = vm.pfn().allocate_page(PageState::Modified).unwrap();

        let mut locked = cache.lock();
        locked.insert_page(page, 0);
        assert_eq!(mm_write_modified_pages(&mut locked), Err(VmError::Io(-5)));
        assert_eq!(vm.pfn().page(page).state(), PageState::Modified);
        assert!(!vm.pfn().page(page).is_busy());
        assert_eq!(locked.ref_count(), 1);
    }

    #[test]
    fn test_mapped_page_becomes_active() {
        use crate::mm::area::{AreaProtection, VmArea};

        let vm = VmContext::new(VmConfig::with_pages(8));
        let vnode = MemoryVnode::new(PAGE as usize);
        let cache = CacheFactory::create_vnode_cache(&vm, vnode).unwrap();
        let page = vm.pfn().allocate_page(PageState::Modified).unwrap();
        let area = VmArea::new(0, PAGE, 0, AreaProtection::READ | AreaProtection::WRITE);

        let mut locked = cache.lock();
        locked.insert_area_locked(&area);
        locked.insert_page(page, 0);
        area.map_page(vm.pfn(), 0, page).unwrap();

        assert_eq!(mm_write_modified_pages(&mut locked), Ok(1));
        assert_eq!(vm.pfn().page(page).state(), PageState::Active);
    }

    #[test]
    fn test_write_modified_skips_temporary_caches() {
        let vm = VmContext::new(VmConfig::with_pages(8));
        let cache = CacheFactory::create_anonymous_cache(&vm, false, 0, 0, false).unwrap();
        let page = vm.pfn().allocate_page(PageState::Modified).unwrap();
        {
            let mut locked = cache.lock();
            locked.resize(PAGE).unwrap();
            locked.insert_page(page, 0);
        }

        // The store cannot write, but temporary caches are never written
        assert_eq!(cache.write_modified(), Ok(()));
        cache.lock().set_temporary(false);
        assert_eq!(cache.write_modified(), Err(VmError::NotSupported));
    }

    #[test]
    fn test_page_past_end_becomes_clean_without_write() {
        let vm = VmContext::new(VmConfig::with_pages(8));
        let vnode = MemoryVnode::new(100);
        let cache = CacheFactory::create_vnode_cache(&vm, vnode.clone()).unwrap();
        let page = vm.pfn().allocate_page(PageState::Modified).unwrap();

        let mut locked = cache.lock();
        locked.insert_page(page, PAGE);
        assert_eq!(mm_write_modified_pages(&mut locked), Ok(0));
        assert_eq!(vm.pfn().page(page).state(), PageState::Cached);
        assert!(!vm.pfn().page(page).is_busy());
        assert_eq!(vnode.data.lock().unwrap().len(), 100);
    }
}
