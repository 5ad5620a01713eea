//! Busy-page wait protocol
//!
//! A thread that needs a page to leave the busy state queues a waiter on
//! the owning cache, drops the cache lock and blocks. Whoever changes the
//! page in a way matching the waiter's event mask calls
//! `notify_page_events`, which unblocks and dequeues every match.

use alloc::sync::Arc;

use super::LockedCache;
use crate::bugcheck;
use crate::ke::bugcheck::{codes, mm_subcodes};
use crate::ke::KWaitBlock;
use crate::mm::pfn::PageId;

bitflags::bitflags! {
    /// Page events a thread can wait for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageEvents: u32 {
        /// The page is no longer busy
        const NOT_BUSY = 0x01;
    }
}

/// A thread blocked on events of one page
pub struct PageEventWaiter {
    page: PageId,
    events: PageEvents,
    wait_block: Arc<KWaitBlock>,
}

impl PageEventWaiter {
    #[inline]
    pub fn page(&self) -> PageId {
        self.page
    }

    #[inline]
    pub fn events(&self) -> PageEvents {
        self.events
    }
}

impl LockedCache {
    fn enqueue_waiter(&mut self, page: PageId, events: PageEvents) -> Arc<KWaitBlock> {
        let wait_block = Arc::new(KWaitBlock::new());
        self.state_mut().page_event_waiters.push(PageEventWaiter {
            page,
            events,
            wait_block: Arc::clone(&wait_block),
        });
        wait_block
    }

    /// Wait until one of `events` happens to `page`
    ///
    /// The cache is unlocked (with the full unlock path) before the thread
    /// blocks. With `relock` the cache is locked again and returned.
    pub fn wait_for_page_events(
        mut self,
        page: PageId,
        events: PageEvents,
        relock: bool,
    ) -> Option<LockedCache> {
        let wait_block = self.enqueue_waiter(page, events);
        let cache = Arc::clone(&self.cache);

        log::trace!("[CACHE] Waiting for events {:?} of page {}", events, page.0);
        drop(self);
        wait_block.block();

        relock.then(|| cache.lock())
    }

    /// Wait for page events, keeping this guard
    ///
    /// The lock is given up raw for the wait, so no merge can happen in
    /// between; the caller must hold a reference to the cache.
    pub(super) fn wait_for_page_events_in_place(&mut self, page: PageId, events: PageEvents) {
        let wait_block = self.enqueue_waiter(page, events);

        self.cache.lock.release();
        wait_block.block();
        self.cache.lock.acquire();

        if self.deleted {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_USED_AFTER_DELETE,
                self.id().0
            );
        }
    }

    /// Wake every thread waiting for one of `events` on `page`
    ///
    /// Returns the number of threads woken.
    pub fn notify_page_events(&mut self, page: PageId, events: PageEvents) -> usize {
        let mut woken = 0;
        self.state_mut().page_event_waiters.retain(|waiter| {
            if waiter.page == page && waiter.events.intersects(events) {
                waiter.wait_block.unblock();
                woken += 1;
                false
            } else {
                true
            }
        });
        woken
    }

    /// Clear a page's busy flag and wake the threads waiting for that
    pub fn mark_page_unbusy(&mut self, page: PageId) {
        self.cache.vm.pfn().page(page).set_busy(false);
        self.notify_page_events(page, PageEvents::NOT_BUSY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::cache::{CacheFactory, VmCache};
    use crate::mm::config::{VmConfig, PAGE_SIZE};
    use crate::mm::context::VmContext;
    use crate::mm::pfn::PageState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn busy_page_cache() -> (Arc<VmContext>, Arc<VmCache>, PageId) {
        let vm = VmContext::new(VmConfig::with_pages(8));
        let cache = CacheFactory::create_anonymous_cache(&vm, true, 0, 0, false).unwrap();
        let page = vm.pfn().allocate_page(PageState::Active).unwrap();
        {
            let mut locked = cache.lock();
            locked.resize(4 * PAGE).unwrap();
            locked.insert_page(page, 0);
        }
        vm.pfn().page(page).set_busy(true);
        (vm, cache, page)
    }

    #[test]
    fn test_notify_without_waiters() {
        let (_vm, cache, page) = busy_page_cache();
        let mut locked = cache.lock();
        assert_eq!(locked.notify_page_events(page, PageEvents::NOT_BUSY), 0);
    }

    #[test]
    fn test_wait_woken_once_by_mark_unbusy() {
        let (vm, cache, page) = busy_page_cache();
        let woken = Arc::new(AtomicBool::new(false));

        let handle = {
            let cache = Arc::clone(&cache);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                let locked = cache.lock();
                let relocked = locked.wait_for_page_events(page, PageEvents::NOT_BUSY, false);
                assert!(relocked.is_none());
                woken.store(true, Ordering::SeqCst);
            })
        };

        // Wait for the waiter to queue itself
        loop {
            let locked = cache.lock();
            if locked.waiter_count() == 1 {
                break;
            }
        }
        assert!(!woken.load(Ordering::SeqCst));

        {
            let mut locked = cache.lock();
            locked.mark_page_unbusy(page);
            assert_eq!(locked.waiter_count(), 0);
            // A second notify finds nobody
            assert_eq!(locked.notify_page_events(page, PageEvents::NOT_BUSY), 0);
        }

        handle.join().unwrap();
        assert!(woken.load(Ordering::SeqCst));
        assert!(!vm.pfn().page(page).is_busy());
    }

    #[test]
    fn test_wait_with_relock_returns_locked_cache() {
        let (_vm, cache, page) = busy_page_cache();

        let handle = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let locked = cache.lock();
                let relocked = locked
                    .wait_for_page_events(page, PageEvents::NOT_BUSY, true)
                    .unwrap();
                assert!(relocked.cache().is_locked());
                relocked.lookup_page(0)
            })
        };

        loop {
            let locked = cache.lock();
            if locked.waiter_count() == 1 {
                break;
            }
        }
        cache.lock().mark_page_unbusy(page);

        assert_eq!(handle.join().unwrap(), Some(page));
        assert!(!cache.is_locked());
    }

    #[test]
    fn test_resize_waits_for_busy_page() {
        let (vm, cache, page) = busy_page_cache();
        let done = Arc::new(AtomicBool::new(false));

        let handle = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut locked = cache.lock();
                locked.resize(0).unwrap();
                done.store(true, Ordering::SeqCst);
                locked.page_count()
            })
        };

        loop {
            let locked = cache.lock();
            if locked.waiter_count() == 1 {
                break;
            }
        }
        assert!(!done.load(Ordering::SeqCst));
        cache.lock().mark_page_unbusy(page);

        assert_eq!(handle.join().unwrap(), 0);
        assert_eq!(vm.pfn().page(page).state(), PageState::Free);
    }
}
