//! Global Cache Registry
//!
//! Every live cache of a context is registered here from creation until
//! deletion. The registry lock also serializes the opportunistic
//! page-to-cache lookup: a thread that only knows a page can find and lock
//! the cache owning it without racing against that cache's deletion.
//!
//! The registry lock may be held while a cache lock is *tried* or handed
//! off to (`switch_from`), never while blocking on a cache lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use super::{CacheId, LockedCache, VmCache};
use crate::ke::KQueuedLock;
use crate::mm::error::{VmError, VmResult};
use crate::mm::pfn::{PageId, PfnDatabase};

/// The set of live caches of a context
pub struct CacheRegistry {
    lock: KQueuedLock,
    caches: UnsafeCell<BTreeMap<CacheId, Arc<VmCache>>>,
    next_id: AtomicU32,
    max_caches: usize,
}

// Safety: `caches` is only accessed with `lock` held
unsafe impl Send for CacheRegistry {}
unsafe impl Sync for CacheRegistry {}

impl CacheRegistry {
    pub fn new(max_caches: usize) -> Self {
        Self {
            lock: KQueuedLock::new(),
            caches: UnsafeCell::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            max_caches,
        }
    }

    /// Run `f` on the cache list with the registry lock held
    fn with_list<R>(&self, f: impl FnOnce(&mut BTreeMap<CacheId, Arc<VmCache>>) -> R) -> R {
        self.lock.acquire();
        // SAFETY: registry lock held
        let result = f(unsafe { &mut *self.caches.get() });
        self.lock.release();
        result
    }

    /// Run `f` with page lookups held off
    pub(super) fn synchronized<R>(&self, f: impl FnOnce() -> R) -> R {
        self.with_list(|_| f())
    }

    pub(super) fn allocate_id(&self) -> CacheId {
        CacheId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a cache; fails with `NoMemory` once `max_caches` are live
    pub(super) fn register(&self, cache: Arc<VmCache>) -> VmResult<()> {
        let max_caches = self.max_caches;
        let id = cache.id();
        self.with_list(|caches| {
            if caches.len() >= max_caches {
                log::warn!("[CACHE] Registry full ({} caches)", max_caches);
                return Err(VmError::NoMemory);
            }
            caches.insert(id, cache);
            Ok(())
        })
    }

    pub(super) fn unregister(&self, id: CacheId) -> Option<Arc<VmCache>> {
        self.with_list(|caches| caches.remove(&id))
    }

    /// Look up a live cache
    pub fn get(&self, id: CacheId) -> Option<Arc<VmCache>> {
        self.with_list(|caches| caches.get(&id).cloned())
    }

    /// Number of live caches
    pub fn cache_count(&self) -> usize {
        self.with_list(|caches| caches.len())
    }

    /// Call `f` for every live cache, in id order
    ///
    /// The caches are not locked; `f` must not lock them or touch the
    /// registry.
    pub fn for_each_cache(&self, mut f: impl FnMut(&Arc<VmCache>)) {
        self.with_list(|caches| caches.values().for_each(|cache| f(cache)))
    }

    /// Lock the cache a page belongs to
    ///
    /// Returns the owning cache locked and with an extra reference the
    /// caller must release, or `None` if the page has no owner. With
    /// `dont_wait` the cache is only try-locked and `None` is also returned
    /// when it is contended. The page's owner is checked again once the
    /// cache is locked, since it may have changed meanwhile.
    pub fn acquire_locked_page_cache(
        &self,
        pfn: &PfnDatabase,
        page: PageId,
        dont_wait: bool,
    ) -> Option<LockedCache> {
        let entry = pfn.page(page);
        self.lock.acquire();

        loop {
            // SAFETY: registry lock held
            let caches = unsafe { &*self.caches.get() };
            let cache = match entry.cache_id().and_then(|id| caches.get(&id)) {
                Some(cache) => Arc::clone(cache),
                None => {
                    self.lock.release();
                    return None;
                }
            };

            if dont_wait {
                if !cache.lock.try_acquire() {
                    self.lock.release();
                    return None;
                }
                self.lock.release();
            } else {
                cache.lock.switch_from(&self.lock);
                // SAFETY: cache lock held
                if unsafe { cache.state() }.deleted {
                    cache.lock.release();
                    self.lock.acquire();
                    continue;
                }
            }

            if entry.cache_id() == Some(cache.id()) {
                let mut locked = LockedCache::new(cache);
                locked.acquire_ref_locked();
                return Some(locked);
            }

            // The page moved on; try its new owner
            cache.lock.release();
            self.lock.acquire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::cache::CacheFactory;
    use crate::mm::config::VmConfig;
    use crate::mm::context::VmContext;
    use crate::mm::pfn::PageState;
    use alloc::vec::Vec;

    #[test]
    fn test_register_and_enumerate() {
        let vm = VmContext::new(VmConfig::with_pages(4));
        let a = CacheFactory::create_null_cache(&vm).unwrap();
        let b = CacheFactory::create_null_cache(&vm).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(vm.caches().cache_count(), 2);

        let mut seen = Vec::new();
        vm.caches().for_each_cache(|cache| seen.push(cache.id()));
        assert_eq!(seen, [a.id(), b.id()]);

        a.release_ref();
        assert!(vm.caches().get(a.id()).is_none());
        assert!(vm.caches().get(b.id()).is_some());
    }

    #[test]
    fn test_registry_limit() {
        let mut config = VmConfig::with_pages(4);
        config.max_caches = 1;
        let vm = VmContext::new(config);

        let first = CacheFactory::create_null_cache(&vm).unwrap();
        assert_eq!(CacheFactory::create_null_cache(&vm).err(), Some(VmError::NoMemory));
        first.release_ref();
        assert!(CacheFactory::create_null_cache(&vm).is_ok());
    }

    #[test]
    fn test_acquire_locked_page_cache() {
        let vm = VmContext::new(VmConfig::with_pages(4));
        let cache = CacheFactory::create_anonymous_cache(&vm, true, 0, 0, false).unwrap();
        let page = vm.pfn().allocate_page(PageState::Active).unwrap();
        let stray = vm.pfn().allocate_page(PageState::Active).unwrap();
        cache.lock().insert_page(page, 0);

        assert!(vm.acquire_locked_page_cache(stray, false).is_none());

        let locked = vm.acquire_locked_page_cache(page, false).unwrap();
        assert_eq!(locked.id(), cache.id());
        assert_eq!(locked.ref_count(), 2);

        // Contended: only a blocking lookup would get it
        assert!(vm.acquire_locked_page_cache(page, true).is_none());
        locked.release_ref_and_unlock();

        let locked = vm.acquire_locked_page_cache(page, true).unwrap();
        assert_eq!(locked.ref_count(), 2);
        locked.release_ref_and_unlock();
        assert_eq!(cache.lock().ref_count(), 1);
    }

    #[test]
    fn test_page_lookup_follows_moved_page() {
        use std::thread;

        let vm = VmContext::new(VmConfig::with_pages(4));
        let first = CacheFactory::create_anonymous_cache(&vm, true, 0, 0, false).unwrap();
        let second = CacheFactory::create_anonymous_cache(&vm, true, 0, 0, false).unwrap();
        let page = vm.pfn().allocate_page(PageState::Active).unwrap();
        first.lock().insert_page(page, 0);

        // Hold the first cache so the lookup has to queue on it
        let mut locked_first = first.lock();
        let handle = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                let locked = vm.acquire_locked_page_cache(page, false).unwrap();
                let id = locked.id();
                locked.release_ref_and_unlock();
                id
            })
        };

        while first.lock.waiter_count() == 0 {
            core::hint::spin_loop();
        }
        {
            let mut locked_second = second.lock();
            locked_second.move_page(&mut locked_first, page);
        }
        drop(locked_first);

        assert_eq!(handle.join().unwrap(), second.id());
    }
}
