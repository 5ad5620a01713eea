//! Areas mapping a cache

use alloc::sync::Arc;

use super::{LockedCache, VmCache};
use crate::bugcheck;
use crate::ke::bugcheck::{codes, mm_subcodes};
use crate::mm::area::VmArea;

impl LockedCache {
    /// Attach an area to this cache
    ///
    /// The area holds a cache reference and a store reference until it is
    /// removed again with `VmCache::remove_area`.
    pub fn insert_area_locked(&mut self, area: &Arc<VmArea>) {
        if let Some(current) = area.cache_id() {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_LINK_CORRUPT,
                self.id().0,
                current.0
            );
        }

        area.set_cache(Some(self.id()));
        let (cache, state) = self.parts();
        state.areas.push(Arc::clone(area));
        state.ref_count += 1;
        cache.backend.acquire_store_ref();

        log::debug!("[CACHE] Area {} attached to cache {}", area.id().0, self.id().0);
    }

    /// Move every area of `from` to this cache; both caches are locked
    ///
    /// The store references the areas hold on `from` cannot be given up
    /// under the cache locks. They are handed back in the returned
    /// `StoreRefRelease`, which the caller drops once both caches are
    /// unlocked.
    #[must_use]
    pub fn transfer_areas(&mut self, from: &mut LockedCache) -> StoreRefRelease {
        let id = self.id();
        let moved = core::mem::take(&mut from.state_mut().areas);
        let count = moved.len();

        for area in moved {
            area.set_cache(Some(id));
            {
                let (cache, state) = self.parts();
                state.areas.push(area);
                state.ref_count += 1;
                cache.backend.acquire_store_ref();
            }
            from.release_ref_locked();
        }

        log::debug!(
            "[CACHE] Transferred {} areas from cache {} to cache {}",
            count,
            from.id().0,
            id.0
        );

        StoreRefRelease {
            cache: Arc::clone(&from.cache),
            count,
        }
    }

    /// Number of writable areas, not counting `ignore`
    pub fn count_writable_areas(&self, ignore: Option<&VmArea>) -> usize {
        self.areas
            .iter()
            .filter(|area| ignore.map_or(true, |ignored| !core::ptr::eq(Arc::as_ptr(area), ignored)))
            .filter(|area| area.is_writable())
            .count()
    }
}

/// Store references left behind by `transfer_areas`
///
/// Released on drop. Must not be dropped while the cache is locked.
#[must_use]
pub struct StoreRefRelease {
    cache: Arc<VmCache>,
    count: usize,
}

impl StoreRefRelease {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for StoreRefRelease {
    fn drop(&mut self) {
        for _ in 0..self.count {
            self.cache.backend.release_store_ref();
        }
    }
}

impl VmCache {
    /// Detach an area, tearing down its mappings
    ///
    /// The store reference is released before the cache is locked. The
    /// area's cache reference goes with the unlock, which may merge or
    /// delete the cache.
    pub fn remove_area(self: &Arc<Self>, area: &Arc<VmArea>) {
        self.backend.release_store_ref();

        let mut locked = self.lock();
        let state = locked.state_mut();
        let Some(position) = state.areas.iter().position(|a| Arc::ptr_eq(a, area)) else {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_LINK_CORRUPT,
                self.id.0,
                area.id().0
            );
        };
        state.areas.remove(position);

        area.unmap_all(self.vm.pfn());
        area.set_cache(None);

        log::debug!("[CACHE] Area {} detached from cache {}", area.id().0, self.id.0);
        locked.release_ref_and_unlock();
    }
}
