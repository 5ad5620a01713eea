//! Consumer/source hierarchy and merging
//!
//! A consumer shadows its source: lookups that miss in the consumer
//! continue in the source. When a temporary source without areas is left
//! with a single consumer and nobody else references it, it is folded into
//! that consumer on unlock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::pages::move_page_between;
use super::{release_ref, CacheState, ConsumerLink, LockedCache, VmCache};
use crate::bugcheck;
use crate::ke::bugcheck::{codes, mm_subcodes};
use crate::mm::pfn::PageId;

impl LockedCache {
    /// Make `consumer` a consumer of this cache
    ///
    /// Both caches must be locked. The consumer must not have a source
    /// yet. This cache takes a reference and a store reference on behalf
    /// of the new link.
    pub fn add_consumer(&mut self, consumer: &mut LockedCache) {
        let this = Arc::clone(&self.cache);
        let consumer_cache = Arc::clone(&consumer.cache);

        if consumer.source.is_some() || consumer_cache.id == this.id {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_LINK_CORRUPT,
                this.id.0,
                consumer_cache.id.0
            );
        }

        log::debug!(
            "[CACHE] Cache {} consumes cache {}",
            consumer_cache.id.0,
            this.id.0
        );

        consumer.state_mut().source = Some(Arc::clone(&this));
        let state = self.state_mut();
        state.consumers.push(ConsumerLink::new(&consumer_cache));
        state.ref_count += 1;
        this.backend.acquire_store_ref();
    }
}

impl VmCache {
    /// Unlink a consumer that is being deleted
    ///
    /// The consumer is locked by the caller and has already dropped its
    /// `source` pointer. The store reference goes first, before this cache
    /// is locked.
    pub(super) fn remove_consumer(self: &Arc<Self>, consumer: &VmCache) {
        self.backend.release_store_ref();

        let mut locked = self.lock();
        let state = locked.state_mut();
        let Some(position) = state.consumers.iter().position(|link| link.id == consumer.id) else {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_LINK_CORRUPT,
                self.id.0,
                consumer.id.0
            );
        };
        state.consumers.remove(position);

        log::debug!(
            "[CACHE] Cache {} no longer consumes cache {}",
            consumer.id.0,
            self.id.0
        );
        locked.release_ref_and_unlock();
    }

    /// Fold this cache into its only consumer
    ///
    /// Both caches are locked. Pages the consumer already has win; the
    /// consumer takes over this cache's source and its reference on it.
    fn merge_with_only_consumer(&self, state: &mut CacheState, consumer: &mut LockedCache) {
        let link = state.consumers.remove(0);
        if link.id != consumer.id() {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_LINK_CORRUPT,
                self.id.0,
                consumer.id().0
            );
        }

        let consumer_arc = Arc::clone(consumer.cache());
        let vm = Arc::clone(&self.vm);
        let (consumer_cache, consumer_state) = consumer.parts();

        let movable: Vec<PageId> = state
            .pages
            .iter()
            .filter(|(index, _)| !consumer_state.pages.contains_key(*index))
            .map(|(_, &page)| page)
            .collect();

        log::debug!(
            "[CACHE] Merging cache {} into consumer {} ({} of {} pages move)",
            self.id.0,
            consumer_cache.id.0,
            movable.len(),
            state.pages.len()
        );

        for page in movable {
            move_page_between(vm.pfn(), self, state, consumer_cache, consumer_state, page);
        }
        consumer_cache
            .backend
            .merge_from(&vm, consumer_state, self, state);

        match state.source.take() {
            Some(source) => {
                // Consumer before source; the consumer stays locked, so the
                // source is released without the merge path
                source.lock.acquire();
                // SAFETY: source lock held
                let source_state = unsafe { source.state_mut() };
                match source_state.consumers.iter_mut().find(|l| l.id == self.id) {
                    Some(link) => *link = ConsumerLink::new(&consumer_arc),
                    None => bugcheck!(
                        codes::MEMORY_MANAGEMENT,
                        mm_subcodes::CACHE_LINK_CORRUPT,
                        source.id.0,
                        self.id.0
                    ),
                }
                source.lock.release();
                consumer_state.source = Some(source);
            }
            None => consumer_state.source = None,
        }

        // The reference the consumer link owned
        release_ref(self, state);
    }
}

/// Merge `cache` into its only consumer for as long as that is possible
///
/// Called with the cache locked; returns with it locked.
pub(super) fn merge_while_possible(cache: &Arc<VmCache>) {
    loop {
        let consumer = {
            // SAFETY: lock held
            let state = unsafe { cache.state() };
            if state.ref_count != 1 || !state.is_mergeable() {
                return;
            }
            match state.consumers[0].cache.upgrade() {
                Some(consumer) => consumer,
                None => return,
            }
        };

        if consumer.lock.try_acquire() {
            let mut consumer_locked = LockedCache::new(consumer);
            // SAFETY: lock held
            cache.merge_with_only_consumer(unsafe { cache.state_mut() }, &mut consumer_locked);
            consumer_locked.unlock();
            continue;
        }

        // Someone holds the consumer. Pin this cache so nobody else merges
        // or deletes it, and queue on the consumer lock.
        // SAFETY: lock held
        unsafe { cache.state_mut() }.ref_count += 1;
        consumer.lock.switch_from(&cache.lock);

        // SAFETY: consumer lock held
        let consumer_deleted = unsafe { consumer.state() }.deleted;
        if consumer_deleted {
            consumer.lock.release();
        }

        cache.lock.acquire();
        // SAFETY: lock held
        let state = unsafe { cache.state_mut() };
        state.ref_count -= 1;

        if consumer_deleted {
            continue;
        }

        let consumer_locked = LockedCache::new(consumer);
        let unchanged = state.ref_count == 1
            && state.is_mergeable()
            && state.consumers[0].id == consumer_locked.id();
        if unchanged {
            let mut consumer_locked = consumer_locked;
            cache.merge_with_only_consumer(state, &mut consumer_locked);
            consumer_locked.unlock();
        } else {
            // The consumer's own unlock could need this cache's lock
            consumer_locked.release_raw();
        }
    }
}
