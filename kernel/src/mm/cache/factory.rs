//! Cache creation
//!
//! Every cache is made here: the store is built, the cache registered and
//! the store initialized with the new cache locked. A cache whose store
//! fails to initialize is torn down again before the error is returned.

use alloc::boxed::Box;
use alloc::sync::Arc;

use super::{AnonymousCache, CacheBackend, DeviceCache, NullCache, VmCache, VnodeCache, VnodeIo};
use crate::mm::context::VmContext;
use crate::mm::error::VmResult;

/// Creates caches of each kind
pub struct CacheFactory;

impl CacheFactory {
    /// Create an anonymous cache
    ///
    /// # Arguments
    /// * `can_overcommit` - Commit memory page by page on fault instead of up front
    /// * `precommitted_pages` - Pages to commit up front when over-committing
    /// * `guard_pages` - Pages at the start that fault as bad addresses
    /// * `swappable` - Pages can be written out to swap
    pub fn create_anonymous_cache(
        vm: &Arc<VmContext>,
        can_overcommit: bool,
        precommitted_pages: u32,
        guard_pages: u32,
        swappable: bool,
    ) -> VmResult<Arc<VmCache>> {
        let store = AnonymousCache::new(can_overcommit, precommitted_pages, guard_pages, swappable);
        Self::create(vm, Box::new(store), true)
    }

    /// Create a cache for a file
    pub fn create_vnode_cache(vm: &Arc<VmContext>, vnode: Arc<dyn VnodeIo>) -> VmResult<Arc<VmCache>> {
        Self::create(vm, Box::new(VnodeCache::new(vnode)), false)
    }

    /// Create a cache for device memory at `base_address`
    pub fn create_device_cache(vm: &Arc<VmContext>, base_address: u64) -> VmResult<Arc<VmCache>> {
        Self::create(vm, Box::new(DeviceCache::new(base_address)), false)
    }

    pub fn create_null_cache(vm: &Arc<VmContext>) -> VmResult<Arc<VmCache>> {
        Self::create(vm, Box::new(NullCache), true)
    }

    fn create(
        vm: &Arc<VmContext>,
        backend: Box<dyn CacheBackend>,
        temporary: bool,
    ) -> VmResult<Arc<VmCache>> {
        let cache = VmCache::create(vm, backend)?;
        let mut locked = cache.lock();

        let result = {
            let (cache, state) = locked.parts();
            cache.backend.init(&cache.vm, state)
        };
        if let Err(error) = result {
            log::warn!(
                "[CACHE] Initializing {} cache {} failed: {}",
                cache.cache_type().name(),
                cache.id().0,
                error
            );
            locked.release_ref_and_unlock();
            return Err(error);
        }

        locked.set_temporary(temporary);
        drop(locked);
        Ok(cache)
    }
}
