//! VM Cache
//!
//! A cache owns the physical pages backing a range of memory. Areas map a
//! cache into address spaces; a cache may in turn be the *source* of one
//! or more *consumer* caches, which is how copy-on-write works: a consumer
//! holds the pages it has written itself and forwards everything else up
//! the source chain.
//!
//! # Locking
//!
//! Every cache has its own lock, protecting all of its mutable state
//! (`CacheState`). The only way to get at that state is `VmCache::lock`,
//! which returns a `LockedCache`. Dropping the `LockedCache` (or calling
//! `unlock`) releases the lock and, on the way out:
//!
//! 1. Merges the cache into its only consumer while the cache is
//!    referenced once, has no areas, is temporary and has one consumer
//! 2. Deletes the cache if its reference count reached zero
//!
//! Lock order between two caches is consumer before source. A source lock
//! is only ever combined with a consumer lock through a try-lock or a lock
//! hand-off (`KQueuedLock::switch_from`).
//!
//! # Reference counting
//!
//! The reference count lives inside the locked state. Owners are the
//! creator, every area (`insert_area_locked`) and every consumer
//! (`add_consumer`). A consumer additionally keeps its source alive through
//! an `Arc`; the global registry holds the owning `Arc` of each live cache.

mod anonymous;
mod areas;
mod backend;
mod consumers;
mod device;
mod events;
mod factory;
mod null;
mod pages;
mod registry;
mod vnode;


pub use anonymous::{AnonymousCache, MAX_PRECOMMITTED_PAGES};
pub use areas::StoreRefRelease;
pub use backend::{AsyncIoCallback, CacheBackend};
pub use device::DeviceCache;
pub use events::{PageEventWaiter, PageEvents};
pub use factory::CacheFactory;
pub use null::NullCache;
pub use registry::CacheRegistry;
pub use vnode::{VnodeCache, VnodeIo};

#[cfg(test)]
pub(crate) use vnode::tests::MemoryVnode;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::Deref;

use crate::bugcheck;
use crate::ke::bugcheck::{codes, mm_subcodes};
use crate::ke::KQueuedLock;
use crate::mm::area::VmArea;
use crate::mm::context::VmContext;
use crate::mm::error::VmResult;
use crate::mm::pfn::PageId;

/// Cache identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(pub u32);

/// Backing store kind of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheType {
    /// Anonymous memory that can be paged out to swap
    AnonymousSwap = 0,
    /// Anonymous memory that stays resident
    AnonymousNoSwap = 1,
    /// File data
    Vnode = 2,
    /// Device memory
    Device = 3,
    /// No backing store at all
    Null = 4,
}

impl CacheType {
    pub fn name(self) -> &'static str {
        match self {
            Self::AnonymousSwap => "anonymous",
            Self::AnonymousNoSwap => "anonymous-noswap",
            Self::Vnode => "vnode",
            Self::Device => "device",
            Self::Null => "null",
        }
    }

    /// Check if the cache holds anonymous memory
    pub fn is_anonymous(self) -> bool {
        matches!(self, Self::AnonymousSwap | Self::AnonymousNoSwap)
    }
}

/// Link from a source to one of its consumers
struct ConsumerLink {
    id: CacheId,
    cache: Weak<VmCache>,
}

impl ConsumerLink {
    fn new(cache: &Arc<VmCache>) -> Self {
        Self {
            id: cache.id,
            cache: Arc::downgrade(cache),
        }
    }
}

// ============================================================================
// Cache State
// ============================================================================

/// The mutable state of a cache, only reachable with the cache locked
pub struct CacheState {
    virtual_base: u64,
    virtual_end: u64,
    committed_size: u64,
    /// Resident pages by page index
    pages: BTreeMap<u64, PageId>,
    ref_count: u32,
    /// The cache this one shadows
    source: Option<Arc<VmCache>>,
    consumers: Vec<ConsumerLink>,
    areas: Vec<Arc<VmArea>>,
    temporary: bool,
    page_event_waiters: Vec<PageEventWaiter>,
    deleted: bool,
}

impl CacheState {
    fn new() -> Self {
        Self {
            virtual_base: 0,
            virtual_end: 0,
            committed_size: 0,
            pages: BTreeMap::new(),
            ref_count: 1,
            source: None,
            consumers: Vec::new(),
            areas: Vec::new(),
            temporary: false,
            page_event_waiters: Vec::new(),
            deleted: false,
        }
    }

    #[inline]
    pub fn virtual_base(&self) -> u64 {
        self.virtual_base
    }

    #[inline]
    pub fn virtual_end(&self) -> u64 {
        self.virtual_end
    }

    #[inline]
    pub fn committed_size(&self) -> u64 {
        self.committed_size
    }

    /// Record the committed size; for backing stores doing their own accounting
    pub fn set_committed_size(&mut self, size: u64) {
        self.committed_size = size;
    }

    /// Number of resident pages
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Resident pages as (page index, page), in offset order
    pub fn pages(&self) -> impl Iterator<Item = (u64, PageId)> + '_ {
        self.pages.iter().map(|(&index, &page)| (index, page))
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// The cache this one shadows
    pub fn source(&self) -> Option<&Arc<VmCache>> {
        self.source.as_ref()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Ids of the caches consuming this one
    pub fn consumer_ids(&self) -> impl Iterator<Item = CacheId> + '_ {
        self.consumers.iter().map(|link| link.id)
    }

    pub fn areas(&self) -> &[Arc<VmArea>] {
        &self.areas
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Number of threads waiting for page events
    pub fn waiter_count(&self) -> usize {
        self.page_event_waiters.len()
    }

    /// A cache nobody but its only consumer can see
    pub fn is_mergeable(&self) -> bool {
        self.areas.is_empty() && self.temporary && self.consumers.len() == 1
    }
}

// ============================================================================
// Cache
// ============================================================================

/// A VM cache
pub struct VmCache {
    id: CacheId,
    cache_type: CacheType,
    vm: Arc<VmContext>,
    lock: KQueuedLock,
    state: UnsafeCell<CacheState>,
    backend: Box<dyn CacheBackend>,
}

// Safety: `state` is only accessed with `lock` held
unsafe impl Send for VmCache {}
unsafe impl Sync for VmCache {}

impl VmCache {
    /// Allocate a cache and register it
    ///
    /// The new cache is unlocked, has a reference count of one and no
    /// pages, consumers or areas. Fails with `NoMemory` when the registry
    /// is full.
    fn create(vm: &Arc<VmContext>, backend: Box<dyn CacheBackend>) -> VmResult<Arc<Self>> {
        let cache = Arc::new(Self {
            id: vm.caches().allocate_id(),
            cache_type: backend.cache_type(),
            vm: Arc::clone(vm),
            lock: KQueuedLock::new(),
            state: UnsafeCell::new(CacheState::new()),
            backend,
        });

        vm.caches().register(Arc::clone(&cache))?;
        log::debug!("[CACHE] Created cache {} ({})", cache.id.0, cache.cache_type.name());
        Ok(cache)
    }

    #[inline]
    pub fn id(&self) -> CacheId {
        self.id
    }

    #[inline]
    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    /// The memory manager context the cache lives in
    #[inline]
    pub fn context(&self) -> &Arc<VmContext> {
        &self.vm
    }

    /// The backing store
    pub fn backend(&self) -> &dyn CacheBackend {
        &*self.backend
    }

    /// The backing store as its concrete type
    pub fn store<T: CacheBackend + 'static>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }

    /// Check if some thread holds the cache lock
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Lock the cache
    pub fn lock(self: &Arc<Self>) -> LockedCache {
        self.lock.acquire();
        self.check_not_deleted();
        LockedCache::new(Arc::clone(self))
    }

    /// Lock the cache if nobody else holds it
    pub fn try_lock(self: &Arc<Self>) -> Option<LockedCache> {
        if !self.lock.try_acquire() {
            return None;
        }
        self.check_not_deleted();
        Some(LockedCache::new(Arc::clone(self)))
    }

    /// Take a reference, locking the cache for the update
    pub fn acquire_ref(self: &Arc<Self>) {
        self.lock().acquire_ref_locked();
    }

    /// Drop a reference, locking the cache for the update
    ///
    /// The cache may be merged or deleted on the way out.
    pub fn release_ref(self: &Arc<Self>) {
        self.lock().release_ref_and_unlock();
    }

    /// Write back the modified pages of a non-temporary cache
    pub fn write_modified(self: &Arc<Self>) -> VmResult<()> {
        let mut locked = self.lock();
        if locked.temporary {
            return Ok(());
        }
        crate::mm::writeback::mm_write_modified_pages(&mut locked).map(|_| ())
    }

    /// # Safety
    /// The caller must hold the cache lock.
    #[inline]
    unsafe fn state(&self) -> &CacheState {
        &*self.state.get()
    }

    /// # Safety
    /// The caller must hold the cache lock and must not create a second
    /// live reference to the state.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn state_mut(&self) -> &mut CacheState {
        &mut *self.state.get()
    }

    fn check_not_deleted(&self) {
        // SAFETY: called with the lock held
        if unsafe { self.state() }.deleted {
            self.lock.release();
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_USED_AFTER_DELETE,
                self.id.0
            );
        }
    }

    /// Tear down a cache whose last reference is gone, releasing its lock
    fn delete(&self, state: &mut CacheState) {
        if !state.areas.is_empty() || !state.consumers.is_empty() {
            bugcheck!(
                codes::MEMORY_MANAGEMENT,
                mm_subcodes::CACHE_DELETED_WHILE_REFERENCED,
                self.id.0,
                state.areas.len(),
                state.consumers.len()
            );
        }

        log::debug!(
            "[CACHE] Deleting cache {} ({} pages)",
            self.id.0,
            state.pages.len()
        );

        let pfn = self.vm.pfn();
        for (_, page) in core::mem::take(&mut state.pages) {
            let entry = pfn.page(page);
            if entry.is_mapped() || entry.wired_count() != 0 {
                bugcheck!(
                    codes::MEMORY_MANAGEMENT,
                    mm_subcodes::PAGE_STILL_IN_USE,
                    self.id.0,
                    page.0,
                    entry.wired_count()
                );
            }
            entry.set_cache(None);
            pfn.free_page(page);
        }

        if let Some(source) = state.source.take() {
            source.remove_consumer(self);
        }

        // Nobody can find the cache through a page any more
        state.deleted = true;
        self.vm.caches().unregister(self.id);

        self.backend.delete_object(&self.vm, state);
        self.lock.release();
    }
}

/// Release a locked cache's lock, merging and deleting it as needed
fn unlock_cache(cache: &Arc<VmCache>) {
    consumers::merge_while_possible(cache);

    // SAFETY: the merge loop returns with the lock held
    let state = unsafe { cache.state_mut() };
    if state.ref_count == 0 {
        cache.delete(state);
    } else {
        cache.lock.release();
    }
}

// ============================================================================
// Locked Cache
// ============================================================================

/// A locked cache
///
/// Holding a `LockedCache` means holding the cache lock. Dropping it is the
/// full unlock, including merging and deletion.
#[must_use = "dropping a LockedCache unlocks the cache"]
pub struct LockedCache {
    cache: Arc<VmCache>,
    /// Cleared once the lock was given up without the unlock path
    armed: bool,
}

impl LockedCache {
    /// Wrap a cache whose lock the caller already holds
    fn new(cache: Arc<VmCache>) -> Self {
        Self { cache, armed: true }
    }

    #[inline]
    pub fn cache(&self) -> &Arc<VmCache> {
        &self.cache
    }

    #[inline]
    pub fn id(&self) -> CacheId {
        self.cache.id
    }

    #[inline]
    fn state_mut(&mut self) -> &mut CacheState {
        // SAFETY: the lock is held for the lifetime of self
        unsafe { self.cache.state_mut() }
    }

    /// The cache and its state, borrowed together
    #[inline]
    fn parts(&mut self) -> (&VmCache, &mut CacheState) {
        let cache: &VmCache = &self.cache;
        // SAFETY: the lock is held for the lifetime of self
        (cache, unsafe { cache.state_mut() })
    }

    /// Unlock the cache
    pub fn unlock(self) {
        drop(self);
    }

    /// Release the lock without merging or deleting
    fn release_raw(mut self) {
        self.armed = false;
        self.cache.lock.release();
    }

    pub fn acquire_ref_locked(&mut self) {
        self.state_mut().ref_count += 1;
    }

    /// Drop a reference; deletion waits for the unlock
    pub fn release_ref_locked(&mut self) {
        let (cache, state) = self.parts();
        release_ref(cache, state);
    }

    pub fn release_ref_and_unlock(mut self) {
        self.release_ref_locked();
        drop(self);
    }

    pub fn set_temporary(&mut self, temporary: bool) {
        self.state_mut().temporary = temporary;
    }

    /// Set the committed size through the backing store
    pub fn commit(&mut self, size: u64) -> VmResult<()> {
        let (cache, state) = self.parts();
        cache.backend.commit(&cache.vm, state, size)
    }

    /// Make sure at least `commitment` bytes are committed
    pub fn set_minimal_commitment(&mut self, commitment: u64) -> VmResult<()> {
        if self.committed_size < commitment {
            self.commit(commitment)
        } else {
            Ok(())
        }
    }

    /// Check if the backing store can provide the page at `offset`
    pub fn has_page(&self, offset: u64) -> bool {
        self.cache.backend.has_page(self, offset)
    }

    pub fn can_write_page(&self, offset: u64) -> bool {
        self.cache.backend.can_write_page(offset)
    }

    /// Read from the backing store
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> VmResult<usize> {
        self.cache.backend.read(offset, buffer)
    }

    /// Write to the backing store
    pub fn write(&self, offset: u64, data: &[u8]) -> VmResult<usize> {
        self.cache.backend.write(offset, data)
    }

    /// Write to the backing store, reporting completion through `callback`
    pub fn write_async(
        &self,
        offset: u64,
        data: &[u8],
        callback: Box<dyn AsyncIoCallback>,
    ) -> VmResult<()> {
        self.cache.backend.write_async(offset, data, callback)
    }

    /// Let the backing store handle a fault at `offset`
    ///
    /// `NoHandler` asks the caller to resolve the fault the generic way.
    pub fn fault(&mut self, offset: u64) -> VmResult<()> {
        let (cache, state) = self.parts();
        cache.backend.fault(&cache.vm, state, offset)
    }

    /// Write page data to the backing store with the cache unlocked
    ///
    /// The cache is pinned by a reference for the duration of the I/O.
    pub(crate) fn write_unlocked(&mut self, offset: u64, data: &[u8]) -> VmResult<usize> {
        self.acquire_ref_locked();
        self.cache.lock.release();

        let result = self.cache.backend.write(offset, data);

        self.cache.lock.acquire();
        self.cache.check_not_deleted();
        self.release_ref_locked();
        result
    }
}

fn release_ref(cache: &VmCache, state: &mut CacheState) {
    if state.ref_count == 0 {
        bugcheck!(
            codes::MEMORY_MANAGEMENT,
            mm_subcodes::CACHE_REFERENCE_UNDERFLOW,
            cache.id.0
        );
    }
    state.ref_count -= 1;
}

impl Deref for LockedCache {
    type Target = CacheState;

    fn deref(&self) -> &CacheState {
        // SAFETY: the lock is held for the lifetime of self
        unsafe { self.cache.state() }
    }
}

impl Drop for LockedCache {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            unlock_cache(&self.cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::config::VmConfig;

    fn context() -> Arc<VmContext> {
        VmContext::new(VmConfig::with_pages(16))
    }

    #[test]
    fn test_create_and_delete() {
        let vm = context();
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        let id = cache.id();
        assert!(vm.caches().get(id).is_some());

        {
            let locked = cache.lock();
            assert_eq!(locked.ref_count(), 1);
            assert_eq!(locked.page_count(), 0);
            assert!(locked.source().is_none());
            assert!(cache.is_locked());
        }
        assert!(!cache.is_locked());

        cache.release_ref();
        assert!(vm.caches().get(id).is_none());
    }

    #[test]
    fn test_try_lock() {
        let vm = context();
        let cache = CacheFactory::create_null_cache(&vm).unwrap();

        let locked = cache.lock();
        assert!(cache.try_lock().is_none());
        locked.unlock();

        let locked = cache.try_lock();
        assert!(locked.is_some());
        drop(locked);
        cache.release_ref();
    }

    #[test]
    fn test_ref_counting() {
        let vm = context();
        let cache = CacheFactory::create_null_cache(&vm).unwrap();

        cache.acquire_ref();
        cache.acquire_ref();
        assert_eq!(cache.lock().ref_count(), 3);

        cache.release_ref();
        cache.release_ref();
        assert_eq!(cache.lock().ref_count(), 1);
        assert_eq!(vm.caches().cache_count(), 1);

        cache.release_ref();
        assert_eq!(vm.caches().cache_count(), 0);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_reference_underflow_bugchecks() {
        let vm = context();
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        let mut locked = cache.lock();
        locked.release_ref_locked();
        locked.release_ref_locked();
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_lock_after_delete_bugchecks() {
        let vm = context();
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        cache.release_ref();
        let _locked = cache.lock();
    }

    #[test]
    fn test_set_minimal_commitment() {
        let vm = context();
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        let mut locked = cache.lock();

        locked.set_minimal_commitment(0x3000).unwrap();
        assert_eq!(locked.committed_size(), 0x3000);
        locked.set_minimal_commitment(0x1000).unwrap();
        assert_eq!(locked.committed_size(), 0x3000);

        locked.release_ref_and_unlock();
    }

    #[test]
    fn test_cache_type_names() {
        assert_eq!(CacheType::Vnode.name(), "vnode");
        assert!(CacheType::AnonymousNoSwap.is_anonymous());
        assert!(!CacheType::Device.is_anonymous());
    }
}
