//! Anonymous memory caches
//!
//! Anonymous caches back private and copy-on-write memory. Their
//! commitment is charged against the context's commit limit:
//!
//! - A cache that cannot over-commit reserves its full size up front.
//! - An over-committing cache reserves only its precommitted pages and
//!   commits the rest one page at a time as faults come in. The lowest
//!   `guard_pages` pages of such a cache (stack guard) are never
//!   committed; a fault there is a bad address.
//!
//! The swappable variant additionally keeps an in-memory swap store that
//! pages can be written out to and read back from.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use core::any::Any;
use spin::Mutex;

use super::backend::CacheBackend;
use super::{CacheState, CacheType, VmCache};
use crate::mm::config::{page_index, PAGE_SIZE};
use crate::mm::context::VmContext;
use crate::mm::error::{VmError, VmResult};

/// Upper bound on precommitted pages
pub const MAX_PRECOMMITTED_PAGES: u32 = 255;

/// Commitment state changed by faults
struct CommitState {
    /// The precommitted pages have been reserved
    has_precommitted: bool,
    /// Precommitted pages not yet used up by faults
    precommitted_pages: u32,
}

/// Swapped-out pages by page index
type SwapStore = BTreeMap<u64, Box<[u8]>>;

/// Backing store of an anonymous cache
pub struct AnonymousCache {
    can_overcommit: bool,
    swappable: bool,
    /// Bytes of guard pages at the start of the cache
    guarded_size: u64,
    commit: Mutex<CommitState>,
    swap: Mutex<SwapStore>,
}

impl AnonymousCache {
    pub fn new(can_overcommit: bool, precommitted_pages: u32, guard_pages: u32, swappable: bool) -> Self {
        Self {
            can_overcommit,
            swappable,
            guarded_size: guard_pages as u64 * PAGE_SIZE as u64,
            commit: Mutex::new(CommitState {
                has_precommitted: false,
                precommitted_pages: precommitted_pages.min(MAX_PRECOMMITTED_PAGES),
            }),
            swap: Mutex::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn can_overcommit(&self) -> bool {
        self.can_overcommit
    }

    #[inline]
    pub fn is_swappable(&self) -> bool {
        self.swappable
    }

    pub fn guarded_size(&self) -> u64 {
        self.guarded_size
    }

    /// Precommitted pages faults may still use
    pub fn precommitted_pages(&self) -> u32 {
        self.commit.lock().precommitted_pages
    }

    /// Number of pages in the swap store
    pub fn swapped_page_count(&self) -> usize {
        self.swap.lock().len()
    }

    fn drain_swap(&self) -> SwapStore {
        core::mem::take(&mut *self.swap.lock())
    }
}

impl CacheBackend for AnonymousCache {
    fn cache_type(&self) -> CacheType {
        if self.swappable {
            CacheType::AnonymousSwap
        } else {
            CacheType::AnonymousNoSwap
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn commit(&self, vm: &VmContext, state: &mut CacheState, size: u64) -> VmResult<()> {
        let mut size = size;

        // Over-committing caches commit in fault(), apart from a few
        // precommitted pages. Shrinking always gives memory back.
        if self.can_overcommit && size > state.committed_size {
            let mut commit = self.commit.lock();
            if commit.has_precommitted {
                return Ok(());
            }
            commit.has_precommitted = true;
            size = size.min(commit.precommitted_pages as u64 * PAGE_SIZE as u64);
        }

        if size > state.committed_size {
            if !vm.try_reserve_memory(size - state.committed_size) {
                return Err(VmError::NoMemory);
            }
        } else {
            vm.unreserve_memory(state.committed_size - size);
        }

        state.committed_size = size;
        Ok(())
    }

    fn has_page(&self, _state: &CacheState, offset: u64) -> bool {
        self.swappable && self.swap.lock().contains_key(&page_index(offset))
    }

    fn can_write_page(&self, _offset: u64) -> bool {
        self.swappable
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> VmResult<usize> {
        if !self.swappable {
            return Err(VmError::NotSupported);
        }

        let swap = self.swap.lock();
        let mut done = 0;
        while done < buffer.len() {
            let position = offset + done as u64;
            let within = (position % PAGE_SIZE as u64) as usize;
            let Some(slot) = swap.get(&page_index(position)) else {
                return if done == 0 { Err(VmError::BadAddress) } else { Ok(done) };
            };

            let count = (PAGE_SIZE - within).min(buffer.len() - done);
            buffer[done..done + count].copy_from_slice(&slot[within..within + count]);
            done += count;
        }
        Ok(done)
    }

    fn write(&self, offset: u64, data: &[u8]) -> VmResult<usize> {
        if !self.swappable {
            return Err(VmError::NotSupported);
        }

        let mut swap = self.swap.lock();
        let mut done = 0;
        while done < data.len() {
            let position = offset + done as u64;
            let within = (position % PAGE_SIZE as u64) as usize;
            let slot = swap
                .entry(page_index(position))
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());

            let count = (PAGE_SIZE - within).min(data.len() - done);
            slot[within..within + count].copy_from_slice(&data[done..done + count]);
            done += count;
        }
        Ok(done)
    }

    fn fault(&self, vm: &VmContext, state: &mut CacheState, offset: u64) -> VmResult<()> {
        if self.can_overcommit {
            // Stack guard hit
            let guard_start = state.virtual_base;
            if self.guarded_size > 0
                && offset >= guard_start
                && offset < guard_start + self.guarded_size
            {
                log::debug!("[CACHE] Guard page hit at offset {:#x}", offset);
                return Err(VmError::BadAddress);
            }

            // Already backed, or everything is committed
            let index = page_index(offset);
            let resident = state.pages.contains_key(&index)
                || (self.swappable && self.swap.lock().contains_key(&index));
            let cache_size = state.virtual_end - state.virtual_base;
            if resident || state.committed_size >= cache_size {
                return Err(VmError::NoHandler);
            }

            let mut commit = self.commit.lock();
            if commit.precommitted_pages == 0 {
                if !vm.try_reserve_memory(PAGE_SIZE as u64) {
                    return Err(VmError::NoMemory);
                }
                state.committed_size += PAGE_SIZE as u64;
            } else {
                commit.precommitted_pages -= 1;
            }
        }

        Err(VmError::NoHandler)
    }

    fn merge_from(
        &self,
        vm: &VmContext,
        state: &mut CacheState,
        source: &VmCache,
        source_state: &mut CacheState,
    ) {
        let Some(source_store) = source.store::<AnonymousCache>() else {
            return;
        };

        // Take over the source's commitment, keeping no more than our size
        state.committed_size += source_state.committed_size;
        source_state.committed_size = 0;
        let actual_size = state.virtual_end - state.virtual_base;
        if state.committed_size > actual_size {
            vm.unreserve_memory(state.committed_size - actual_size);
            state.committed_size = actual_size;
        }

        let swapped = source_store.drain_swap();
        if self.swappable {
            let mut swap = self.swap.lock();
            for (index, data) in swapped {
                if !state.pages.contains_key(&index) {
                    swap.entry(index).or_insert(data);
                }
            }
        }
    }

    fn delete_object(&self, vm: &VmContext, state: &mut CacheState) {
        vm.unreserve_memory(state.committed_size);
        state.committed_size = 0;
        self.swap.lock().clear();
    }
}
