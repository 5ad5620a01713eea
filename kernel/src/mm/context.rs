//! Memory Manager Context
//!
//! Everything the caches of one memory manager instance share: the page
//! frame database, the global cache registry and the commit accounting
//! anonymous caches reserve memory against.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::cache::{CacheRegistry, LockedCache};
use crate::mm::config::VmConfig;
use crate::mm::pfn::{PageId, PfnDatabase};

/// One memory manager instance
pub struct VmContext {
    config: VmConfig,
    pfn: PfnDatabase,
    caches: CacheRegistry,
    /// Bytes reserved by cache commitments
    reserved_memory: AtomicU64,
}

impl VmContext {
    /// Create a context; the registry lives until the context is dropped
    pub fn new(config: VmConfig) -> Arc<Self> {
        let context = Arc::new(Self {
            config,
            pfn: PfnDatabase::new(config.page_count),
            caches: CacheRegistry::new(config.max_caches),
            reserved_memory: AtomicU64::new(0),
        });

        log::info!(
            "[MM] Context initialized: {} pages, commit limit {:#x}, max {} caches",
            config.page_count,
            config.commit_limit,
            config.max_caches
        );
        context
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[inline]
    pub fn pfn(&self) -> &PfnDatabase {
        &self.pfn
    }

    #[inline]
    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// Reserve `bytes` of commit charge
    ///
    /// Returns false without reserving anything if the commit limit would
    /// be exceeded.
    pub fn try_reserve_memory(&self, bytes: u64) -> bool {
        let limit = self.config.commit_limit;
        let result = self
            .reserved_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved.checked_add(bytes).filter(|&total| total <= limit)
            });

        if result.is_err() {
            log::warn!(
                "[MM] Commit of {:#x} bytes refused ({:#x} of {:#x} reserved)",
                bytes,
                self.reserved_memory(),
                limit
            );
        }
        result.is_ok()
    }

    /// Give back commit charge taken with `try_reserve_memory`
    pub fn unreserve_memory(&self, bytes: u64) {
        let result = self
            .reserved_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved.checked_sub(bytes)
            });

        if result.is_err() {
            log::error!("[MM] Unreserving {:#x} bytes more than reserved", bytes);
            self.reserved_memory.store(0, Ordering::Release);
        }
    }

    /// Bytes currently reserved
    pub fn reserved_memory(&self) -> u64 {
        self.reserved_memory.load(Ordering::Acquire)
    }

    /// Bytes that can still be reserved
    pub fn available_memory(&self) -> u64 {
        self.config.commit_limit.saturating_sub(self.reserved_memory())
    }

    /// Lock the cache a page currently belongs to
    ///
    /// See `CacheRegistry::acquire_locked_page_cache`.
    pub fn acquire_locked_page_cache(&self, page: PageId, dont_wait: bool) -> Option<LockedCache> {
        self.caches.acquire_locked_page_cache(&self.pfn, page, dont_wait)
    }
}
