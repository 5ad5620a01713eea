//! Backing store interface
//!
//! A cache delegates everything that depends on where its data comes from
//! to a `CacheBackend`. The default implementations describe a store that
//! can do nothing: I/O is unsupported and every fault is a bad address, so
//! an unspecialized cache is inert rather than silently wrong.
//!
//! Hooks that receive a `CacheState` are called with the cache locked.
//! `read`, `write` and `write_async` may be called with the cache unlocked.

use alloc::boxed::Box;
use core::any::Any;

use super::{CacheState, CacheType, VmCache};
use crate::mm::context::VmContext;
use crate::mm::error::{VmError, VmResult};

/// Completion of an asynchronous write
pub trait AsyncIoCallback: Send {
    /// # Arguments
    /// * `status` - Result of the transfer
    /// * `partial_transfer` - Fewer bytes than requested were transferred
    /// * `bytes_transferred` - Number of bytes transferred
    fn io_finished(self: Box<Self>, status: VmResult<()>, partial_transfer: bool, bytes_transferred: usize);
}

/// The store behind a cache
pub trait CacheBackend: Send + Sync {
    fn cache_type(&self) -> CacheType;

    /// The store as `Any`, for downcasting to the concrete store
    fn as_any(&self) -> &dyn Any;

    /// Variant-specific initialization of a freshly created cache
    fn init(&self, _vm: &VmContext, _state: &mut CacheState) -> VmResult<()> {
        Ok(())
    }

    /// Commit `size` bytes of backing storage
    fn commit(&self, _vm: &VmContext, state: &mut CacheState, size: u64) -> VmResult<()> {
        state.committed_size = size;
        Ok(())
    }

    /// Check if the store can provide the page at `offset`
    fn has_page(&self, state: &CacheState, offset: u64) -> bool {
        state.virtual_base <= offset && offset <= state.virtual_end
    }

    fn can_write_page(&self, _offset: u64) -> bool {
        false
    }

    fn read(&self, _offset: u64, _buffer: &mut [u8]) -> VmResult<usize> {
        Err(VmError::NotSupported)
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> VmResult<usize> {
        Err(VmError::NotSupported)
    }

    /// Start a write, reporting completion through `callback`
    ///
    /// The default performs the write synchronously.
    fn write_async(
        &self,
        offset: u64,
        data: &[u8],
        callback: Box<dyn AsyncIoCallback>,
    ) -> VmResult<()> {
        match self.write(offset, data) {
            Ok(written) => callback.io_finished(Ok(()), written < data.len(), written),
            Err(error) => callback.io_finished(Err(error), false, 0),
        }
        Ok(())
    }

    /// Handle a page fault at `offset`
    ///
    /// `NoHandler` lets the generic fault path resolve the fault.
    fn fault(&self, _vm: &VmContext, _state: &mut CacheState, _offset: u64) -> VmResult<()> {
        Err(VmError::BadAddress)
    }

    /// Take over store-private data of a source being merged into this cache
    fn merge_from(
        &self,
        _vm: &VmContext,
        _state: &mut CacheState,
        _source: &VmCache,
        _source_state: &mut CacheState,
    ) {
    }

    fn acquire_store_ref(&self) {}

    fn release_store_ref(&self) {}

    /// Take a store reference when the cache holds none
    fn acquire_unreferenced_store_ref(&self) -> VmResult<()> {
        Ok(())
    }

    /// Release everything the store holds for a deleted cache
    fn delete_object(&self, _vm: &VmContext, _state: &mut CacheState) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::cache::CacheFactory;
    use crate::mm::config::VmConfig;
    use alloc::sync::Arc;
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Option<(VmResult<()>, bool, usize)>>>);

    impl AsyncIoCallback for Recorder {
        fn io_finished(self: Box<Self>, status: VmResult<()>, partial: bool, bytes: usize) {
            *self.0.lock().unwrap() = Some((status, partial, bytes));
        }
    }

    #[test]
    fn test_default_hooks() {
        let vm = VmContext::new(VmConfig::with_pages(4));
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        let mut locked = cache.lock();

        locked.commit(0x2000).unwrap();
        assert_eq!(locked.committed_size(), 0x2000);
        assert!(locked.has_page(0));
        assert!(!locked.has_page(1));
        assert!(!locked.can_write_page(0));
        assert_eq!(locked.read(0, &mut [0u8; 16]), Err(VmError::NotSupported));
        assert_eq!(locked.write(0, &[0u8; 16]), Err(VmError::NotSupported));
        assert_eq!(locked.fault(0), Err(VmError::BadAddress));
        assert_eq!(cache.backend().acquire_unreferenced_store_ref(), Ok(()));
    }

    #[test]
    fn test_default_write_async_reports_through_callback() {
        let vm = VmContext::new(VmConfig::with_pages(4));
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        let result = Arc::new(Mutex::new(None));

        let locked = cache.lock();
        locked
            .write_async(0, &[1, 2, 3], Box::new(Recorder(Arc::clone(&result))))
            .unwrap();

        assert_eq!(*result.lock().unwrap(), Some((Err(VmError::NotSupported), false, 0)));
    }
}
