//! File-backed caches
//!
//! A vnode cache holds the pages of one file. Page-in and write-back go
//! through the `VnodeIo` the file system provides; store references are
//! references on the vnode itself.

use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicBool, Ordering};

use super::backend::CacheBackend;
use super::{CacheState, CacheType};
use crate::mm::config::{pages_for, PAGE_SIZE};
use crate::mm::context::VmContext;
use crate::mm::error::{VmError, VmResult};

/// File system side of a vnode cache
pub trait VnodeIo: Send + Sync {
    /// Current size of the file in bytes
    fn size(&self) -> u64;

    /// Read file data at `offset`; returns the number of bytes read
    fn read_pages(&self, offset: u64, buffer: &mut [u8]) -> VmResult<usize>;

    /// Write file data at `offset`; returns the number of bytes written
    fn write_pages(&self, offset: u64, data: &[u8]) -> VmResult<usize>;

    /// Take a reference on a vnode that is known to be referenced
    fn acquire_vnode(&self);

    fn put_vnode(&self);

    /// Take a reference on a vnode that may have none left
    fn get_vnode(&self) -> VmResult<()>;
}

/// Backing store of a file cache
pub struct VnodeCache {
    vnode: Arc<dyn VnodeIo>,
    vnode_deleted: AtomicBool,
}

impl VnodeCache {
    pub fn new(vnode: Arc<dyn VnodeIo>) -> Self {
        Self {
            vnode,
            vnode_deleted: AtomicBool::new(false),
        }
    }

    pub fn vnode(&self) -> &Arc<dyn VnodeIo> {
        &self.vnode
    }

    /// Mark the file as deleted; no new store references can be taken
    pub fn set_vnode_deleted(&self, deleted: bool) {
        self.vnode_deleted.store(deleted, Ordering::Release);
    }

    pub fn is_vnode_deleted(&self) -> bool {
        self.vnode_deleted.load(Ordering::Acquire)
    }
}

impl CacheBackend for VnodeCache {
    fn cache_type(&self) -> CacheType {
        CacheType::Vnode
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn init(&self, _vm: &VmContext, state: &mut CacheState) -> VmResult<()> {
        state.virtual_end = self.vnode.size();
        Ok(())
    }

    fn has_page(&self, state: &CacheState, offset: u64) -> bool {
        // The partial last page of the file counts as inside
        let end = pages_for(state.virtual_end) * PAGE_SIZE as u64;
        offset >= state.virtual_base && offset < end
    }

    fn can_write_page(&self, _offset: u64) -> bool {
        true
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> VmResult<usize> {
        let read = self.vnode.read_pages(offset, buffer)?;

        // Past the end of the file reads as zeroes
        if read < buffer.len() {
            buffer[read..].fill(0);
        }
        Ok(read)
    }

    fn write(&self, offset: u64, data: &[u8]) -> VmResult<usize> {
        self.vnode.write_pages(offset, data)
    }

    fn fault(&self, _vm: &VmContext, _state: &mut CacheState, _offset: u64) -> VmResult<()> {
        Err(VmError::NoHandler)
    }

    fn acquire_store_ref(&self) {
        self.vnode.acquire_vnode();
    }

    fn release_store_ref(&self) {
        self.vnode.put_vnode();
    }

    fn acquire_unreferenced_store_ref(&self) -> VmResult<()> {
        if self.is_vnode_deleted() {
            return Err(VmError::Busy);
        }

        self.vnode.get_vnode()?;

        // Deleted while we got hold of it
        if self.is_vnode_deleted() {
            self.vnode.put_vnode();
            return Err(VmError::Busy);
        }
        Ok(())
    }
}
