//! Device memory caches
//!
//! A device cache maps a fixed physical range. It has no store to page
//! from, so faults are bad addresses and I/O is unsupported.

use core::any::Any;

use super::backend::CacheBackend;
use super::{CacheState, CacheType};
use crate::mm::config::is_page_aligned;
use crate::mm::context::VmContext;
use crate::mm::error::{VmError, VmResult};

pub struct DeviceCache {
    base_address: u64,
}

impl DeviceCache {
    pub fn new(base_address: u64) -> Self {
        Self { base_address }
    }

    /// Physical address the cache starts at
    #[inline]
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Physical address backing cache offset `offset`
    pub fn physical_address(&self, offset: u64) -> u64 {
        self.base_address + offset
    }
}

impl CacheBackend for DeviceCache {
    fn cache_type(&self) -> CacheType {
        CacheType::Device
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn init(&self, _vm: &VmContext, _state: &mut CacheState) -> VmResult<()> {
        if !is_page_aligned(self.base_address) {
            log::warn!(
                "[CACHE] Device base {:#x} is not page aligned",
                self.base_address
            );
            return Err(VmError::InvalidParameter);
        }
        Ok(())
    }
}
