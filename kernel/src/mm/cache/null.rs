//! Caches without any backing store

use core::any::Any;

use super::backend::CacheBackend;
use super::CacheType;

/// Store of a cache whose pages only ever exist in memory
pub struct NullCache;

impl CacheBackend for NullCache {
    fn cache_type(&self) -> CacheType {
        CacheType::Null
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::cache::CacheFactory;
    use crate::mm::config::{VmConfig, PAGE_SIZE};
    use crate::mm::context::VmContext;
    use crate::mm::error::VmError;
    use crate::mm::pfn::PageState;

    #[test]
    fn test_null_cache() {
        let vm = VmContext::new(VmConfig::with_pages(4));
        let cache = CacheFactory::create_null_cache(&vm).unwrap();
        assert_eq!(cache.cache_type(), CacheType::Null);
        assert!(cache.store::<NullCache>().is_some());

        let page = vm.pfn().allocate_page(PageState::Active).unwrap();
        let mut locked = cache.lock();
        assert!(locked.is_temporary());
        locked.resize(PAGE_SIZE as u64).unwrap();
        locked.insert_page(page, 0);
        assert_eq!(locked.fault(0), Err(VmError::BadAddress));

        locked.release_ref_and_unlock();
        assert_eq!(vm.pfn().page(page).state(), PageState::Free);
    }
}
