//! Area Implementation
//!
//! An area is one mapping of a cache into an address space: a virtual
//! range `[base, base + size)` showing the cache's contents starting at
//! `cache_offset`. Page tables are not modelled; each area keeps the set
//! of cache pages it currently maps, which is what the cache needs when it
//! has to invalidate mappings (resize, discard).
//!
//! # Lock order
//!
//! An area's mapping table is locked before a page's mapping list, never
//! the other way round.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::mm::cache::CacheId;
use crate::mm::config::{page_offset, PAGE_SIZE};
use crate::mm::error::{VmError, VmResult};
use crate::mm::pfn::{PageId, PfnDatabase};

bitflags::bitflags! {
    /// Area protection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AreaProtection: u32 {
        /// User readable
        const READ = 0x0000_0001;
        /// User writable
        const WRITE = 0x0000_0002;
        /// User executable
        const EXECUTE = 0x0000_0004;
        /// Kernel readable
        const KERNEL_READ = 0x0000_0010;
        /// Kernel writable
        const KERNEL_WRITE = 0x0000_0020;
        /// Kernel executable
        const KERNEL_EXECUTE = 0x0000_0040;
    }
}

/// Next area id to hand out
static NEXT_AREA_ID: AtomicU32 = AtomicU32::new(1);

/// Area identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub u32);

/// Raw value of an area not attached to a cache
const NO_CACHE: u32 = u32::MAX;

/// A mapping of a cache into an address space
pub struct VmArea {
    id: AreaId,
    /// Virtual start address
    base: u64,
    /// Size in bytes
    size: u64,
    /// Byte offset into the cache shown at `base`
    cache_offset: u64,
    protection: AreaProtection,
    /// Cache the area currently maps (raw `CacheId`)
    cache: AtomicU32,
    /// Mapped pages by cache page index
    mapped: Mutex<BTreeMap<u64, PageId>>,
}

impl VmArea {
    /// Create a detached area
    pub fn new(base: u64, size: u64, cache_offset: u64, protection: AreaProtection) -> Arc<Self> {
        let id = AreaId(NEXT_AREA_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "[AREA] Created area {} base={:#x} size={:#x} offset={:#x}",
            id.0,
            base,
            size,
            cache_offset
        );

        Arc::new(Self {
            id,
            base,
            size,
            cache_offset,
            protection,
            cache: AtomicU32::new(NO_CACHE),
            mapped: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> AreaId {
        self.id
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn cache_offset(&self) -> u64 {
        self.cache_offset
    }

    #[inline]
    pub fn protection(&self) -> AreaProtection {
        self.protection
    }

    /// Check if user or kernel may write through this area
    pub fn is_writable(&self) -> bool {
        self.protection
            .intersects(AreaProtection::WRITE | AreaProtection::KERNEL_WRITE)
    }

    /// Cache the area is attached to
    pub fn cache_id(&self) -> Option<CacheId> {
        match self.cache.load(Ordering::Acquire) {
            NO_CACHE => None,
            raw => Some(CacheId(raw)),
        }
    }

    pub(crate) fn set_cache(&self, cache: Option<CacheId>) {
        self.cache
            .store(cache.map_or(NO_CACHE, |id| id.0), Ordering::Release);
    }

    /// Check if a cache byte offset falls inside this area
    pub fn contains_cache_offset(&self, offset: u64) -> bool {
        offset >= self.cache_offset && offset - self.cache_offset < self.size
    }

    /// Virtual address at which a cache page index appears
    pub fn address_of(&self, page_index: u64) -> Option<u64> {
        let offset = page_offset(page_index);
        if self.contains_cache_offset(offset) {
            Some(self.base + (offset - self.cache_offset))
        } else {
            None
        }
    }

    /// Map a cache page into this area
    ///
    /// # Arguments
    /// * `pfn` - Page database the page lives in
    /// * `page_index` - Page index of the page inside the cache
    /// * `page` - The page to map
    pub fn map_page(
        self: &Arc<Self>,
        pfn: &PfnDatabase,
        page_index: u64,
        page: PageId,
    ) -> VmResult<()> {
        if self.address_of(page_index).is_none() {
            return Err(VmError::InvalidParameter);
        }

        let mut mapped = self.mapped.lock();
        if mapped.contains_key(&page_index) {
            return Err(VmError::Busy);
        }
        mapped.insert(page_index, page);
        pfn.page(page).add_mapping(Arc::clone(self));

        log::trace!("[AREA] Area {} mapped page {} at index {}", self.id.0, page.0, page_index);
        Ok(())
    }

    /// Unmap the page at a cache page index
    pub fn unmap_page(&self, pfn: &PfnDatabase, page_index: u64) -> Option<PageId> {
        let mut mapped = self.mapped.lock();
        let page = mapped.remove(&page_index)?;
        pfn.page(page).remove_mapping(self);
        Some(page)
    }

    /// Unmap every page; returns the number of pages unmapped
    pub fn unmap_all(&self, pfn: &PfnDatabase) -> usize {
        let mut mapped = self.mapped.lock();
        let count = mapped.len();
        for (_, page) in core::mem::take(&mut *mapped) {
            pfn.page(page).remove_mapping(self);
        }
        count
    }

    /// Page mapped at a cache page index
    pub fn lookup(&self, page_index: u64) -> Option<PageId> {
        self.mapped.lock().get(&page_index).copied()
    }

    /// Number of mapped pages
    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }

    /// Number of pages the area spans
    pub fn page_count(&self) -> u64 {
        self.size / PAGE_SIZE as u64
    }
}

/// Remove a page from every area mapping it
///
/// Returns the number of mappings torn down.
pub fn mm_remove_all_page_mappings(pfn: &PfnDatabase, page: PageId) -> usize {
    let areas = pfn.page(page).take_mappings();
    let mut removed = 0;

    for area in &areas {
        let mut mapped = area.mapped.lock();
        let before = mapped.len();
        mapped.retain(|_, mapped_page| *mapped_page != page);
        removed += before - mapped.len();
    }

    if removed > 0 {
        log::trace!("[AREA] Removed {} mappings of page {}", removed, page.0);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pfn::PageState;

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_protection() {
        let area = VmArea::new(0x10000, 4 * PAGE, 0, AreaProtection::READ);
        assert!(!area.is_writable());

        let area = VmArea::new(0x10000, 4 * PAGE, 0, AreaProtection::KERNEL_WRITE);
        assert!(area.is_writable());
        assert!(area.cache_id().is_none());
    }

    #[test]
    fn test_address_of() {
        let area = VmArea::new(0x10000, 2 * PAGE, PAGE, AreaProtection::READ);
        assert_eq!(area.address_of(0), None);
        assert_eq!(area.address_of(1), Some(0x10000));
        assert_eq!(area.address_of(2), Some(0x10000 + PAGE));
        assert_eq!(area.address_of(3), None);
        assert_eq!(area.page_count(), 2);
    }

    #[test]
    fn test_map_unmap() {
        let pfn = PfnDatabase::new(2);
        let page = pfn.allocate_page(PageState::Active).unwrap();
        let area = VmArea::new(0, 2 * PAGE, 0, AreaProtection::READ | AreaProtection::WRITE);

        area.map_page(&pfn, 1, page).unwrap();
        assert_eq!(area.map_page(&pfn, 1, page), Err(VmError::Busy));
        assert_eq!(area.map_page(&pfn, 5, page), Err(VmError::InvalidParameter));
        assert!(pfn.page(page).is_mapped());
        assert_eq!(area.lookup(1), Some(page));

        assert_eq!(area.unmap_page(&pfn, 1), Some(page));
        assert!(!pfn.page(page).is_mapped());
        assert_eq!(area.unmap_page(&pfn, 1), None);
    }

    #[test]
    fn test_remove_all_page_mappings() {
        let pfn = PfnDatabase::new(2);
        let page = pfn.allocate_page(PageState::Active).unwrap();
        let other = pfn.allocate_page(PageState::Active).unwrap();
        let first = VmArea::new(0, 4 * PAGE, 0, AreaProtection::READ);
        let second = VmArea::new(0x8000, 4 * PAGE, 0, AreaProtection::READ);

        first.map_page(&pfn, 2, page).unwrap();
        first.map_page(&pfn, 3, other).unwrap();
        second.map_page(&pfn, 2, page).unwrap();
        assert_eq!(pfn.page(page).mapping_count(), 2);

        assert_eq!(mm_remove_all_page_mappings(&pfn, page), 2);
        assert!(!pfn.page(page).is_mapped());
        assert_eq!(first.mapped_count(), 1);
        assert_eq!(second.mapped_count(), 0);
        assert!(pfn.page(other).is_mapped());
    }

    #[test]
    fn test_unmap_all() {
        let pfn = PfnDatabase::new(2);
        let a = pfn.allocate_page(PageState::Active).unwrap();
        let b = pfn.allocate_page(PageState::Active).unwrap();
        let area = VmArea::new(0, 2 * PAGE, 0, AreaProtection::READ);
        area.map_page(&pfn, 0, a).unwrap();
        area.map_page(&pfn, 1, b).unwrap();

        assert_eq!(area.unmap_all(&pfn), 2);
        assert!(!pfn.page(a).is_mapped());
        assert!(!pfn.page(b).is_mapped());
    }
}
