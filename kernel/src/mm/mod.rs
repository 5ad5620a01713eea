//! Memory Manager (mm)
//!
//! The memory manager's cache layer:
//!
//! - **PFN Database**: State and ownership of every physical page
//! - **Areas**: Mappings of caches into address spaces
//! - **Caches**: Page ownership, copy-on-write chains, backing stores
//! - **Writeback**: Writing modified pages back to their store
//!
//! Everything hangs off a `VmContext`, which owns the page frame database,
//! the global cache registry and the commit accounting.
//!
//! # Key Structures
//!
//! - `VmPage`: Page Frame Number database entry
//! - `VmArea`: A mapping of a cache range
//! - `VmCache`: A cache and its locked view, `LockedCache`

pub mod area;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod pfn;
pub mod writeback;

pub use area::{mm_remove_all_page_mappings, AreaId, AreaProtection, VmArea};
pub use cache::{
    CacheBackend, CacheFactory, CacheId, CacheState, CacheType, LockedCache, PageEvents, VmCache,
};
pub use config::{VmConfig, PAGE_SHIFT, PAGE_SIZE};
pub use context::VmContext;
pub use error::{VmError, VmResult};
pub use pfn::{mm_page_state_name, PageId, PageState, PfnDatabase, PfnStats, VmPage};
pub use writeback::mm_write_modified_pages;
