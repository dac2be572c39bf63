// Page cache: a bounded LRU keyed by (block-id, page-id) sitting in front of
// the container file.

pub mod page_cache;

pub use page_cache::{FlushPredicate, PageCache, PageKey, PageSource};
