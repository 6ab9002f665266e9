//! Provides a size constrained LRU Cache.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond the given
//! memory budget. Every cache group owns one such cache (its *main cache*) which holds the
//! values this node computed itself as well as the values it fetched from peers.
//!
//! The cache accounts its memory usage byte-exactly as the sum of key length and value size
//! over all entries. Reading an entry promotes it to the most recently used position, therefore
//! entries which are requested over and over effectively never leave the cache, while one-shot
//! values bleed out at the least recently used end.
//!
//! The cache can store all kinds of values for which the [ByteSize](ByteSize) trait is
//! implemented. An optional eviction callback reports every entry which is thrown out due to
//! the memory constraint, so that an application can keep derived book-keeping in sync.
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::LRUCache;
