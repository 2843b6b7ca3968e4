//! harbor-cache — TTL bookkeeping for cached query results.
//!
//! [`ExpiryHeap`] orders keys by deadline and signals a capacity-1 channel
//! only when the soonest deadline changes, so the background sweeper in
//! [`Cache::run_expiry_loop`] sleeps exactly until the next expiry instead
//! of polling.

pub mod cache;
pub mod heap;

pub use cache::Cache;
pub use heap::{ExpiryHeap, HeapEntry};
