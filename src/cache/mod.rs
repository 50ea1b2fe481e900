//! Durable cache partitions keyed by request identity.
//!
//! This module provides the storage side of the agent:
//! - Named partitions holding request/response snapshots (one per GET identity)
//! - Queued write requests stored without a response for later replay
//! - Memoized partition handles with explicit open/close/delete

mod layer;
mod storage;
mod traits;

pub use layer::{CacheStore, Partition};
pub use storage::{CacheStorage, SqliteStorage, StoredRequest};
pub use traits::{CacheSource, Served};
