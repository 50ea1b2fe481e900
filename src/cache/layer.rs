//! Partition manager that hands out memoized partition handles.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::storage::{CachedResponse, CacheStorage, EntryId, StoredRequest};
use crate::http::{Request, Response};

/// Entry point to the durable cache store.
///
/// Partition handles are opened lazily and memoized until `close` or
/// `delete`. Opening a partition creates it in the backing store.
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
  handles: Mutex<HashMap<String, Partition>>,
}

impl CacheStore {
  /// Create a new cache store over the given storage backend.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
      handles: Mutex::new(HashMap::new()),
    }
  }

  /// Open or create a partition.
  pub fn open(&self, name: &str) -> Result<Partition> {
    let mut handles = self
      .handles
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(handle) = handles.get(name) {
      return Ok(handle.clone());
    }

    self.storage.create_partition(name)?;
    debug!(partition = name, "opened cache partition");

    let handle = Partition {
      name: Arc::from(name),
      storage: Arc::clone(&self.storage),
    };
    handles.insert(name.to_string(), handle.clone());
    Ok(handle)
  }

  /// Forget the memoized handle. The partition's data stays in the store.
  pub fn close(&self, name: &str) -> Result<bool> {
    let mut handles = self
      .handles
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(handles.remove(name).is_some())
  }

  /// Names of every partition in the store, open or not.
  pub fn partition_names(&self) -> Result<Vec<String>> {
    self.storage.partition_names()
  }

  /// Delete a partition. Deleting a partition that does not exist is a no-op.
  pub fn delete(&self, name: &str) -> Result<bool> {
    self.close(name)?;
    let removed = self.storage.delete_partition(name)?;
    if removed {
      info!(partition = name, "deleted cache partition");
    }
    Ok(removed)
  }
}

/// Handle to one named partition.
#[derive(Clone)]
pub struct Partition {
  name: Arc<str>,
  storage: Arc<dyn CacheStorage>,
}

impl Partition {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Cached response for the request's identity, if any.
  pub fn lookup(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.get(&self.name, &request.key())
  }

  /// Store a snapshot of `response`, replacing the previous one.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self.storage.put(&self.name, request, response)
  }

  /// Hold a request with no response, e.g. a write waiting for replay.
  pub fn enqueue(&self, request: &Request) -> Result<EntryId> {
    self.storage.enqueue(&self.name, request)
  }

  pub fn keys(&self) -> Result<Vec<StoredRequest>> {
    self.storage.keys(&self.name)
  }

  pub fn delete_entry(&self, id: EntryId) -> Result<bool> {
    self.storage.delete_entry(&self.name, id)
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.len(&self.name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use url::Url;

  fn store() -> CacheStore {
    CacheStore::new(SqliteStorage::open_in_memory().unwrap())
  }

  #[test]
  fn test_open_is_memoized() {
    let store = store();
    let a = store.open("runtime-cache").unwrap();
    let b = store.open("runtime-cache").unwrap();
    assert!(Arc::ptr_eq(&a.name, &b.name));
  }

  #[test]
  fn test_open_creates_partition() {
    let store = store();
    store.open("app-cache-v1").unwrap();
    assert_eq!(store.partition_names().unwrap(), vec!["app-cache-v1"]);
  }

  #[test]
  fn test_close_keeps_data() {
    let store = store();
    let request = Request::get(Url::parse("https://app.test/").unwrap());
    store
      .open("runtime-cache")
      .unwrap()
      .put(&request, &Response::ok("home"))
      .unwrap();

    assert!(store.close("runtime-cache").unwrap());
    assert!(!store.close("runtime-cache").unwrap());

    let reopened = store.open("runtime-cache").unwrap();
    let cached = reopened.lookup(&request).unwrap().unwrap();
    assert_eq!(cached.response.body.as_ref(), b"home");
  }

  #[test]
  fn test_delete_missing_partition_is_noop() {
    let store = store();
    assert!(!store.delete("never-existed").unwrap());
  }

  #[test]
  fn test_delete_then_reopen_starts_empty() {
    let store = store();
    let request = Request::get(Url::parse("https://app.test/a.css").unwrap());
    let partition = store.open("app-cache-v1").unwrap();
    partition.put(&request, &Response::ok("body{}")).unwrap();

    assert!(store.delete("app-cache-v1").unwrap());
    assert!(store.partition_names().unwrap().is_empty());

    let fresh = store.open("app-cache-v1").unwrap();
    assert_eq!(fresh.len().unwrap(), 0);
  }
}
