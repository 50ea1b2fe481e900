//! Core types describing where a served response came from.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response handed back to a page, with metadata about its source.
///
/// Pages only ever see `response`; the rest is for logging.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh response straight from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cache hit served without waiting on the network.
  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Cached response served because the network failed.
  pub fn offline(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Synthesized acknowledgement for a write held for later replay.
  pub fn queued(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Queued,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, network not consulted or still revalidating
  Cache,
  /// Offline mode - network failed, serving cached data
  Offline,
  /// Write captured for deferred replay
  Queued,
}
