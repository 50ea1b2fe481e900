//! Capture of failed form submissions and their background replay.

use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStore, Partition, Served, StoredRequest};
use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::net::Network;

/// Result of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  pub attempted: usize,
  pub replayed: usize,
  pub retained: usize,
}

/// Queue of form submissions held in the runtime partition.
pub struct ReplayQueue {
  store: Arc<CacheStore>,
  network: Arc<dyn Network>,
  runtime: String,
  endpoint: Url,
}

impl ReplayQueue {
  pub fn new(
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    runtime: String,
    endpoint: Url,
  ) -> Self {
    Self {
      store,
      network,
      runtime,
      endpoint,
    }
  }

  /// A POST to the forms endpoint (query string ignored).
  pub fn is_deferred_write(&self, request: &Request) -> bool {
    request.method == Method::POST
      && request.url.origin() == self.endpoint.origin()
      && request.url.path() == self.endpoint.path()
  }

  /// Send a form submission, queueing it if the network is unavailable.
  ///
  /// A queued submission is acknowledged with `202 Accepted`.
  pub async fn submit(&self, request: Request) -> Result<Served, FetchError> {
    match self.network.fetch(&request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(err) => {
        let id = self
          .partition()?
          .enqueue(&request)
          .map_err(FetchError::store)?;
        info!(id, url = %request.url, error = %err, "queued form submission for replay");
        Ok(Served::queued(
          Response::new(202, r#"{"queued":true}"#).with_header("Content-Type", "application/json"),
        ))
      }
    }
  }

  /// Submissions currently waiting for replay.
  pub fn pending(&self) -> Result<Vec<StoredRequest>, FetchError> {
    let keys = self.partition()?.keys().map_err(FetchError::store)?;
    Ok(
      keys
        .into_iter()
        .filter(|stored| !stored.has_response && self.is_deferred_write(&stored.request))
        .collect(),
    )
  }

  /// Resend every queued submission concurrently. Successful ones are removed;
  /// failed ones stay queued for the next pass.
  pub async fn replay(&self) -> Result<ReplayReport, FetchError> {
    let partition = self.partition()?;
    let pending = self.pending()?;
    if pending.is_empty() {
      debug!("no queued submissions to replay");
      return Ok(ReplayReport::default());
    }

    let results = join_all(
      pending
        .iter()
        .map(|stored| self.replay_one(&partition, stored)),
    )
    .await;

    let replayed = results.iter().filter(|ok| **ok).count();
    let report = ReplayReport {
      attempted: results.len(),
      replayed,
      retained: results.len() - replayed,
    };
    info!(
      attempted = report.attempted,
      replayed = report.replayed,
      retained = report.retained,
      "replayed queued submissions"
    );
    Ok(report)
  }

  async fn replay_one(&self, partition: &Partition, stored: &StoredRequest) -> bool {
    match self.network.fetch(&stored.request).await {
      Ok(response) if response.is_success() => {
        if let Err(e) = partition.delete_entry(stored.id) {
          // Still queued: it will be sent again next time
          warn!(id = stored.id, "failed to remove replayed submission: {:#}", e);
        }
        true
      }
      Ok(response) => {
        warn!(id = stored.id, status = response.status, "replay rejected, keeping submission");
        false
      }
      Err(e) => {
        warn!(id = stored.id, "replay failed, keeping submission: {}", e);
        false
      }
    }
  }

  fn partition(&self) -> Result<Partition, FetchError> {
    self.store.open(&self.runtime).map_err(FetchError::store)
  }
}
