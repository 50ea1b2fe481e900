//! Policy executors: cache-first, network-first and stale-while-revalidate.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheStore, Partition, Served};
use crate::config::PartitionNames;
use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::net::Network;
use crate::rules::Policy;

type Revalidation = JoinHandle<Result<Response, FetchError>>;

/// Background cache refreshes that outlive the request that started them.
#[derive(Default)]
pub struct BackgroundTasks {
  handles: Mutex<Vec<Revalidation>>,
}

impl BackgroundTasks {
  fn track(&self, handle: Revalidation) {
    let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Wait for every tracked refresh to finish. Returns how many were awaited.
  pub async fn settle(&self) -> usize {
    let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
    let count = handles.len();

    for handle in handles {
      // Fetch failures were already logged by the task itself
      if let Err(e) = handle.await {
        warn!("background revalidation task aborted: {}", e);
      }
    }

    count
  }
}

/// Runs a GET request through one of the three caching policies.
///
/// Cache writes are plain overwrites; two requests racing on the same URL
/// leave whichever response was stored last.
pub struct PolicyExecutor {
  store: Arc<CacheStore>,
  network: Arc<dyn Network>,
  names: PartitionNames,
  background: BackgroundTasks,
}

impl PolicyExecutor {
  pub fn new(store: Arc<CacheStore>, network: Arc<dyn Network>, names: PartitionNames) -> Self {
    Self {
      store,
      network,
      names,
      background: BackgroundTasks::default(),
    }
  }

  pub async fn execute(&self, policy: Policy, request: &Request) -> Result<Served, FetchError> {
    match policy {
      Policy::CacheFirst => self.cache_first(request).await,
      Policy::NetworkFirst => self.network_first(request).await,
      Policy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Serve from the core partition; on a miss fetch, store and return.
  pub async fn cache_first(&self, request: &Request) -> Result<Served, FetchError> {
    let core = self.partition(&self.names.core)?;

    if let Some(hit) = core.lookup(request).map_err(FetchError::store)? {
      debug!(url = %request.url, "cache-first hit");
      return Ok(Served::from_cache(hit.response, hit.cached_at));
    }

    debug!(url = %request.url, "cache-first miss");
    let response = self.network.fetch(request).await?;
    store_response(&core, request, &response);
    Ok(Served::from_network(response))
  }

  /// Prefer the network; fall back to the runtime partition when it fails.
  pub async fn network_first(&self, request: &Request) -> Result<Served, FetchError> {
    let runtime = self.partition(&self.names.runtime)?;

    match self.network.fetch(request).await {
      Ok(response) => {
        store_response(&runtime, request, &response);
        Ok(Served::from_network(response))
      }
      Err(err) => match runtime.lookup(request) {
        Ok(Some(hit)) => {
          debug!(url = %request.url, error = %err, "network failed, serving cached copy");
          Ok(Served::offline(hit.response, hit.cached_at))
        }
        Ok(None) => Err(err),
        Err(store_err) => {
          warn!(url = %request.url, "cache fallback failed: {:#}", store_err);
          Err(err)
        }
      },
    }
  }

  /// Serve the cached copy right away and refresh it in the background. With
  /// nothing cached, wait for the refresh instead.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Served, FetchError> {
    let runtime = self.partition(&self.names.runtime)?;

    let revalidation = {
      let network = Arc::clone(&self.network);
      let partition = runtime.clone();
      let request = request.clone();
      tokio::spawn(async move {
        match network.fetch(&request).await {
          Ok(response) => {
            store_response(&partition, &request, &response);
            Ok(response)
          }
          Err(e) => {
            debug!(url = %request.url, "revalidation failed: {}", e);
            Err(e)
          }
        }
      })
    };

    let cached = match runtime.lookup(request) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, "cache lookup failed: {:#}", e);
        None
      }
    };

    match cached {
      Some(hit) => {
        debug!(url = %request.url, "serving cached copy while revalidating");
        self.background.track(revalidation);
        Ok(Served::from_cache(hit.response, hit.cached_at))
      }
      None => {
        let response = revalidation
          .await
          .map_err(|e| FetchError::Network(format!("revalidation task failed: {}", e)))??;
        Ok(Served::from_network(response))
      }
    }
  }

  pub async fn settle(&self) -> usize {
    self.background.settle().await
  }

  fn partition(&self, name: &str) -> Result<Partition, FetchError> {
    self.store.open(name).map_err(FetchError::store)
  }
}

/// Write a successful response into the partition. Store failures do not
/// fail the request that produced the response.
fn store_response(partition: &Partition, request: &Request, response: &Response) {
  if !response.is_success() {
    debug!(url = %request.url, status = response.status, "not caching unsuccessful response");
    return;
  }

  if let Err(e) = partition.put(request, response) {
    warn!(
      url = %request.url,
      partition = partition.name(),
      "failed to cache response: {:#}",
      e
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::testing::{get, memory_store, FakeNetwork, SharedBuffer};

  fn names() -> PartitionNames {
    PartitionNames {
      core: "app-cache-v1".into(),
      runtime: "runtime-cache".into(),
    }
  }

  fn executor(store: &Arc<CacheStore>, network: &Arc<FakeNetwork>) -> PolicyExecutor {
    PolicyExecutor::new(Arc::clone(store), network.clone(), names())
  }

  fn cached_body(store: &CacheStore, partition: &str, request: &Request) -> Option<Vec<u8>> {
    store
      .open(partition)
      .unwrap()
      .lookup(request)
      .unwrap()
      .map(|hit| hit.response.body.to_vec())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let store = memory_store();
    let network = FakeNetwork::serving("from network");
    let request = get("https://app.test/static/js/app.js");
    store
      .open("app-cache-v1")
      .unwrap()
      .put(&request, &Response::ok("from cache"))
      .unwrap();

    let served = executor(&store, &network).cache_first(&request).await.unwrap();

    assert_eq!(served.response.body.as_ref(), b"from cache");
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores_in_core() {
    let store = memory_store();
    let network = FakeNetwork::serving("body{}");
    let request = get("https://app.test/static/css/main.css");

    let served = executor(&store, &network).cache_first(&request).await.unwrap();

    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(cached_body(&store, "app-cache-v1", &request), Some(b"body{}".to_vec()));
    assert_eq!(cached_body(&store, "runtime-cache", &request), None);
  }

  #[tokio::test]
  async fn test_cache_first_twice_hits_cache_second_time() {
    let store = memory_store();
    let network = FakeNetwork::serving("stable");
    let executor = executor(&store, &network);
    let request = get("https://app.test/static/js/app.js");

    let first = executor.cache_first(&request).await.unwrap();
    let second = executor.cache_first(&request).await.unwrap();

    assert_eq!(first.response, second.response);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(network.call_count(), 1);
    assert_eq!(store.open("app-cache-v1").unwrap().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_cold_cache_offline_propagates() {
    let store = memory_store();
    let network = FakeNetwork::offline();
    let request = get("https://app.test/static/js/app.js");

    let err = executor(&store, &network).cache_first(&request).await.unwrap_err();
    assert_eq!(err, FetchError::Network("offline".into()));
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let store = memory_store();
    let network = FakeNetwork::new(|_| Ok(Response::new(404, "missing")));
    let request = get("https://app.test/static/js/gone.js");

    let served = executor(&store, &network).cache_first(&request).await.unwrap();

    assert_eq!(served.response.status, 404);
    assert_eq!(cached_body(&store, "app-cache-v1", &request), None);
  }

  #[tokio::test]
  async fn test_network_first_stores_fresh_response() {
    let store = memory_store();
    let network = FakeNetwork::serving("{\"name\":\"ada\"}");
    let request = get("https://app.test/api/profile");

    let served = executor(&store, &network).network_first(&request).await.unwrap();

    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(
      cached_body(&store, "runtime-cache", &request),
      Some(b"{\"name\":\"ada\"}".to_vec())
    );
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_runtime_cache() {
    let store = memory_store();
    let network = FakeNetwork::serving("fresh profile");
    let executor = executor(&store, &network);
    let request = get("https://app.test/api/profile");

    executor.network_first(&request).await.unwrap();
    network.go_offline();

    let served = executor.network_first(&request).await.unwrap();
    assert_eq!(served.response.body.as_ref(), b"fresh profile");
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(network.call_count(), 2);
  }

  #[tokio::test]
  async fn test_network_first_ignores_core_partition() {
    let store = memory_store();
    let network = FakeNetwork::offline();
    let request = get("https://app.test/");
    store
      .open("app-cache-v1")
      .unwrap()
      .put(&request, &Response::ok("precached"))
      .unwrap();

    let err = executor(&store, &network).network_first(&request).await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
  }

  #[tokio::test]
  async fn test_network_first_exhausted_propagates_network_error() {
    let store = memory_store();
    let network = FakeNetwork::new(|_| Err(FetchError::Timeout(std::time::Duration::from_secs(10))));
    let request = get("https://app.test/api/profile");

    let err = executor(&store, &network).network_first(&request).await.unwrap_err();
    assert_eq!(err, FetchError::Timeout(std::time::Duration::from_secs(10)));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cached_then_refreshes() {
    let store = memory_store();
    let network = FakeNetwork::serving("new bytes");
    let executor = executor(&store, &network);
    let request = get("https://app.test/img/hero.png");
    store
      .open("runtime-cache")
      .unwrap()
      .put(&request, &Response::ok("old bytes"))
      .unwrap();

    let served = executor.stale_while_revalidate(&request).await.unwrap();
    assert_eq!(served.response.body.as_ref(), b"old bytes");
    assert_eq!(served.source, CacheSource::Cache);

    assert_eq!(executor.settle().await, 1);
    assert_eq!(network.call_count(), 1);
    assert_eq!(cached_body(&store, "runtime-cache", &request), Some(b"new bytes".to_vec()));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_for_network() {
    let store = memory_store();
    let network = FakeNetwork::serving("first bytes");
    let executor = executor(&store, &network);
    let request = get("https://app.test/img/logo.webp");

    let served = executor.stale_while_revalidate(&request).await.unwrap();

    assert_eq!(served.response.body.as_ref(), b"first bytes");
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(executor.settle().await, 0);
    assert_eq!(cached_body(&store, "runtime-cache", &request), Some(b"first bytes".to_vec()));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_offline_keeps_cached_copy() {
    let store = memory_store();
    let network = FakeNetwork::offline();
    let executor = executor(&store, &network);
    let request = get("https://app.test/img/hero.png");
    store
      .open("runtime-cache")
      .unwrap()
      .put(&request, &Response::ok("old bytes"))
      .unwrap();

    let served = executor.stale_while_revalidate(&request).await.unwrap();
    assert_eq!(served.response.body.as_ref(), b"old bytes");

    executor.settle().await;
    assert_eq!(cached_body(&store, "runtime-cache", &request), Some(b"old bytes".to_vec()));
  }

  #[tokio::test]
  async fn test_failed_background_revalidation_is_logged() {
    let logs = SharedBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_ansi(false)
      .with_writer(move || writer.clone())
      .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = memory_store();
    let network = FakeNetwork::offline();
    let executor = executor(&store, &network);
    let request = get("https://app.test/img/hero.png");
    store
      .open("runtime-cache")
      .unwrap()
      .put(&request, &Response::ok("old bytes"))
      .unwrap();

    executor.stale_while_revalidate(&request).await.unwrap();
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    // The second request prunes the first, already finished refresh
    executor.stale_while_revalidate(&request).await.unwrap();
    executor.settle().await;

    let logs = logs.contents();
    assert_eq!(
      logs.matches("revalidation failed: Network error: offline").count(),
      2,
      "{}",
      logs
    );
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_offline_propagates() {
    let store = memory_store();
    let network = FakeNetwork::offline();
    let request = get("https://app.test/img/none.png");

    let err = executor(&store, &network)
      .stale_while_revalidate(&request)
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Network("offline".into()));
  }

  #[tokio::test]
  async fn test_execute_routes_by_policy() {
    let store = memory_store();
    let network = FakeNetwork::serving("x");
    let executor = executor(&store, &network);
    let request = get("https://app.test/anything");

    executor.execute(Policy::CacheFirst, &request).await.unwrap();
    executor.execute(Policy::NetworkFirst, &request).await.unwrap();

    assert!(cached_body(&store, "app-cache-v1", &request).is_some());
    assert!(cached_body(&store, "runtime-cache", &request).is_some());
  }
}
