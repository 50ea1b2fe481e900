//! Install and activation of an agent generation.

use futures::future::try_join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::config::PartitionNames;
use crate::error::LifecycleError;
use crate::host::Clients;
use crate::http::Request;
use crate::net::Network;

/// Lifecycle state of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Activating,
  Active,
}

#[derive(Debug)]
struct Generation {
  state: LifecycleState,
  /// Precache completed; the generation skips waiting and may activate
  installed: bool,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub partition: String,
  pub cached: usize,
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
  /// Stale partitions removed
  pub deleted: Vec<String>,
  /// Clients now routed through this generation
  pub claimed: usize,
}

pub struct Lifecycle {
  store: Arc<CacheStore>,
  network: Arc<dyn Network>,
  clients: Arc<dyn Clients>,
  names: PartitionNames,
  manifest: Vec<Url>,
  generation: Mutex<Generation>,
}

impl Lifecycle {
  pub fn new(
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
    names: PartitionNames,
    manifest: Vec<Url>,
  ) -> Self {
    Self {
      store,
      network,
      clients,
      names,
      manifest,
      generation: Mutex::new(Generation {
        state: LifecycleState::Installing,
        installed: false,
      }),
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.generation().state
  }

  #[cfg(test)]
  pub fn is_installed(&self) -> bool {
    self.generation().installed
  }

  /// Precache the manifest into the core partition.
  ///
  /// Either every asset is stored or none is: all fetches run concurrently
  /// and a single failure or non-2xx answer aborts the install.
  pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
    info!(partition = %self.names.core, assets = self.manifest.len(), "installing");

    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|source| LifecycleError::Precache {
          url: url.to_string(),
          source,
        })?;
      if !response.is_success() {
        return Err(LifecycleError::PrecacheStatus {
          url: url.to_string(),
          status: response.status,
        });
      }
      Ok((request, response))
    });
    let assets = try_join_all(fetches).await?;

    let core = self
      .store
      .open(&self.names.core)
      .map_err(LifecycleError::store)?;
    for (request, response) in &assets {
      core.put(request, response).map_err(LifecycleError::store)?;
    }

    self.generation().installed = true;
    info!(partition = %self.names.core, cached = assets.len(), "installed, skipping wait");

    Ok(InstallReport {
      partition: self.names.core.clone(),
      cached: assets.len(),
    })
  }

  /// Drop partitions of earlier generations and take control of clients.
  pub async fn activate(&self) -> Result<ActivateReport, LifecycleError> {
    {
      let mut generation = self.generation();
      if !generation.installed {
        return Err(LifecycleError::NotInstalled(self.names.core.clone()));
      }
      if generation.state == LifecycleState::Installing {
        generation.state = LifecycleState::Activating;
      }
    }

    let names = self
      .store
      .partition_names()
      .map_err(LifecycleError::store)?;

    let mut deleted = Vec::new();
    for name in names.into_iter().filter(|n| !self.names.is_current(n)) {
      // A failed delete leaves the partition for the next activation
      match self.store.delete(&name) {
        Ok(_) => deleted.push(name),
        Err(e) => warn!(partition = %name, "failed to delete stale partition: {:#}", e),
      }
    }

    let claimed = self.clients.claim().await?;

    self.generation().state = LifecycleState::Active;
    info!(
      partition = %self.names.core,
      deleted = deleted.len(),
      claimed,
      "activated"
    );

    Ok(ActivateReport { deleted, claimed })
  }

  fn generation(&self) -> std::sync::MutexGuard<'_, Generation> {
    self.generation.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
