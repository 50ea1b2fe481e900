//! Error types surfaced by the agent's event handlers.

use color_eyre::Report;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single intercepted request.
///
/// This is the only error a controlled page ever observes: cache-first with a
/// cold cache and network-first with nothing to fall back on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Network(String),

  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Invalid URL: {0}")]
  InvalidUrl(String),

  #[error("Cache store error: {0}")]
  Store(String),
}

impl FetchError {
  pub fn store(report: Report) -> Self {
    Self::Store(format!("{:#}", report))
  }
}

/// Failure while installing or activating a generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
  #[error("Failed to precache {url}: {source}")]
  Precache { url: String, source: FetchError },

  #[error("Precache of {url} returned status {status}")]
  PrecacheStatus { url: String, status: u16 },

  #[error("Generation {0} has not finished installing")]
  NotInstalled(String),

  #[error("Cache store error: {0}")]
  Store(String),

  #[error(transparent)]
  Host(#[from] HostError),
}

impl LifecycleError {
  pub fn store(report: Report) -> Self {
    Self::Store(format!("{:#}", report))
  }
}

/// Failure of a host-side effect (showing a notification, opening a window).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
  #[error("Host output failed: {0}")]
  Io(String),
}

/// Any failure a dispatched event can end in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),

  #[error(transparent)]
  Host(#[from] HostError),

  #[error("No handler registered for {0} events")]
  Unhandled(&'static str),

  #[error("Handler for {0} events received a different event")]
  Misrouted(&'static str),
}
