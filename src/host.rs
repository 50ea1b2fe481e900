//! The hosting side of the agent: controlled clients, notifications and the
//! stdio event loop.

use async_trait::async_trait;
use color_eyre::Result;
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tracing::{info, warn};
use url::Url;

use crate::agent::{Agent, Outcome};
use crate::error::HostError;
use crate::event::EventHandler;
use crate::notify::Notification;

/// What `focus_or_open` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
  Focused,
  Opened,
}

/// Pages (windows) the agent controls.
#[async_trait]
pub trait Clients: Send + Sync {
  /// Route every in-scope client through this agent. Returns how many were claimed.
  async fn claim(&self) -> Result<usize, HostError>;

  /// Focus a client already showing `url`, or open a new one.
  async fn focus_or_open(&self, url: &Url) -> Result<WindowAction, HostError>;
}

/// Displays notifications to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, notification: &Notification) -> Result<(), HostError>;

  async fn close(&self, notification: &Notification) -> Result<(), HostError>;
}

/// One line written to stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage<'a> {
  Outcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    outcome: &'a Outcome,
  },
  ShowNotification {
    notification: &'a Notification,
  },
  CloseNotification {
    tag: &'a str,
  },
  FocusWindow {
    url: &'a str,
  },
  OpenWindow {
    url: &'a str,
  },
  ClaimClients {
    count: usize,
  },
}

/// Host that speaks newline-delimited JSON, on stdout unless told otherwise.
pub struct StdioHost {
  out: Mutex<Box<dyn Write + Send>>,
  windows: Mutex<Vec<Url>>,
}

impl StdioHost {
  pub fn new() -> Arc<Self> {
    Self::with_writer(std::io::stdout())
  }

  pub fn with_writer(out: impl Write + Send + 'static) -> Arc<Self> {
    Arc::new(Self {
      out: Mutex::new(Box::new(out)),
      windows: Mutex::new(Vec::new()),
    })
  }

  /// Write one message as a single line and flush it.
  pub fn emit(&self, message: &HostMessage<'_>) -> Result<(), HostError> {
    let line = serde_json::to_string(message).map_err(|e| HostError::Io(e.to_string()))?;
    let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
    writeln!(out, "{}", line)
      .and_then(|_| out.flush())
      .map_err(|e| HostError::Io(e.to_string()))
  }

  fn windows(&self) -> std::sync::MutexGuard<'_, Vec<Url>> {
    self.windows.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[async_trait]
impl Clients for StdioHost {
  async fn claim(&self) -> Result<usize, HostError> {
    let count = self.windows().len();
    self.emit(&HostMessage::ClaimClients { count })?;
    Ok(count)
  }

  async fn focus_or_open(&self, url: &Url) -> Result<WindowAction, HostError> {
    let known = self.windows().contains(url);
    if known {
      self.emit(&HostMessage::FocusWindow { url: url.as_str() })?;
      Ok(WindowAction::Focused)
    } else {
      self.emit(&HostMessage::OpenWindow { url: url.as_str() })?;
      self.windows().push(url.clone());
      Ok(WindowAction::Opened)
    }
  }
}

#[async_trait]
impl Notifier for StdioHost {
  async fn show(&self, notification: &Notification) -> Result<(), HostError> {
    self.emit(&HostMessage::ShowNotification { notification })
  }

  async fn close(&self, notification: &Notification) -> Result<(), HostError> {
    self.emit(&HostMessage::CloseNotification {
      tag: &notification.tag,
    })
  }
}

/// Feed events from `input` to the agent until the input ends.
///
/// Every event runs as its own task; outcomes are written in completion order
/// and carry the event's `id` when it had one.
pub async fn run<R>(agent: Arc<Agent>, host: Arc<StdioHost>, input: R) -> Result<()>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  let mut events = EventHandler::new(input);
  let mut tasks = JoinSet::new();

  while let Some(envelope) = events.next().await {
    let agent = Arc::clone(&agent);
    let host = Arc::clone(&host);
    tasks.spawn(async move {
      let outcome = agent.dispatch(envelope.event).await;
      let message = HostMessage::Outcome {
        id: envelope.id.as_deref(),
        outcome: &outcome,
      };
      if let Err(e) = host.emit(&message) {
        warn!("failed to write outcome: {}", e);
      }
    });
  }

  while let Some(result) = tasks.join_next().await {
    if let Err(e) = result {
      warn!("event task failed: {}", e);
    }
  }

  let settled = agent.settle().await;
  info!(settled, "input closed, agent idle");
  Ok(())
}
