use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;
use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::http::{BodyEncoding, Headers, Request};
use crate::notify::Notification;

/// Events delivered to the agent by its host
#[derive(Debug, Clone)]
pub enum Event {
  /// A new generation was registered
  Install,
  /// The installed generation may take control
  Activate,
  /// A controlled page issued a request
  Fetch(Request),
  /// Background-sync opportunity
  Sync { tag: String },
  /// Push message, payload possibly absent
  Push { payload: Option<Bytes> },
  /// The user clicked a notification
  NotificationClick(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Push,
  NotificationClick,
}

impl EventKind {
  pub fn as_str(self) -> &'static str {
    match self {
      EventKind::Install => "install",
      EventKind::Activate => "activate",
      EventKind::Fetch => "fetch",
      EventKind::Sync => "sync",
      EventKind::Push => "push",
      EventKind::NotificationClick => "notificationclick",
    }
  }
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate => EventKind::Activate,
      Event::Fetch(_) => EventKind::Fetch,
      Event::Sync { .. } => EventKind::Sync,
      Event::Push { .. } => EventKind::Push,
      Event::NotificationClick(_) => EventKind::NotificationClick,
    }
  }
}

/// An event plus the host's correlation id.
#[derive(Debug, Clone)]
pub struct Envelope {
  pub id: Option<String>,
  pub event: Event,
}

#[derive(Deserialize)]
struct WireEnvelope {
  #[serde(default)]
  id: Option<String>,
  #[serde(flatten)]
  event: WireEvent,
}

/// JSON shape of an event line.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
  Install,
  Activate,
  Fetch {
    #[serde(default = "default_method")]
    method: String,
    url: Url,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    encoding: BodyEncoding,
  },
  Sync {
    tag: String,
  },
  Push {
    #[serde(default)]
    payload: Option<String>,
  },
  #[serde(rename = "notificationclick")]
  NotificationClick {
    notification: Notification,
  },
}

fn default_method() -> String {
  "GET".to_string()
}

impl TryFrom<WireEvent> for Event {
  type Error = color_eyre::Report;

  fn try_from(wire: WireEvent) -> Result<Self> {
    Ok(match wire {
      WireEvent::Install => Event::Install,
      WireEvent::Activate => Event::Activate,
      WireEvent::Fetch {
        method,
        url,
        headers,
        body,
        encoding,
      } => {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
          .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
        let body = match body {
          Some(body) => encoding
            .decode(body)
            .map_err(|e| eyre!("Invalid {:?} body: {}", encoding, e))?,
          None => Bytes::new(),
        };
        Event::Fetch(Request {
          method,
          url,
          headers,
          body,
        })
      }
      WireEvent::Sync { tag } => Event::Sync { tag },
      WireEvent::Push { payload } => Event::Push {
        payload: payload.map(Bytes::from),
      },
      WireEvent::NotificationClick { notification } => Event::NotificationClick(notification),
    })
  }
}

/// Parse one line of host input.
pub fn parse_line(line: &str) -> Result<Envelope> {
  let wire: WireEnvelope =
    serde_json::from_str(line).map_err(|e| eyre!("Invalid event line: {}", e))?;
  Ok(Envelope {
    id: wire.id,
    event: Event::try_from(wire.event)?,
  })
}

/// Event handler that reads newline-delimited JSON events from the host
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Envelope>,
}

impl EventHandler {
  /// Create a new event handler reading from `input`
  pub fn new<R>(input: R) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn input reader
    tokio::spawn(async move {
      let mut lines = BufReader::new(input).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match parse_line(&line) {
              Ok(envelope) => {
                if tx.send(envelope).is_err() {
                  break;
                }
              }
              Err(e) => warn!("skipping event: {:#}", e),
            }
          }
          Ok(None) => break,
          Err(e) => {
            warn!("failed to read host input: {}", e);
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Envelope> {
    self.rx.recv().await
  }
}
