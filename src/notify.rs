//! Push payload decoding and notification click routing.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationConfig;
use crate::error::HostError;
use crate::host::{Clients, Notifier, WindowAction};

/// Structured content of a push message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
}

/// Opaque data attached to a notification and handed back on click.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  /// Identifies the notification when it is clicked or closed
  pub tag: String,
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub badge: Option<String>,
  #[serde(default)]
  pub data: NotificationData,
}

fn next_tag() -> String {
  static COUNTER: AtomicU64 = AtomicU64::new(1);
  format!("cachet-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub struct NotificationDispatcher {
  notifier: Arc<dyn Notifier>,
  clients: Arc<dyn Clients>,
  origin: Url,
  app_name: String,
  config: NotificationConfig,
}

impl NotificationDispatcher {
  pub fn new(
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn Clients>,
    origin: Url,
    app_name: String,
    config: NotificationConfig,
  ) -> Self {
    Self {
      notifier,
      clients,
      origin,
      app_name,
      config,
    }
  }

  /// Show a notification for a push message.
  ///
  /// An absent or empty payload does nothing. A payload that is not valid JSON
  /// is logged and dropped.
  pub async fn on_push(&self, payload: Option<&[u8]>) -> Result<Option<Notification>, HostError> {
    let payload = match payload {
      Some(bytes) if !bytes.is_empty() => bytes,
      _ => {
        debug!("push without payload, ignoring");
        return Ok(None);
      }
    };

    let decoded: PushPayload = match serde_json::from_slice(payload) {
      Ok(decoded) => decoded,
      Err(e) => {
        warn!("ignoring malformed push payload: {}", e);
        return Ok(None);
      }
    };

    let notification = Notification {
      tag: next_tag(),
      title: decoded.title.unwrap_or_else(|| self.app_name.clone()),
      body: decoded.body.unwrap_or_default(),
      icon: Some(self.config.icon.clone()),
      badge: Some(self.config.badge.clone()),
      data: NotificationData { url: decoded.url },
    };

    self.notifier.show(&notification).await?;
    info!(tag = %notification.tag, title = %notification.title, "notification shown");
    Ok(Some(notification))
  }

  /// Close the notification and navigate to its target, if it has one.
  pub async fn on_click(&self, notification: &Notification) -> Result<Option<Url>, HostError> {
    self.notifier.close(notification).await?;

    let Some(destination) = notification.data.url.as_deref() else {
      return Ok(None);
    };

    let url = match self.origin.join(destination) {
      Ok(url) => url,
      Err(e) => {
        warn!(destination, "notification target is not a valid URL: {}", e);
        return Ok(None);
      }
    };

    match self.clients.focus_or_open(&url).await? {
      WindowAction::Focused => debug!(%url, "focused existing client"),
      WindowAction::Opened => debug!(%url, "opened new client"),
    }
    Ok(Some(url))
  }
}
