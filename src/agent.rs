//! The agent: one generation's components behind an event dispatch table.

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheSource, CacheStorage, CacheStore, Served};
use crate::config::{Config, PartitionNames};
use crate::error::{AgentError, FetchError, LifecycleError};
use crate::event::{Event, EventKind};
use crate::host::{Clients, Notifier};
use crate::http::{BodyEncoding, Headers, Request, Response};
use crate::lifecycle::{ActivateReport, InstallReport, Lifecycle, LifecycleState};
use crate::net::Network;
use crate::notify::NotificationDispatcher;
use crate::rules::RuleTable;
use crate::strategy::PolicyExecutor;
use crate::sync::{ReplayQueue, ReplayReport};

/// What handling an event produced, as reported back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Response {
    status: u16,
    headers: Headers,
    body: String,
    encoding: BodyEncoding,
  },
  Replayed(ReplayReport),
  Notified {
    tag: String,
  },
  Navigated {
    url: Option<String>,
  },
  Ignored {
    reason: String,
  },
  Failed {
    error: String,
  },
}

impl Outcome {
  fn response(response: Response) -> Self {
    let (body, encoding) = BodyEncoding::encode(&response.body);
    Outcome::Response {
      status: response.status,
      headers: response.headers,
      body,
      encoding,
    }
  }
}

type Handler = for<'a> fn(&'a Agent, Event) -> BoxFuture<'a, Result<Outcome, AgentError>>;

/// Event kind → handler, built once when the agent starts.
pub struct DispatchTable {
  handlers: HashMap<EventKind, Handler>,
}

impl DispatchTable {
  fn standard() -> Self {
    let mut handlers: HashMap<EventKind, Handler> = HashMap::new();
    handlers.insert(EventKind::Install, on_install);
    handlers.insert(EventKind::Activate, on_activate);
    handlers.insert(EventKind::Fetch, on_fetch);
    handlers.insert(EventKind::Sync, on_sync);
    handlers.insert(EventKind::Push, on_push);
    handlers.insert(EventKind::NotificationClick, on_notification_click);
    Self { handlers }
  }

  fn get(&self, kind: EventKind) -> Option<Handler> {
    self.handlers.get(&kind).copied()
  }
}

fn on_install<'a>(agent: &'a Agent, _event: Event) -> BoxFuture<'a, Result<Outcome, AgentError>> {
  async move { Ok(Outcome::Installed(agent.install().await?)) }.boxed()
}

fn on_activate<'a>(agent: &'a Agent, _event: Event) -> BoxFuture<'a, Result<Outcome, AgentError>> {
  async move { Ok(Outcome::Activated(agent.activate().await?)) }.boxed()
}

fn on_fetch<'a>(agent: &'a Agent, event: Event) -> BoxFuture<'a, Result<Outcome, AgentError>> {
  async move {
    let Event::Fetch(request) = event else {
      return Err(AgentError::Misrouted(EventKind::Fetch.as_str()));
    };
    let response = agent.fetch(request).await?;
    Ok(Outcome::response(response))
  }
  .boxed()
}

fn on_sync<'a>(agent: &'a Agent, event: Event) -> BoxFuture<'a, Result<Outcome, AgentError>> {
  async move {
    let Event::Sync { tag } = event else {
      return Err(AgentError::Misrouted(EventKind::Sync.as_str()));
    };
    match agent.sync(&tag).await? {
      Some(report) => Ok(Outcome::Replayed(report)),
      None => Ok(Outcome::Ignored {
        reason: format!("unknown sync tag {}", tag),
      }),
    }
  }
  .boxed()
}

fn on_push<'a>(agent: &'a Agent, event: Event) -> BoxFuture<'a, Result<Outcome, AgentError>> {
  async move {
    let Event::Push { payload } = event else {
      return Err(AgentError::Misrouted(EventKind::Push.as_str()));
    };
    match agent.notifications.on_push(payload.as_deref()).await? {
      Some(notification) => Ok(Outcome::Notified {
        tag: notification.tag,
      }),
      None => Ok(Outcome::Ignored {
        reason: "push without usable payload".into(),
      }),
    }
  }
  .boxed()
}

fn on_notification_click<'a>(
  agent: &'a Agent,
  event: Event,
) -> BoxFuture<'a, Result<Outcome, AgentError>> {
  async move {
    let Event::NotificationClick(notification) = event else {
      return Err(AgentError::Misrouted(EventKind::NotificationClick.as_str()));
    };
    let url = agent.notifications.on_click(&notification).await?;
    Ok(Outcome::Navigated {
      url: url.map(String::from),
    })
  }
  .boxed()
}

/// One agent generation.
pub struct Agent {
  store: Arc<CacheStore>,
  network: Arc<dyn Network>,
  names: PartitionNames,
  rules: RuleTable,
  executor: PolicyExecutor,
  lifecycle: Lifecycle,
  replay: ReplayQueue,
  notifications: NotificationDispatcher,
  sync_tag: String,
  dispatch: DispatchTable,
}

impl Agent {
  pub fn new(
    config: &Config,
    storage: impl CacheStorage + 'static,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self> {
    let store = Arc::new(CacheStore::new(storage));
    let names = config.partition_names();

    Ok(Self {
      executor: PolicyExecutor::new(Arc::clone(&store), Arc::clone(&network), names.clone()),
      lifecycle: Lifecycle::new(
        Arc::clone(&store),
        Arc::clone(&network),
        Arc::clone(&clients),
        names.clone(),
        config.precache_urls()?,
      ),
      replay: ReplayQueue::new(
        Arc::clone(&store),
        Arc::clone(&network),
        names.runtime.clone(),
        config.forms_url()?,
      ),
      notifications: NotificationDispatcher::new(
        notifier,
        clients,
        config.origin.clone(),
        config.app_name.clone(),
        config.notifications.clone(),
      ),
      rules: config.rule_table(),
      sync_tag: config.sync_tag.clone(),
      dispatch: DispatchTable::standard(),
      store,
      network,
      names,
    })
  }

  /// Run an event through its handler. Failures become `Outcome::Failed`.
  pub async fn dispatch(&self, event: Event) -> Outcome {
    let kind = event.kind();
    let result = match self.dispatch.get(kind) {
      Some(handler) => handler(self, event).await,
      None => Err(AgentError::Unhandled(kind.as_str())),
    };

    result.unwrap_or_else(|e| {
      warn!(event = %kind, "event failed: {}", e);
      Outcome::Failed {
        error: e.to_string(),
      }
    })
  }

  /// Answer an intercepted request.
  ///
  /// GETs go through the policy their URL classifies as. Form submissions are
  /// queued when offline; every other request goes straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
    if !request.is_get() {
      if self.replay.is_deferred_write(&request) {
        return Ok(self.replay.submit(request).await?.response);
      }
      debug!(method = %request.method, url = %request.url, "passing through");
      return self.network.fetch(&request).await;
    }

    let policy = self.rules.classify(&request.url);
    let Served {
      response,
      source,
      cached_at,
    } = self.executor.execute(policy, &request).await?;
    if source == CacheSource::Offline {
      info!(url = %request.url, ?cached_at, "network unavailable, served cached copy");
    } else {
      debug!(url = %request.url, %policy, ?source, ?cached_at, status = response.status, "served");
    }
    Ok(response)
  }

  pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
    self.lifecycle.install().await
  }

  pub async fn activate(&self) -> Result<ActivateReport, LifecycleError> {
    self.lifecycle.activate().await
  }

  /// Replay queued submissions if `tag` is the configured sync tag.
  pub async fn sync(&self, tag: &str) -> Result<Option<ReplayReport>, FetchError> {
    if tag != self.sync_tag {
      debug!(tag, "ignoring sync with unknown tag");
      return Ok(None);
    }
    self.replay.replay().await.map(Some)
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  /// Entry counts per partition, current partitions flagged.
  pub fn partitions(&self) -> Result<Vec<PartitionSummary>> {
    self
      .store
      .partition_names()?
      .into_iter()
      .map(|name| -> Result<PartitionSummary> {
        let entries = self.store.open(&name)?.len()?;
        Ok(PartitionSummary {
          current: self.names.is_current(&name),
          name,
          entries,
        })
      })
      .collect()
  }

  /// Wait for background revalidations to land.
  pub async fn settle(&self) -> usize {
    self.executor.settle().await
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
  pub name: String,
  pub entries: usize,
  pub current: bool,
}
