//! In-process fakes for the network and the host, shared by unit tests.

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{CacheStore, SqliteStorage};
use crate::error::{FetchError, HostError};
use crate::host::{Clients, Notifier, WindowAction};
use crate::http::{Request, Response};
use crate::net::Network;
use crate::notify::Notification;

pub fn url(s: &str) -> Url {
  Url::parse(s).unwrap()
}

pub fn get(s: &str) -> Request {
  Request::get(url(s))
}

pub fn memory_store() -> Arc<CacheStore> {
  Arc::new(CacheStore::new(SqliteStorage::open_in_memory().unwrap()))
}

type Responder = Box<dyn Fn(&Request) -> Result<Response, FetchError> + Send + Sync>;

/// Scripted network that records every request it sees.
pub struct FakeNetwork {
  responder: Mutex<Responder>,
  calls: Mutex<Vec<Request>>,
}

impl FakeNetwork {
  pub fn new(
    responder: impl Fn(&Request) -> Result<Response, FetchError> + Send + Sync + 'static,
  ) -> Arc<Self> {
    Arc::new(Self {
      responder: Mutex::new(Box::new(responder)),
      calls: Mutex::new(Vec::new()),
    })
  }

  /// Answers every request with 200 and the given body.
  pub fn serving(body: &'static str) -> Arc<Self> {
    Self::new(move |_| Ok(Response::ok(body)))
  }

  /// Fails every request as if there were no connectivity.
  pub fn offline() -> Arc<Self> {
    Self::new(|_| Err(FetchError::Network("offline".into())))
  }

  pub fn respond_with(
    &self,
    responder: impl Fn(&Request) -> Result<Response, FetchError> + Send + Sync + 'static,
  ) {
    *self.responder.lock().unwrap() = Box::new(responder);
  }

  pub fn go_offline(&self) {
    self.respond_with(|_| Err(FetchError::Network("offline".into())));
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.lock().unwrap().push(request.clone());
    // Behave like real I/O: give other tasks a chance to run first
    tokio::task::yield_now().await;
    let responder = self.responder.lock().unwrap();
    responder(request)
  }
}

/// Host that records notifications and window navigation.
#[derive(Default)]
pub struct RecordingHost {
  pub shown: Mutex<Vec<Notification>>,
  pub closed: Mutex<Vec<String>>,
  pub windows: Mutex<Vec<Url>>,
  pub focused: Mutex<Vec<Url>>,
  pub claims: Mutex<usize>,
}

impl RecordingHost {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn with_window(self: Arc<Self>, window: Url) -> Arc<Self> {
    self.windows.lock().unwrap().push(window);
    self
  }
}

#[async_trait]
impl Clients for RecordingHost {
  async fn claim(&self) -> Result<usize, HostError> {
    *self.claims.lock().unwrap() += 1;
    Ok(self.windows.lock().unwrap().len())
  }

  async fn focus_or_open(&self, url: &Url) -> Result<WindowAction, HostError> {
    let mut windows = self.windows.lock().unwrap();
    if windows.contains(url) {
      self.focused.lock().unwrap().push(url.clone());
      Ok(WindowAction::Focused)
    } else {
      windows.push(url.clone());
      Ok(WindowAction::Opened)
    }
  }
}

#[async_trait]
impl Notifier for RecordingHost {
  async fn show(&self, notification: &Notification) -> Result<(), HostError> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }

  async fn close(&self, notification: &Notification) -> Result<(), HostError> {
    self.closed.lock().unwrap().push(notification.tag.clone());
    Ok(())
  }
}

/// Byte sink that can be cloned into a writer and read back afterwards.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
  pub fn contents(&self) -> String {
    String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
  }

  pub fn lines(&self) -> Vec<String> {
    self.contents().lines().map(str::to_string).collect()
  }
}

impl Write for SharedBuffer {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.0.lock().unwrap().extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}
