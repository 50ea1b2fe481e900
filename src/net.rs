//! Network access to the remote origin.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::trace;

use crate::error::FetchError;
use crate::http::{Request, Response};

/// Anything that can turn a request into a response over the network.
#[async_trait]
pub trait Network: Send + Sync {
  /// Send the request. Any HTTP status is a successful fetch; only transport
  /// failures (offline, DNS, timeout) are errors.
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// `reqwest`-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("cachet/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, timeout })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    trace!(method = %request.method, url = %request.url, "network fetch");

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|e| self.classify(e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(|e| self.classify(e))?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl HttpNetwork {
  fn classify(&self, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else if err.is_builder() {
      FetchError::InvalidUrl(err.to_string())
    } else {
      FetchError::Network(err.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;
  use wiremock::matchers::{body_string, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn network() -> HttpNetwork {
    HttpNetwork::new(Duration::from_secs(5)).unwrap()
  }

  #[tokio::test]
  async fn test_fetch_returns_status_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/static/js/app.js"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header("content-type", "application/javascript")
          .set_body_string("console.log('hi')"),
      )
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/static/js/app.js", server.uri())).unwrap();
    let response = network().fetch(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/javascript"));
    assert_eq!(response.body.as_ref(), b"console.log('hi')");
  }

  #[tokio::test]
  async fn test_error_status_is_not_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/api/profile", server.uri())).unwrap();
    let response = network().fetch(&Request::get(url)).await.unwrap();
    assert_eq!(response.status, 503);
    assert!(!response.is_success());
  }

  #[tokio::test]
  async fn test_post_sends_body_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/forms"))
      .and(header("content-type", "application/x-www-form-urlencoded"))
      .and(body_string("name=ada"))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/api/forms", server.uri())).unwrap();
    let request = Request::post(url, "name=ada")
      .with_header("content-type", "application/x-www-form-urlencoded");
    let response = network().fetch(&request).await.unwrap();
    assert_eq!(response.status, 201);
  }

  #[tokio::test]
  async fn test_timeout_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
      .mount(&server)
      .await;

    let network = HttpNetwork::new(Duration::from_millis(100)).unwrap();
    let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
    let err = network.fetch(&Request::get(url)).await.unwrap_err();
    assert_eq!(err, FetchError::Timeout(Duration::from_millis(100)));
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    // Port 9 (discard) on localhost is not listening in test environments
    let url = Url::parse("http://127.0.0.1:9/").unwrap();
    let err = network().fetch(&Request::get(url)).await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
  }
}
