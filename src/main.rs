mod agent;
mod cache;
mod config;
mod error;
mod event;
mod host;
mod http;
mod lifecycle;
mod logging;
mod net;
mod notify;
mod rules;
mod strategy;
mod sync;
#[cfg(test)]
mod testing;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::agent::{Agent, Outcome};
use crate::cache::SqliteStorage;
use crate::event::Event;
use crate::host::{HostMessage, StdioHost};
use crate::http::Request;
use crate::net::HttpNetwork;

#[derive(Parser, Debug)]
#[command(name = "cachet")]
#[command(about = "An offline-first request interception and cache agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./cachet.yaml, then $XDG_CONFIG_HOME/cachet/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin the agent controls
  #[arg(long, global = true)]
  origin: Option<Url>,

  /// Cache version of this generation
  #[arg(long, global = true)]
  cache_version: Option<u32>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read events from stdin until it closes (default)
  Run,
  /// Precache the manifest into this generation's core partition
  Install,
  /// Install, then delete stale partitions and claim clients
  Activate,
  /// Answer one request the way a controlled page would see it
  Fetch {
    url: Url,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request header as `Name: value`, repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Replay queued form submissions
  Sync {
    /// Sync tag (default: the configured tag)
    #[arg(long)]
    tag: Option<String>,
  },
  /// List cache partitions and their entry counts
  Partitions,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.cache_version {
    config.cache_version = version;
  }

  let _guard = logging::init(&config::Config::data_dir()?)?;

  let database = config.database_path()?;
  let storage = SqliteStorage::open(&database)?;
  let network = Arc::new(HttpNetwork::new(config.network.timeout())?);
  let host = StdioHost::new();
  let agent = Arc::new(Agent::new(
    &config,
    storage,
    network,
    host.clone(),
    host.clone(),
  )?);
  info!(
    partition = %config.core_partition(),
    origin = %config.origin,
    database = %database.display(),
    "agent started"
  );

  match args.command.unwrap_or(Command::Run) {
    Command::Run => host::run(Arc::clone(&agent), host, tokio::io::stdin()).await?,
    Command::Install => {
      emit(&host, &agent.dispatch(Event::Install).await)?;
    }
    Command::Activate => {
      let installed = agent.dispatch(Event::Install).await;
      emit(&host, &installed)?;
      if !matches!(installed, Outcome::Failed { .. }) {
        emit(&host, &agent.dispatch(Event::Activate).await)?;
      }
      info!(state = ?agent.state(), "lifecycle finished");
    }
    Command::Fetch {
      url,
      method,
      headers,
      body,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let mut request = Request {
        method,
        body: body.map(Bytes::from).unwrap_or_default(),
        ..Request::get(url)
      };
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header {:?}, expected `Name: value`", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      emit(&host, &agent.dispatch(Event::Fetch(request)).await)?;
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
      emit(&host, &agent.dispatch(Event::Sync { tag }).await)?;
    }
    Command::Partitions => {
      for partition in agent.partitions()? {
        println!("{}", serde_json::to_string(&partition)?);
      }
    }
  }

  agent.settle().await;
  Ok(())
}

fn emit(host: &StdioHost, outcome: &Outcome) -> Result<()> {
  host.emit(&HostMessage::Outcome { id: None, outcome })?;
  Ok(())
}
