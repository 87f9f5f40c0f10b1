//! CLI subcommands and their handlers.

use async_trait::async_trait;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use offsync::cache::{CacheEntry, CacheStorage, QueryKey};
use offsync::config::Config;
use offsync::connectivity::{spawn_probe, ConnectivityMonitor, HttpProbe, Probe};
use offsync::db::Database;
use offsync::queue::OperationKind;
use offsync::sync::{HttpRemote, RemoteService, SyncOutcome};
use offsync::{OfflineClient, RemoteApplyError};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Inspect or edit cached read results
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Inspect or edit the pending write queue
  #[command(subcommand)]
  Queue(QueueCommand),

  /// Read a resource through the cache
  Fetch {
    resource: String,
    /// Profile that owns the cached result
    #[arg(long)]
    owner: Option<String>,
    /// Row filter passed to the remote, e.g. -f stage=eq.new
    #[arg(short = 'f', long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
  },

  /// Replay pending writes now
  Sync,

  /// Show connectivity and queue state
  Status,

  /// Probe connectivity and sync automatically until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Print a cached entry
  Get { key: String },
  /// Store a JSON value under a key
  Set {
    key: String,
    json: String,
    #[arg(long)]
    owner: Option<String>,
  },
  /// Delete one entry
  Rm { key: String },
  /// Delete every entry owned by a profile
  ClearOwner { owner: String },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  /// Queue a write for later replay
  Add {
    resource: String,
    /// insert, update or delete
    kind: OperationKind,
    /// JSON row, or the id to delete
    payload: String,
  },
  /// List pending writes, oldest first
  List,
  /// Drop one pending write
  Rm { id: String },
  /// Discard every pending write
  Clear {
    /// Confirm that unsynced writes will be lost
    #[arg(long)]
    yes: bool,
  },
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
  if key.is_empty() {
    return Err(format!("empty filter key in '{}'", s));
  }
  Ok((key.to_string(), value.to_string()))
}

fn parse_json(s: &str) -> Result<Value> {
  serde_json::from_str(s).map_err(|e| eyre!("Invalid JSON '{}': {}", s, e))
}

/// Remote used when no URL is configured. Rejecting every write keeps the
/// queue intact instead of silently dropping anything.
struct UnconfiguredRemote;

#[async_trait]
impl RemoteService for UnconfiguredRemote {
  async fn apply(
    &self,
    _resource: &str,
    _kind: OperationKind,
    _payload: &Value,
  ) -> Result<(), RemoteApplyError> {
    Err(RemoteApplyError::new("remote.url is not configured"))
  }
}

/// Everything a command needs, built once from the configuration.
struct Context<S: CacheStorage> {
  config: Config,
  client: OfflineClient<S>,
  http: Option<HttpRemote>,
  probe: Option<HttpProbe>,
}

impl<S: CacheStorage> Context<S> {
  fn owner(&self, explicit: Option<String>) -> Result<String> {
    explicit
      .or_else(|| self.config.owner_id.clone())
      .ok_or_else(|| eyre!("No owner given. Pass --owner or set owner_id in the config file"))
  }

  fn require_remote(&self) -> Result<&HttpRemote> {
    self
      .http
      .as_ref()
      .ok_or_else(|| eyre!("No remote configured. Set remote.url in the config file"))
  }

  /// Refresh the connectivity state once before a one-shot command.
  async fn probe_once(&self) {
    if let Some(probe) = &self.probe {
      self.client.connectivity().set_online(probe.check().await);
    }
  }
}

fn build_probe(config: &Config) -> Result<Option<HttpProbe>> {
  let Some(raw) = config.probe_url() else {
    return Ok(None);
  };
  let url = Url::parse(raw).map_err(|e| eyre!("Invalid probe url {}: {}", raw, e))?;
  let timeout = Duration::from_secs(5).min(config.remote.timeout());
  let probe = HttpProbe::new(url, timeout).map_err(|e| eyre!("Failed to build probe: {}", e))?;
  Ok(Some(probe))
}

/// Build the client from `config` and run `command` against it.
///
/// If the database cannot be opened or upgraded the command still runs,
/// against a client that keeps nothing between invocations.
pub async fn run(command: Command, config: Config) -> Result<()> {
  let http = match &config.remote.url {
    Some(url) => Some(HttpRemote::new(url, Config::get_api_key(), config.remote.timeout())?),
    None => None,
  };
  let remote: Arc<dyn RemoteService> = match &http {
    Some(http) => Arc::new(http.clone()),
    None => Arc::new(UnconfiguredRemote),
  };
  let probe = build_probe(&config)?;
  let monitor = ConnectivityMonitor::new(config.connectivity.start_online);

  match OfflineClient::open(&config, remote.clone(), monitor.clone()) {
    Ok(client) => {
      let ctx = Context {
        config,
        client,
        http,
        probe,
      };
      dispatch(command, ctx).await
    }
    Err(e) if e.disables_storage() => {
      warn!(error = %e, "Offline storage disabled, nothing will persist");
      let client = OfflineClient::without_storage(remote, monitor)?
        .with_stale_time(config.cache.stale_time());
      let ctx = Context {
        config,
        client,
        http,
        probe,
      };
      dispatch(command, ctx).await
    }
    Err(e) => Err(e.into()),
  }
}

async fn dispatch<S: CacheStorage>(command: Command, ctx: Context<S>) -> Result<()> {
  match command {
    Command::Cache(cmd) => run_cache(cmd, &ctx),
    Command::Queue(cmd) => run_queue(cmd, &ctx),
    Command::Fetch {
      resource,
      owner,
      filters,
    } => fetch(&ctx, &resource, owner, &filters).await,
    Command::Sync => sync(&ctx).await,
    Command::Status => status(&ctx).await,
    Command::Watch => watch(ctx).await,
  }
}

fn run_cache<S: CacheStorage>(cmd: CacheCommand, ctx: &Context<S>) -> Result<()> {
  let client = &ctx.client;
  match cmd {
    CacheCommand::Get { key } => match client.get_cache::<Value>(&key)? {
      Some(entry) => print_entry(&entry)?,
      None => println!("not cached: {}", key),
    },
    CacheCommand::Set { key, json, owner } => {
      let owner = ctx.owner(owner)?;
      client.set_cache(&key, &parse_json(&json)?, &owner)?;
      println!("cached {} for {}", key, owner);
    }
    CacheCommand::Rm { key } => {
      client.remove_cache(&key)?;
      println!("removed {}", key);
    }
    CacheCommand::ClearOwner { owner } => {
      let removed = client.clear_cache_for_profile(&owner)?;
      println!("evicted {} entries for {}", removed, owner);
    }
  }
  Ok(())
}

fn print_entry(entry: &CacheEntry<Value>) -> Result<()> {
  println!(
    "{} (owner {}, cached {})",
    entry.key,
    entry.owner_id,
    entry.cached_at().to_rfc3339()
  );
  println!("{}", serde_json::to_string_pretty(&entry.data)?);
  Ok(())
}

fn run_queue<S: CacheStorage>(cmd: QueueCommand, ctx: &Context<S>) -> Result<()> {
  let client = &ctx.client;
  match cmd {
    QueueCommand::Add {
      resource,
      kind,
      payload,
    } => {
      let id = client.enqueue(&resource, kind, parse_json(&payload)?)?;
      println!("{}", id);
    }
    QueueCommand::List => {
      let pending = client.list_pending()?;
      if pending.is_empty() {
        println!("no pending operations");
      }
      for op in pending {
        println!(
          "{}  {}  {:<6}  {}  {}",
          op.id, op.created_at, op.kind, op.resource, op.payload
        );
      }
    }
    QueueCommand::Rm { id } => {
      client.remove(&id)?;
      println!("removed {}", id);
    }
    QueueCommand::Clear { yes } => {
      let pending = client.pending_count();
      if !yes && pending > 0 {
        return Err(eyre!(
          "Refusing to discard {} pending operations without --yes",
          pending
        ));
      }
      let removed = client.clear_all()?;
      println!("discarded {} pending operations", removed);
    }
  }
  Ok(())
}

async fn fetch<S: CacheStorage>(
  ctx: &Context<S>,
  resource: &str,
  owner: Option<String>,
  filters: &[(String, String)],
) -> Result<()> {
  let remote = ctx.require_remote()?;
  let owner = ctx.owner(owner)?;
  ctx.probe_once().await;

  let key = filters
    .iter()
    .fold(QueryKey::new(resource, owner.as_str()), |key, (k, v)| {
      key.param(k.as_str(), v)
    });
  info!(query = %key.description(), "Fetching");

  let result = ctx
    .client
    .fetch(&key.cache_key(), &owner, || remote.select(resource, filters))
    .await
    .map_err(|e| eyre!("{}", e))?;

  eprintln!("source: {:?}", result.source);
  println!("{}", serde_json::to_string_pretty(&result.data)?);
  Ok(())
}

async fn sync<S: CacheStorage>(ctx: &Context<S>) -> Result<()> {
  ctx.require_remote()?;
  ctx.probe_once().await;

  if !ctx.client.is_online() {
    println!("offline, {} pending operations kept", ctx.client.pending_count());
    return Ok(());
  }

  let report = ctx.client.sync_now().await?;
  match report.outcome {
    SyncOutcome::Completed => println!("synced {} operations", report.applied),
    SyncOutcome::Halted {
      operation_id,
      reason,
    } => {
      return Err(eyre!(
        "sync stopped at {} after {} applied, {} still pending: {}",
        operation_id,
        report.applied,
        report.pending_count,
        reason
      ))
    }
    SyncOutcome::AlreadyRunning => println!("a sync is already running"),
  }
  Ok(())
}

async fn status<S: CacheStorage>(ctx: &Context<S>) -> Result<()> {
  ctx.probe_once().await;

  let database = match &ctx.config.database_path {
    Some(path) => path.clone(),
    None => Database::default_path()?,
  };
  let status = ctx.client.sync_status();

  println!("database: {}", database.display());
  println!(
    "remote:   {}",
    ctx
      .http
      .as_ref()
      .map(|h| h.base_url().to_string())
      .unwrap_or_else(|| "not configured".to_string())
  );
  println!("online:   {}", ctx.client.is_online());
  println!("pending:  {}", status.pending_count);
  Ok(())
}

async fn watch<S: CacheStorage>(mut ctx: Context<S>) -> Result<()> {
  ctx.require_remote()?;

  let probe_handle = ctx.probe.take().map(|probe| {
    spawn_probe(
      ctx.client.connectivity().clone(),
      probe,
      ctx.config.connectivity.interval(),
    )
  });
  let sync_handle = ctx.client.spawn_auto_sync(ctx.config.sync.retry.policy());
  let mut status = ctx.client.subscribe_status();

  info!(pending = ctx.client.pending_count(), "Watching, press Ctrl-C to stop");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let s = status.borrow_and_update().clone();
        info!(
          syncing = s.is_syncing,
          pending = s.pending_count,
          last_error = s.last_error.as_deref().unwrap_or("-"),
          "Sync status"
        );
      }
    }
  }

  sync_handle.abort();
  if let Some(handle) = probe_handle {
    handle.abort();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_filter() {
    assert_eq!(
      parse_filter("stage=eq.new").unwrap(),
      ("stage".to_string(), "eq.new".to_string())
    );
    assert_eq!(
      parse_filter("order=created_at.desc=x").unwrap(),
      ("order".to_string(), "created_at.desc=x".to_string())
    );
    assert!(parse_filter("stage").is_err());
    assert!(parse_filter("=x").is_err());
  }

  #[tokio::test]
  async fn test_unconfigured_remote_rejects() {
    let err = UnconfiguredRemote
      .apply("leads", OperationKind::Insert, &Value::Null)
      .await
      .unwrap_err();
    assert!(err.reason.contains("not configured"));
  }
}
