mod cache;
mod catalog;
mod config;
mod db;
mod net;
mod state;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStorage, LocalStore, MemoryStorage, SqliteStorage};
use catalog::{decode_records, minify, Artifact, CatalogLoader, FieldMap};
use config::Config;
use net::{Destination, HttpNetwork, Network, Request};
use state::AppState;
use worker::{RegisterOutcome, Registration, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "artcache")]
#[command(about = "Offline cache and catalog loader for artifact gallery sites")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./artcache.yaml, then $XDG_CONFIG_HOME/artcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep caches in memory only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Log to stderr instead of the log file
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Simulate a page load: register the worker and load the catalog
  Sync,
  /// Send one request through the controlling worker
  Fetch {
    /// Site path or absolute URL
    path: String,
    /// Issue it as a page navigation
    #[arg(long, conflicts_with = "image")]
    navigate: bool,
    /// Issue it as an image load
    #[arg(long)]
    image: bool,
  },
  /// Show worker versions and cache generations
  Status,
  /// Record a click on an artifact
  Click { id: String },
  /// Toggle an artifact as favorite
  Favorite { id: String },
  /// Show recently opened artifacts and click counts
  History,
  /// Convert a long-key catalog file to the short-key format
  Minify { input: PathBuf, output: PathBuf },
}

/// Set up logging. Returns the guard that flushes the log file on drop.
fn init_tracing(verbose: bool) -> Result<Option<WorkerGuard>> {
  // RUST_LOG controls the level (e.g. RUST_LOG=artcache=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(if verbose { "artcache=debug" } else { "warn" })
  });

  if verbose {
    tracing_subscriber::registry()
      .with(fmt::layer().with_writer(std::io::stderr))
      .with(filter)
      .init();
    return Ok(None);
  }

  let dir = db::data_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "artcache.log"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose)?;

  // Minify is a build step and works without a site config
  if let Command::Minify { input, output } = &args.command {
    let fields = Config::load(args.config.as_deref())
      .map(|c| c.catalog.field_map)
      .unwrap_or_default();
    return minify_file(input, output, &fields);
  }

  let config = Config::load(args.config.as_deref())?;
  info!(origin = %config.origin, version = %config.cache_version, "artcache starting");

  if args.ephemeral {
    run(config, Arc::new(MemoryStorage::new()), args.command).await
  } else {
    let storage = SqliteStorage::open(config.storage.path.as_deref())?;
    run(config, Arc::new(storage), args.command).await
  }
}

async fn run<S>(config: Config, storage: Arc<S>, command: Command) -> Result<()>
where
  S: CacheStorage + LocalStore + 'static,
{
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(&config.origin)?);

  match command {
    Command::Sync => sync(&config, storage, network).await,
    Command::Fetch {
      path,
      navigate,
      image,
    } => {
      let url = config.resolve(&path)?;
      fetch(&config, storage, network, url, navigate, image).await
    }
    Command::Status => status(&config, storage, network),
    Command::Click { id } => {
      let artifact = find_artifact(&config, storage.as_ref(), &id)?;
      let mut state = AppState::load(storage, config.state.clone());
      state.record_click(&artifact)?;
      println!("{} ({}): {} clicks", artifact.title, artifact.id, state.clicks(&artifact.id));
      Ok(())
    }
    Command::Favorite { id } => {
      let mut state = AppState::load(storage, config.state.clone());
      if state.toggle_favorite(&id)? {
        println!("{} added to favorites", id);
      } else {
        println!("{} removed from favorites", id);
      }
      Ok(())
    }
    Command::History => {
      let state = AppState::load(storage, config.state.clone());
      print_history(&state);
      Ok(())
    }
    Command::Minify { .. } => Ok(()),
  }
}

/// One page load: register the worker, then load the catalog through it.
async fn sync<S>(config: &Config, storage: Arc<S>, network: Arc<dyn Network>) -> Result<()>
where
  S: CacheStorage + LocalStore + 'static,
{
  let mut registration = Registration::new(Arc::clone(&storage), network);
  let outcome = registration.register(WorkerConfig::from_config(config)?).await?;
  println!("worker: {}", describe(&outcome));

  let client: Arc<dyn Network> = Arc::new(registration.client());
  let loader = CatalogLoader::new(client, Arc::clone(&storage), config.catalog.snapshot_key.clone());
  let result = loader
    .load(&config.catalog_url()?, config.catalog.timeout())
    .await;

  match result {
    Some(result) => {
      let artifacts = decode_records(&result.data, &config.catalog.field_map)?;
      if result.is_offline() {
        let saved = result
          .cached_at
          .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
          .unwrap_or_else(|| "unknown".to_string());
        println!(
          "catalog: {} artifacts from offline snapshot (saved {})",
          artifacts.len(),
          saved
        );
      } else {
        println!("catalog: {} artifacts from network", artifacts.len());
      }
    }
    None => println!("catalog: no data available offline"),
  }

  registration.settle().await?;

  // This process is the only page; closing it lets a waiting worker take over
  if let Some(report) = registration.release_clients().await? {
    println!(
      "worker: {} activated, removed {} old generation(s)",
      registration.active_version().unwrap_or_default(),
      report.deleted.len()
    );
  }

  Ok(())
}

async fn fetch<S>(
  config: &Config,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  url: Url,
  navigate: bool,
  image: bool,
) -> Result<()>
where
  S: CacheStorage + LocalStore + 'static,
{
  let mut registration = Registration::new(storage, network);
  let outcome = registration.register(WorkerConfig::from_config(config)?).await?;
  info!(outcome = %describe(&outcome), "worker registered");

  let request = if navigate {
    Request::navigate(url)
  } else if image {
    Request::get(url).with_destination(Destination::Image)
  } else {
    Request::get(url)
  };

  let response = registration.client().fetch(&request).await?;
  println!("{} {} ({})", response.status, response.url, response.kind.as_str());
  if let Some(content_type) = response.content_type() {
    println!("content-type: {}", content_type);
  }
  println!("{} bytes", response.body.len());

  registration.settle().await
}

fn status<S>(config: &Config, storage: Arc<S>, network: Arc<dyn Network>) -> Result<()>
where
  S: CacheStorage + LocalStore + 'static,
{
  let registration = Registration::new(Arc::clone(&storage), network);
  println!("configured version: {}", config.cache_version);
  println!(
    "active version:     {}",
    registration
      .persisted_version()
      .unwrap_or_else(|| "none".to_string())
  );

  println!("generations:");
  for name in storage.generations()? {
    println!("  {}", name);
  }

  match storage.get(&config.catalog.snapshot_key)? {
    Some(snapshot) => println!("catalog snapshot:   saved {}", snapshot.updated_at),
    None => println!("catalog snapshot:   none"),
  }

  Ok(())
}

fn describe(outcome: &RegisterOutcome) -> String {
  match outcome {
    RegisterOutcome::AlreadyActive => "already active".to_string(),
    RegisterOutcome::Revived => "active from previous load".to_string(),
    RegisterOutcome::Activated { deleted } => {
      format!("installed and activated ({} old generation(s) removed)", deleted.len())
    }
    RegisterOutcome::Waiting => "new version installed, waiting".to_string(),
    RegisterOutcome::InstallFailed { reason } => format!("install failed: {}", reason),
  }
}

/// Look an artifact up in the saved catalog snapshot.
fn find_artifact(config: &Config, store: &impl LocalStore, id: &str) -> Result<Artifact> {
  let snapshot = store
    .get(&config.catalog.snapshot_key)?
    .ok_or_else(|| eyre!("No catalog saved yet. Run `artcache sync` first."))?;
  let records: Vec<Value> = serde_json::from_str(&snapshot.value)
    .map_err(|e| eyre!("Catalog snapshot is corrupt: {}", e))?;

  decode_records(&records, &config.catalog.field_map)?
    .into_iter()
    .find(|a| a.id == id)
    .ok_or_else(|| eyre!("Unknown artifact: {}", id))
}

fn print_history<L: LocalStore>(state: &AppState<L>) {
  if state.history().is_empty() {
    println!("No recently opened artifacts");
  }
  for entry in state.history() {
    let star = if state.is_favorite(&entry.id) { "*" } else { " " };
    println!(
      "{} {}  {}  ({} clicks, {})",
      star,
      entry.id,
      entry.title,
      state.clicks(&entry.id),
      entry.opened_at.format("%Y-%m-%d %H:%M")
    );
  }

  let total: u64 = state.all_clicks().values().sum();
  if total > 0 {
    println!(
      "{} clicks across {} artifacts",
      total,
      state.all_clicks().len()
    );
  }

  if !state.favorites().is_empty() {
    let favorites: Vec<&str> = state.favorites().iter().map(String::as_str).collect();
    println!("favorites: {}", favorites.join(", "));
  }
}

fn minify_file(input: &Path, output: &Path, fields: &FieldMap) -> Result<()> {
  let contents = std::fs::read_to_string(input)
    .map_err(|e| eyre!("Failed to read {}: {}", input.display(), e))?;
  let records: Vec<Map<String, Value>> = serde_json::from_str(&contents)
    .map_err(|e| eyre!("{} is not an array of objects: {}", input.display(), e))?;

  let short = minify(&records, fields);
  std::fs::write(output, serde_json::to_string(&short)?)
    .map_err(|e| eyre!("Failed to write {}: {}", output.display(), e))?;

  println!(
    "wrote {} records to {} ({} -> {} bytes)",
    short.len(),
    output.display(),
    contents.len(),
    std::fs::metadata(output).map(|m| m.len()).unwrap_or(0)
  );
  Ok(())
}
