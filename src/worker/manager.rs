//! Offline cache manager: generation lifecycle and per-route fetch policies.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use super::route::{RouteClass, RouteRules};
use crate::cache::{CacheStorage, CachedEntry};
use crate::config::Config;
use crate::net::{FetchError, Network, Request, RequestKey, Response};

/// Everything one worker version needs to know, resolved against the origin.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub version: String,
  pub shell: Url,
  pub precache: Vec<Url>,
  pub placeholder_image: Option<Url>,
  pub rules: RouteRules,
}

impl WorkerConfig {
  pub fn from_config(config: &Config) -> Result<Self> {
    let precache = config
      .worker
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let placeholder_image = config
      .worker
      .placeholder_image
      .as_deref()
      .map(|path| config.resolve(path))
      .transpose()?;

    Ok(Self {
      version: config.cache_version.clone(),
      shell: config.resolve(&config.worker.shell)?,
      precache,
      placeholder_image,
      rules: RouteRules::new(
        &config.origin,
        &config.catalog_url()?,
        config.worker.bypass_hosts.clone(),
      ),
    })
  }

  /// Same routing and manifest under another version tag.
  pub fn with_version(mut self, version: &str) -> Self {
    self.version = version.to_string();
    self
  }

  /// Generation holding the precached manifest.
  pub fn static_cache(&self) -> String {
    format!("{}-static", self.version)
  }

  /// Generation filled while handling requests.
  pub fn runtime_cache(&self) -> String {
    format!("{}-runtime", self.version)
  }
}

/// What an activation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Generations that could not be deleted; retried on the next activation
  pub failed: Vec<String>,
}

/// Serves requests from cache generations or the network, per route class.
pub struct OfflineCacheManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  config: Arc<WorkerConfig>,
  /// Cache writes run after the response is handed back
  writes: TaskTracker,
  /// Held while settling; the tracker is closed and reopened under it
  settling: Arc<Mutex<()>>,
}

impl<S: CacheStorage + 'static> OfflineCacheManager<S> {
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>, config: WorkerConfig) -> Self {
    Self {
      storage,
      network,
      config: Arc::new(config),
      writes: TaskTracker::new(),
      settling: Arc::new(Mutex::new(())),
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn network(&self) -> Arc<dyn Network> {
    Arc::clone(&self.network)
  }

  /// Fetch every manifest entry and store them in the static generation.
  ///
  /// Entries are fetched concurrently and written in one batch, so a single
  /// failure leaves no generation behind.
  pub async fn install(&self) -> Result<usize> {
    let generation = self.config.static_cache();
    info!(generation = %generation, entries = self.config.precache.len(), "precaching manifest");

    let fetches = self.config.precache.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.key(), response))
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(&generation, &entries)?;

    Ok(entries.len())
  }

  /// Delete every generation but the current static and runtime ones.
  ///
  /// Best effort: failures are logged and reported, never raised.
  pub fn activate(&self) -> ActivationReport {
    let keep = [self.config.static_cache(), self.config.runtime_cache()];
    let mut report = ActivationReport::default();

    match self.storage.generations() {
      Ok(existing) => {
        for name in existing.into_iter().filter(|n| !keep.contains(n)) {
          match self.storage.delete(&name) {
            Ok(_) => {
              info!(generation = %name, "deleted old cache generation");
              report.deleted.push(name);
            }
            Err(e) => {
              warn!(generation = %name, error = %e, "failed to delete cache generation");
              report.failed.push(name);
            }
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to list cache generations"),
    }

    for name in &keep {
      if let Err(e) = self.storage.open(name) {
        warn!(generation = %name, error = %e, "failed to open cache generation");
      }
    }

    report
  }

  /// Answer an intercepted request.
  ///
  /// Errors only surface for requests the page would have seen fail anyway:
  /// unhandled or static requests with neither a cached copy nor a network.
  pub async fn handle_fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let class = self.config.rules.classify(request);
    debug!(url = %request.url, ?class, "handling fetch");

    match class {
      RouteClass::Unhandled => self.pass_through(request).await,
      RouteClass::Navigation => self.serve_shell(request).await,
      RouteClass::DynamicData => Ok(self.network_first(request).await),
      RouteClass::StaticGet => self.cache_first(request).await,
    }
  }

  pub async fn pass_through(&self, request: &Request) -> Result<Response, FetchError> {
    self.network.fetch(request).await
  }

  /// Wait for every pending cache write.
  pub async fn settle(&self) {
    let _settling = self.settling.lock().await;
    self.writes.close();
    self.writes.wait().await;
    self.writes.reopen();
  }

  async fn serve_shell(&self, request: &Request) -> Result<Response, FetchError> {
    let shell = RequestKey::get(&self.config.shell);
    if let Some(entry) = self.lookup(&self.config.static_cache(), &shell) {
      return Ok(entry.response);
    }
    debug!(url = %request.url, "no cached shell, navigating over network");
    self.pass_through(request).await
  }

  async fn network_first(&self, request: &Request) -> Response {
    let key = request.key();

    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        self.store_later(self.config.runtime_cache(), key, response.clone());
        response
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "catalog request returned an error status");
        match self.cached_copy(&key) {
          Some(entry) => entry.response,
          None => response,
        }
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "catalog request failed, serving from cache");
        match self.cached_copy(&key) {
          Some(entry) => entry.response,
          None => Response::offline_fallback(request.url.clone()),
        }
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Response, FetchError> {
    let key = request.key();
    if let Some(entry) = self.cached_copy_static_first(&key) {
      return Ok(entry.response);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_storable() {
          self.store_later(self.config.runtime_cache(), key, response.clone());
        }
        Ok(response)
      }
      Err(e) => {
        if request.expects_image() {
          if let Some(placeholder) = self.placeholder() {
            debug!(url = %request.url, "serving placeholder image");
            return Ok(placeholder.response);
          }
        }
        Err(e)
      }
    }
  }

  fn placeholder(&self) -> Option<CachedEntry> {
    let url = self.config.placeholder_image.as_ref()?;
    self.lookup(&self.config.static_cache(), &RequestKey::get(url))
  }

  /// Runtime copy first, then the precached one.
  fn cached_copy(&self, key: &RequestKey) -> Option<CachedEntry> {
    self
      .lookup(&self.config.runtime_cache(), key)
      .or_else(|| self.lookup(&self.config.static_cache(), key))
  }

  fn cached_copy_static_first(&self, key: &RequestKey) -> Option<CachedEntry> {
    self
      .lookup(&self.config.static_cache(), key)
      .or_else(|| self.lookup(&self.config.runtime_cache(), key))
  }

  /// Storage errors count as a miss.
  fn lookup(&self, generation: &str, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.lookup(generation, key) {
      Ok(Some(entry)) => {
        debug!(
          generation = %entry.generation,
          key = %entry.key,
          cached_at = %entry.cached_at,
          "cache hit"
        );
        Some(entry)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(generation, key = %key, error = %e, "cache lookup failed");
        None
      }
    }
  }

  fn store_later(&self, generation: String, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    self.writes.spawn(async move {
      match storage.put(&generation, &key, &response) {
        Ok(()) => debug!(generation = %generation, key = %key, "stored response"),
        Err(e) => warn!(generation = %generation, key = %key, error = %e, "failed to store response"),
      }
    });
  }
}

impl<S: CacheStorage> Clone for OfflineCacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      config: Arc::clone(&self.config),
      writes: self.writes.clone(),
      settling: Arc::clone(&self.settling),
    }
  }
}
