//! Worker registration for a page: which version controls requests.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::handle::WorkerHandle;
use super::manager::{ActivationReport, OfflineCacheManager, WorkerConfig};
use crate::cache::{CacheStorage, LocalStore};
use crate::net::{FetchError, Network, Request, Response};

/// Local storage key remembering which version was last activated.
const ACTIVE_VERSION_KEY: &str = "artcache.active_version";

/// What `register` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
  /// This version already controls the page
  AlreadyActive,
  /// This version was activated on an earlier load and controls the page again
  Revived,
  /// Installed and activated; nothing else controlled the page
  Activated { deleted: Vec<String> },
  /// Installed, waiting for pages of the previous version to go away
  Waiting,
  /// Install failed; the page runs uncached and the next load retries
  InstallFailed { reason: String },
}

type Controller = Arc<RwLock<Option<WorkerHandle>>>;

/// Registration of the offline worker for one origin.
pub struct Registration<S> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  controller: Controller,
  waiting: Option<WorkerHandle>,
}

impl<S: CacheStorage + LocalStore + 'static> Registration<S> {
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>) -> Self {
    Self {
      storage,
      network,
      controller: Arc::new(RwLock::new(None)),
      waiting: None,
    }
  }

  /// Register a worker version. Idempotent for the version already active.
  ///
  /// A version activated by an earlier page load takes control again without
  /// reinstalling, so a returning visit works offline. A new version is
  /// installed next to it and waits until `release_clients`.
  pub async fn register(&mut self, config: WorkerConfig) -> Result<RegisterOutcome> {
    if self.active_version().as_deref() == Some(config.version.as_str()) {
      return Ok(RegisterOutcome::AlreadyActive);
    }
    if self.waiting_version().as_deref() == Some(config.version.as_str()) {
      return Ok(RegisterOutcome::Waiting);
    }

    if self.active_version().is_none() {
      if let Some(version) = self.persisted_version() {
        let manager = OfflineCacheManager::new(
          Arc::clone(&self.storage),
          Arc::clone(&self.network),
          config.clone().with_version(&version),
        );
        self.set_controller(Some(WorkerHandle::spawn_active(manager)));
        info!(version = %version, "revived active worker");

        if version == config.version {
          return Ok(RegisterOutcome::Revived);
        }
      }
    }

    let manager = OfflineCacheManager::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      config,
    );
    let worker = WorkerHandle::spawn(manager);

    if let Err(e) = worker.install().await {
      warn!(version = %worker.version(), error = %e, "install failed, continuing without offline support");
      return Ok(RegisterOutcome::InstallFailed {
        reason: e.to_string(),
      });
    }

    if self.active_version().is_some() {
      info!(version = %worker.version(), "new worker waiting for clients to be released");
      self.waiting = Some(worker);
      return Ok(RegisterOutcome::Waiting);
    }

    let report = self.promote(worker).await?;
    Ok(RegisterOutcome::Activated {
      deleted: report.deleted,
    })
  }

  /// Every page of the old version has navigated away: activate the waiting worker.
  pub async fn release_clients(&mut self) -> Result<Option<ActivationReport>> {
    match self.waiting.take() {
      Some(worker) => Ok(Some(self.promote(worker).await?)),
      None => Ok(None),
    }
  }

  /// Network access for the page, routed through the controlling worker.
  pub fn client(&self) -> PageClient {
    PageClient {
      controller: Arc::clone(&self.controller),
      network: Arc::clone(&self.network),
    }
  }

  pub fn active_version(&self) -> Option<String> {
    current(&self.controller).map(|w| w.version().to_string())
  }

  pub fn waiting_version(&self) -> Option<String> {
    self.waiting.as_ref().map(|w| w.version().to_string())
  }

  /// Wait for cache writes of the controlling worker.
  pub async fn settle(&self) -> Result<()> {
    match current(&self.controller) {
      Some(worker) => worker.settle().await,
      None => Ok(()),
    }
  }

  async fn promote(&mut self, worker: WorkerHandle) -> Result<ActivationReport> {
    if let Some(previous) = current(&self.controller) {
      if let Err(e) = previous.retire().await {
        warn!(version = %previous.version(), error = %e, "failed to retire worker");
      }
    }

    let report = worker.activate().await?;

    if let Err(e) = self.storage.set(ACTIVE_VERSION_KEY, worker.version()) {
      warn!(error = %e, "failed to persist active worker version");
    }
    info!(version = %worker.version(), "worker now controls the page");
    self.set_controller(Some(worker));

    Ok(report)
  }

  /// Version activated by the last page load, if any.
  pub fn persisted_version(&self) -> Option<String> {
    match self.storage.get(ACTIVE_VERSION_KEY) {
      Ok(stored) => stored.map(|s| s.value),
      Err(e) => {
        warn!(error = %e, "failed to read active worker version");
        None
      }
    }
  }

  fn set_controller(&self, worker: Option<WorkerHandle>) {
    match self.controller.write() {
      Ok(mut guard) => *guard = worker,
      Err(poisoned) => *poisoned.into_inner() = worker,
    }
  }
}

fn current(controller: &Controller) -> Option<WorkerHandle> {
  match controller.read() {
    Ok(guard) => guard.clone(),
    Err(poisoned) => poisoned.into_inner().clone(),
  }
}

/// The page's view of the network.
///
/// Requests go through the controlling worker when there is one, straight to
/// the network otherwise.
#[derive(Clone)]
pub struct PageClient {
  controller: Controller,
  network: Arc<dyn Network>,
}

#[async_trait]
impl Network for PageClient {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let worker = current(&self.controller);
    match worker {
      Some(worker) => worker.fetch(request).await,
      None => self.network.fetch(request).await,
    }
  }
}
