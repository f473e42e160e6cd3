//! The worker as a dedicated task driven by messages.
//!
//! Each worker version runs in its own task that owns the lifecycle state.
//! Pages talk to it through a cloneable `WorkerHandle`; every message carries
//! a oneshot reply channel. Lifecycle messages are handled in order; fetches
//! are answered on spawned tasks so one slow request never holds up another.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::lifecycle::{LifecycleEvent, WorkerState};
use super::manager::{ActivationReport, OfflineCacheManager};
use crate::cache::CacheStorage;
use crate::net::{FetchError, Network, Request, Response};

/// Messages understood by the worker task
enum WorkerMessage {
  Install {
    reply: oneshot::Sender<Result<()>>,
  },
  Activate {
    reply: oneshot::Sender<Result<ActivationReport>>,
  },
  Retire {
    reply: oneshot::Sender<Result<()>>,
  },
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Response, FetchError>>,
  },
  Settle {
    reply: oneshot::Sender<()>,
  },
  #[cfg(test)]
  State {
    reply: oneshot::Sender<WorkerState>,
  },
}

/// Page-side handle to a running worker version.
#[derive(Clone)]
pub struct WorkerHandle {
  version: String,
  tx: mpsc::UnboundedSender<WorkerMessage>,
  /// Used when the worker cannot answer
  network: Arc<dyn Network>,
}

impl WorkerHandle {
  /// Spawn a fresh, uninstalled worker.
  pub fn spawn<S: CacheStorage + 'static>(manager: OfflineCacheManager<S>) -> Self {
    Self::spawn_in_state(manager, WorkerState::Uninstalled)
  }

  /// Spawn a worker that was installed and activated by an earlier page load.
  pub fn spawn_active<S: CacheStorage + 'static>(manager: OfflineCacheManager<S>) -> Self {
    Self::spawn_in_state(manager, WorkerState::Active)
  }

  fn spawn_in_state<S: CacheStorage + 'static>(
    manager: OfflineCacheManager<S>,
    state: WorkerState,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Self {
      version: manager.config().version.clone(),
      tx,
      network: manager.network(),
    };

    tokio::spawn(run(manager, state, rx));

    handle
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Precache the manifest. A no-op once installed.
  pub async fn install(&self) -> Result<()> {
    self.request(|reply| WorkerMessage::Install { reply }).await?
  }

  /// Prune old generations and start intercepting requests.
  pub async fn activate(&self) -> Result<ActivationReport> {
    self.request(|reply| WorkerMessage::Activate { reply }).await?
  }

  /// Mark this version as superseded.
  pub async fn retire(&self) -> Result<()> {
    self.request(|reply| WorkerMessage::Retire { reply }).await?
  }

  #[cfg(test)]
  pub async fn state(&self) -> Result<WorkerState> {
    self.request(|reply| WorkerMessage::State { reply }).await
  }

  /// Wait for cache writes started by earlier fetches.
  pub async fn settle(&self) -> Result<()> {
    self.request(|reply| WorkerMessage::Settle { reply }).await
  }

  /// Send a request through the worker.
  ///
  /// If the worker is gone or its handler died, the request goes straight to
  /// the network instead of failing.
  pub async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let (reply, rx) = oneshot::channel();
    let message = WorkerMessage::Fetch {
      request: request.clone(),
      reply,
    };

    if self.tx.send(message).is_ok() {
      if let Ok(result) = rx.await {
        return result;
      }
    }

    warn!(version = %self.version, url = %request.url, "worker unavailable, passing request through");
    self.network.fetch(request).await
  }

  async fn request<T>(
    &self,
    message: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage,
  ) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(message(reply))
      .map_err(|_| eyre!("Worker {} has stopped", self.version))?;
    rx.await
      .map_err(|_| eyre!("Worker {} dropped the request", self.version))
  }
}

/// Worker task loop. Ends when every handle is dropped.
async fn run<S: CacheStorage + 'static>(
  manager: OfflineCacheManager<S>,
  mut state: WorkerState,
  mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
  let version = manager.config().version.clone();
  debug!(version = %version, %state, "worker started");

  while let Some(message) = rx.recv().await {
    match message {
      WorkerMessage::Install { reply } => {
        let result = install(&manager, &mut state).await;
        let _ = reply.send(result);
      }
      WorkerMessage::Activate { reply } => {
        let result = activate(&manager, &mut state);
        let _ = reply.send(result);
      }
      WorkerMessage::Retire { reply } => {
        let result: Result<()> = state
          .on(LifecycleEvent::Superseded)
          .map(|next| {
            state = next;
            info!(version = %version, "worker retired");
          })
          .map_err(Into::into);
        let _ = reply.send(result);
      }
      WorkerMessage::Fetch { request, reply } => {
        let manager = manager.clone();
        let intercept = state.intercepts_fetch();
        tokio::spawn(async move {
          let result = if intercept {
            manager.handle_fetch(&request).await
          } else {
            manager.pass_through(&request).await
          };
          // Ignore send errors - the page may have gone away
          let _ = reply.send(result);
        });
      }
      WorkerMessage::Settle { reply } => {
        let manager = manager.clone();
        tokio::spawn(async move {
          manager.settle().await;
          let _ = reply.send(());
        });
      }
      #[cfg(test)]
      WorkerMessage::State { reply } => {
        let _ = reply.send(state);
      }
    }
  }

  debug!(version = %version, "worker stopped");
}

async fn install<S: CacheStorage + 'static>(
  manager: &OfflineCacheManager<S>,
  state: &mut WorkerState,
) -> Result<()> {
  if matches!(*state, WorkerState::Installed | WorkerState::Active) {
    return Ok(());
  }

  *state = state.on(LifecycleEvent::InstallStarted)?;
  match manager.install().await {
    Ok(count) => {
      *state = state.on(LifecycleEvent::InstallSucceeded)?;
      info!(version = %manager.config().version, count, "worker installed");
      Ok(())
    }
    Err(e) => {
      *state = state.on(LifecycleEvent::InstallFailed)?;
      warn!(version = %manager.config().version, error = %e, "worker install failed");
      Err(e)
    }
  }
}

fn activate<S: CacheStorage + 'static>(
  manager: &OfflineCacheManager<S>,
  state: &mut WorkerState,
) -> Result<ActivationReport> {
  *state = state.on(LifecycleEvent::ActivateStarted)?;
  let report = manager.activate();
  *state = state.on(LifecycleEvent::ActivateFinished)?;
  info!(
    version = %manager.config().version,
    deleted = report.deleted.len(),
    "worker activated"
  );
  Ok(report)
}
