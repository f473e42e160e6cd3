//! Worker lifecycle state machine.

use std::fmt;
use thiserror::Error;

/// Lifecycle states of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Not installed, or the last install failed
  Uninstalled,
  /// Precaching the manifest
  Installing,
  /// Installed and waiting to activate
  Installed,
  /// Pruning old generations
  Activating,
  /// Controlling pages
  Active,
  /// Superseded by a newer version
  Redundant,
}

/// Named events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  InstallStarted,
  InstallSucceeded,
  InstallFailed,
  ActivateStarted,
  ActivateFinished,
  Superseded,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} in state {state}")]
pub struct LifecycleError {
  pub state: WorkerState,
  pub event: LifecycleEvent,
}

impl WorkerState {
  /// Apply an event, returning the next state.
  pub fn on(self, event: LifecycleEvent) -> Result<WorkerState, LifecycleError> {
    use LifecycleEvent::*;
    use WorkerState::*;

    let next = match (self, event) {
      (Uninstalled, InstallStarted) => Installing,
      (Installing, InstallSucceeded) => Installed,
      (Installing, InstallFailed) => Uninstalled,
      (Installed, ActivateStarted) => Activating,
      // Re-activation re-runs cleanup
      (Active, ActivateStarted) => Activating,
      (Activating, ActivateFinished) => Active,
      (Installed | Active, Superseded) => Redundant,
      (state, event) => return Err(LifecycleError { state, event }),
    };
    Ok(next)
  }

  /// Only an active worker intercepts requests.
  pub fn intercepts_fetch(&self) -> bool {
    matches!(self, WorkerState::Active)
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkerState::Uninstalled => "uninstalled",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Active => "active",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}
