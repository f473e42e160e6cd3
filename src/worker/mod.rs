//! Offline worker: intercepts page requests and serves them from cache generations.
//!
//! - `lifecycle`: install/activate state machine
//! - `route`: request classification
//! - `manager`: generation housekeeping and per-route fetch policies
//! - `handle`: the worker as a message-driven task
//! - `registration`: which version controls the page

mod handle;
mod lifecycle;
mod manager;
mod registration;
mod route;

pub use manager::WorkerConfig;
pub use registration::{RegisterOutcome, Registration};
