//! Network access: the request/response model and the `Network` seam.

pub mod client;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Destination, FetchError, Request, RequestKey, RequestMode, Response, ResponseKind};
