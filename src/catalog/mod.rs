//! Catalog loading and record decoding.

mod loader;
mod schema;

pub use loader::CatalogLoader;
pub use schema::{decode_records, minify, Artifact, FieldMap};
