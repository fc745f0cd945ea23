// History storage layer with sqlx
//
// This crate persists threads, runs and run events:
// - SQLite (embedded, single connection) or PostgreSQL (pooled) through one Any pool
// - Versioned, reversible migrations per backend
// - Transactional run finalization and thread deletion

pub mod error;
pub mod models;
pub mod repositories;

pub use error::{Result, StoreError};
pub use models::RunDisposition;
pub use repositories::{Backend, Database};
