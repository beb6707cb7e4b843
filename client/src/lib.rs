//! Host side of the AquaPin sync engine.
//!
//! Supplies the pieces [`aquapin_engine::Engine`] leaves to its host:
//! a SQLite-backed [`KeyValueStore`](aquapin_engine::KeyValueStore), a
//! reqwest [`Remote`](aquapin_engine::Remote) and a TCP connectivity probe.
//! The `aquapin-sync` binary wires them together.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod probe;

pub use config::{Config, ConfigError};
pub use db::{create_pool, run_migrations, Pool, SqliteStore};
pub use error::{AppError, Result};
pub use http::{resolve_base_url, HttpRemote, DEFAULT_BACKEND_PORT};
pub use probe::ProbeConnectivity;
