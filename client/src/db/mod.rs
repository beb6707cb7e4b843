//! Database module for SQLite persistence.

mod kv;
mod pool;

pub use kv::*;
pub use pool::*;
