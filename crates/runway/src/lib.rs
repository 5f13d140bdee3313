//! Runway
//!
//! Single-node application runtime: versioned apps on disk, each served by
//! an isolated worker from a keyed pool, with a plugin layer in front.

pub mod apps;
pub mod config;
pub mod error;
pub mod plugin;
pub mod pool;
pub mod routes;
pub mod server;

pub use error::{Error, Result};
