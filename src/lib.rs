//! Geyser Monitor Library
//!
//! Streams transactions from Yellowstone Geyser endpoints, classifies them
//! through pluggable filters, persists raw payloads to RocksDB and sends
//! batch alerts, with a small HTTP surface for introspection.

pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod notify;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod stream;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
