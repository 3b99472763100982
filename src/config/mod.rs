//! Application configuration
//!
//! Loaded from an optional JSON file, then overridden from the command line.

mod schema;

pub use schema::{AppConfig, StreamConfig, WebConfig};
