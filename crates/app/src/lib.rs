//! Application layer for a ledgermesh node.
//!
//! This crate turns the overlay core into a runnable process:
//!
//! - [`config`] - TOML configuration with environment overrides
//! - [`logging`] - `tracing` subscriber setup in text or JSON
//! - [`run_cmd`] - The node runner and the crawl client

pub mod config;
pub mod logging;
pub mod run_cmd;

pub use config::{AppConfig, ConfigBuilder};
pub use logging::{LogConfig, LogFormat};
pub use run_cmd::{crawl_peer, run_node, Node, RunOptions};
