//! Core library for multi-consul-template
//!
//! This crate holds everything the sidecar daemon needs that is not part of
//! its event loops:
//! - settings resolution (CLI overrides, environment, optional TOML file)
//! - the Consul KV client used for blocking prefix listings
//! - durable file writes for templates and the renderer config
//! - hang-up / terminate delivery to the supervised renderer

pub mod config;
pub mod consul;
pub mod io;
pub mod logging;
pub mod signal;

pub use config::{Endpoint, Settings, WatchPair};
pub use consul::{KvClient, KvEntry, KvListing};
