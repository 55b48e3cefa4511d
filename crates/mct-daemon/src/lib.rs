//! multi-consul-template daemon
//!
//! Mirrors template keys from Consul KV prefixes into local directories,
//! keeps the generated block of consul-template's config in sync with the
//! set of materialized templates, and supervises the consul-template
//! process, hanging it up after every change.

pub mod daemon;
