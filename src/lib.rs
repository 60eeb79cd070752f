//! kraken - an on-demand static-file HTTP serving fabric
//!
//! This library provides a fabric of HTTP servers created at runtime:
//! - Spawns HTTP listeners on chosen or ephemeral ports through a server pool
//! - Maps URL path prefixes to local directories via per-server mount tables
//! - Dispatches requests to pluggable file-server backends by longest prefix
//! - Exposes the whole fabric over a RESTful admin API under `/api`
//! - Streams lifecycle and per-request events to filtered websocket sinks
//!
//! The `krakend` binary runs the fabric; `krakenctl` drives it from the
//! command line.

pub mod admin;
pub mod beachplug;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fileserver;
pub mod listener;
pub mod mount;
pub mod server;
