//! gfwpass - Failover supervisor for a local shadowsocks endpoint
//!
//! Keeps one `ss-local` process serving a fixed local SOCKS port, picked
//! from a subscription feed and replaced whenever it stops answering.
//!
//! ## Features
//!
//! - Subscription feed decoding (Base64 list of `ss://` URIs)
//! - Latency ranking of candidates by TCP dial time
//! - Multi-target health checks through the local proxy
//! - Round-robin failover with port-release waiting
//! - Periodic subscription refresh

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;
pub mod shutdown;

pub use config::Config;
pub use error::{PassError, Result};
pub use services::Service;
