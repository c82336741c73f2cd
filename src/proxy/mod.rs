//! Proxy candidates and the machinery around them
//!
//! This module provides:
//! - The adapter contract and its shadowsocks implementation
//! - Subscription feed resolution
//! - Latency ranking
//! - Health checking through the local proxy
//! - The shared candidate queue and local port checks

pub mod adapter;
pub mod health;
pub mod latency;
pub mod port;
pub mod queue;
pub mod shadowsocks;
pub mod subscription;

pub use adapter::{ProxyAdapter, UNREACHABLE};
pub use health::{HealthProber, HttpProbe, ProbeConnector, SocksProbeConnector};
pub use latency::rank;
pub use port::{wait_port_free, PortProbe, TcpPortProbe};
pub use queue::{CandidateQueue, Selection, SharedQueue};
pub use shadowsocks::ShadowsocksAdapter;
pub use subscription::{CandidateOptions, CandidateSource, SubscriptionResolver};
