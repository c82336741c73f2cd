//! Long-running services

pub mod orchestrator;
pub mod refresher;
pub mod service;

pub use orchestrator::{FailoverOrchestrator, FailoverState, OrchestratorConfig, StateUpdate};
pub use refresher::SubscriptionRefresher;
pub use service::Service;
