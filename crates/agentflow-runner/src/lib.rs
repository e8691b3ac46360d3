//! The runner service (§4.5): poll loop, adaptive backoff, hysteresis
//! backpressure, heartbeat, and graceful shutdown over a [`Store`] and a
//! [`RunnerExecutor`].
//!
//! [`Store`]: agentflow_store::Store
//! [`RunnerExecutor`]: agentflow_engine::RunnerExecutor

pub mod backpressure;
pub mod config;
pub mod error;
pub mod poller;
pub mod service;

pub use config::RunnerConfig;
pub use error::RunnerServiceError;
pub use service::{Handler, HandlerResult, RunnerService, ServiceStatus};
