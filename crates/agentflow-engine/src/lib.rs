//! The step state machine (§4.3) and the event/task dispatcher (§4.4),
//! composed into a [`RunnerExecutor`] that drives one runner forward using
//! `agentflow-core`'s interpreter and `agentflow-store`'s DAOs.

pub mod audit;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod scope;
pub mod state_machine;

pub use error::EngineError;
pub use executor::RunnerExecutor;
