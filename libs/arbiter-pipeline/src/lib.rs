pub mod cancel;
pub mod coordinator;
pub mod error;
pub mod evaluator;
pub mod language;
pub mod memory;
pub mod publisher;
pub mod rate_limit;
pub mod retry;
pub mod sandbox;
pub mod scoring;
pub mod service;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{PipelineError, Result};
pub use service::{
    AdhocRequest, AdhocResponse, Backends, EvaluateRequest, EvaluationService, SubmitResponse,
};
