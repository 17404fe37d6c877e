//! Typed error hierarchy for the lessonlab service.
//!
//! Two top-level enums cover the two subsystems that need matchable errors:
//! - `PipelineError`: generation pipeline failures, split by recovery policy
//! - `TransportError`: client-side stream transport failures

use thiserror::Error;

/// Errors from the generation pipeline.
///
/// The variants mirror the recovery policy: `Generation` is retried with
/// backoff, `Validation`/`CorrectiveFailed` end the run after the single
/// auto-fix attempt, and `Persistence` is fatal: the pipeline cannot declare
/// success without a durable write.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Generation failed after {attempts} attempts: {message}")]
    Generation { attempts: u32, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Auto-fix failed; original errors: [{original}]; fix stage: {fix}")]
    CorrectiveFailed { original: String, fix: String },

    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the client-side stream transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    #[error("Reconnect attempts exhausted after {attempts} failures: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
}
