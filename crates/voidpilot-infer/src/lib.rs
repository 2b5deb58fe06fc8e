//! Traits and offline implementations for Voidpilot inference backends.
//!
//! A backend turns a prompt into a response string, either blocking or as
//! an ordered token stream. The core assumes a single-threaded cooperative
//! backend: one generation in flight per process, synchronous from the
//! caller's point of view. Embedders wrapping a real model implement
//! [`InferenceBackend`] outside this workspace; the scripted backends here
//! exist for tests and headless runs.

mod scripted;

pub use scripted::{EchoBackend, ScriptedBackend};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by inference backends.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The model could not be opened or initialised.
    #[error("backend failed to load model `{path}`: {reason}")]
    BackendLoadFailed { path: String, reason: String },
    /// A generation was requested before `init` succeeded (or after shutdown).
    #[error("backend is not ready")]
    NotReady,
    /// A blocking or streamed generation ended abnormally. The caller must
    /// not adopt any partial output.
    #[error("inference ended abnormally: {0}")]
    InferenceFailed(String),
}

/// One event delivered by [`InferenceBackend::generate_stream`].
///
/// Tokens arrive in order and need not be word-aligned; `Done` is the
/// distinguished end-marker and is always the final event of a successful
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The next chunk of generated text.
    Token(String),
    /// Generation completed normally.
    Done,
}

/// Shared interface implemented by all inference backends.
///
/// Ownership contract: every returned string is owned by the caller, and
/// the backend retains no reference to caller-provided prompts after the
/// call returns.
pub trait InferenceBackend: Send {
    /// Open the model at `model_path` and allocate a token buffer of
    /// `max_ctx`. On success the backend reports ready.
    fn init(&mut self, model_path: &str, max_ctx: usize) -> Result<(), InferenceError>;

    /// Whether the backend can serve generations.
    fn is_ready(&self) -> bool;

    /// Generate a response, blocking until completion or failure. Only
    /// valid while ready. Updates the last-inference duration.
    fn generate(&mut self, prompt: &str, max_tokens: usize) -> Result<String, InferenceError>;

    /// Generate a response as an ordered token stream. A successful stream
    /// ends with [`StreamEvent::Done`]; a failed stream returns an error
    /// and the events already delivered must be discarded by the caller.
    fn generate_stream(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        on_event: &mut dyn FnMut(StreamEvent),
    ) -> Result<(), InferenceError>;

    /// Release resources. Afterwards `is_ready` reports false.
    fn shutdown(&mut self);

    /// Wall-clock duration of the most recent generation.
    fn last_inference_time(&self) -> Duration;
}

/// Aggregate counters a host can sample from its backend wrapper.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceTelemetry {
    /// Completed generations.
    pub calls: u64,
    /// Generations that ended abnormally.
    pub failures: u64,
    /// Total time spent inside the backend, in seconds.
    pub total_time_s: f64,
}

impl InferenceTelemetry {
    /// Record a completed call of the given duration.
    pub fn record_call(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total_time_s += elapsed.as_secs_f64();
    }

    /// Record an abnormal termination.
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Mean time per completed call, in milliseconds.
    #[must_use]
    pub fn mean_call_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_time_s * 1000.0 / self.calls as f64
        }
    }
}
