//! Offline backends with canned behaviour, used by tests and headless runs.

use crate::{InferenceBackend, InferenceError, StreamEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// One scripted reply popped per generation request.
#[derive(Debug, Clone)]
enum Script {
    /// A plain response string.
    Text(String),
    /// A response pre-split into stream tokens.
    Tokens(Vec<String>),
    /// An abnormal termination with the given reason.
    Failure(String),
}

/// Backend that replays a queue of scripted responses.
///
/// When the queue is empty it falls back to a fixed response, so long test
/// runs never stall. Every prompt received is retained for assertions.
#[derive(Debug)]
pub struct ScriptedBackend {
    ready: bool,
    refuse_init: bool,
    scripts: VecDeque<Script>,
    fallback: String,
    synthetic_latency: Duration,
    last_inference: Duration,
    prompts_seen: Vec<String>,
    max_ctx: usize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Create an uninitialised scripted backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: false,
            refuse_init: false,
            scripts: VecDeque::new(),
            fallback: String::from("acknowledged"),
            synthetic_latency: Duration::from_millis(1),
            last_inference: Duration::ZERO,
            prompts_seen: Vec::new(),
            max_ctx: 0,
        }
    }

    /// Create a backend that is already ready (skips `init`).
    #[must_use]
    pub fn ready() -> Self {
        let mut backend = Self::new();
        backend.ready = true;
        backend.max_ctx = 4096;
        backend
    }

    /// Make the next `init` call fail with `BackendLoadFailed`.
    pub fn refuse_init(&mut self) {
        self.refuse_init = true;
    }

    /// Queue a plain response.
    pub fn push_response(&mut self, text: impl Into<String>) {
        self.scripts.push_back(Script::Text(text.into()));
    }

    /// Queue a streamed response with explicit token boundaries.
    pub fn push_stream(&mut self, tokens: &[&str]) {
        self.scripts
            .push_back(Script::Tokens(tokens.iter().map(|t| (*t).into()).collect()));
    }

    /// Queue an abnormal termination.
    pub fn push_failure(&mut self, reason: impl Into<String>) {
        self.scripts.push_back(Script::Failure(reason.into()));
    }

    /// Replace the fallback response used when the queue is empty.
    pub fn set_fallback(&mut self, text: impl Into<String>) {
        self.fallback = text.into();
    }

    /// Synthetic duration reported for each generation.
    pub fn set_synthetic_latency(&mut self, latency: Duration) {
        self.synthetic_latency = latency;
    }

    /// Prompts received so far, in call order.
    #[must_use]
    pub fn prompts_seen(&self) -> &[String] {
        &self.prompts_seen
    }

    /// Scripted replies not yet consumed.
    #[must_use]
    pub fn pending_scripts(&self) -> usize {
        self.scripts.len()
    }

    fn next_script(&mut self) -> Script {
        self.scripts
            .pop_front()
            .unwrap_or_else(|| Script::Text(self.fallback.clone()))
    }
}

impl InferenceBackend for ScriptedBackend {
    fn init(&mut self, model_path: &str, max_ctx: usize) -> Result<(), InferenceError> {
        if self.refuse_init {
            return Err(InferenceError::BackendLoadFailed {
                path: model_path.to_string(),
                reason: String::from("scripted refusal"),
            });
        }
        if max_ctx == 0 {
            return Err(InferenceError::BackendLoadFailed {
                path: model_path.to_string(),
                reason: String::from("max_ctx must be non-zero"),
            });
        }
        self.max_ctx = max_ctx;
        self.ready = true;
        debug!(model_path, max_ctx, "scripted backend initialised");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn generate(&mut self, prompt: &str, _max_tokens: usize) -> Result<String, InferenceError> {
        if !self.ready {
            return Err(InferenceError::NotReady);
        }
        self.prompts_seen.push(prompt.to_string());
        self.last_inference = self.synthetic_latency;
        match self.next_script() {
            Script::Text(text) => Ok(text),
            Script::Tokens(tokens) => Ok(tokens.concat()),
            Script::Failure(reason) => Err(InferenceError::InferenceFailed(reason)),
        }
    }

    fn generate_stream(
        &mut self,
        prompt: &str,
        _max_tokens: usize,
        on_event: &mut dyn FnMut(StreamEvent),
    ) -> Result<(), InferenceError> {
        if !self.ready {
            return Err(InferenceError::NotReady);
        }
        self.prompts_seen.push(prompt.to_string());
        self.last_inference = self.synthetic_latency;
        match self.next_script() {
            Script::Text(text) => {
                if !text.is_empty() {
                    on_event(StreamEvent::Token(text));
                }
                on_event(StreamEvent::Done);
                Ok(())
            }
            Script::Tokens(tokens) => {
                for token in tokens {
                    on_event(StreamEvent::Token(token));
                }
                on_event(StreamEvent::Done);
                Ok(())
            }
            Script::Failure(reason) => Err(InferenceError::InferenceFailed(reason)),
        }
    }

    fn shutdown(&mut self) {
        self.ready = false;
        self.scripts.clear();
    }

    fn last_inference_time(&self) -> Duration {
        self.last_inference
    }
}

/// Backend that deterministically echoes a digest of the prompt.
///
/// Useful for smoke-testing prompt plumbing without scripting replies.
#[derive(Debug, Default)]
pub struct EchoBackend {
    ready: bool,
    last_inference: Duration,
}

impl EchoBackend {
    /// Create a ready echo backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: true,
            last_inference: Duration::ZERO,
        }
    }

    fn digest(prompt: &str, max_tokens: usize) -> String {
        let head: String = prompt.chars().take(48).collect();
        format!("echo[{max_tokens}]: {head}")
    }
}

impl InferenceBackend for EchoBackend {
    fn init(&mut self, _model_path: &str, max_ctx: usize) -> Result<(), InferenceError> {
        if max_ctx == 0 {
            return Err(InferenceError::BackendLoadFailed {
                path: String::new(),
                reason: String::from("max_ctx must be non-zero"),
            });
        }
        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn generate(&mut self, prompt: &str, max_tokens: usize) -> Result<String, InferenceError> {
        if !self.ready {
            return Err(InferenceError::NotReady);
        }
        self.last_inference = Duration::from_micros(1);
        Ok(Self::digest(prompt, max_tokens))
    }

    fn generate_stream(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        on_event: &mut dyn FnMut(StreamEvent),
    ) -> Result<(), InferenceError> {
        let text = self.generate(prompt, max_tokens)?;
        on_event(StreamEvent::Token(text));
        on_event(StreamEvent::Done);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.ready = false;
    }

    fn last_inference_time(&self) -> Duration {
        self.last_inference
    }
}
