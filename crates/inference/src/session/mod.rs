//! Inference session boundary
//!
//! The session is the stateful, single-conversation execution context that
//! turns a prompt into text. It is callback driven: `submit` returns at once
//! and generation events arrive later, possibly on another thread. The
//! [`GenerationBridge`](crate::bridge::GenerationBridge) is the only caller
//! and serializes all access.

pub mod upstream;

#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

use async_trait::async_trait;

pub use upstream::{UpstreamConfig, UpstreamSession};

#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedSession;

/// Error types for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not ready")]
    NotReady,

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(String),
}

impl SessionError {
    /// Cancellation is reported through the error path by some engines but
    /// is not a failure: the partial text is still a valid answer.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

/// A decoded image handed to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA8 pixels
    pub rgba: Vec<u8>,
}

/// Text plus optional images for one user turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub images: Vec<PromptImage>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }
}

/// Event delivered by the session while a generation is in flight
#[derive(Debug)]
pub enum SessionEvent {
    /// Incremental piece of generated text
    Fragment(String),
    /// Generation finished normally
    Completed,
    /// Generation stopped after `cancel()`
    Cancelled,
    /// Generation aborted
    Failed(SessionError),
}

/// Callback receiving generation events; may be invoked from any thread
pub type EventCallback = Box<dyn Fn(SessionEvent) + Send + Sync + 'static>;

/// The stateful, single-conversation model context.
///
/// Implementations are not required to be reentrant: callers must not
/// submit a second prompt before the first one reached a terminal event.
#[async_trait]
pub trait InferenceSession: Send + Sync {
    /// Name of the currently active model
    fn model_name(&self) -> String;

    /// Whether the session can accept a prompt right now
    fn is_ready(&self) -> bool;

    /// Drop accumulated context and start a fresh turn
    async fn reset(&self) -> Result<(), SessionError>;

    /// Start generating for `prompt`.
    ///
    /// Returns once the prompt was accepted. Every accepted submission ends
    /// with exactly one terminal event (`Completed`, `Cancelled` or `Failed`).
    fn submit(&self, prompt: Prompt, on_event: EventCallback) -> Result<(), SessionError>;

    /// Cancel the in-flight generation, if any
    fn cancel(&self);
}
