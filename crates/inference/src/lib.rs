//! On-device inference bridge
//!
//! This library puts a single, stateful inference session behind a
//! serialized generation bridge:
//! - **session**: the callback-driven session boundary plus an adapter for
//!   OpenAI-compatible upstream servers
//! - **bridge**: one generation at a time, readiness wait, token budget,
//!   blocking and streaming views
//! - **logs**: bounded newest-first log shared with the HTTP layer
//!
//! # Example
//!
//! ```rust,ignore
//! use ondevice_inference::{GenerationBridge, GenerationRequest, LogBuffer, Prompt};
//! use ondevice_inference::session::{UpstreamConfig, UpstreamSession};
//! use std::sync::Arc;
//!
//! let session = Arc::new(UpstreamSession::new(UpstreamConfig::new(
//!     "http://127.0.0.1:11434",
//!     "qwen2.5:3b",
//! )));
//! session.spawn_probe();
//!
//! let bridge = GenerationBridge::new(session, Arc::new(LogBuffer::new()));
//! let result = bridge
//!     .generate(GenerationRequest { prompt: Prompt::text("Hello"), max_tokens: Some(64) })
//!     .await?;
//! ```

pub mod bridge;
pub mod constants;
pub mod logs;
pub mod session;

// Re-exports for convenience
pub use bridge::{
    BridgeConfig, FragmentSink, GenerationBridge, GenerationError, GenerationRequest,
    GenerationResult, GenerationStats, SharedBridge,
};
pub use logs::LogBuffer;
pub use session::{
    EventCallback, InferenceSession, Prompt, PromptImage, SessionError, SessionEvent,
};
