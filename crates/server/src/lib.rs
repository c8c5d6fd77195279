//! OpenAI-compatible HTTP front end for a single on-device inference session
//!
//! - **decode**: request body reading and prompt extraction
//! - **format**: response and chunk shapes
//! - **stream**: bounded SSE transport between generation and response body
//! - **routes**: axum router and handlers
//! - **server**: listener lifecycle and the single-instance manager
//! - **config**: JSON configuration with defaults

pub mod config;
pub mod decode;
pub mod error;
pub mod format;
pub mod routes;
pub mod server;
pub mod stream;

pub use config::{ConfigError, ServerConfig};
pub use error::ApiError;
pub use routes::{build_router, AppState};
pub use server::{HttpServer, ServerError, ServerHandle, ServerManager, ServerStatus};
