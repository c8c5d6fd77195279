//! Shared constants
//!
//! Single source of truth for ports, timeouts and capacities used by the
//! bridge and the HTTP server.

/// Network port configuration
pub mod ports {
    /// Default port for the chat-completion server
    pub const SERVER: u16 = 8080;
}

/// Host names
pub mod hosts {
    /// Bind address that accepts connections on every interface
    pub const ANY: &str = "0.0.0.0";
    /// Advertised address when no non-loopback IPv4 interface exists
    pub const LOCALHOST: &str = "localhost";
}

/// Timeout configuration
pub mod timeouts {
    /// Maximum time to wait for the session to report ready
    pub const SESSION_READY_SECS: u64 = 30;
    /// Interval between readiness checks
    pub const SESSION_READY_POLL_MS: u64 = 100;
    /// Maximum wait for the next queued stream chunk
    pub const STREAM_CHUNK_SECS: u64 = 30;
    /// Wait for a terminal signal after a budget cancel was issued
    pub const CANCEL_GRACE_SECS: u64 = 5;
    /// Bounded wait for the listener task when stopping the server
    pub const SERVER_STOP_SECS: u64 = 5;
}

/// Capacities and size limits
pub mod limits {
    /// Maximum number of retained log entries
    pub const LOG_CAPACITY: usize = 100;
    /// Number of SSE frames buffered between generation and response writer
    pub const STREAM_QUEUE_CAPACITY: usize = 64;
    /// Largest accepted request body (inline images make these big)
    pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
}
