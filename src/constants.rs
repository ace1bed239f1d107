//! Application-wide constants and environment switches.
//!
//! Centralizes magic numbers so timeouts and intervals are discoverable in
//! one place, grouped by domain.

// Rust guideline compliant 2026-03

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Program identifier advertised to child processes.
pub const TERM_PROGRAM: &str = env!("CARGO_PKG_NAME");

/// Program version advertised to child processes.
pub const TERM_PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Hub channel
// ============================================================================

/// Request header carrying the API key during the channel handshake.
pub const API_KEY_HEADER: &str = "GANGLIONAPIKEY";

/// Interval between websocket-level pings keeping the channel alive.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// Sessions
// ============================================================================

/// Ready token a framed-app child must print on stdout before any frames.
pub const READY_TOKEN: &[u8] = b"__GANGLION__\n";

/// Number of stdout lines scanned for the ready token before giving up.
pub const READY_LINE_BUDGET: usize = 10;

/// Upper bound for shutting down all sessions at once.
pub const CLOSE_ALL_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Polling
// ============================================================================

/// Ceiling on a single read from a polled file descriptor.
pub const READ_CHUNK_SIZE: usize = 1024 * 32;

/// Poll timeout bounding each poller iteration, so the exit flag is observed.
pub const POLL_TIMEOUT_MS: u16 = 1000;

/// Interval between idle checks by the exit poller.
pub const EXIT_POLL_RATE: Duration = Duration::from_secs(5);

// ============================================================================
// Environment switches
// ============================================================================

/// Whether verbose debug diagnostics are enabled (`DEBUG=1`).
#[must_use]
pub fn debug() -> bool {
    std::env::var("DEBUG").as_deref() == Ok("1")
}

/// Environment selected via `GANGLION_ENVIRONMENT`, defaulting to `prod`.
#[must_use]
pub fn environment() -> String {
    std::env::var("GANGLION_ENVIRONMENT").unwrap_or_else(|_| "prod".to_string())
}

/// API key supplied via `GANGLION_API_KEY`, if any.
#[must_use]
pub fn api_key() -> Option<String> {
    std::env::var("GANGLION_API_KEY")
        .ok()
        .filter(|key| !key.is_empty())
}
