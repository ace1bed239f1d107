//! Session abstractions.
//!
//! A session is a single end-user conversation realized as one child
//! process. Two variants exist: a framed app ([`app::AppSession`]) speaking
//! a tag-length-value protocol on its stdio, and a PTY terminal
//! ([`terminal::TerminalSession`]) exchanging raw bytes through the fd
//! poller. Both implement [`Session`]; dispatch is static per session.
//!
//! Sessions push upstream through a [`SessionConnector`] handed to
//! [`Session::start`]. The connector points at the hub client's sending
//! machinery, not at the session, so ownership is acyclic.

pub mod app;
pub mod manager;
#[cfg(unix)]
pub mod terminal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{Meta, SessionId};

/// The state of a session process.
///
/// Transitions are monotonic: `Pending -> Running -> Closing -> Closed`,
/// with `Closing` skipped when the child ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created but not yet serving frames.
    Pending,
    /// Main loop running.
    Running,
    /// Graceful shutdown requested.
    Closing,
    /// Terminal state; the child is gone.
    Closed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        write!(f, "{name}")
    }
}

/// Callback surface by which a session pushes data, metadata, and close
/// events upstream without knowing the transport.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Handle data from the session.
    async fn on_data(&self, _data: Vec<u8>) {}

    /// Handle meta from the session.
    async fn on_meta(&self, _meta: Meta) {}

    /// Handle a pre-encoded binary message from the session, to be
    /// forwarded upstream verbatim.
    async fn on_binary_encoded_message(&self, _payload: Vec<u8>) {}

    /// Handle session close.
    async fn on_close(&self) {}
}

/// A connector that discards everything; the default before `start`.
pub struct NullConnector;

#[async_trait]
impl SessionConnector for NullConnector {}

/// Common interface over the session variants.
#[async_trait]
pub trait Session: Send + Sync {
    /// The hub-assigned session identity.
    fn session_id(&self) -> &SessionId;

    /// Current lifecycle state.
    fn state(&self) -> ProcessState;

    /// Launch the child process at the given terminal size.
    async fn open(&self, width: u16, height: u16) -> Result<()>;

    /// Start the driving task. The session reports upstream through
    /// `connector` from here on.
    async fn start(self: Arc<Self>, connector: Arc<dyn SessionConnector>);

    /// Request a graceful close.
    async fn close(&self);

    /// Wait for the session to end. Safe to call from multiple tasks.
    async fn wait(&self);

    /// Apply a new terminal size.
    async fn set_terminal_size(&self, width: u16, height: u16);

    /// Send bytes to the child. Returns `false` if the data was not sent.
    async fn send_bytes(&self, data: Vec<u8>) -> bool;

    /// Send meta to the child. Returns `false` if the data was not sent.
    async fn send_meta(&self, meta: Meta) -> bool;
}

/// Lifecycle bookkeeping shared by the session variants: the state tag,
/// start/end instants, and the finished signal `wait()` blocks on.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    label: String,
    state: Mutex<ProcessState>,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
    started: AtomicBool,
    finished: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new(label: String) -> Self {
        Self {
            label,
            state: Mutex::new(ProcessState::Pending),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
            started: AtomicBool::new(false),
            finished: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> ProcessState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.state.lock().expect("state lock poisoned") = state;
        let run_time = self
            .run_time()
            .map_or_else(|| "0".to_string(), |elapsed| format!("{}s", elapsed.as_secs()));
        log::debug!("{} state={state} run_time={run_time}", self.label);
    }

    /// Record the child launch time.
    pub(crate) fn mark_opened(&self) {
        *self.start_time.lock().expect("start_time lock poisoned") = Some(Instant::now());
    }

    /// Record that the driving task exists, so `wait()` has something to
    /// wait for.
    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Whether the driving task was ever started.
    pub(crate) fn was_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Record the end instant and flip the finished signal.
    pub(crate) fn mark_ended(&self) {
        *self.end_time.lock().expect("end_time lock poisoned") = Some(Instant::now());
        self.finished.cancel();
    }

    /// Time the process has been running, or `None` if it hasn't started.
    pub(crate) fn run_time(&self) -> Option<Duration> {
        let start_time = (*self.start_time.lock().expect("start_time lock poisoned"))?;
        let end_time = *self.end_time.lock().expect("end_time lock poisoned");
        Some(match end_time {
            Some(end_time) => end_time.duration_since(start_time),
            None => start_time.elapsed(),
        })
    }

    /// Wait until `mark_ended`, or return at once if the driving task was
    /// never started.
    pub(crate) async fn wait(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.finished.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::Pending.to_string(), "PENDING");
        assert_eq!(ProcessState::Closed.to_string(), "CLOSED");
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_never_started() {
        let lifecycle = Lifecycle::new("test".to_string());
        lifecycle.wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_ended() {
        let lifecycle = Arc::new(Lifecycle::new("test".to_string()));
        lifecycle.mark_started();

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait().await })
        };
        assert!(!waiter.is_finished());

        lifecycle.mark_ended();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait did not resolve")
            .unwrap();
    }

    #[test]
    fn test_run_time_tracks_open_and_end() {
        let lifecycle = Lifecycle::new("test".to_string());
        assert!(lifecycle.run_time().is_none());
        lifecycle.mark_opened();
        assert!(lifecycle.run_time().is_some());
        lifecycle.mark_ended();
        let frozen = lifecycle.run_time().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(lifecycle.run_time().unwrap(), frozen);
    }
}
