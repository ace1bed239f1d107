//! Idle-exit watchdog.
//!
//! When configured with a positive idle window, polls the session manager
//! every few seconds and forces the bridge down once it has been free of
//! sessions for the whole window. Any session appearing mid-window resets
//! the clock.

// Rust guideline compliant 2026-03

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::EXIT_POLL_RATE;
use crate::session::manager::SessionManager;

/// Monitors the bridge for an idle state, and exits.
pub struct ExitPoller {
    session_manager: Arc<SessionManager>,
    exit: CancellationToken,
    idle_wait: Duration,
    poll_rate: Duration,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ExitPoller {
    /// Create a poller that cancels `exit` after `idle_wait` of no
    /// sessions. A zero `idle_wait` disables the watchdog.
    #[must_use]
    pub fn new(
        session_manager: Arc<SessionManager>,
        exit: CancellationToken,
        idle_wait: Duration,
    ) -> Self {
        Self::with_poll_rate(session_manager, exit, idle_wait, EXIT_POLL_RATE)
    }

    /// As [`ExitPoller::new`], with an explicit polling interval.
    #[must_use]
    pub fn with_poll_rate(
        session_manager: Arc<SessionManager>,
        exit: CancellationToken,
        idle_wait: Duration,
        poll_rate: Duration,
    ) -> Self {
        Self {
            session_manager,
            exit,
            idle_wait,
            poll_rate,
            task: StdMutex::new(None),
        }
    }

    /// Start polling.
    pub fn start(&self) {
        if self.idle_wait.is_zero() {
            return;
        }
        let session_manager = Arc::clone(&self.session_manager);
        let exit = self.exit.clone();
        let idle_wait = self.idle_wait;
        let poll_rate = self.poll_rate;
        let task = tokio::spawn(async move {
            let mut idle_start: Option<Instant> = None;
            loop {
                tokio::time::sleep(poll_rate).await;
                if session_manager.session_count() == 0 {
                    match idle_start {
                        Some(since) if since.elapsed() > idle_wait => {
                            log::info!("Exiting after {}s idle", idle_wait.as_secs());
                            exit.cancel();
                            break;
                        }
                        Some(_) => {}
                        None => idle_start = Some(Instant::now()),
                    }
                } else {
                    idle_start = None;
                }
            }
        });
        *self.task.lock().expect("task lock poisoned") = Some(task);
    }

    /// Stop polling.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
    }
}
