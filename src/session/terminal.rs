//! PTY-hosted terminal sessions.
//!
//! The configured command runs under a fresh pseudo-terminal. The master
//! descriptor is registered with the fd poller; raw bytes flow in both
//! directions with no framing and no metadata channel. Resizes apply the
//! TTY window-size ioctl through the PTY handle, and close delivers
//! `SIGHUP` to the child.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::task::JoinHandle;

use crate::constants;
use crate::poller::{Poller, ReadQueue};
use crate::session::{Lifecycle, ProcessState, Session, SessionConnector};
use crate::types::{Meta, SessionId};

/// A session that manages a terminal.
pub struct TerminalSession {
    poller: Poller,
    session_id: SessionId,
    command: String,
    lifecycle: Lifecycle,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    child: StdMutex<Option<Box<dyn portable_pty::Child + Send + Sync>>>,
    pid: StdMutex<Option<i32>>,
    master_fd: StdMutex<Option<RawFd>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TerminalSession({:?}, id={})",
            self.command, self.session_id
        )
    }
}

impl TerminalSession {
    /// Create a terminal session for `command`; an empty command falls back
    /// to the user's shell.
    #[must_use]
    pub fn new(poller: Poller, session_id: SessionId, command: String) -> Self {
        let label = format!("TerminalSession({command:?}, id={session_id})");
        Self {
            poller,
            session_id,
            command,
            lifecycle: Lifecycle::new(label),
            master: StdMutex::new(None),
            child: StdMutex::new(None),
            pid: StdMutex::new(None),
            master_fd: StdMutex::new(None),
            task: StdMutex::new(None),
        }
    }

    fn winsize(width: u16, height: u16) -> PtySize {
        PtySize {
            rows: height,
            cols: width,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// The driving task: pump poller chunks upstream until EOF.
    async fn run(self: Arc<Self>, connector: Arc<dyn SessionConnector>) {
        let registered = *self.master_fd.lock().expect("master_fd lock poisoned");
        let Some(fd) = registered else {
            log::debug!("{self:?} started without a PTY");
            self.finish(&connector, None).await;
            return;
        };

        let mut queue: ReadQueue = self.poller.add_file(fd);
        self.lifecycle.set_state(ProcessState::Running);

        loop {
            match queue.recv().await {
                Some(Some(data)) => connector.on_data(data).await,
                // Null chunk: EOF or fd error; either way the terminal is done.
                Some(None) | None => break,
            }
        }

        self.finish(&connector, Some(fd)).await;
    }

    /// Tear down after the run loop: report close, release the master fd,
    /// and reap the child off the async runtime.
    async fn finish(&self, connector: &Arc<dyn SessionConnector>, fd: Option<RawFd>) {
        self.lifecycle.mark_ended();
        self.lifecycle.set_state(ProcessState::Closed);
        connector.on_close().await;

        if let Some(fd) = fd {
            self.poller.remove_file(fd);
        }
        *self.master_fd.lock().expect("master_fd lock poisoned") = None;
        // Dropping the master closes the descriptor.
        *self.master.lock().expect("master lock poisoned") = None;

        let child = self.child.lock().expect("child lock poisoned").take();
        if let Some(mut child) = child {
            tokio::task::spawn_blocking(move || {
                let _ = child.wait();
            });
        }
    }
}

#[async_trait]
impl Session for TerminalSession {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn state(&self) -> ProcessState {
        self.lifecycle.state()
    }

    async fn open(&self, width: u16, height: u16) -> Result<()> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(Self::winsize(width, height))
            .context("unable to open a PTY")?;

        let mut builder = if self.command.is_empty() {
            CommandBuilder::new_default_prog()
        } else {
            CommandBuilder::new(&self.command)
        };
        builder.env("TERM_PROGRAM", constants::TERM_PROGRAM);
        builder.env("TERM_PROGRAM_VERSION", constants::TERM_PROGRAM_VERSION);

        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("unable to spawn {:?}", self.command))?;
        drop(pair.slave);

        let raw_fd = pair
            .master
            .as_raw_fd()
            .context("PTY master has no file descriptor")?;

        *self.pid.lock().expect("pid lock poisoned") =
            child.process_id().map(|pid| pid as i32);
        *self.child.lock().expect("child lock poisoned") = Some(child);
        *self.master_fd.lock().expect("master_fd lock poisoned") = Some(raw_fd);
        *self.master.lock().expect("master lock poisoned") = Some(pair.master);

        self.lifecycle.mark_opened();
        log::debug!("opened {self:?}");
        Ok(())
    }

    async fn start(self: Arc<Self>, connector: Arc<dyn SessionConnector>) {
        self.lifecycle.mark_started();
        let task = tokio::spawn(Arc::clone(&self).run(connector));
        *self.task.lock().expect("task lock poisoned") = Some(task);
    }

    async fn close(&self) {
        if self.state() == ProcessState::Running {
            self.lifecycle.set_state(ProcessState::Closing);
        }
        let pid = *self.pid.lock().expect("pid lock poisoned");
        if let Some(pid) = pid {
            let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
        }
    }

    async fn wait(&self) {
        self.lifecycle.wait().await;
    }

    async fn set_terminal_size(&self, width: u16, height: u16) {
        let master = self.master.lock().expect("master lock poisoned");
        if let Some(master) = master.as_ref() {
            if let Err(error) = master.resize(Self::winsize(width, height)) {
                log::warn!("{self:?} resize failed: {error}");
            }
        }
    }

    async fn send_bytes(&self, data: Vec<u8>) -> bool {
        let fd = *self.master_fd.lock().expect("master_fd lock poisoned");
        match fd {
            Some(fd) => self.poller.write(fd, data).await,
            None => false,
        }
    }

    /// PTY sessions have no metadata channel; meta is silently accepted.
    async fn send_meta(&self, _meta: Meta) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        output: StdMutex<Vec<u8>>,
        closes: AtomicUsize,
    }

    impl Recorder {
        fn output_string(&self) -> String {
            String::from_utf8_lossy(&self.output.lock().unwrap()).to_string()
        }
    }

    #[async_trait]
    impl SessionConnector for Recorder {
        async fn on_data(&self, data: Vec<u8>) {
            self.output.lock().unwrap().extend_from_slice(&data);
        }

        async fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for_output(recorder: &Recorder, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if recorder.output_string().contains(needle) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn terminal(poller: &Poller) -> Arc<TerminalSession> {
        Arc::new(TerminalSession::new(
            poller.clone(),
            SessionId::from("T-test"),
            "sh".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_shell_round_trip_and_close() {
        let poller = Poller::new().unwrap();
        poller.start();
        let session = terminal(&poller);
        let connector = Arc::new(Recorder::default());

        session.open(80, 24).await.unwrap();
        Arc::clone(&session)
            .start(Arc::clone(&connector) as Arc<dyn SessionConnector>)
            .await;

        // The quoting splits the marker so the echoed input line can't match.
        assert!(session.send_bytes(b"echo byte\"s-round\"-trip\n".to_vec()).await);
        assert!(wait_for_output(&connector, "bytes-round-trip").await);

        session.close().await;
        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end after SIGHUP");
        assert_eq!(session.state(), ProcessState::Closed);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        // Closing again is safe.
        session.close().await;
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        poller.exit();
    }

    #[tokio::test]
    async fn test_resize_is_visible_to_the_child() {
        let poller = Poller::new().unwrap();
        poller.start();
        let session = terminal(&poller);
        let connector = Arc::new(Recorder::default());

        session.open(80, 24).await.unwrap();
        Arc::clone(&session)
            .start(Arc::clone(&connector) as Arc<dyn SessionConnector>)
            .await;

        session.set_terminal_size(132, 50).await;
        assert!(session.send_bytes(b"stty size\n".to_vec()).await);
        assert!(wait_for_output(&connector, "50 132").await);

        session.close().await;
        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end");
        poller.exit();
    }

    #[tokio::test]
    async fn test_send_meta_is_a_silent_success() {
        let poller = Poller::new().unwrap();
        let session = terminal(&poller);
        assert!(session.send_meta(Meta::new()).await);
    }

    #[tokio::test]
    async fn test_send_bytes_without_a_pty_returns_false() {
        let poller = Poller::new().unwrap();
        let session = terminal(&poller);
        assert!(!session.send_bytes(b"data".to_vec()).await);
    }
}
