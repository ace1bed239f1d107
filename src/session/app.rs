//! Framed-app sessions.
//!
//! Runs a single app process with piped stdio. After the child prints the
//! ready token on stdout, every message in either direction is a frame:
//!
//! ```text
//! ┌─────┬──────────────┬───────────────┐
//! │ tag │ length (be32)│ payload       │
//! └─────┴──────────────┴───────────────┘
//! ```
//!
//! Tags: `D` opaque session data, `M` UTF-8 JSON metadata, `P` a
//! pre-encoded binary message the child asks us to forward upstream
//! verbatim. A child that never signals ready within the line budget is
//! closed without ever receiving a frame.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::constants::{self, READY_LINE_BUDGET, READY_TOKEN};
use crate::session::{Lifecycle, ProcessState, Session, SessionConnector};
use crate::types::{Meta, SessionId};

/// Opaque terminal bytes.
const FRAME_DATA: u8 = b'D';
/// UTF-8 JSON metadata object.
const FRAME_META: u8 = b'M';
/// Pre-encoded binary message, forwarded upstream verbatim.
const FRAME_PACKED: u8 = b'P';

/// Runs a single app process.
pub struct AppSession {
    working_directory: PathBuf,
    command: String,
    session_id: SessionId,
    devtools: bool,
    lifecycle: Lifecycle,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: StdMutex<Option<ChildStdout>>,
    stderr: StdMutex<Option<ChildStderr>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AppSession({:?}, id={})",
            self.command, self.session_id
        )
    }
}

impl AppSession {
    /// Create a session for `command`, run from `working_directory`.
    #[must_use]
    pub fn new(
        working_directory: PathBuf,
        command: String,
        session_id: SessionId,
        devtools: bool,
    ) -> Self {
        let label = format!("AppSession({command:?}, id={session_id})");
        Self {
            working_directory,
            command,
            session_id,
            devtools,
            lifecycle: Lifecycle::new(label),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: StdMutex::new(None),
            stderr: StdMutex::new(None),
            task: StdMutex::new(None),
        }
    }

    /// Encode a single frame.
    fn encode_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(tag);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Write one frame to the child's stdin.
    ///
    /// The stdin lock serializes concurrent senders, so frames reach the
    /// child whole and in submission order.
    async fn send_frame(&self, tag: u8, payload: &[u8]) -> bool {
        let frame = Self::encode_frame(tag, payload);
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return false;
        };
        if let Err(error) = stdin.write_all(&frame).await {
            log::debug!("{self:?} write failed: {error}");
            return false;
        }
        if let Err(error) = stdin.flush().await {
            log::debug!("{self:?} flush failed: {error}");
            return false;
        }
        true
    }

    /// Scan up to the line budget of stdout for the ready token.
    async fn await_ready(reader: &mut BufReader<ChildStdout>) -> bool {
        let mut line = Vec::new();
        for _ in 0..READY_LINE_BUDGET {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
            if line == READY_TOKEN {
                return true;
            }
        }
        false
    }

    /// The frame loop: read `tag + length + payload` until the stream ends.
    async fn run_frames(
        &self,
        reader: &mut BufReader<ChildStdout>,
        connector: &Arc<dyn SessionConnector>,
    ) {
        loop {
            let mut tag = [0u8; 1];
            if reader.read_exact(&mut tag).await.is_err() {
                break;
            }
            let mut size_bytes = [0u8; 4];
            if reader.read_exact(&mut size_bytes).await.is_err() {
                break;
            }
            let size = u32::from_be_bytes(size_bytes) as usize;
            let mut payload = vec![0u8; size];
            if reader.read_exact(&mut payload).await.is_err() {
                break;
            }

            match tag[0] {
                FRAME_DATA => connector.on_data(payload).await,
                FRAME_META => {
                    let Ok(Value::Object(meta)) = serde_json::from_slice::<Value>(&payload)
                    else {
                        log::debug!("{self:?} sent unparseable meta");
                        continue;
                    };
                    self.handle_meta(meta, connector).await;
                }
                FRAME_PACKED => connector.on_binary_encoded_message(payload).await,
                other => {
                    log::debug!("{self:?} sent unknown frame tag {other:#04x}");
                    break;
                }
            }
        }
    }

    /// Route an inbound meta object.
    ///
    /// `exit` is reflected back to the child unchanged, signaling an
    /// acknowledged exit; everything else goes upstream through the
    /// connector.
    async fn handle_meta(&self, meta: Meta, connector: &Arc<dyn SessionConnector>) {
        let meta_type = meta
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        log::debug!("{self:?} meta {meta_type:?}");
        if meta_type == "exit" {
            let _ = self.send_meta(meta).await;
        } else {
            connector.on_meta(meta).await;
        }
    }

    /// The driving task: handshake, frame loop, then teardown.
    async fn run(self: Arc<Self>, connector: Arc<dyn SessionConnector>) {
        let stdout = self.stdout.lock().expect("stdout lock poisoned").take();
        let stderr = self.stderr.lock().expect("stderr lock poisoned").take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            log::debug!("{self:?} started without a process");
            self.finish(&connector).await;
            return;
        };

        // Drain stderr concurrently; its contents only surface in the logs
        // if the child exits non-zero.
        let stderr_buffer: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let stderr_task = tokio::spawn(read_stderr(stderr, Arc::clone(&stderr_buffer)));

        let mut reader = BufReader::new(stdout);
        if Self::await_ready(&mut reader).await {
            self.lifecycle.set_state(ProcessState::Running);
            self.run_frames(&mut reader, &connector).await;
        } else {
            // The child never signalled ready; it gets no frames, and is
            // not left running.
            log::debug!("{self:?} did not signal ready");
            if let Some(child) = self.child.lock().await.as_mut() {
                let _ = child.start_kill();
            }
        }

        stderr_task.abort();
        let _ = stderr_task.await;

        if let Some(child) = self.child.lock().await.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    log::info!("{self:?} returned error code={:?}", status.code());
                    if constants::debug() {
                        let stderr_output = stderr_buffer
                            .lock()
                            .expect("stderr buffer poisoned")
                            .clone();
                        if !stderr_output.is_empty() {
                            log::warn!("{}", String::from_utf8_lossy(&stderr_output));
                        }
                    }
                }
                _ => {}
            }
        }

        self.finish(&connector).await;
    }

    /// Record the end of the session and tell the connector, exactly once
    /// per lifecycle.
    async fn finish(&self, connector: &Arc<dyn SessionConnector>) {
        self.lifecycle.mark_ended();
        self.lifecycle.set_state(ProcessState::Closed);
        connector.on_close().await;
    }
}

/// Task draining stderr into a shared buffer.
async fn read_stderr(mut stderr: ChildStderr, buffer: Arc<StdMutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(count) => buffer
                .lock()
                .expect("stderr buffer poisoned")
                .extend_from_slice(&chunk[..count]),
        }
    }
}

#[async_trait]
impl Session for AppSession {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn state(&self) -> ProcessState {
        self.lifecycle.state()
    }

    async fn open(&self, width: u16, height: u16) -> Result<()> {
        let mut command = shell_command(&self.command);
        command
            .current_dir(&self.working_directory)
            .env("TEXTUAL_DRIVER", "textual.drivers.web_driver:WebDriver")
            .env("TEXTUAL_FPS", "60")
            .env("TEXTUAL_COLOR_SYSTEM", "truecolor")
            .env("TERM_PROGRAM", constants::TERM_PROGRAM)
            .env("TERM_PROGRAM_VERSION", constants::TERM_PROGRAM_VERSION)
            .env("COLUMNS", width.to_string())
            .env("ROWS", height.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.devtools {
            command.env("TEXTUAL", "devtools").env("TEXTUAL_LOG", "textual.log");
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("unable to spawn {:?}", self.command))?;
        *self.stdin.lock().await = child.stdin.take();
        *self.stdout.lock().expect("stdout lock poisoned") = child.stdout.take();
        *self.stderr.lock().expect("stderr lock poisoned") = child.stderr.take();
        *self.child.lock().await = Some(child);

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
        match self.state() {
            ProcessState::Closed => return,
            ProcessState::Closing => {
                self.wait().await;
                return;
            }
            ProcessState::Pending | ProcessState::Running => {}
        }
        if !self.lifecycle.was_started() {
            // Never driven; there is no loop to wind down.
            if let Some(child) = self.child.lock().await.as_mut() {
                let _ = child.start_kill();
            }
            self.lifecycle.mark_ended();
            self.lifecycle.set_state(ProcessState::Closed);
            return;
        }
        self.lifecycle.set_state(ProcessState::Closing);
        let mut quit = Meta::new();
        quit.insert("type".to_string(), "quit".into());
        let _ = self.send_meta(quit).await;
        self.wait().await;
    }

    async fn wait(&self) {
        self.lifecycle.wait().await;
    }

    async fn set_terminal_size(&self, width: u16, height: u16) {
        let mut resize = Meta::new();
        resize.insert("type".to_string(), "resize".into());
        resize.insert("width".to_string(), width.into());
        resize.insert("height".to_string(), height.into());
        let _ = self.send_meta(resize).await;
    }

    async fn send_bytes(&self, data: Vec<u8>) -> bool {
        self.send_frame(FRAME_DATA, &data).await
    }

    async fn send_meta(&self, meta: Meta) -> bool {
        let payload = match serde_json::to_vec(&Value::Object(meta)) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        self.send_frame(FRAME_META, &payload).await
    }
}

/// Run a command string through the platform shell.
fn shell_command(command: &str) -> tokio::process::Command {
    #[cfg(unix)]
    {
        let mut shell = tokio::process::Command::new("sh");
        shell.arg("-c").arg(command);
        shell
    }
    #[cfg(not(unix))]
    {
        let mut shell = tokio::process::Command::new("cmd");
        shell.arg("/C").arg(command);
        shell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        data: StdMutex<Vec<Vec<u8>>>,
        metas: StdMutex<Vec<Meta>>,
        binary: StdMutex<Vec<Vec<u8>>>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl SessionConnector for Recorder {
        async fn on_data(&self, data: Vec<u8>) {
            self.data.lock().unwrap().push(data);
        }

        async fn on_meta(&self, meta: Meta) {
            self.metas.lock().unwrap().push(meta);
        }

        async fn on_binary_encoded_message(&self, payload: Vec<u8>) {
            self.binary.lock().unwrap().push(payload);
        }

        async fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(command: &str) -> Arc<AppSession> {
        Arc::new(AppSession::new(
            std::env::temp_dir(),
            command.to_string(),
            SessionId::from("S-test"),
            false,
        ))
    }

    async fn open_and_start(session: &Arc<AppSession>) -> Arc<Recorder> {
        let connector = Arc::new(Recorder::default());
        session.open(80, 24).await.unwrap();
        Arc::clone(session)
            .start(connector.clone() as Arc<dyn SessionConnector>)
            .await;
        connector
    }

    #[test]
    fn test_encode_frame() {
        let frame = AppSession::encode_frame(FRAME_DATA, b"hello");
        assert_eq!(frame, b"D\x00\x00\x00\x05hello");
        let empty = AppSession::encode_frame(FRAME_META, b"");
        assert_eq!(empty, b"M\x00\x00\x00\x00");
    }

    #[tokio::test]
    async fn test_ready_child_delivers_data_frames() {
        let session = session(
            r#"printf '__GANGLION__\n'; printf 'D\000\000\000\005hello'"#,
        );
        let connector = open_and_start(&session).await;

        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end");
        assert_eq!(connector.data.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), ProcessState::Closed);
    }

    #[tokio::test]
    async fn test_ready_token_may_follow_other_lines() {
        let session = session(
            r#"echo warming up; printf '__GANGLION__\n'; printf 'P\000\000\000\002ok'"#,
        );
        let connector = open_and_start(&session).await;

        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end");
        assert_eq!(connector.binary.lock().unwrap().as_slice(), &[b"ok".to_vec()]);
    }

    #[tokio::test]
    async fn test_handshake_gate_closes_silent_children() {
        // Ten lines, none of them the token, then the child lingers; the
        // budget (not EOF) must end the search.
        let session = session(
            "for i in 1 2 3 4 5 6 7 8 9 10; do echo line $i; done; sleep 5",
        );
        let connector = open_and_start(&session).await;

        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end");
        assert!(connector.data.lock().unwrap().is_empty());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), ProcessState::Closed);
    }

    #[tokio::test]
    async fn test_inbound_meta_reaches_the_connector() {
        let session = session(concat!(
            r#"printf '__GANGLION__\n'; "#,
            r#"payload='{"type":"open_url","url":"https://example.com","new_tab":true}'; "#,
            r#"printf 'M'; printf '\000\000\000'; printf "\\$(printf '%03o' ${#payload})"; "#,
            r#"printf '%s' "$payload""#,
        ));
        let connector = open_and_start(&session).await;

        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end");
        let metas = connector.metas.lock().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(
            metas[0].get("type").and_then(Value::as_str),
            Some("open_url")
        );
    }

    #[tokio::test]
    async fn test_send_bytes_frames_arrive_in_order() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let path = out.path().to_string_lossy().to_string();
        // 3 frames x 10 bytes each; head exits once it has them all.
        let session = session(&format!(
            r#"printf '__GANGLION__\n'; head -c 30 > '{path}'"#
        ));
        let _connector = open_and_start(&session).await;

        for payload in [b"aaaaa", b"bbbbb", b"ccccc"] {
            assert!(session.send_bytes(payload.to_vec()).await);
        }

        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .expect("session did not end");
        let written = std::fs::read(out.path()).unwrap();
        assert_eq!(
            written,
            b"D\x00\x00\x00\x05aaaaaD\x00\x00\x00\x05bbbbbD\x00\x00\x00\x05ccccc"
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session("printf '__GANGLION__\\n'; cat");
        let connector = open_and_start(&session).await;

        // cat ignores the quit meta, so close() only returns once the
        // close-all style timeout gives up on it; what matters here is that
        // a second close is safe and on_close never fires twice.
        let close_a = tokio::time::timeout(Duration::from_secs(2), session.close()).await;
        let close_b = tokio::time::timeout(Duration::from_secs(2), session.close()).await;
        let _ = (close_a, close_b);
        assert!(connector.closes.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_close_before_start_goes_straight_to_closed() {
        let session = session("cat");
        session.close().await;
        assert_eq!(session.state(), ProcessState::Closed);
        session.close().await;
        assert_eq!(session.state(), ProcessState::Closed);
    }

    #[tokio::test]
    async fn test_send_bytes_without_a_process_returns_false() {
        let session = session("true");
        assert!(!session.send_bytes(b"data".to_vec()).await);
    }
}
