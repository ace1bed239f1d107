//! Background thread shuttling bytes between raw file descriptors and the
//! async world.
//!
//! PTY master descriptors don't fit tokio's ownership model, so a dedicated
//! OS thread polls them with poll(2) and crosses the boundary through
//! thread-safe queues:
//!
//! ```text
//! Poller thread                       async side
//!   poll(fds, 1s) ── read ──► UnboundedSender ──► ReadQueue.recv()
//!   poll(fds, 1s) ◄─ write ── write queue ◄────── Poller::write().await
//! ```
//!
//! Reads are bounded (32 KiB) and delivered in kernel order; writes drain
//! from a per-fd FIFO, one completion signal per payload. A null chunk on a
//! read queue signals EOF or an fd error; deregistration is left to the
//! consumer. A self-pipe wakes the thread when registrations or writes
//! arrive mid-poll.

#![cfg(unix)]

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use tokio::sync::{mpsc, oneshot};

use crate::constants::{POLL_TIMEOUT_MS, READ_CHUNK_SIZE};

/// A chunk delivered on a read queue; `None` signals EOF or an fd error.
pub type ReadChunk = Option<Vec<u8>>;

/// The receiving side of a per-fd read queue.
pub type ReadQueue = mpsc::UnboundedReceiver<ReadChunk>;

/// Data in a write queue.
struct WriteEntry {
    data: Vec<u8>,
    position: usize,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct PollerState {
    read_queues: HashMap<RawFd, mpsc::UnboundedSender<ReadChunk>>,
    write_queues: HashMap<RawFd, VecDeque<WriteEntry>>,
}

struct PollerInner {
    state: Mutex<PollerState>,
    exit: AtomicBool,
    wake_pending: AtomicBool,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A thread which reads from file descriptors and posts the data to per-fd
/// queues.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("poller state poisoned");
        f.debug_struct("Poller")
            .field("read_fds", &state.read_queues.len())
            .field("write_fds", &state.write_queues.len())
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Create a poller.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake pipe cannot be created; without it the
    /// poller could never observe its exit promptly, so this is fatal.
    pub fn new() -> Result<Self> {
        let (wake_read, wake_write) = unistd::pipe().context("unable to create wake pipe")?;
        Ok(Self {
            inner: Arc::new(PollerInner {
                state: Mutex::new(PollerState::default()),
                exit: AtomicBool::new(false),
                wake_pending: AtomicBool::new(false),
                wake_read,
                wake_write,
                thread: Mutex::new(None),
            }),
        })
    }

    /// Start the poller thread.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("fd-poller".to_string())
            .spawn(move || run_loop(&inner))
            .expect("unable to spawn poller thread");
        *self.inner.thread.lock().expect("poller thread poisoned") = Some(handle);
    }

    /// Register a file descriptor and return the queue its chunks will be
    /// published on.
    pub fn add_file(&self, file_descriptor: RawFd) -> ReadQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock().expect("poller state poisoned");
            state.read_queues.insert(file_descriptor, sender);
        }
        self.notify();
        receiver
    }

    /// Deregister a file descriptor, forgetting all state for it.
    pub fn remove_file(&self, file_descriptor: RawFd) {
        {
            let mut state = self.inner.state.lock().expect("poller state poisoned");
            state.read_queues.remove(&file_descriptor);
            state.write_queues.remove(&file_descriptor);
        }
        self.notify();
    }

    /// Write data to a file descriptor, resolving once the entire payload
    /// has been drained to the kernel.
    ///
    /// Returns `false` if the poller went away before the write completed.
    pub async fn write(&self, file_descriptor: RawFd, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().expect("poller state poisoned");
            state
                .write_queues
                .entry(file_descriptor)
                .or_default()
                .push_back(WriteEntry {
                    data,
                    position: 0,
                    done: Some(done_tx),
                });
        }
        self.notify();
        done_rx.await.is_ok()
    }

    /// Exit and block until the thread has finished.
    ///
    /// All read queues receive a final null chunk.
    pub fn exit(&self) {
        {
            let state = self.inner.state.lock().expect("poller state poisoned");
            for queue in state.read_queues.values() {
                let _ = queue.send(None);
            }
        }
        self.inner.exit.store(true, Ordering::Release);
        self.notify();
        let handle = self
            .inner
            .thread
            .lock()
            .expect("poller thread poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let mut state = self.inner.state.lock().expect("poller state poisoned");
        state.read_queues.clear();
        state.write_queues.clear();
    }

    /// Wake the poller thread so it observes new registrations or writes.
    ///
    /// At most one wake byte is outstanding at a time, so the pipe can
    /// never fill however fast callers enqueue.
    fn notify(&self) {
        if !self.inner.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = unistd::write(self.inner.wake_write.as_fd(), &[0]);
        }
    }
}

/// The poller thread body.
fn run_loop(inner: &PollerInner) {
    let wake_fd = inner.wake_read.as_raw_fd();

    while !inner.exit.load(Ordering::Acquire) {
        // Snapshot the fds of interest; the lock must not be held across
        // poll or the async side would stall for up to the poll timeout.
        let mut poll_spec: Vec<(RawFd, PollFlags)> = {
            let state = inner.state.lock().expect("poller state poisoned");
            let mut spec: HashMap<RawFd, PollFlags> = state
                .read_queues
                .keys()
                .map(|&fd| (fd, PollFlags::POLLIN))
                .collect();
            for (&fd, queue) in &state.write_queues {
                if !queue.is_empty() {
                    *spec.entry(fd).or_insert(PollFlags::empty()) |= PollFlags::POLLOUT;
                }
            }
            spec.into_iter().collect()
        };
        poll_spec.push((wake_fd, PollFlags::POLLIN));

        let mut poll_fds: Vec<PollFd> = poll_spec
            .iter()
            // SAFETY: every fd here is either the wake pipe (owned by the
            // poller) or was registered by a session that keeps it open
            // until after remove_file.
            .map(|&(fd, events)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, events))
            .collect();

        match poll(&mut poll_fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(error) => {
                log::error!("poll failed: {error}");
                continue;
            }
        }

        let revents: Vec<(RawFd, PollFlags)> = poll_spec
            .iter()
            .zip(&poll_fds)
            .map(|(&(fd, _), poll_fd)| (fd, poll_fd.revents().unwrap_or_else(PollFlags::empty)))
            .collect();
        drop(poll_fds);

        let mut state = inner.state.lock().expect("poller state poisoned");
        for (fd, events) in revents {
            if fd == wake_fd {
                if events.intersects(PollFlags::POLLIN) {
                    inner.wake_pending.store(false, Ordering::Release);
                    let mut sink = [0u8; 64];
                    let _ = unistd::read(wake_fd, &mut sink);
                }
                continue;
            }

            let readable = events.intersects(
                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
            );
            if readable {
                if let Some(queue) = state.read_queues.get(&fd) {
                    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
                    match unistd::read(fd, &mut buffer) {
                        Ok(0) => {
                            let _ = queue.send(None);
                        }
                        Ok(count) => {
                            buffer.truncate(count);
                            let _ = queue.send(Some(buffer));
                        }
                        Err(Errno::EAGAIN) => {}
                        Err(_) => {
                            let _ = queue.send(None);
                        }
                    }
                }
            }

            if events.intersects(PollFlags::POLLOUT) {
                service_write(&mut state, fd);
            }
        }
    }
}

/// Attempt a single write from the head of an fd's write queue.
fn service_write(state: &mut PollerState, fd: RawFd) {
    let Some(write_queue) = state.write_queues.get_mut(&fd) else {
        return;
    };
    let mut failed = false;
    let mut complete = false;
    if let Some(entry) = write_queue.front_mut() {
        // SAFETY: the fd was registered by a session that keeps it open
        // until after remove_file.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match unistd::write(borrowed, &entry.data[entry.position..]) {
            Ok(count) => {
                entry.position += count;
                complete = entry.position >= entry.data.len();
            }
            Err(Errno::EAGAIN) => {}
            Err(_) => failed = true,
        }
    }
    if complete {
        if let Some(mut entry) = write_queue.pop_front() {
            if let Some(done) = entry.done.take() {
                let _ = done.send(());
            }
        }
    }
    if failed {
        // A write error poisons the fd; surface it on the read queue and
        // leave teardown to the consumer.
        if let Some(queue) = state.read_queues.get(&fd) {
            let _ = queue.send(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_poller() -> Poller {
        let poller = Poller::new().unwrap();
        poller.start();
        poller
    }

    async fn recv_chunk(queue: &mut ReadQueue) -> ReadChunk {
        tokio::time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .expect("timed out waiting for chunk")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_write_and_read_through_a_pipe() {
        let poller = test_poller();
        let (read_end, write_end) = unistd::pipe().unwrap();

        let mut queue = poller.add_file(read_end.as_raw_fd());
        assert!(poller.write(write_end.as_raw_fd(), b"hello".to_vec()).await);

        let chunk = recv_chunk(&mut queue).await.unwrap();
        assert_eq!(chunk, b"hello");
        poller.exit();
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_submission_order() {
        let poller = test_poller();
        let (read_end, write_end) = unistd::pipe().unwrap();
        let mut queue = poller.add_file(read_end.as_raw_fd());

        for index in 0..10u8 {
            assert!(poller.write(write_end.as_raw_fd(), vec![index; 16]).await);
        }

        let mut received = Vec::new();
        while received.len() < 160 {
            received.extend(recv_chunk(&mut queue).await.unwrap());
        }
        let expected: Vec<u8> = (0..10u8).flat_map(|index| vec![index; 16]).collect();
        assert_eq!(received, expected);
        poller.exit();
    }

    #[tokio::test]
    async fn test_large_write_drains_with_cursor() {
        let poller = test_poller();
        let (read_end, write_end) = unistd::pipe().unwrap();
        let mut queue = poller.add_file(read_end.as_raw_fd());

        // Larger than any pipe buffer, forcing partial writes.
        let payload: Vec<u8> = (0..256 * 1024).map(|index| (index % 251) as u8).collect();
        let expected = payload.clone();

        let writer = {
            let poller = poller.clone();
            let fd = write_end.as_raw_fd();
            tokio::spawn(async move { poller.write(fd, payload).await })
        };

        let mut received = Vec::new();
        while received.len() < expected.len() {
            received.extend(recv_chunk(&mut queue).await.unwrap());
        }
        assert_eq!(received, expected);
        assert!(writer.await.unwrap());
        poller.exit();
    }

    #[tokio::test]
    async fn test_eof_delivers_null_chunk() {
        let poller = test_poller();
        let (read_end, write_end) = unistd::pipe().unwrap();
        let mut queue = poller.add_file(read_end.as_raw_fd());

        assert!(poller.write(write_end.as_raw_fd(), b"bye".to_vec()).await);
        drop(write_end);

        assert_eq!(recv_chunk(&mut queue).await.unwrap(), b"bye");
        assert_eq!(recv_chunk(&mut queue).await, None);
        poller.exit();
    }

    #[tokio::test]
    async fn test_undrained_queue_does_not_stall_other_fds() {
        let poller = test_poller();
        let (stalled_read, stalled_write) = unistd::pipe().unwrap();
        let (live_read, live_write) = unistd::pipe().unwrap();

        // The stalled queue is registered but never drained.
        let _stalled_queue = poller.add_file(stalled_read.as_raw_fd());
        let mut live_queue = poller.add_file(live_read.as_raw_fd());

        for _ in 0..50 {
            assert!(poller.write(stalled_write.as_raw_fd(), vec![1; 64]).await);
            assert!(poller.write(live_write.as_raw_fd(), vec![2; 64]).await);
        }

        let mut received = 0;
        while received < 50 * 64 {
            received += recv_chunk(&mut live_queue).await.unwrap().len();
        }
        poller.exit();
    }

    #[tokio::test]
    async fn test_exit_posts_null_to_all_queues() {
        let poller = test_poller();
        let (read_end, _write_end) = unistd::pipe().unwrap();
        let mut queue = poller.add_file(read_end.as_raw_fd());

        poller.exit();
        assert_eq!(queue.recv().await, Some(None));
    }

    #[tokio::test]
    async fn test_remove_file_forgets_state() {
        let poller = test_poller();
        let (read_end, write_end) = unistd::pipe().unwrap();
        let mut queue = poller.add_file(read_end.as_raw_fd());

        poller.remove_file(read_end.as_raw_fd());
        let _ = unistd::write(write_end.as_fd(), b"ignored");

        // Nothing may arrive once the fd is deregistered.
        let outcome =
            tokio::time::timeout(Duration::from_millis(1500), queue.recv()).await;
        match outcome {
            Err(_) | Ok(None) => {}
            Ok(Some(chunk)) => panic!("unexpected chunk after remove_file: {chunk:?}"),
        }
        poller.exit();
    }
}
