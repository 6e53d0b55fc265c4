//! Bounded backpressure pipe.
//!
//! A pipe is a single in-flight chunk queue shared by a reader and a writer:
//!
//! ```text
//!   PipeWriter ──write_chunks──▶ [ buffered MultiBuffer ] ──read_chunks──▶ PipeReader
//!                                   │ Open │ Closed │ Errored │
//! ```
//!
//! Writes are accepted while the buffered byte count is at or below the
//! limit. Above it the pipe is full and a write either waits (`Block`) or is
//! dropped (`Discard`). A limit of zero is handoff mode: one pending write is
//! tolerated and the next waits for the reader.
//!
//! `close` is graceful (readers drain what is left, then see end-of-stream);
//! `interrupt` is a hard failure that discards buffered data and hands the
//! stored error to every subsequent operation.

mod io;
mod link;

pub use io::{attach, pump};
pub use link::{new_links, Link};

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::buf::{self, MultiBuffer};
use crate::error::{Error, Result};

/// What a blocking write does when the pipe is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait until a read frees capacity, or the pipe closes, is interrupted
    /// or the write deadline passes.
    Block,
    /// Drop the new data and report success. Used for loss tolerant traffic.
    Discard,
}

/// Construction options for a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Byte limit, `None` for unbounded
    pub limit: Option<usize>,
    /// Behaviour once the limit is exceeded
    pub overflow: OverflowPolicy,
}

impl PipeOptions {
    /// Unbounded pipe; writes never wait.
    pub const fn unbounded() -> Self {
        Self {
            limit: None,
            overflow: OverflowPolicy::Block,
        }
    }

    /// Pipe that is full once more than `limit` bytes are buffered.
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            overflow: OverflowPolicy::Block,
        }
    }

    /// Switch to silently dropping writes when full.
    pub const fn discard_overflow(mut self) -> Self {
        self.overflow = OverflowPolicy::Discard;
        self
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Pipe lifecycle state.
#[derive(Debug, Clone)]
enum State {
    Open,
    Closed,
    Errored(Error),
}

struct Inner {
    data: MultiBuffer,
    size: usize,
    state: State,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl Inner {
    fn expired(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Non-blocking read attempt. `None` means the caller has to wait.
    fn poll_read(&mut self, local_deadline: Option<Instant>) -> Option<Result<Option<MultiBuffer>>> {
        if let State::Errored(err) = &self.state {
            return Some(Err(err.clone()));
        }
        if Self::expired(self.read_deadline) || Self::expired(local_deadline) {
            return Some(Err(Error::Timeout));
        }
        if !self.data.is_empty() {
            self.size = 0;
            return Some(Ok(Some(std::mem::take(&mut self.data))));
        }
        match self.state {
            State::Closed => Some(Ok(None)),
            _ => None,
        }
    }

    /// Whether a write may append right now.
    fn writable(&self, limit: Option<usize>) -> Result<bool> {
        match &self.state {
            State::Errored(err) => return Err(err.clone()),
            State::Closed => return Err(Error::ClosedPipe),
            State::Open => {}
        }
        if Self::expired(self.write_deadline) {
            return Err(Error::Timeout);
        }
        Ok(limit.map_or(true, |limit| self.size <= limit))
    }

    fn push(&mut self, mb: MultiBuffer) {
        for chunk in mb.into_iter().filter(|c| !c.is_empty()) {
            self.size += chunk.len();
            self.data.push(chunk);
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
    options: PipeOptions,
}

impl Shared {
    fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, State::Open) {
                return;
            }
            inner.state = State::Closed;
        }
        self.wake_all();
    }

    fn interrupt(&self, err: Error) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, State::Errored(_)) {
                return;
            }
            inner.data.clear();
            inner.size = 0;
            inner.state = State::Errored(err);
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Wait for `notified`, giving up at `deadline`.
///
/// Both outcomes return to the caller's state check, which is where an
/// expired deadline turns into `Error::Timeout`.
async fn wait(notified: Pin<&mut Notified<'_>>, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = notified => {}
                _ = time::sleep_until(deadline) => {}
            }
        }
        None => notified.await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Create a new pipe and return its two ends.
pub fn new(options: PipeOptions) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            data: Vec::new(),
            size: 0,
            state: State::Open,
            read_deadline: None,
            write_deadline: None,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
        options,
    });

    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

/// Read end of a pipe.
///
/// Clones share the same queue; every chunk is delivered to exactly one
/// reader.
#[derive(Clone)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Read the next available chunks.
    ///
    /// Returns `Ok(None)` once the pipe is closed and drained, and the stored
    /// error once it is interrupted.
    pub async fn read_chunks(&self) -> Result<Option<MultiBuffer>> {
        self.read_until(None).await
    }

    /// Read with a bounded wait of `timeout`.
    ///
    /// Gives up with `Error::Timeout` when nothing arrives in time; buffered
    /// state is untouched by the timeout.
    pub async fn read_chunks_timeout(&self, timeout: Duration) -> Result<Option<MultiBuffer>> {
        self.read_until(Some(Instant::now() + timeout)).await
    }

    async fn read_until(&self, local_deadline: Option<Instant>) -> Result<Option<MultiBuffer>> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.shared.inner.lock();
                if let Some(result) = inner.poll_read(local_deadline) {
                    drop(inner);
                    self.shared.writable.notify_waiters();
                    return result;
                }
                earliest(inner.read_deadline, local_deadline)
            };

            wait(notified, deadline).await;
        }
    }

    /// Set or clear the read deadline. Pending reads observe the change.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.inner.lock().read_deadline = deadline;
        self.shared.readable.notify_waiters();
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.inner.lock().size
    }

    /// Gracefully close the pipe.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Hard-fail the pipe with `err`.
    pub fn interrupt(&self, err: Error) {
        self.shared.interrupt(err);
    }
}

/// Write end of a pipe.
///
/// Clones share the same queue. Each `write_chunks` call appends its chunks
/// atomically, so concurrent writers never interleave inside one call.
#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append `mb` to the pipe, taking ownership of the chunks.
    ///
    /// With the `Block` policy a full pipe makes this wait; with `Discard` the
    /// data is dropped and `Ok(())` returned.
    pub async fn write_chunks(&self, mb: MultiBuffer) -> Result<()> {
        if buf::is_empty(&mb) {
            return Ok(());
        }

        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.shared.inner.lock();
                if inner.writable(self.shared.options.limit)? {
                    inner.push(mb);
                    drop(inner);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
                if self.shared.options.overflow == OverflowPolicy::Discard {
                    tracing::trace!("pipe full, discarding {} bytes", buf::len(&mb));
                    return Ok(());
                }
                inner.write_deadline
            };

            wait(notified, deadline).await;
        }
    }

    /// Append `mb` without waiting.
    ///
    /// A full `Block` pipe rejects the write with `Error::BufferFull`; a full
    /// `Discard` pipe drops it.
    pub fn try_write_chunks(&self, mb: MultiBuffer) -> Result<()> {
        if buf::is_empty(&mb) {
            return Ok(());
        }
        {
            let mut inner = self.shared.inner.lock();
            if !inner.writable(self.shared.options.limit)? {
                return match self.shared.options.overflow {
                    OverflowPolicy::Discard => Ok(()),
                    OverflowPolicy::Block => Err(Error::BufferFull),
                };
            }
            inner.push(mb);
        }
        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Set or clear the write deadline. Pending writes observe the change.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.inner.lock().write_deadline = deadline;
        self.shared.writable.notify_waiters();
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.inner.lock().size
    }

    /// True once the pipe left the open state.
    pub fn is_closed(&self) -> bool {
        !matches!(self.shared.inner.lock().state, State::Open)
    }

    /// Gracefully close the pipe.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Hard-fail the pipe with `err`.
    pub fn interrupt(&self, err: Error) {
        self.shared.interrupt(err);
    }
}
