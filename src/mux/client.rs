//! Client side multiplexor.
//!
//! A `Client` owns one physical link. Every local flow handed to
//! [`Client::dispatch`] becomes a session with its own outbound copy loop
//! (`merge`); one shared demultiplexing loop (`split`) routes the peer's
//! frames back to the owning session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{self, FrameMetadata, SessionId, SessionStatus};
use super::session::{EndFlags, ErrorSlot, Latch};
use super::writer::{self, MuxWriter, TransferType};
use crate::buf::BufferedReader;
use crate::config::{ClientStrategy, MuxConfig};
use crate::error::{Error, Result};
use crate::net::{Destination, Network};
use crate::pipe::{Link, PipeReader, PipeWriter};

/// A local flow multiplexed onto the client's connection.
struct ClientSession {
    id: SessionId,
    /// Feeds the local consumer with data from the peer
    output: PipeWriter,
    errors: ErrorSlot,
    outbound_done: Latch,
    inbound_done: Latch,
    end: EndFlags,
}

/// Session table of one client connection.
#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Arc<ClientSession>>,
    /// Sessions ever created on this connection
    count: u64,
    last_id: SessionId,
    empty_since: Option<Instant>,
    closed: bool,
}

impl SessionTable {
    fn next_id(&mut self) -> Option<SessionId> {
        for _ in 0..=u16::MAX as u32 {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.sessions.contains_key(&self.last_id) {
                return Some(self.last_id);
            }
        }
        None
    }

    fn add_session(&mut self, session: Arc<ClientSession>) {
        self.count += 1;
        self.empty_since = None;
        self.sessions.insert(session.id, session);
    }

    fn remove_session(&mut self, id: SessionId) -> bool {
        if self.sessions.remove(&id).is_none() {
            return false;
        }
        if self.sessions.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        true
    }

    fn is_closing(&self, strategy: &ClientStrategy) -> bool {
        self.closed
            || (strategy.max_connection > 0 && self.count >= strategy.max_connection as u64)
    }

    fn is_full(&self, strategy: &ClientStrategy) -> bool {
        self.is_closing(strategy)
            || (strategy.max_concurrency > 0
                && self.sessions.len() >= strategy.max_concurrency as usize)
    }
}

/// Session counters of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    /// Sessions currently in the table
    pub active: usize,
    /// Sessions ever created
    pub total: u64,
    /// When the table last became empty, if it is empty now
    pub idle_since: Option<Instant>,
}

struct ClientInner {
    link: Link,
    table: Mutex<SessionTable>,
    strategy: ClientStrategy,
    first_payload_timeout: Duration,
    done: CancellationToken,
}

/// Client end of a multiplexed connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start multiplexing over `link`, the client's end of the physical
    /// connection.
    ///
    /// Spawns the demultiplexing loop, and the keep-alive loop when
    /// configured, on the current tokio runtime.
    pub fn new(link: Link, config: &MuxConfig) -> Self {
        let inner = Arc::new(ClientInner {
            link,
            table: Mutex::new(SessionTable {
                empty_since: Some(Instant::now()),
                ..SessionTable::default()
            }),
            strategy: config.strategy,
            first_payload_timeout: config.first_payload_timeout,
            done: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).split());
        if let Some(interval) = config.keep_alive_interval {
            tokio::spawn(Arc::clone(&inner).keep_alive(interval));
        }

        Self { inner }
    }

    /// Multiplex the local flow `local` towards `target`.
    ///
    /// `local.reader` is what the application sends; replies are written to
    /// `local.writer`. Fails with `Error::Busy` when the connection has no
    /// spare capacity and `Error::ConnectionClosed` once it is shut down.
    pub fn dispatch(&self, target: Destination, local: Link) -> Result<SessionId> {
        let (errors, error_rx) = ErrorSlot::new();
        let session = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return Err(Error::ConnectionClosed);
            }
            if table.is_full(&self.inner.strategy) {
                return Err(Error::Busy);
            }
            let id = table.next_id().ok_or(Error::Busy)?;
            let session = Arc::new(ClientSession {
                id,
                output: local.writer.clone(),
                errors,
                outbound_done: Latch::default(),
                inbound_done: Latch::default(),
                end: EndFlags::default(),
            });
            table.add_session(Arc::clone(&session));
            session
        };

        let id = session.id;
        tracing::debug!("session {}: dispatch to {}", id, target);
        tokio::spawn(Arc::clone(&self.inner).run_session(session, error_rx, target, local));
        Ok(id)
    }

    /// True once the connection has originated `max_connection` sessions or
    /// has been closed: it must not take new sessions any more.
    pub fn is_closing(&self) -> bool {
        self.inner.table.lock().is_closing(&self.inner.strategy)
    }

    /// True when no session can be added right now.
    pub fn is_full(&self) -> bool {
        self.inner.table.lock().is_full(&self.inner.strategy)
    }

    /// True once the demultiplexing loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Wait until the demultiplexing loop has stopped.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }

    /// Session counters.
    pub fn stats(&self) -> ClientStats {
        let table = self.inner.table.lock();
        ClientStats {
            active: table.sessions.len(),
            total: table.count,
            idle_since: table.empty_since,
        }
    }

    /// Shut the physical link down; every session observes an error.
    pub fn close(&self) {
        self.inner.link.interrupt(Error::ConnectionClosed);
    }
}

impl ClientInner {
    fn remove_session(&self, id: SessionId) {
        if self.table.lock().remove_session(id) {
            tracing::trace!("session {}: removed", id);
        }
    }

    fn lookup(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.table.lock().sessions.get(&id).cloned()
    }

    /// Push `err` onto every active session and refuse new ones.
    fn interrupt(&self, err: Error) {
        let mut table = self.table.lock();
        table.closed = true;
        for session in table.sessions.values() {
            session.errors.report(err.clone());
        }
    }

    /// Drive one session until it fails or both directions finish.
    async fn run_session(
        self: Arc<Self>,
        session: Arc<ClientSession>,
        mut errors: mpsc::Receiver<Error>,
        target: Destination,
        local: Link,
    ) {
        let outcome = tokio::select! {
            Some(err) = errors.recv() => Err(err),
            _ = async {
                self.merge(&session, &target, &local.reader).await;
                session.inbound_done.wait().await;
            } => Ok(()),
        };

        self.remove_session(session.id);
        match outcome {
            Ok(()) => tracing::debug!("session {}: finished", session.id),
            Err(err) => {
                tracing::debug!("session {}: {}", session.id, err);
                // Connection-wide failures have no peer left to tell.
                if !err.is_connection_fatal() && session.end.claim_error_notify() {
                    let sent = writer::write_end_frame(&self.link.writer, session.id, true).await;
                    if let Err(e) = sent {
                        tracing::trace!("session {}: end frame not written: {}", session.id, e);
                    }
                }
                local.interrupt(err);
            }
        }
    }

    /// Copy the local flow into frames until end-of-stream or failure.
    async fn merge(&self, session: &ClientSession, target: &Destination, input: &PipeReader) {
        if !target.is_valid() {
            // Nothing was opened on the wire, so there is nobody to notify.
            session.end.claim_notify();
            session
                .errors
                .report(Error::invalid_target(target.to_string()));
            return;
        }

        let transfer_type = match target.network {
            Network::Tcp => TransferType::Stream,
            Network::Udp => TransferType::Packet,
        };
        let mut writer = MuxWriter::new(
            session.id,
            target.clone(),
            self.link.writer.clone(),
            transfer_type,
        );

        match self.forward(&mut writer, input).await {
            Ok(()) => {
                if session.end.claim_notify() {
                    writer.send_session_status_end().await;
                }
                session.outbound_done.mark();
            }
            Err(err) => {
                tracing::debug!("session {}: outbound failed: {}", session.id, err);
                if session.end.claim_error_notify() {
                    writer.set_error();
                    writer.send_session_status_end().await;
                }
                input.interrupt(err.clone());
                session.errors.report(err);
            }
        }
    }

    async fn forward(&self, writer: &mut MuxWriter, input: &PipeReader) -> Result<()> {
        match input.read_chunks_timeout(self.first_payload_timeout).await {
            Ok(Some(mb)) => writer.write_multi_buffer(mb).await?,
            Ok(None) => return writer.write_multi_buffer(Vec::new()).await,
            Err(err) if err.is_timeout() => writer.write_multi_buffer(Vec::new()).await?,
            Err(err) => return Err(err),
        }

        while let Some(mb) = input.read_chunks().await? {
            writer.write_multi_buffer(mb).await?;
        }
        Ok(())
    }

    /// The demultiplexing loop.
    async fn split(self: Arc<Self>) {
        let mut reader = BufferedReader::new(self.link.reader.clone());
        let err = match self.demux(&mut reader).await {
            Ok(()) => {
                tracing::debug!("mux connection closed by peer");
                Error::ConnectionClosed
            }
            Err(err) => {
                tracing::debug!("mux connection failed: {}", err);
                err
            }
        };

        self.link.interrupt(err.clone());
        self.interrupt(err);
        self.done.cancel();
    }

    async fn demux(&self, reader: &mut BufferedReader) -> Result<()> {
        while let Some(meta) = FrameMetadata::read_from(reader).await? {
            match meta.status {
                SessionStatus::KeepAlive => frame::drain_payload(reader, &meta).await?,
                SessionStatus::New => {
                    tracing::trace!("session {}: unexpected new frame", meta.session_id);
                    frame::drain_payload(reader, &meta).await?;
                }
                SessionStatus::Keep => self.handle_keep(reader, &meta).await?,
                SessionStatus::End => self.handle_end(reader, &meta).await?,
            }
        }
        Ok(())
    }

    /// Deliver the frame's payload to `session`, or drain it.
    async fn deliver(
        &self,
        reader: &mut BufferedReader,
        meta: &FrameMetadata,
        session: Option<&ClientSession>,
    ) -> Result<()> {
        if !meta.has_data() {
            return Ok(());
        }
        let payload = frame::read_payload(reader).await?;
        if let Some(session) = session {
            if let Err(err) = session.output.write_chunks(payload).await {
                session.errors.report(err);
            }
        }
        Ok(())
    }

    async fn handle_keep(&self, reader: &mut BufferedReader, meta: &FrameMetadata) -> Result<()> {
        let session = self.lookup(meta.session_id);
        self.deliver(reader, meta, session.as_deref()).await
    }

    async fn handle_end(&self, reader: &mut BufferedReader, meta: &FrameMetadata) -> Result<()> {
        let session = self.lookup(meta.session_id);
        self.deliver(reader, meta, session.as_deref()).await?;

        let Some(session) = session else {
            return Ok(());
        };
        if meta.has_error() {
            session.end.mark_peer_errored();
            session.errors.report(Error::PeerEnded(session.id));
            self.remove_session(session.id);
        } else {
            session.output.close();
            session.inbound_done.mark();
        }
        Ok(())
    }

    async fn keep_alive(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = writer::write_keep_alive(&self.link.writer).await {
                tracing::trace!("keep-alive stopped: {}", err);
                return;
            }
        }
    }
}
