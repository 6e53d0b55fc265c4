//! Server side demultiplexor.
//!
//! The server reads frames from one physical link, creates a session for
//! every `New` frame and hands the session's internal link to a
//! [`Dispatcher`]. Whatever the handler writes back is framed by a response
//! writer onto the same physical link.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::frame::{self, FrameMetadata, SessionId, SessionStatus};
use super::session::EndFlags;
use super::writer::{self, MuxWriter, TransferType};
use crate::buf::{BufferedReader, MultiBuffer};
use crate::config::MuxConfig;
use crate::error::{Error, Result};
use crate::net::{Destination, Network};
use crate::pipe::{new_links, Link};

/// Handles the sessions a server accepts.
///
/// The handler owns its end of the session link: it reads what the client
/// sent from `link.reader` and writes replies to `link.writer`. Returning
/// `Ok` ends the reply direction cleanly; returning an error ends the session
/// with the error option. `token` is cancelled when the session is torn
/// down from the mux side.
pub trait Dispatcher: Send + Sync + 'static {
    /// Serve a TCP-like byte stream to `destination`.
    fn handle_flow(
        &self,
        token: CancellationToken,
        destination: Destination,
        link: Link,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Serve a UDP-like packet flow to `destination`; every chunk on the
    /// link is one datagram.
    fn handle_packet_conn(
        &self,
        token: CancellationToken,
        destination: Destination,
        link: Link,
    ) -> impl Future<Output = Result<()>> + Send;
}

struct ServerSession {
    id: SessionId,
    /// Mux end of the internal link: `reader` yields handler output,
    /// `writer` feeds handler input.
    link: Link,
    token: CancellationToken,
    end: EndFlags,
}

struct ServerInner<D> {
    link: Link,
    sessions: Mutex<HashMap<SessionId, Arc<ServerSession>>>,
    dispatcher: Arc<D>,
    config: MuxConfig,
    token: CancellationToken,
    total: AtomicU64,
}

/// Server end of a multiplexed connection.
pub struct Server<D> {
    inner: Arc<ServerInner<D>>,
}

impl<D> Clone for Server<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dispatcher> Server<D> {
    /// Create a server over `link`, the server's end of the physical
    /// connection.
    pub fn new(link: Link, dispatcher: Arc<D>, config: &MuxConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                link,
                sessions: Mutex::new(HashMap::new()),
                dispatcher,
                config: config.clone(),
                token: CancellationToken::new(),
                total: AtomicU64::new(0),
            }),
        }
    }

    /// Serve frames until the peer disconnects, a protocol error occurs or
    /// [`Server::shutdown`] is called.
    ///
    /// Every session still registered on return is interrupted. A clean
    /// end-of-stream or a shutdown returns `Ok`.
    pub async fn run(&self) -> Result<()> {
        let inner = &self.inner;
        let mut reader = BufferedReader::new(inner.link.reader.clone());

        let result = tokio::select! {
            _ = inner.token.cancelled() => Ok(()),
            result = inner.serve(&mut reader) => result,
        };

        let err = match &result {
            Ok(()) => Error::ConnectionClosed,
            Err(err) => {
                tracing::debug!("mux server stopped: {}", err);
                err.clone()
            }
        };
        inner.link.interrupt(err.clone());
        inner.interrupt_all(err);
        inner.token.cancel();
        result
    }

    /// Stop serving; `run` returns and all sessions are torn down.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }

    /// Sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Sessions accepted since the server started.
    pub fn total_sessions(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }
}

impl<D: Dispatcher> ServerInner<D> {
    async fn serve(self: &Arc<Self>, reader: &mut BufferedReader) -> Result<()> {
        while let Some(meta) = FrameMetadata::read_from(reader).await? {
            self.handle_frame(reader, meta).await?;
        }
        Ok(())
    }

    async fn handle_frame(
        self: &Arc<Self>,
        reader: &mut BufferedReader,
        meta: FrameMetadata,
    ) -> Result<()> {
        match meta.status {
            SessionStatus::New => self.handle_new(reader, meta).await,
            SessionStatus::Keep => self.handle_keep(reader, &meta).await,
            SessionStatus::End => self.handle_end(reader, &meta).await,
            SessionStatus::KeepAlive => frame::drain_payload(reader, &meta).await,
        }
    }

    fn lookup(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    fn remove_session(&self, session: &Arc<ServerSession>) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(&session.id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.id);
            tracing::trace!("session {}: removed", session.id);
        }
    }

    fn interrupt_all(&self, err: Error) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.link.interrupt(err.clone());
            session.token.cancel();
        }
    }

    async fn handle_new(
        self: &Arc<Self>,
        reader: &mut BufferedReader,
        meta: FrameMetadata,
    ) -> Result<()> {
        let target = meta
            .target
            .clone()
            .ok_or_else(|| Error::invalid_frame("new frame without target"))?;

        let (handler_link, mux_link) = new_links(self.config.session_pipe());
        let session = Arc::new(ServerSession {
            id: meta.session_id,
            link: mux_link,
            token: self.token.child_token(),
            end: EndFlags::default(),
        });

        let replaced = self
            .sessions
            .lock()
            .insert(session.id, Arc::clone(&session));
        if let Some(old) = replaced {
            tracing::debug!("session {}: replaced by new frame", old.id);
            old.link.interrupt(Error::ConnectionClosed);
            old.token.cancel();
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("session {}: new {}", session.id, target);

        tokio::spawn(Arc::clone(self).run_session(Arc::clone(&session), target, handler_link));

        if meta.has_data() {
            let payload = frame::read_payload(reader).await?;
            self.deliver(&session, payload).await;
        }
        Ok(())
    }

    async fn handle_keep(
        self: &Arc<Self>,
        reader: &mut BufferedReader,
        meta: &FrameMetadata,
    ) -> Result<()> {
        if !meta.has_data() {
            return Ok(());
        }
        let payload = frame::read_payload(reader).await?;
        if let Some(session) = self.lookup(meta.session_id) {
            self.deliver(&session, payload).await;
        }
        Ok(())
    }

    async fn handle_end(
        self: &Arc<Self>,
        reader: &mut BufferedReader,
        meta: &FrameMetadata,
    ) -> Result<()> {
        let session = self.lookup(meta.session_id);
        if meta.has_data() {
            let payload = frame::read_payload(reader).await?;
            if let Some(session) = &session {
                self.deliver(session, payload).await;
            }
        }

        let Some(session) = session else {
            return Ok(());
        };
        if meta.has_error() {
            tracing::debug!("session {}: ended with error by peer", session.id);
            session.end.mark_peer_errored();
            session.link.interrupt(Error::PeerEnded(session.id));
            session.token.cancel();
            self.remove_session(&session);
        } else {
            session.link.writer.close();
        }
        Ok(())
    }

    async fn deliver(self: &Arc<Self>, session: &Arc<ServerSession>, payload: MultiBuffer) {
        if let Err(err) = session.link.writer.write_chunks(payload).await {
            self.on_session_error(session, err).await;
        }
    }

    /// Tear a session down after a failure on this side.
    ///
    /// Sends `End` with the error option unless either side already ended
    /// the session; the session is removed in every case.
    async fn on_session_error(&self, session: &Arc<ServerSession>, err: Error) {
        if session.end.claim_error_notify() {
            tracing::debug!("session {}: {}", session.id, err);
            if let Err(e) = writer::write_end_frame(&self.link.writer, session.id, true).await {
                tracing::trace!("session {}: end frame not written: {}", session.id, e);
            }
        }
        session.link.interrupt(err);
        session.token.cancel();
        self.remove_session(session);
    }

    async fn run_session(
        self: Arc<Self>,
        session: Arc<ServerSession>,
        target: Destination,
        handler_link: Link,
    ) {
        let transfer_type = match target.network {
            Network::Tcp => TransferType::Stream,
            Network::Udp => TransferType::Packet,
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let token = session.token.clone();
        let handler = async move {
            let result = match target.network {
                Network::Tcp => {
                    dispatcher
                        .handle_flow(token, target, handler_link.clone())
                        .await
                }
                Network::Udp => {
                    dispatcher
                        .handle_packet_conn(token, target, handler_link.clone())
                        .await
                }
            };
            match &result {
                Ok(()) => handler_link.writer.close(),
                Err(err) => handler_link.interrupt(err.clone()),
            }
            result
        };

        let (handled, ()) = tokio::join!(handler, self.forward_response(&session, transfer_type));
        if let Err(err) = handled {
            self.on_session_error(&session, err).await;
        }
        self.remove_session(&session);
        tracing::debug!("session {}: finished", session.id);
    }

    /// Frame the handler's output onto the physical link.
    async fn forward_response(&self, session: &Arc<ServerSession>, transfer_type: TransferType) {
        let mut writer = MuxWriter::response(session.id, self.link.writer.clone(), transfer_type);
        match copy_response(session, &mut writer).await {
            Ok(()) => {
                if session.end.claim_notify() {
                    writer.send_session_status_end().await;
                }
            }
            Err(err) => self.on_session_error(session, err).await,
        }
    }
}

async fn copy_response(session: &ServerSession, writer: &mut MuxWriter) -> Result<()> {
    while let Some(mb) = session.link.reader.read_chunks().await? {
        writer.write_multi_buffer(mb).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::frame::SessionOption;
    use crate::net::Address;
    use crate::pipe::PipeOptions;
    use bytes::{Bytes, BytesMut};
    use std::time::Duration;

    /// Echoes every chunk back until the input ends.
    struct Echo;

    impl Dispatcher for Echo {
        async fn handle_flow(
            &self,
            _token: CancellationToken,
            _destination: Destination,
            link: Link,
        ) -> Result<()> {
            while let Some(mb) = link.reader.read_chunks().await? {
                link.writer.write_chunks(mb).await?;
            }
            Ok(())
        }

        async fn handle_packet_conn(
            &self,
            token: CancellationToken,
            destination: Destination,
            link: Link,
        ) -> Result<()> {
            self.handle_flow(token, destination, link).await
        }
    }

    /// Refuses every session.
    struct Refuse;

    impl Dispatcher for Refuse {
        async fn handle_flow(
            &self,
            _token: CancellationToken,
            destination: Destination,
            _link: Link,
        ) -> Result<()> {
            Err(Error::handler(format!("refused {}", destination)))
        }

        async fn handle_packet_conn(
            &self,
            token: CancellationToken,
            destination: Destination,
            link: Link,
        ) -> Result<()> {
            self.handle_flow(token, destination, link).await
        }
    }

    /// Parks until cancelled, then reports how the link looked.
    struct Park {
        seen: tokio::sync::mpsc::UnboundedSender<Result<Option<MultiBuffer>>>,
    }

    impl Dispatcher for Park {
        async fn handle_flow(
            &self,
            token: CancellationToken,
            _destination: Destination,
            link: Link,
        ) -> Result<()> {
            token.cancelled().await;
            let _ = self.seen.send(link.reader.read_chunks().await);
            Ok(())
        }

        async fn handle_packet_conn(
            &self,
            token: CancellationToken,
            destination: Destination,
            link: Link,
        ) -> Result<()> {
            self.handle_flow(token, destination, link).await
        }
    }

    /// Reports every packet batch handed to the handler.
    struct Record {
        packets: tokio::sync::mpsc::UnboundedSender<MultiBuffer>,
    }

    impl Dispatcher for Record {
        async fn handle_flow(
            &self,
            _token: CancellationToken,
            _destination: Destination,
            _link: Link,
        ) -> Result<()> {
            Ok(())
        }

        async fn handle_packet_conn(
            &self,
            _token: CancellationToken,
            _destination: Destination,
            link: Link,
        ) -> Result<()> {
            while let Some(mb) = link.reader.read_chunks().await? {
                let _ = self.packets.send(mb);
            }
            Ok(())
        }
    }

    struct Peer {
        reader: BufferedReader,
        link: Link,
    }

    impl Peer {
        async fn next_frame(&mut self) -> (FrameMetadata, Bytes) {
            let meta = FrameMetadata::read_from(&mut self.reader)
                .await
                .unwrap()
                .unwrap();
            let mut payload = BytesMut::new();
            if meta.has_data() {
                for chunk in frame::read_payload(&mut self.reader).await.unwrap() {
                    payload.extend_from_slice(&chunk);
                }
            }
            (meta, payload.freeze())
        }

        async fn send(&self, mut meta: FrameMetadata, payload: Option<&'static [u8]>) {
            let mut buf = BytesMut::new();
            if payload.is_some() {
                meta.option.set(SessionOption::DATA);
            }
            meta.write_to(&mut buf).unwrap();
            if let Some(payload) = payload {
                buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            self.link.writer.write_chunks(vec![buf.freeze()]).await.unwrap();
        }

        async fn send_error_end(&self, id: SessionId) {
            let mut meta = FrameMetadata::new(id, SessionStatus::End);
            meta.option.set(SessionOption::ERROR);
            self.send(meta, None).await;
        }

        /// True when nothing arrives within a short grace period.
        async fn is_quiet(&self) -> bool {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.reader.buffered() + self.link.reader.buffered() == 0
        }
    }

    fn start<D: Dispatcher>(
        dispatcher: D,
    ) -> (Server<D>, Peer, tokio::task::JoinHandle<Result<()>>) {
        let (server_side, peer_side) = new_links(PipeOptions::unbounded());
        let server = Server::new(server_side, Arc::new(dispatcher), &MuxConfig::default());
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let peer = Peer {
            reader: BufferedReader::new(peer_side.reader.clone()),
            link: peer_side,
        };
        (server, peer, handle)
    }

    fn target() -> Destination {
        Destination::tcp(Address::parse("1.2.3.4"), 80)
    }

    #[tokio::test]
    async fn test_echo_session_lifecycle() {
        let (server, mut peer, _handle) = start(Echo);

        peer.send(FrameMetadata::new_session(3, target()), Some(b"GET / "))
            .await;
        let (meta, payload) = peer.next_frame().await;
        assert_eq!((meta.session_id, meta.status), (3, SessionStatus::Keep));
        assert!(meta.target.is_none());
        assert_eq!(payload, Bytes::from("GET / "));
        assert_eq!(server.session_count(), 1);

        peer.send(FrameMetadata::new(3, SessionStatus::Keep), Some(b"more"))
            .await;
        let (_, payload) = peer.next_frame().await;
        assert_eq!(payload, Bytes::from("more"));

        peer.send(FrameMetadata::new(3, SessionStatus::End), None).await;
        let (meta, _) = peer.next_frame().await;
        assert_eq!((meta.status, meta.has_error()), (SessionStatus::End, false));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.total_sessions(), 1);
    }

    #[tokio::test]
    async fn test_packet_boundaries_preserved() {
        let (_server, mut peer, _handle) = start(Echo);
        let dest = Destination::udp(Address::parse("8.8.8.8"), 53);

        peer.send(FrameMetadata::new_session(1, dest), Some(b"q1")).await;
        peer.send(FrameMetadata::new(1, SessionStatus::Keep), Some(b"q22"))
            .await;

        let (_, first) = peer.next_frame().await;
        let (_, second) = peer.next_frame().await;
        assert_eq!(first, Bytes::from("q1"));
        assert_eq!(second, Bytes::from("q22"));
    }

    #[tokio::test]
    async fn test_packet_split_across_reads_arrives_whole() {
        let (tx, mut packets) = tokio::sync::mpsc::unbounded_channel();
        let (_server, peer, _handle) = start(Record { packets: tx });
        let dest = Destination::udp(Address::parse("8.8.8.8"), 53);

        let mut meta = FrameMetadata::new_session(1, dest);
        meta.option.set(SessionOption::DATA);
        let mut head = BytesMut::new();
        meta.write_to(&mut head).unwrap();
        head.extend_from_slice(&4u16.to_be_bytes());
        head.extend_from_slice(b"ab");
        peer.link.writer.write_chunks(vec![head.freeze()]).await.unwrap();
        peer.link
            .writer
            .write_chunks(vec![Bytes::from_static(b"cd")])
            .await
            .unwrap();

        let mb = packets.recv().await.unwrap();
        assert_eq!(mb, vec![Bytes::from("abcd")]);
    }

    #[tokio::test]
    async fn test_handler_failure_sends_one_error_end() {
        let (server, mut peer, _handle) = start(Refuse);

        peer.send(FrameMetadata::new_session(9, target()), None).await;
        let (meta, _) = peer.next_frame().await;
        assert_eq!(meta.session_id, 9);
        assert_eq!((meta.status, meta.has_error()), (SessionStatus::End, true));

        assert!(peer.is_quiet().await);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_error_end_interrupts_handler() {
        let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let (server, peer, _handle) = start(Park { seen: tx });

        peer.send(FrameMetadata::new_session(2, target()), Some(b"data"))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.session_count(), 1);

        peer.send_error_end(2).await;
        let observed = seen.recv().await.unwrap();
        assert!(matches!(observed, Err(Error::PeerEnded(2))));

        assert!(peer.is_quiet().await);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_error_notification_is_idempotent() {
        let (tx, _seen) = tokio::sync::mpsc::unbounded_channel();
        let (server, mut peer, _handle) = start(Park { seen: tx });

        peer.send(FrameMetadata::new_session(4, target()), None).await;
        peer.send(FrameMetadata::new_session(5, target()), None).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = server.inner.lookup(4).unwrap();
        server.inner.on_session_error(&first, Error::handler("x")).await;
        server.inner.on_session_error(&first, Error::handler("y")).await;

        let (meta, _) = peer.next_frame().await;
        assert_eq!((meta.session_id, meta.has_error()), (4, true));

        // Peer already reported an error end: nothing goes back.
        let second = server.inner.lookup(5).unwrap();
        second.end.mark_peer_errored();
        server.inner.on_session_error(&second, Error::handler("z")).await;

        assert!(peer.is_quiet().await);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_frames_are_drained() {
        let (server, mut peer, _handle) = start(Echo);

        peer.send(FrameMetadata::new(40, SessionStatus::Keep), Some(b"stray"))
            .await;
        peer.send(FrameMetadata::new(41, SessionStatus::End), Some(b"late"))
            .await;
        peer.send(FrameMetadata::new(0, SessionStatus::KeepAlive), Some(b"ka"))
            .await;
        peer.send(FrameMetadata::new_session(1, target()), Some(b"ok"))
            .await;

        let (meta, payload) = peer.next_frame().await;
        assert_eq!(meta.session_id, 1);
        assert_eq!(payload, Bytes::from("ok"));
        assert_eq!(server.total_sessions(), 1);
    }

    #[tokio::test]
    async fn test_unknown_status_stops_run() {
        let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let (_server, peer, handle) = start(Park { seen: tx });

        peer.send(FrameMetadata::new_session(1, target()), None).await;
        peer.link
            .writer
            .write_chunks(vec![Bytes::from_static(&[0x00, 0x04, 0x00, 0x01, 0x07, 0x00])])
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::UnknownStatus(0x07))));
        assert!(matches!(seen.recv().await.unwrap(), Err(Error::UnknownStatus(0x07))));
    }

    #[tokio::test]
    async fn test_peer_disconnect_interrupts_sessions() {
        let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let (server, peer, handle) = start(Park { seen: tx });

        peer.send(FrameMetadata::new_session(1, target()), None).await;
        peer.link.writer.close();

        assert!(handle.await.unwrap().is_ok());
        assert!(matches!(seen.recv().await.unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let (server, _peer, handle) = start(Echo);
        server.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }
}
