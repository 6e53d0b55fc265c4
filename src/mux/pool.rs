//! Pool of multiplexed client connections.

use std::future::Future;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::client::Client;
use super::frame::SessionId;
use crate::config::MuxConfig;
use crate::error::{Error, Result};
use crate::net::Destination;
use crate::pipe::{self, Link};

/// Opens physical connections to the mux server.
pub trait Dialer: Send + Sync + 'static {
    /// Byte stream carrying the frames.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a new connection.
    fn dial(&self) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// Spreads sessions over as few client connections as the strategy allows.
///
/// A session goes to the first connection with spare capacity; a new
/// connection is dialed only when every existing one is full.
pub struct ClientPool<D> {
    dialer: D,
    config: MuxConfig,
    clients: Mutex<Vec<Client>>,
    token: CancellationToken,
}

impl<D: Dialer> ClientPool<D> {
    /// Create an empty pool.
    pub fn new(dialer: D, config: MuxConfig) -> Self {
        Self {
            dialer,
            config,
            clients: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        }
    }

    /// Multiplex `local` towards `target` on some pooled connection.
    pub async fn dispatch(&self, target: Destination, local: Link) -> Result<SessionId> {
        if self.token.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let candidates: Vec<Client> = self
            .clients
            .lock()
            .iter()
            .filter(|c| !c.is_full())
            .cloned()
            .collect();
        for client in candidates {
            match client.dispatch(target.clone(), local.clone()) {
                Ok(id) => return Ok(id),
                Err(Error::Busy) | Err(Error::ConnectionClosed) => continue,
                Err(err) => return Err(err),
            }
        }

        let client = self.connect().await?;
        client.dispatch(target, local)
    }

    async fn connect(&self) -> Result<Client> {
        let stream = self.dialer.dial().await?;
        let link = pipe::attach(stream, self.config.session_pipe());
        let client = Client::new(link, &self.config);

        let mut clients = self.clients.lock();
        clients.push(client.clone());
        tracing::debug!("mux pool: dialed connection, {} open", clients.len());
        Ok(client)
    }

    /// Connections currently pooled.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Drop dead connections and close the ones that stayed empty past the
    /// idle timeout or retired after reaching their session quota.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|client| {
            if client.is_closed() {
                return false;
            }
            let stats = client.stats();
            if stats.active > 0 {
                return true;
            }
            let idle_expired = stats
                .idle_since
                .is_some_and(|since| now.duration_since(since) >= idle_timeout);
            if idle_expired || client.is_closing() {
                client.close();
                return false;
            }
            true
        });

        let removed = before - clients.len();
        if removed > 0 {
            tracing::debug!("mux pool: released {} connections", removed);
        }
    }

    /// Run [`ClientPool::cleanup`] every `cleanup_interval` until the pool
    /// is closed.
    pub async fn run_cleanup(&self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(self.config.cleanup_interval) => self.cleanup(),
            }
        }
    }

    /// Close every connection and refuse further sessions.
    pub fn close(&self) {
        self.token.cancel();
        for client in self.clients.lock().drain(..) {
            client.close();
        }
    }
}

impl<D> Drop for ClientPool<D> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
