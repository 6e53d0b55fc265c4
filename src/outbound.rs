//! Direct outbound: serve mux sessions by connecting to their targets.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mux::Dispatcher;
use crate::net::{Address, Destination};
use crate::pipe::{self, Link};

/// Largest datagram relayed in either direction.
const MAX_DATAGRAM: usize = 64 * 1024;

/// [`Dispatcher`] that dials every session's destination directly.
#[derive(Debug, Clone)]
pub struct DirectDispatcher {
    connect_timeout: Duration,
}

impl Default for DirectDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl DirectDispatcher {
    /// Create a dispatcher giving up on connects after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn resolve(&self, destination: &Destination) -> Result<SocketAddr> {
        if let Some(addr) = destination.socket_addr() {
            return Ok(addr);
        }
        let Address::Domain(name) = &destination.address else {
            return Err(Error::invalid_target(destination.to_string()));
        };
        tokio::net::lookup_host((name.as_str(), destination.port))
            .await?
            .next()
            .ok_or_else(|| Error::invalid_target(format!("{} did not resolve", name)))
    }

    async fn connect(&self, destination: &Destination) -> Result<TcpStream> {
        let addr = self.resolve(destination).await?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Dispatcher for DirectDispatcher {
    async fn handle_flow(
        &self,
        token: CancellationToken,
        destination: Destination,
        link: Link,
    ) -> Result<()> {
        let stream = tokio::select! {
            _ = token.cancelled() => return Err(Error::ConnectionClosed),
            stream = self.connect(&destination) => stream?,
        };
        tracing::debug!("direct: connected to {}", destination);

        tokio::select! {
            _ = token.cancelled() => Err(Error::ConnectionClosed),
            result = pipe::pump(stream, link) => result,
        }
    }

    async fn handle_packet_conn(
        &self,
        token: CancellationToken,
        destination: Destination,
        link: Link,
    ) -> Result<()> {
        let addr = self.resolve(&destination).await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        tracing::debug!("direct: udp association to {}", destination);

        let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::ConnectionClosed),
                outgoing = link.reader.read_chunks() => {
                    let Some(packets) = outgoing? else {
                        return Ok(());
                    };
                    for packet in packets {
                        socket.send(&packet).await?;
                    }
                }
                incoming = socket.recv_buf(&mut buf) => {
                    incoming?;
                    let packet = buf.split().freeze();
                    buf.reserve(MAX_DATAGRAM);
                    link.writer.write_chunks(vec![packet]).await?;
                }
            }
        }
    }
}
