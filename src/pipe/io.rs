//! Bridge between byte-stream sockets and pipe links.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{new_links, Link, PipeOptions, PipeReader, PipeWriter};
use crate::error::{Error, Result};

/// Read size per socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Relay between `stream` and `link` until both directions finish.
///
/// Socket bytes are written into `link.writer`; chunks read from
/// `link.reader` are written to the socket. End-of-stream on either side is
/// forwarded as a close / write shutdown. The first failure interrupts the
/// link and is returned.
pub async fn pump<S>(stream: S, link: Link) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let result = tokio::try_join!(
        copy_to_pipe(&mut read_half, &link.writer),
        copy_from_pipe(&link.reader, &mut write_half),
    );

    if let Err(err) = &result {
        tracing::debug!("stream pump stopped: {}", err);
        link.interrupt(err.clone());
    }

    result.map(|_| ())
}

/// Spawn a [`pump`] for `stream` and return the link endpoint that speaks
/// for it: reading yields socket bytes, writing sends to the socket.
pub fn attach<S>(stream: S, options: PipeOptions) -> Link
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (local, remote) = new_links(options);
    tokio::spawn(pump(stream, remote));
    local
}

async fn copy_to_pipe<R>(reader: &mut R, writer: &PipeWriter) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let n = reader.read_buf(&mut buf).await.map_err(Error::from)?;
        if n == 0 {
            writer.close();
            return Ok(());
        }
        writer.write_chunks(vec![buf.freeze()]).await?;
    }
}

async fn copy_from_pipe<W>(reader: &PipeReader, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mb) = reader.read_chunks().await? {
        for chunk in mb {
            if let Err(err) = writer.write_all(&chunk).await {
                let err = Error::from(err);
                reader.interrupt(err.clone());
                return Err(err);
            }
        }
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pump_relays_both_ways() {
        let (socket, mut remote) = tokio::io::duplex(1024);
        let (local, inner) = new_links(PipeOptions::unbounded());

        let pump_task = tokio::spawn(pump(socket, inner));

        remote.write_all(b"from socket").await.unwrap();
        let mb = local.reader.read_chunks().await.unwrap().unwrap();
        assert_eq!(crate::buf::len(&mb), 11);

        local
            .writer
            .write_chunks(vec![Bytes::from("from link")])
            .await
            .unwrap();
        let mut buf = [0u8; 9];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from link");

        local.writer.close();
        drop(remote);
        pump_task.await.unwrap().unwrap();
        assert!(local.reader.read_chunks().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attach_interrupt_drops_socket() {
        let (socket, mut remote) = tokio::io::duplex(1024);
        let link = attach(socket, PipeOptions::unbounded());

        link.interrupt(Error::ConnectionClosed);
        let mut buf = Vec::new();
        let n = remote.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
