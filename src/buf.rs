//! Chunked byte buffers.
//!
//! A `MultiBuffer` is an ordered run of `Bytes` chunks. Pipes move whole
//! multi-buffers between tasks; the frame reader pulls exact byte counts
//! back out of them.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pipe::PipeReader;

/// Sequence of byte chunks handed around as one unit.
pub type MultiBuffer = Vec<Bytes>;

/// Total number of bytes across all chunks.
pub fn len(mb: &[Bytes]) -> usize {
    mb.iter().map(Bytes::len).sum()
}

/// True when no chunk holds any byte.
pub fn is_empty(mb: &[Bytes]) -> bool {
    mb.iter().all(Bytes::is_empty)
}

/// Split off the first `size` bytes of `mb`.
///
/// Returns `(head, tail)`; chunks straddling the boundary are split without
/// copying.
pub fn split_size(mb: MultiBuffer, size: usize) -> (MultiBuffer, MultiBuffer) {
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut remaining = size;

    for mut chunk in mb {
        if chunk.is_empty() {
            continue;
        }
        if remaining == 0 {
            tail.push(chunk);
        } else if chunk.len() <= remaining {
            remaining -= chunk.len();
            head.push(chunk);
        } else {
            let first = chunk.split_to(remaining);
            remaining = 0;
            head.push(first);
            tail.push(chunk);
        }
    }

    (head, tail)
}

/// Buffered reader over a pipe that yields exact byte counts.
///
/// The demultiplexing loops use it to pull frame headers and payloads off the
/// physical link regardless of how the transport chunked them.
pub struct BufferedReader {
    reader: PipeReader,
    pending: VecDeque<Bytes>,
    buffered: usize,
    eof: bool,
}

impl BufferedReader {
    /// Wrap a pipe reader.
    pub fn new(reader: PipeReader) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
            buffered: 0,
            eof: false,
        }
    }

    /// Number of bytes already pulled from the pipe but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Pull at least `n` bytes into the local buffer.
    ///
    /// Returns `Ok(false)` when the pipe reached end-of-stream first.
    async fn fill(&mut self, n: usize) -> Result<bool> {
        while self.buffered < n {
            if self.eof {
                return Ok(false);
            }
            match self.reader.read_chunks().await? {
                Some(mb) => {
                    for chunk in mb.into_iter().filter(|c| !c.is_empty()) {
                        self.buffered += chunk.len();
                        self.pending.push_back(chunk);
                    }
                }
                None => self.eof = true,
            }
        }
        Ok(true)
    }

    /// Take exactly `n` buffered bytes, which must be available.
    fn take(&mut self, n: usize) -> MultiBuffer {
        let mut out = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut chunk) = self.pending.pop_front() else {
                break;
            };
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                out.push(chunk);
            } else {
                out.push(chunk.split_to(remaining));
                self.pending.push_front(chunk);
                remaining = 0;
            }
        }
        self.buffered -= n - remaining;
        out
    }

    /// Read exactly `n` bytes as chunks.
    ///
    /// Hitting end-of-stream before `n` bytes is `Error::UnexpectedEof`.
    async fn read_exact_chunks(&mut self, n: usize) -> Result<MultiBuffer> {
        if !self.fill(n).await? {
            return Err(Error::UnexpectedEof);
        }
        Ok(self.take(n))
    }

    /// Read exactly `n` bytes into one contiguous buffer.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let mut chunks = self.read_exact_chunks(n).await?;
        if chunks.len() == 1 {
            return Ok(chunks.remove(0));
        }
        let mut out = BytesMut::with_capacity(n);
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Read a big-endian `u16`.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream before the first byte, so
    /// callers can tell a finished stream apart from a truncated one.
    pub async fn read_u16_or_eof(&mut self) -> Result<Option<u16>> {
        if !self.fill(1).await? {
            return Ok(None);
        }
        let b = self.read_exact(2).await?;
        Ok(Some(u16::from_be_bytes([b[0], b[1]])))
    }

    /// Read a big-endian `u16`.
    pub async fn read_u16(&mut self) -> Result<u16> {
        self.read_u16_or_eof()
            .await?
            .ok_or(Error::UnexpectedEof)
    }

    /// Discard exactly `n` bytes.
    pub async fn skip(&mut self, n: usize) -> Result<()> {
        self.read_exact_chunks(n).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{self, PipeOptions};

    #[test]
    fn test_split_size() {
        let mb = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];
        let (head, tail) = split_size(mb, 7);
        assert_eq!(len(&head), 7);
        assert_eq!(head[1], Bytes::from_static(b"wo"));
        assert_eq!(tail, vec![Bytes::from_static(b"rld")]);
    }

    #[test]
    fn test_split_size_exact_boundary() {
        let mb = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")];
        let (head, tail) = split_size(mb, 3);
        assert_eq!(head, vec![Bytes::from_static(b"abc")]);
        assert_eq!(tail, vec![Bytes::from_static(b"def")]);
    }

    #[test]
    fn test_is_empty() {
        assert!(is_empty(&[]));
        assert!(is_empty(&[Bytes::new()]));
        assert!(!is_empty(&[Bytes::from_static(b"x")]));
    }

    #[tokio::test]
    async fn test_buffered_reader_across_chunks() {
        let (reader, writer) = pipe::new(PipeOptions::unbounded());
        writer
            .write_chunks(vec![Bytes::from_static(&[0x00]), Bytes::from_static(&[0x05, b'a'])])
            .await
            .unwrap();
        writer
            .write_chunks(vec![Bytes::from_static(b"bcde")])
            .await
            .unwrap();
        writer.close();

        let mut reader = BufferedReader::new(reader);
        assert_eq!(reader.read_u16().await.unwrap(), 5);
        assert_eq!(reader.read_exact(5).await.unwrap(), Bytes::from_static(b"abcde"));
        assert_eq!(reader.read_u16_or_eof().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_buffered_reader_truncated() {
        let (reader, writer) = pipe::new(PipeOptions::unbounded());
        writer
            .write_chunks(vec![Bytes::from_static(b"ab")])
            .await
            .unwrap();
        writer.close();

        let mut reader = BufferedReader::new(reader);
        assert!(matches!(
            reader.read_exact(3).await,
            Err(Error::UnexpectedEof)
        ));
    }
}
