//! Per-session frame writer.

use bytes::{BufMut, BytesMut};

use super::frame::{FrameMetadata, SessionId, SessionOption, SessionStatus};
use crate::buf::{self, MultiBuffer};
use crate::error::{Error, Result};
use crate::net::Destination;
use crate::pipe::PipeWriter;

/// Largest payload carried by one stream frame.
pub const MAX_SEGMENT_SIZE: usize = 8 * 1024;

/// How a session's bytes map onto frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Continuous byte stream; frame boundaries carry no meaning.
    Stream,
    /// Discrete packets; one chunk per frame.
    Packet,
}

/// Turns a session's outbound chunks into frames on the shared connection.
///
/// The first frame of an initiator writer is `New` and carries the target;
/// a response writer starts with `Keep`.
pub struct MuxWriter {
    id: SessionId,
    target: Option<Destination>,
    output: PipeWriter,
    followup: bool,
    has_error: bool,
    transfer_type: TransferType,
}

impl MuxWriter {
    /// Writer for a session this side opens towards `target`.
    pub fn new(
        id: SessionId,
        target: Destination,
        output: PipeWriter,
        transfer_type: TransferType,
    ) -> Self {
        Self {
            id,
            target: Some(target),
            output,
            followup: false,
            has_error: false,
            transfer_type,
        }
    }

    /// Writer for a session the peer opened.
    pub fn response(id: SessionId, output: PipeWriter, transfer_type: TransferType) -> Self {
        Self {
            id,
            target: None,
            output,
            followup: true,
            has_error: false,
            transfer_type,
        }
    }

    /// Session id frames are written for.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Make the next `End` frame carry the ERROR option.
    pub fn set_error(&mut self) {
        self.has_error = true;
    }

    fn next_frame_meta(&mut self) -> FrameMetadata {
        if self.followup {
            return FrameMetadata::new(self.id, SessionStatus::Keep);
        }
        self.followup = true;
        match self.target.clone() {
            Some(target) => FrameMetadata::new_session(self.id, target),
            None => FrameMetadata::new(self.id, SessionStatus::Keep),
        }
    }

    async fn write_meta_only(&mut self) -> Result<()> {
        let meta = self.next_frame_meta();
        let mut frame = BytesMut::new();
        meta.write_to(&mut frame)?;
        self.output.write_chunks(vec![frame.freeze()]).await
    }

    async fn write_data(&mut self, payload: MultiBuffer) -> Result<()> {
        let len = buf::len(&payload);
        if len > u16::MAX as usize {
            return Err(Error::invalid_frame(format!("payload of {} bytes", len)));
        }

        let mut meta = self.next_frame_meta();
        meta.option.set(SessionOption::DATA);

        let mut header = BytesMut::new();
        meta.write_to(&mut header)?;
        header.put_u16(len as u16);

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(header.freeze());
        frame.extend(payload);
        self.output.write_chunks(frame).await
    }

    /// Frame and write `mb`.
    ///
    /// An empty `mb` produces a single metadata-only frame, which is how a
    /// session is opened before any payload is available.
    pub async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        if buf::is_empty(&mb) {
            return self.write_meta_only().await;
        }

        match self.transfer_type {
            TransferType::Stream => {
                let mut rest = mb;
                while !rest.is_empty() {
                    let (segment, tail) = buf::split_size(rest, MAX_SEGMENT_SIZE);
                    rest = tail;
                    self.write_data(segment).await?;
                }
            }
            TransferType::Packet => {
                for packet in mb.into_iter().filter(|p| !p.is_empty()) {
                    self.write_data(vec![packet]).await?;
                }
            }
        }
        Ok(())
    }

    /// Tell the peer this side is done with the session.
    ///
    /// Never fails; a dead connection is noticed by the demultiplexing loop.
    pub async fn send_session_status_end(&mut self) {
        if let Err(err) = write_end_frame(&self.output, self.id, self.has_error).await {
            tracing::trace!("session {}: end frame not written: {}", self.id, err);
        }
    }
}

/// Write a metadata-only `End` frame for `id`.
pub(crate) async fn write_end_frame(output: &PipeWriter, id: SessionId, error: bool) -> Result<()> {
    let mut meta = FrameMetadata::new(id, SessionStatus::End);
    if error {
        meta.option.set(SessionOption::ERROR);
    }
    let mut frame = BytesMut::new();
    meta.write_to(&mut frame)?;
    output.write_chunks(vec![frame.freeze()]).await
}

/// Write a `KeepAlive` frame.
pub(crate) async fn write_keep_alive(output: &PipeWriter) -> Result<()> {
    let mut frame = BytesMut::new();
    FrameMetadata::new(0, SessionStatus::KeepAlive).write_to(&mut frame)?;
    output.write_chunks(vec![frame.freeze()]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferedReader;
    use crate::mux::frame::read_payload;
    use crate::net::{Address, Network};
    use crate::pipe::{self, PipeOptions};
    use bytes::Bytes;

    async fn next_frame(reader: &mut BufferedReader) -> (FrameMetadata, Option<Bytes>) {
        let meta = FrameMetadata::read_from(reader).await.unwrap().unwrap();
        let payload = if meta.has_data() {
            let mb = read_payload(reader).await.unwrap();
            let mut out = BytesMut::new();
            for chunk in mb {
                out.extend_from_slice(&chunk);
            }
            Some(out.freeze())
        } else {
            None
        };
        (meta, payload)
    }

    fn target() -> Destination {
        Destination::tcp(Address::parse("1.2.3.4"), 80)
    }

    #[tokio::test]
    async fn test_empty_write_opens_session() {
        let (reader, output) = pipe::new(PipeOptions::unbounded());
        let mut writer = MuxWriter::new(5, target(), output, TransferType::Stream);
        writer.write_multi_buffer(Vec::new()).await.unwrap();
        writer.write_multi_buffer(Vec::new()).await.unwrap();

        let mut reader = BufferedReader::new(reader);
        let (first, payload) = next_frame(&mut reader).await;
        assert_eq!(first.status, SessionStatus::New);
        assert_eq!(first.target, Some(target()));
        assert!(payload.is_none());

        let (second, _) = next_frame(&mut reader).await;
        assert_eq!(second.status, SessionStatus::Keep);
        assert!(second.target.is_none());
    }

    #[tokio::test]
    async fn test_stream_segments() {
        let (reader, output) = pipe::new(PipeOptions::unbounded());
        let mut writer = MuxWriter::new(1, target(), output, TransferType::Stream);

        let data = vec![
            Bytes::from(vec![1u8; 5000]),
            Bytes::from(vec![2u8; 5000]),
            Bytes::from(vec![3u8; 7000]),
        ];
        writer.write_multi_buffer(data).await.unwrap();

        let mut reader = BufferedReader::new(reader);
        let mut sizes = Vec::new();
        let mut total = Vec::new();
        for i in 0..3 {
            let (meta, payload) = next_frame(&mut reader).await;
            let expected = if i == 0 { SessionStatus::New } else { SessionStatus::Keep };
            assert_eq!(meta.status, expected);
            let payload = payload.unwrap();
            sizes.push(payload.len());
            total.extend_from_slice(&payload);
        }
        assert_eq!(sizes, vec![MAX_SEGMENT_SIZE, MAX_SEGMENT_SIZE, 17000 - 2 * MAX_SEGMENT_SIZE]);
        assert_eq!(&total[4999..5001], &[1, 2]);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_packets_keep_boundaries() {
        let (reader, output) = pipe::new(PipeOptions::unbounded());
        let dest = Destination::udp(Address::parse("8.8.8.8"), 53);
        let mut writer = MuxWriter::new(9, dest.clone(), output, TransferType::Packet);

        writer
            .write_multi_buffer(vec![Bytes::from("one"), Bytes::from("three")])
            .await
            .unwrap();
        writer
            .write_multi_buffer(vec![Bytes::from("x")])
            .await
            .unwrap();

        let mut reader = BufferedReader::new(reader);
        let (a, pa) = next_frame(&mut reader).await;
        let (b, pb) = next_frame(&mut reader).await;
        let (c, pc) = next_frame(&mut reader).await;

        assert_eq!(a.status, SessionStatus::New);
        assert_eq!(a.target.as_ref().map(|t| t.network), Some(Network::Udp));
        assert_eq!(pa.unwrap(), Bytes::from("one"));
        assert_eq!(b.status, SessionStatus::Keep);
        assert_eq!(pb.unwrap(), Bytes::from("three"));
        assert_eq!(c.status, SessionStatus::Keep);
        assert_eq!(pc.unwrap(), Bytes::from("x"));
    }

    #[tokio::test]
    async fn test_response_writer_starts_with_keep() {
        let (reader, output) = pipe::new(PipeOptions::unbounded());
        let mut writer = MuxWriter::response(4, output, TransferType::Stream);
        writer
            .write_multi_buffer(vec![Bytes::from("reply")])
            .await
            .unwrap();

        let mut reader = BufferedReader::new(reader);
        let (meta, payload) = next_frame(&mut reader).await;
        assert_eq!(meta.status, SessionStatus::Keep);
        assert_eq!(meta.session_id, 4);
        assert_eq!(payload.unwrap(), Bytes::from("reply"));
    }

    #[tokio::test]
    async fn test_end_frame_error_flag() {
        let (reader, output) = pipe::new(PipeOptions::unbounded());
        let mut clean = MuxWriter::response(1, output.clone(), TransferType::Stream);
        let mut failed = MuxWriter::response(2, output, TransferType::Stream);
        failed.set_error();

        clean.send_session_status_end().await;
        failed.send_session_status_end().await;

        let mut reader = BufferedReader::new(reader);
        let (a, _) = next_frame(&mut reader).await;
        let (b, _) = next_frame(&mut reader).await;
        assert_eq!((a.session_id, a.status, a.has_error()), (1, SessionStatus::End, false));
        assert_eq!((b.session_id, b.status, b.has_error()), (2, SessionStatus::End, true));
    }

    #[tokio::test]
    async fn test_end_on_closed_output_does_not_fail() {
        let (_reader, output) = pipe::new(PipeOptions::unbounded());
        output.close();
        let mut writer = MuxWriter::response(1, output, TransferType::Stream);
        writer.send_session_status_end().await;
    }
}
