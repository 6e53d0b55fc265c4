//! Duplex link built from two pipes.

use super::{PipeOptions, PipeReader, PipeWriter};
use crate::error::Error;

/// One endpoint of a duplex channel.
///
/// `reader` yields what the peer endpoint wrote; `writer` feeds the peer
/// endpoint's reader.
#[derive(Clone)]
pub struct Link {
    /// Data arriving from the peer endpoint
    pub reader: PipeReader,
    /// Data sent to the peer endpoint
    pub writer: PipeWriter,
}

impl Link {
    /// Assemble a link from existing pipe ends.
    pub fn new(reader: PipeReader, writer: PipeWriter) -> Self {
        Self { reader, writer }
    }

    /// Gracefully close both directions.
    pub fn close(&self) {
        self.writer.close();
        self.reader.close();
    }

    /// Hard-fail both directions with `err`.
    pub fn interrupt(&self, err: Error) {
        self.writer.interrupt(err.clone());
        self.reader.interrupt(err);
    }
}

/// Create two connected link endpoints, socket-pair style.
///
/// Both pipes share `options`.
pub fn new_links(options: PipeOptions) -> (Link, Link) {
    let (up_reader, up_writer) = super::new(options);
    let (down_reader, down_writer) = super::new(options);

    (
        Link::new(down_reader, up_writer),
        Link::new(up_reader, down_writer),
    )
}
