//! Multiplexing frame metadata.
//!
//! Each frame on the shared connection is:
//!
//! ```text
//! [meta len: u16][session id: u16][status: u8][option: u8][target?][data len: u16][data]
//!  └──────────────── metadata (≤ 512 bytes) ───────────────────────┘└── if DATA ───┘
//! ```
//!
//! The target (`network: u8` + type-tagged address + port) is only present
//! on `New` frames.

use bytes::{Buf, BufMut, BytesMut};

use crate::buf::{BufferedReader, MultiBuffer};
use crate::error::{Error, Result};
use crate::net::{self, Destination, Network};

/// Maximum encoded metadata length.
pub const MAX_METADATA_LEN: usize = 512;

/// Fixed part of the metadata: id, status and option.
const FIXED_METADATA_LEN: usize = 4;

/// Shortest `New` metadata worth parsing: fixed part, network byte, address
/// type and the start of the address.
const MIN_NEW_METADATA_LEN: usize = 8;

/// Session identifier, scoped to one physical connection.
pub type SessionId = u16;

/// Lifecycle status carried by every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Opens a session; metadata carries the target.
    New = 0x01,
    /// Continues an existing session.
    Keep = 0x02,
    /// Ends a session; the ERROR option marks an abnormal end.
    End = 0x03,
    /// Connection liveness signal, not tied to a session.
    KeepAlive = 0x04,
}

impl TryFrom<u8> for SessionStatus {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::New),
            0x02 => Ok(Self::Keep),
            0x03 => Ok(Self::End),
            0x04 => Ok(Self::KeepAlive),
            _ => Err(Error::UnknownStatus(v)),
        }
    }
}

/// Frame option bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOption(u8);

impl SessionOption {
    /// A length-prefixed payload follows the metadata.
    pub const DATA: SessionOption = SessionOption(0x01);
    /// The session ended abnormally.
    pub const ERROR: SessionOption = SessionOption(0x02);

    /// Empty option set.
    pub const fn empty() -> Self {
        SessionOption(0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits; unknown bits are kept.
    pub const fn from_bits(bits: u8) -> Self {
        SessionOption(bits)
    }

    /// True when every bit of `other` is set.
    pub const fn has(self, other: SessionOption) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn set(&mut self, other: SessionOption) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn clear(&mut self, other: SessionOption) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for SessionOption {
    type Output = SessionOption;

    fn bitor(self, rhs: SessionOption) -> SessionOption {
        SessionOption(self.0 | rhs.0)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Session the frame belongs to
    pub session_id: SessionId,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Option bits
    pub option: SessionOption,
    /// Present exactly when `status` is `New`
    pub target: Option<Destination>,
}

impl FrameMetadata {
    /// Metadata for a frame of an already known session.
    pub fn new(session_id: SessionId, status: SessionStatus) -> Self {
        Self {
            session_id,
            status,
            option: SessionOption::empty(),
            target: None,
        }
    }

    /// Metadata opening a session towards `target`.
    pub fn new_session(session_id: SessionId, target: Destination) -> Self {
        Self {
            session_id,
            status: SessionStatus::New,
            option: SessionOption::empty(),
            target: Some(target),
        }
    }

    /// Whether a payload follows.
    pub fn has_data(&self) -> bool {
        self.option.has(SessionOption::DATA)
    }

    /// Whether the error bit is set.
    pub fn has_error(&self) -> bool {
        self.option.has(SessionOption::ERROR)
    }

    /// Append the length-prefixed metadata to `buf`.
    ///
    /// On error `buf` is left exactly as it was.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        let result = self.write_unchecked(buf, start);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn write_unchecked(&self, buf: &mut BytesMut, start: usize) -> Result<()> {
        buf.put_u16(0);
        buf.put_u16(self.session_id);
        buf.put_u8(self.status as u8);
        buf.put_u8(self.option.bits());

        if self.status == SessionStatus::New {
            let target = self
                .target
                .as_ref()
                .ok_or_else(|| Error::invalid_target("new session without target"))?;
            buf.put_u8(target.network as u8);
            net::put_address_port(buf, &target.address, target.port)?;
        }

        let len = buf.len() - start - 2;
        if len > MAX_METADATA_LEN {
            return Err(Error::MetadataTooLarge(len));
        }
        buf[start..start + 2].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(())
    }

    /// Parse metadata bytes (without the length prefix).
    pub fn unmarshal(mut b: &[u8]) -> Result<Self> {
        if b.len() < FIXED_METADATA_LEN {
            return Err(Error::invalid_frame(format!(
                "metadata too short: {} bytes",
                b.len()
            )));
        }
        let total = b.len();

        let session_id = b.get_u16();
        let status = SessionStatus::try_from(b.get_u8())?;
        let option = SessionOption::from_bits(b.get_u8());

        let target = if status == SessionStatus::New {
            if total < MIN_NEW_METADATA_LEN {
                return Err(Error::invalid_frame(format!(
                    "insufficient buffer for new session: {} bytes",
                    total
                )));
            }
            let network = Network::try_from(b.get_u8())?;
            let (address, port) = net::get_address_port(&mut b)?;
            Some(Destination {
                network,
                address,
                port,
            })
        } else {
            None
        };

        Ok(Self {
            session_id,
            status,
            option,
            target,
        })
    }

    /// Read one frame header from the shared connection.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between frames.
    pub async fn read_from(reader: &mut BufferedReader) -> Result<Option<Self>> {
        let Some(len) = reader.read_u16_or_eof().await? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_METADATA_LEN {
            return Err(Error::MetadataTooLarge(len));
        }
        let bytes = reader.read_exact(len).await?;
        Self::unmarshal(&bytes).map(Some)
    }
}

/// Read the length-prefixed payload that follows a DATA frame's metadata.
///
/// The payload comes back as a single chunk however the transport split it,
/// so a packet frame always yields exactly one datagram.
pub async fn read_payload(reader: &mut BufferedReader) -> Result<MultiBuffer> {
    let len = reader.read_u16().await? as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    Ok(vec![reader.read_exact(len).await?])
}

/// Consume the payload of `meta`, if any, without delivering it.
pub async fn drain_payload(reader: &mut BufferedReader, meta: &FrameMetadata) -> Result<()> {
    if meta.has_data() {
        let len = reader.read_u16().await? as usize;
        reader.skip(len).await?;
    }
    Ok(())
}
