//! Binary frame format for BRP.
//!
//! Every frame is an 18-byte header followed by a JSON payload:
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | header_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | payload (payload_len bytes)                                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! `header_len` is reserved and must be zero in version 1. Streamed list
//! items travel in frames flagged `STREAM`; the frame that closes a stream
//! additionally carries `END_STREAM`.

use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying BRP frames: "BLGX"
pub const MAGIC: [u8; 4] = *b"BLGX";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// This frame belongs to a server stream.
    pub const STREAM: u16 = 1 << 2;
    /// Final frame of a server stream.
    pub const END_STREAM: u16 = 1 << 3;

    const KNOWN: u16 = Self::CRC_PRESENT | Self::STREAM | Self::END_STREAM;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_stream(mut self) -> Self {
        self.0 |= Self::STREAM;
        self
    }

    pub fn with_end_stream(mut self) -> Self {
        self.0 |= Self::END_STREAM;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_stream(&self) -> bool {
        self.0 & Self::STREAM != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.0 & Self::END_STREAM != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Parses flags off the wire, rejecting unknown bits and an
    /// `END_STREAM` outside a stream.
    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        let flags = Self(bits);
        if bits & !Self::KNOWN != 0 || (flags.is_end_stream() && !flags.is_stream()) {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(flags)
    }
}

fn check_payload_len(len: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_PAYLOAD_SIZE => Ok(len),
        _ => Err(ProtocolError::FrameTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_PAYLOAD_SIZE,
        }),
    }
}

/// The fixed-size part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    flags: FrameFlags,
    payload_len: u32,
    crc: u32,
}

impl FrameHeader {
    fn for_payload(flags: FrameFlags, payload: &[u8]) -> Result<Self, ProtocolError> {
        let payload_len = check_payload_len(payload.len())?;
        let crc = if flags.has_crc() {
            crc32c::crc32c(payload)
        } else {
            0
        };
        Ok(Self {
            flags,
            payload_len,
            crc,
        })
    }

    /// Parses the header at the start of `buf` without consuming anything.
    /// Returns `None` until a whole header is buffered.
    fn peek(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let mut header = match buf.get(..FRAME_HEADER_SIZE) {
            Some(header) => header,
            None => return Ok(None),
        };

        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = header.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(header.get_u16())?;

        let header_len = header.get_u16();
        if header_len != 0 {
            return Err(ProtocolError::HeaderExtension(header_len));
        }

        let payload_len = check_payload_len(header.get_u32() as usize)?;
        let crc = header.get_u32();

        Ok(Some(Self {
            flags,
            payload_len,
            crc,
        }))
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(self.flags.bits());
        buf.put_u16(0);
        buf.put_u32(self.payload_len);
        buf.put_u32(self.crc);
    }

    fn verify(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        if !self.flags.has_crc() {
            return Ok(());
        }
        let actual = crc32c::crc32c(payload);
        if actual != self.crc {
            return Err(ProtocolError::CrcMismatch {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}

/// A BRP frame: flags plus a JSON payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame carrying `payload`.
    pub fn new(payload: Bytes) -> Self {
        Self {
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    /// Creates a frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Replaces the frame flags, keeping the CRC bit set.
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags.with_crc();
        self
    }

    /// Encodes the frame. Fails if the payload exceeds `MAX_PAYLOAD_SIZE`.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let header = FrameHeader::for_payload(self.flags, &self.payload)?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        header.put(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, reserving room for
    /// the rest of it. Header errors are reported as soon as the header is
    /// buffered, before the payload arrives.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let header = match FrameHeader::peek(&buf[..])? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total_len = FRAME_HEADER_SIZE + header.payload_len as usize;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.payload_len as usize).freeze();
        header.verify(&payload)?;

        Ok(Some(Self {
            flags: header.flags,
            payload,
        }))
    }
}
