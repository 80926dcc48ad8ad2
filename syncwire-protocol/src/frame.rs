//! Binary frame format used on broker connections.
//!
//! Frame layout (18 bytes header + header extension + payload):
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | header_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | header_ext   | payload                                        |
//! | header_len   | payload_len bytes                              |
//! +--------------+------------------------------------------------+
//! ```
//!
//! The CRC covers the header extension followed by the payload.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying syncwire frames.
pub const MAGIC: [u8; 4] = *b"SWFR";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield. Only the CRC bit is defined in version 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const CRC_PRESENT: u16 = 0x0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(self) -> Self {
        Self(self.0 | Self::CRC_PRESENT)
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Rejects bits this version does not define.
    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        match bits & !Self::CRC_PRESENT {
            0 => Ok(Self(bits)),
            _ => Err(ProtocolError::InvalidFlags(bits)),
        }
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// Header extension (packet header JSON for broker packets).
    pub header_extension: Bytes,
    pub payload: Bytes,
}

/// Fixed-size prefix, validated but not yet consumed.
struct Prefix {
    version: u16,
    flags: FrameFlags,
    header_len: usize,
    payload_len: usize,
    crc: u32,
}

impl Prefix {
    fn read(mut raw: &[u8]) -> Result<Self, ProtocolError> {
        let mut magic = [0u8; 4];
        raw.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = raw.get_u16();
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let flags = FrameFlags::from_bits(raw.get_u16())?;
        let header_len = raw.get_u16() as usize;
        let payload_len = raw.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            version,
            flags,
            header_len,
            payload_len: payload_len as usize,
            crc: raw.get_u32(),
        })
    }

    fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.header_len + self.payload_len
    }
}

/// CRC32C over the header extension followed by the payload.
fn checksum(header_extension: &[u8], payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(header_extension), payload)
}

impl Frame {
    /// Frame with CRC enabled and no header extension.
    pub fn new(payload: Bytes) -> Self {
        Self::with_header(Bytes::new(), payload)
    }

    pub fn with_header(header_extension: Bytes, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            header_extension,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.header_extension.len() + self.payload.len()
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            })?;
        let header_len = u16::try_from(self.header_extension.len())
            .map_err(|_| ProtocolError::HeaderTooLarge(self.header_extension.len()))?;
        let crc = if self.flags.has_crc() {
            checksum(&self.header_extension, &self.payload)
        } else {
            0
        };

        buf.reserve(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(header_len);
        buf.put_u32(payload_len);
        buf.put_u32(crc);
        buf.put_slice(&self.header_extension);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. Nothing is consumed
    /// unless a frame is returned or the header is rejected.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let prefix = Prefix::read(&buf[..FRAME_HEADER_SIZE])?;
        if buf.len() < prefix.frame_len() {
            return Ok(None);
        }

        let mut frame = buf.split_to(prefix.frame_len());
        frame.advance(FRAME_HEADER_SIZE);
        let header_extension = frame.split_to(prefix.header_len).freeze();
        let payload = frame.freeze();

        if prefix.flags.has_crc() {
            let actual = checksum(&header_extension, &payload);
            if actual != prefix.crc {
                return Err(ProtocolError::CrcMismatch {
                    expected: prefix.crc,
                    actual,
                });
            }
        }

        Ok(Some(Self {
            version: prefix.version,
            flags: prefix.flags,
            header_extension,
            payload,
        }))
    }
}
