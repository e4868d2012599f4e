//! Length-prefixed wire framing.
//!
//! Every frame on the wire is laid out as:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | opcode | length (u32BE) | payload (length) |
//! +--------+----------------+-----------------+
//! ```
//!
//! The opcodes mirror the WebSocket control/data split: text and binary data
//! frames, plus `close`, `ping` and `pong` control frames.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header: one opcode byte plus a big-endian `u32` length.
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a single frame's payload (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame type tag, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Returns the opcode as its wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns `true` for `close`, `ping` and `pong`.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => return Err(FrameError::UnknownOpcode(other)),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is incomplete, more data needed")]
    Incomplete,

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("frame payload of {len} bytes exceeds maximum of {max_bytes} bytes")]
    TooLarge { len: usize, max_bytes: usize },

    #[error("text frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// A single decoded frame.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use rtgate::frame::{Frame, DEFAULT_MAX_FRAME_SIZE};
///
/// let mut buf = BytesMut::new();
/// Frame::Text("hello".into()).encode(&mut buf).unwrap();
///
/// let frame = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
/// assert_eq!(frame, Frame::Text("hello".into()));
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// Returns the opcode this frame is written with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Text(_) => Opcode::Text,
            Self::Binary(_) => Opcode::Binary,
            Self::Ping(_) => Opcode::Ping,
            Self::Pong(_) => Opcode::Pong,
            Self::Close => Opcode::Close,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data,
            Self::Close => &[],
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Fails with [`FrameError::TooLarge`] when the payload exceeds
    /// `max_frame_size`.
    pub fn check_size(&self, max_frame_size: usize) -> Result<(), FrameError> {
        let len = self.payload_len();
        if len > max_frame_size {
            return Err(FrameError::TooLarge {
                len,
                max_bytes: max_frame_size,
            });
        }
        Ok(())
    }

    /// Appends the encoded frame to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] when the payload length does not fit
    /// the `u32` length field. Nothing is written in that case.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = self.payload();
        let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
            len: payload.len(),
            max_bytes: u32::MAX as usize,
        })?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(self.opcode().as_u8());
        dst.put_u32(len);
        dst.put_slice(payload);
        Ok(())
    }

    /// Decodes one frame from the front of `src`, consuming its bytes.
    ///
    /// On success the decoded bytes are split off `src`; any trailing bytes
    /// belonging to the next frame are left in place.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Incomplete`]: `src` does not yet hold a whole frame;
    ///   nothing is consumed.
    /// - [`FrameError::TooLarge`]: the declared length exceeds `max_frame_size`.
    /// - [`FrameError::UnknownOpcode`] / [`FrameError::InvalidUtf8`]: the
    ///   frame is malformed. The connection should be dropped.
    pub fn decode(src: &mut BytesMut, max_frame_size: usize) -> Result<Self, FrameError> {
        if src.len() < HEADER_LEN {
            return Err(FrameError::Incomplete);
        }

        let opcode = Opcode::try_from(src[0])?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if len > max_frame_size {
            return Err(FrameError::TooLarge {
                len,
                max_bytes: max_frame_size,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Err(FrameError::Incomplete);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(match opcode {
            Opcode::Text => Self::Text(std::str::from_utf8(&payload)?.to_owned()),
            Opcode::Binary => Self::Binary(payload),
            Opcode::Ping => Self::Ping(payload),
            Opcode::Pong => Self::Pong(payload),
            Opcode::Close => Self::Close,
        })
    }
}
