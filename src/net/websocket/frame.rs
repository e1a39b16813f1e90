//! WebSocket frame codec according to RFC 6455.
//!
//! Implements the subset of the wire format the server speaks:
//! - Unfragmented frame encoding (FIN always set, RSV bits clear)
//! - Decoding of exactly one frame from a byte-stream source
//! - Decoding from a receive buffer that may hold a partial frame
//! - Masking (client-to-server)
//! - Protocol failures reported as values, not `Err`
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! # Decode outcomes
//!
//! | Input | Result |
//! |-------|--------|
//! | no bytes on first read, read error, header cut short | [`Decoded::Closed`] |
//! | opcode outside {1, 2, 8, 9, A} | `Invalid` / `unknown opcode (1003)` |
//! | any RSV bit set | `Invalid` / `protocol error (1002)` |
//! | 64-bit length above `i64::MAX` | `Invalid` / `content length mismatch` |
//! | length above the codec limit | `Invalid` / `message too big (1009)` |
//! | payload cut short | [`Decoded::Frame`] with the bytes that arrived |
//!
//! Non-blocking sockets hand over whatever has arrived so far. Those callers
//! accumulate bytes in a buffer and use [`FrameCodec::decode_buffered`],
//! which waits for a complete frame instead of treating a partial one as
//! truncated.

use std::io::{self, Read};

/// Payload bytes unmasked per read when decoding a masked frame.
const MASK_CHUNK_SIZE: usize = 1024;

/// Largest length a 64-bit extended length field may carry.
const MAX_FRAME_LENGTH: u64 = i64::MAX as u64;

/// Upper bound on the up-front allocation for a payload buffer.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Default maximum payload accepted by [`FrameCodec`] (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

/// WebSocket frame opcode (4 bits).
///
/// Continuation frames are not supported; opcode `0x0` decodes as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Parses the low nibble of the first header byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// WebSocket close status codes (RFC 6455 Section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Endpoint going away.
    GoingAway = 1001,
    /// Protocol error.
    ProtocolError = 1002,
    /// Unsupported data type.
    Unsupported = 1003,
    /// Message too big.
    MessageTooBig = 1009,
    /// Unexpected server condition.
    InternalError = 1011,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// A single decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)] // RFC 6455 exposes these as independent header bits.
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// Reserved bit 1.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Mask flag as it appeared on the wire.
    pub masked: bool,
    /// Declared payload length.
    pub length: u64,
    /// Payload data, already unmasked.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates an unmasked final frame.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            length: payload.len() as u64,
            payload,
        }
    }

    /// Creates a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Creates a binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Creates a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Creates a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Creates a close frame carrying `code` and an optional reason.
    #[must_use]
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload)
    }

    /// Encodes this frame as an unmasked final frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.payload, self.opcode)
    }
}

/// Protocol-level decode failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Opcode nibble outside the supported set.
    #[error("unknown opcode (1003)")]
    UnknownOpcode(u8),
    /// An RSV bit was set without a negotiated extension.
    #[error("protocol error (1002)")]
    ReservedBits,
    /// 64-bit length field above the signed 63-bit maximum.
    #[error("content length mismatch")]
    ContentLengthMismatch(u64),
    /// Declared payload larger than the codec accepts.
    #[error("message too big (1009)")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
}

impl DecodeError {
    /// Close code to send when failing a connection for this error.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::UnknownOpcode(_) => CloseCode::Unsupported,
            Self::ReservedBits | Self::ContentLengthMismatch(_) => CloseCode::ProtocolError,
            Self::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
        }
    }
}

/// Result of reading one frame from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A well-formed frame.
    Frame(Frame),
    /// The source is gone (EOF, read error, or a header cut short).
    ///
    /// Behaves like a CLOSE frame with an empty payload.
    Closed,
    /// The frame violated the protocol.
    Invalid {
        /// Opcode, when it was recognised before the failure.
        opcode: Option<Opcode>,
        /// What went wrong.
        error: DecodeError,
    },
}

impl Decoded {
    /// Opcode as seen by callers; `Closed` reports [`Opcode::Close`].
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Self::Frame(frame) => Some(frame.opcode),
            Self::Closed => Some(Opcode::Close),
            Self::Invalid { opcode, .. } => *opcode,
        }
    }

    /// Payload bytes; empty unless this is a well-formed frame.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Frame(frame) => &frame.payload,
            Self::Closed | Self::Invalid { .. } => &[],
        }
    }

    /// The protocol error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&DecodeError> {
        match self {
            Self::Invalid { error, .. } => Some(error),
            Self::Frame(_) | Self::Closed => None,
        }
    }

    /// Returns true for a CLOSE frame or a vanished source.
    #[must_use]
    pub fn is_close(&self) -> bool {
        match self {
            Self::Frame(frame) => frame.opcode == Opcode::Close,
            Self::Closed => true,
            Self::Invalid { .. } => false,
        }
    }
}

/// Frame decoder with a payload size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: u64,
}

impl FrameCodec {
    /// Creates a codec with [`DEFAULT_MAX_PAYLOAD_SIZE`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Sets the maximum accepted payload size.
    #[must_use]
    pub const fn max_payload_size(mut self, max: u64) -> Self {
        self.max_payload_size = max;
        self
    }

    /// Reads exactly one frame from `source`.
    ///
    /// Never returns `Err`: a vanished source yields [`Decoded::Closed`] and
    /// protocol violations yield [`Decoded::Invalid`]. A payload that stops
    /// arriving early is returned short rather than retried.
    pub fn decode<R: Read + ?Sized>(&self, source: &mut R) -> Decoded {
        let mut head = [0u8; 2];
        if read_up_to(source, &mut head[..1]) == 0 {
            return Decoded::Closed;
        }

        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        let rsv2 = head[0] & 0x20 != 0;
        let rsv3 = head[0] & 0x10 != 0;
        let nibble = head[0] & 0x0F;

        let Some(opcode) = Opcode::from_u8(nibble) else {
            return Decoded::Invalid {
                opcode: None,
                error: DecodeError::UnknownOpcode(nibble),
            };
        };
        if rsv1 || rsv2 || rsv3 {
            return Decoded::Invalid {
                opcode: Some(opcode),
                error: DecodeError::ReservedBits,
            };
        }

        if read_up_to(source, &mut head[1..]) == 0 {
            return Decoded::Closed;
        }
        let masked = head[1] & 0x80 != 0;
        let length = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                if read_up_to(source, &mut ext) < ext.len() {
                    return Decoded::Closed;
                }
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                if read_up_to(source, &mut ext) < ext.len() {
                    return Decoded::Closed;
                }
                let length = u64::from_be_bytes(ext);
                if length > MAX_FRAME_LENGTH {
                    return Decoded::Invalid {
                        opcode: Some(opcode),
                        error: DecodeError::ContentLengthMismatch(length),
                    };
                }
                length
            }
            short => u64::from(short),
        };

        if length > self.max_payload_size {
            return Decoded::Invalid {
                opcode: Some(opcode),
                error: DecodeError::PayloadTooLarge {
                    size: length,
                    max: self.max_payload_size,
                },
            };
        }

        // The key is consumed even for an empty payload to keep the stream aligned.
        let mask_key = if masked {
            let mut key = [0u8; 4];
            if read_up_to(source, &mut key) < key.len() {
                return Decoded::Closed;
            }
            Some(key)
        } else {
            None
        };

        let payload = match (length, mask_key) {
            (0, _) => Vec::new(),
            (_, None) => read_plain(source, length),
            (_, Some(key)) => read_masked(source, length, key),
        };

        Decoded::Frame(Frame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            length,
            payload,
        })
    }
}

impl FrameCodec {
    /// Number of bytes [`decode`](Self::decode) consumes for the frame at the
    /// front of `buf`.
    ///
    /// Returns `None` while the header (including extended length and mask
    /// key) is incomplete. A header the decoder rejects reports only the bytes
    /// read before the rejection, so the result may be shorter than `buf`
    /// even though the frame is never completed.
    #[must_use]
    pub fn frame_extent(&self, buf: &[u8]) -> Option<usize> {
        let first = *buf.first()?;
        if Opcode::from_u8(first & 0x0F).is_none() || first & 0x70 != 0 {
            return Some(1);
        }
        let second = *buf.get(1)?;
        let (ext, length) = match second & 0x7F {
            126 => {
                let ext: [u8; 2] = buf.get(2..4)?.try_into().ok()?;
                (2, u64::from(u16::from_be_bytes(ext)))
            }
            127 => {
                let ext: [u8; 8] = buf.get(2..10)?.try_into().ok()?;
                (8, u64::from_be_bytes(ext))
            }
            short => (0, u64::from(short)),
        };
        let header = 2 + ext;
        if length > MAX_FRAME_LENGTH || length > self.max_payload_size {
            return Some(header);
        }
        let mask = if second & 0x80 != 0 { 4 } else { 0 };
        usize::try_from(length)
            .ok()
            .and_then(|length| length.checked_add(header + mask))
    }

    /// Decodes the frame at the front of `buf` once all of it has arrived,
    /// and removes its bytes from `buf`.
    ///
    /// Returns `None` when more bytes are needed. Protocol violations are
    /// reported as soon as the offending header bytes are present.
    pub fn decode_buffered(&self, buf: &mut Vec<u8>) -> Option<Decoded> {
        let extent = self.frame_extent(buf)?;
        if extent > buf.len() {
            return None;
        }
        let decoded = self.decode(&mut &buf[..extent]);
        buf.drain(..extent);
        Some(decoded)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes `payload` as a single unmasked final frame.
#[must_use]
pub fn encode(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    write_header(&mut out, opcode, false, payload.len());
    out.extend_from_slice(payload);
    out
}

/// Encodes `payload` as a single masked final frame (client role).
#[must_use]
pub fn encode_masked(payload: &[u8], opcode: Opcode, mask_key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    write_header(&mut out, opcode, true, payload.len());
    out.extend_from_slice(&mask_key);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask_key, 0);
    out
}

/// Reads one frame from `source` using the default codec settings.
pub fn decode<R: Read + ?Sized>(source: &mut R) -> Decoded {
    FrameCodec::new().decode(source)
}

/// XORs `payload` with `mask_key`, starting at key position `offset`.
///
/// Returns the key position for the byte following `payload`, so a payload
/// can be unmasked across several calls.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4], offset: usize) -> usize {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[(offset + i) % 4];
    }
    (offset + payload.len()) % 4
}

fn write_header(out: &mut Vec<u8>, opcode: Opcode, masked: bool, len: usize) {
    let mask_bit = if masked { 0x80 } else { 0x00 };
    out.push(0x80 | opcode as u8);
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Fills as much of `buf` as the source provides before it starves.
fn read_up_to<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    filled
}

fn prealloc(length: u64) -> Vec<u8> {
    Vec::with_capacity(usize::try_from(length).map_or(PREALLOC_LIMIT, |n| n.min(PREALLOC_LIMIT)))
}

fn read_plain<R: Read + ?Sized>(source: &mut R, length: u64) -> Vec<u8> {
    let mut payload = prealloc(length);
    // A starved source leaves whatever arrived in `payload`.
    let _ = Read::take(source, length).read_to_end(&mut payload);
    payload
}

fn read_masked<R: Read + ?Sized>(source: &mut R, length: u64, mask_key: [u8; 4]) -> Vec<u8> {
    let mut payload = prealloc(length);
    let mut chunk = [0u8; MASK_CHUNK_SIZE];
    let mut remaining = length;
    let mut position = 0;

    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(MASK_CHUNK_SIZE, |n| n.min(MASK_CHUNK_SIZE));
        let got = read_up_to(source, &mut chunk[..want]);
        position = apply_mask(&mut chunk[..got], mask_key, position);
        payload.extend_from_slice(&chunk[..got]);
        if got < want {
            break;
        }
        remaining -= want as u64;
    }
    payload
}
