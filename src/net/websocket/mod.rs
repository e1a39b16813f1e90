//! WebSocket protocol subset (RFC 6455).
//!
//! # Architecture
//!
//! - `frame`: wire format encoding/decoding (RFC 6455 Section 5)
//! - `handshake`: server side of the HTTP upgrade (RFC 6455 Section 4)
//!
//! Fragmentation and extensions are not supported: every encoded frame has FIN
//! set and all RSV bits clear, and a frame with an RSV bit is a protocol error.
//!
//! # Example
//!
//! ```
//! use std::io::Cursor;
//! use wsrelay::net::websocket::{decode, encode, Decoded, Opcode};
//!
//! let wire = encode(b"hello", Opcode::Text);
//! match decode(&mut Cursor::new(wire)) {
//!     Decoded::Frame(frame) => assert_eq!(frame.payload, b"hello"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

mod frame;
mod handshake;

pub use frame::{
    apply_mask, decode, encode, encode_masked, CloseCode, DecodeError, Decoded, Frame,
    FrameCodec, Opcode, DEFAULT_MAX_PAYLOAD_SIZE,
};
pub use handshake::{
    accept, compute_accept_key, reject, AcceptResponse, HandshakeError, Headers, KEY_HEADER,
};
