//! # TermBridge Protocol Library
//!
//! Wire protocol shared by the TermBridge daemon and its clients.
//!
//! ## Overview
//!
//! A terminal connection is a stream of WebSocket text messages, each one
//! JSON object tagged by `kind`:
//!
//! | kind        | direction        | payload                     |
//! |-------------|------------------|-----------------------------|
//! | `input`     | client → server  | `{"data": string}`          |
//! | `resize`    | client → server  | `{"columns": u16, "rows": u16}` |
//! | `output`    | server → client  | `{"data": string}`          |
//! | `connected` | server → client  | `{"sessionId": string}`     |
//! | `exit`      | server → client  | `{"exitCode": i32}`         |
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Decoded, Frame, FrameCodec, TerminalSize};
//!
//! let codec = FrameCodec::new();
//! let text = codec.encode(&Frame::resize(TerminalSize::new(120, 40))).unwrap();
//! assert_eq!(text, r#"{"kind":"resize","columns":120,"rows":40}"#);
//!
//! match codec.decode(r#"{"kind":"ping"}"#).unwrap() {
//!     Decoded::Unknown(kind) => assert_eq!(kind, "ping"),
//!     Decoded::Frame(frame) => panic!("unexpected {:?}", frame),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Frame definitions and terminal size
//! - [`framing`]: Text codec and incremental UTF-8 decoding of output
//! - [`sequence`]: Server stream ordering rules
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;
pub mod sequence;

pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, Utf8StreamDecoder, KNOWN_KINDS, MAX_FRAME_SIZE};
pub use messages::{
    Decoded, Direction, Frame, TerminalSize, DEFAULT_COLUMNS, DEFAULT_ROWS,
    SESSION_ERROR_EXIT_CODE,
};
pub use sequence::{ServerFrameSequence, StreamPhase};
