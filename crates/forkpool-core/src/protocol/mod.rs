//! Wire protocol between workers and the engine.
//!
//! Workers stream one frame per finished task over an anonymous pipe. Each
//! frame is an 8-digit hex length header followed by a bincode-encoded
//! [`WireFrame`].

pub mod codec;
pub mod message;

pub use codec::{
    FrameDecoder, FrameError, HEADER_LEN, MAX_PAYLOAD_LEN, encode_frame, encode_frame_limited,
};
pub use message::{WireFrame, WireOutcome, decode_message, encode_message};
