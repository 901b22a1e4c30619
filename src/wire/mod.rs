//! Wire protocol: `Content-Length`-framed JSON-RPC messages.

mod codec;
mod message;

pub use {
  codec::{FrameCodec, ProtocolError, MAX_FRAME_LEN},
  message::{ErrorBody, Message},
};
