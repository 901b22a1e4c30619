use {
  super::Message,
  bytes::{Buf, BufMut, BytesMut},
  thiserror::Error,
  tokio_util::codec::{Decoder, Encoder},
};

/// Upper bound on a frame body. Anything larger is treated as a
/// protocol violation and closes the connection.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Framing violations. Any of these is fatal for the connection that
/// produced them; other connections are unaffected.
#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("missing content-length header")]
  MissingContentLength,

  #[error("malformed content-length header")]
  MalformedContentLength,

  #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
  Oversized(usize),

  #[error("invalid message payload: {0}")]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

enum DecodeState {
  /// Accumulating header bytes until the blank line.
  Head,
  /// Headers parsed; waiting for a body of this many bytes.
  Body(usize),
}

/// Length-prefixed JSON framing:
/// `Content-Length: <n>\r\n\r\n<n bytes of UTF-8 JSON>`.
///
/// Header names are case-insensitive and surrounding whitespace in
/// values is ignored; unknown headers are tolerated and skipped.
pub struct FrameCodec {
  state: DecodeState,
}

impl FrameCodec {
  pub fn new() -> Self {
    Self {
      state: DecodeState::Head,
    }
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Scans raw header bytes for `content-length`.
fn parse_content_length(raw: &[u8]) -> Result<usize, ProtocolError> {
  let text = String::from_utf8_lossy(raw);
  for line in text.split("\r\n") {
    let Some((name, value)) = line.split_once(':') else { continue };
    if name.trim().eq_ignore_ascii_case("content-length") {
      return value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedContentLength);
    }
  }
  Err(ProtocolError::MissingContentLength)
}

impl Decoder for FrameCodec {
  type Error = ProtocolError;
  type Item = Message;

  fn decode(
    &mut self,
    src: &mut BytesMut,
  ) -> Result<Option<Message>, ProtocolError> {
    loop {
      match self.state {
        DecodeState::Head => {
          let Some(end) = src
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
          else {
            return Ok(None);
          };
          let length = parse_content_length(&src[..end])?;
          if length > MAX_FRAME_LEN {
            return Err(ProtocolError::Oversized(length));
          }
          src.advance(end + HEADER_TERMINATOR.len());
          src.reserve(length);
          self.state = DecodeState::Body(length);
        }
        DecodeState::Body(length) => {
          if src.len() < length {
            return Ok(None);
          }
          let body = src.split_to(length);
          self.state = DecodeState::Head;
          return Ok(Some(serde_json::from_slice(&body)?));
        }
      }
    }
  }
}

impl Encoder<Message> for FrameCodec {
  type Error = ProtocolError;

  fn encode(
    &mut self,
    item: Message,
    dst: &mut BytesMut,
  ) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(&item)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    dst.reserve(header.len() + body.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(&body);
    Ok(())
  }
}
