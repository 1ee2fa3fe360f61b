/*
   0                                            15                                              31
   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |   kind (8)          |                          opaque(24)                                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                           session ID(32) when kind = 0x01                                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                           session ID(32) when kind = 0x02                                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                         payload(n)                                          |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use crate::error::{Error, Result};
pub use handshake_kind::HandshakeKind;

mod handshake_kind;

pub const HEAD_LEN: usize = 12;

/// Read-only view over a received handshake datagram.
///
/// The buffer is never modified, so `buffer()` can be relayed as is.
pub struct HandshakeMessage<B> {
    kind: HandshakeKind,
    buffer: B,
}

impl<B: AsRef<[u8]>> HandshakeMessage<B> {
    /// Classify a datagram. Anything shorter than [`HEAD_LEN`] is rejected.
    pub fn new(buffer: B) -> Result<HandshakeMessage<B>> {
        let len = buffer.as_ref().len();
        if len < HEAD_LEN {
            return Err(Error::TooShort {
                len,
                required: HEAD_LEN,
            });
        }
        let kind = HandshakeKind::from(buffer.as_ref()[0]);
        Ok(Self { kind, buffer })
    }
    pub fn kind(&self) -> HandshakeKind {
        self.kind
    }
    /// `None` for [`HandshakeKind::Unknown`].
    pub fn session_id(&self) -> Option<u32> {
        let offset = self.kind.session_id_offset()?;
        let buf = self.buffer.as_ref();
        let mut id = [0u8; 4];
        id.copy_from_slice(&buf[offset..offset + 4]);
        Some(u32::from_be_bytes(id))
    }
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_ref()
    }
    pub fn into_inner(self) -> B {
        self.buffer
    }
}

impl<B: AsRef<[u8]>> std::fmt::Debug for HandshakeMessage<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeMessage")
            .field("kind", &self.kind)
            .field("session_id", &self.session_id())
            .field("len", &self.buffer.as_ref().len())
            .finish()
    }
}

/// Shorthand for [`HandshakeMessage::new`] over a borrowed datagram.
pub fn classify(buf: &[u8]) -> Result<HandshakeMessage<&[u8]>> {
    HandshakeMessage::new(buf)
}
