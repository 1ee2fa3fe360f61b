#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
#[repr(u8)]
pub enum HandshakeKind {
    /// Client to relay, fanned out to every upstream
    First = 0x01,
    /// Upstream to relay, answered back to the client
    Second = 0x02,
    Unknown = 0xFF,
}

impl HandshakeKind {
    /// Offset of the big-endian session id for this kind of message.
    pub fn session_id_offset(&self) -> Option<usize> {
        match self {
            HandshakeKind::First => Some(4),
            HandshakeKind::Second => Some(8),
            HandshakeKind::Unknown => None,
        }
    }
    pub fn is_first(&self) -> bool {
        self == &HandshakeKind::First
    }
    pub fn is_second(&self) -> bool {
        self == &HandshakeKind::Second
    }
}

impl From<u8> for HandshakeKind {
    fn from(value: u8) -> Self {
        match value {
            0x01 => HandshakeKind::First,
            0x02 => HandshakeKind::Second,
            _ => HandshakeKind::Unknown,
        }
    }
}

impl From<HandshakeKind> for u8 {
    fn from(value: HandshakeKind) -> Self {
        value as u8
    }
}
