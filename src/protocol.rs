//! Wire encoding for file mutation messages.
//!
//! Message format (big-endian, one message per logical file mutation):
//! ```text
//! [kind: i32][id: u32 len + utf8][filename: u32 len + utf8]
//! [payload_len: i32][payload: bytes]      // only for Change/Add
//! ```
//!
//! Messages are sent over a reliable ordered byte stream. The decoder never
//! looks ahead into the next message, and a buffer that ends mid-message is
//! `Incomplete`, not an error — the caller keeps accumulating bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire discriminants. Change and Add are both whole-file writes on the
/// receiving side; the distinction is kept for logging.
const KIND_CHANGE: i32 = 1;
const KIND_ADD: i32 = 2;
const KIND_REMOVE: i32 = 3;

/// Upper bound on id/filename length on the wire.
const MAX_STRING_LEN: usize = 64 * 1024;
/// Upper bound on a file payload. Large enough for any reasonable asset.
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// An already-tracked file changed content.
    Change,
    /// A file appeared (also used for full-state sync on connect).
    Add,
    /// A file was deleted.
    Remove,
}

impl MessageKind {
    fn code(self) -> i32 {
        match self {
            Self::Change => KIND_CHANGE,
            Self::Add => KIND_ADD,
            Self::Remove => KIND_REMOVE,
        }
    }

    /// Whether messages of this kind carry a payload on the wire.
    pub fn has_payload(self) -> bool {
        !matches!(self, Self::Remove)
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            KIND_CHANGE => Ok(Self::Change),
            KIND_ADD => Ok(Self::Add),
            KIND_REMOVE => Ok(Self::Remove),
            other => Err(WireError::InvalidKind(other)),
        }
    }
}

/// Decoding errors. `Incomplete` is recoverable (wait for more bytes);
/// everything else means the stream is corrupt and the connection should be
/// reset.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("incomplete message, need more bytes")]
    Incomplete,
    #[error("invalid message kind: {0}")]
    InvalidKind(i32),
    #[error("string field too long: {0} bytes (max: {MAX_STRING_LEN})")]
    StringTooLong(usize),
    #[error("payload too large: {0} bytes (max: {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(i64),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

impl WireError {
    /// True when the error only means "keep reading".
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete)
    }
}

/// One file mutation on the wire. `payload` is `Some` exactly when
/// `kind.has_payload()`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub id: String,
    pub filename: String,
    pub payload: Option<Bytes>,
}

impl WireMessage {
    pub fn change(id: impl Into<String>, filename: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Change,
            id: id.into(),
            filename: filename.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn add(id: impl Into<String>, filename: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Add,
            id: id.into(),
            filename: filename.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn remove(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Remove,
            id: id.into(),
            filename: filename.into(),
            payload: None,
        }
    }

    /// Encode to a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let payload_len = self.payload.as_ref().map(|p| p.len()).unwrap_or(0);
        let mut buf =
            BytesMut::with_capacity(4 + 8 + self.id.len() + self.filename.len() + 4 + payload_len);

        buf.put_i32(self.kind.code());
        put_string(&mut buf, &self.id);
        put_string(&mut buf, &self.filename);
        if let Some(payload) = &self.payload {
            buf.put_i32(payload.len() as i32);
            buf.put_slice(payload);
        }
        buf
    }

    /// Decode one message from the front of `data`.
    ///
    /// Returns the message and the number of bytes consumed. Multiple
    /// messages may sit back-to-back in `data`; callers loop, advancing past
    /// each decoded message, until `Incomplete`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), WireError> {
        let mut buf = data;

        let kind = MessageKind::try_from(take_i32(&mut buf)?)?;
        let id = take_string(&mut buf)?;
        let filename = take_string(&mut buf)?;

        let payload = if kind.has_payload() {
            let len = take_i32(&mut buf)?;
            if len < 0 || len as usize > MAX_PAYLOAD_LEN {
                return Err(WireError::PayloadTooLarge(len as i64));
            }
            let len = len as usize;
            if buf.len() < len {
                return Err(WireError::Incomplete);
            }
            let payload = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Some(payload)
        } else {
            None
        };

        let consumed = data.len() - buf.len();
        Ok((
            Self {
                kind,
                id,
                filename,
                payload,
            },
            consumed,
        ))
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_i32())
}

fn take_string(buf: &mut &[u8]) -> Result<String, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Incomplete);
    }
    let len = buf.get_u32() as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::StringTooLong(len));
    }
    if buf.len() < len {
        return Err(WireError::Incomplete);
    }
    let s = std::str::from_utf8(&buf[..len]).map_err(|_| WireError::InvalidUtf8)?;
    let s = s.to_owned();
    buf.advance(len);
    Ok(s)
}
