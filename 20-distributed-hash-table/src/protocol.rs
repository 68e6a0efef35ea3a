//! Inter-node message protocol.
//!
//! Every message is a tag, a NUL-padded key buffer, and a signed 64-bit
//! value, packed into a fixed [`MESSAGE_LEN`]-byte buffer:
//!
//! ```text
//! +-----+--------------------------+----------------+
//! | tag | key (64 bytes, NUL pad)  | value (i64 LE) |
//! +-----+--------------------------+----------------+
//! ```
//!
//! Messages that carry no key leave the key buffer zeroed; messages that
//! carry no value send zero. The substrate moves these buffers as opaque
//! bytes, and the server loop decodes them back into [`Message`]s.

use crate::error::{DhtError, Result};
use crate::key::{Key, MAX_KEY_LEN};

/// Value returned by `get` when the key is absent.
pub const KEY_NOT_FOUND: i64 = -1;

/// Size of the key buffer, terminator included.
pub const KEY_BUFFER_LEN: usize = MAX_KEY_LEN + 1;

/// Size of every encoded message.
pub const MESSAGE_LEN: usize = 1 + KEY_BUFFER_LEN + 8;

const KEY_OFFSET: usize = 1;
const VALUE_OFFSET: usize = KEY_OFFSET + KEY_BUFFER_LEN;

/// Wire tags. Numbering is part of the protocol; every node must agree.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Put = 1,
    Get = 2,
    GetResult = 3,
    PutConfirm = 4,
    SizeRequest = 5,
    SizeResult = 6,
    Terminate = 7,
}

impl TryFrom<u8> for Tag {
    type Error = DhtError;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => Tag::Put,
            2 => Tag::Get,
            3 => Tag::GetResult,
            4 => Tag::PutConfirm,
            5 => Tag::SizeRequest,
            6 => Tag::SizeResult,
            7 => Tag::Terminate,
            other => return Err(DhtError::UnknownTag(other)),
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Store `value` under `key` on the receiving (owning) node.
    Put { key: Key, value: i64 },
    /// Look `key` up on the receiving (owning) node.
    Get { key: Key },
    /// Reply to `Get`; [`KEY_NOT_FOUND`] when the owner had no such key.
    GetResult { value: i64 },
    /// Reply to `Put`.
    PutConfirm,
    /// Ask the receiver to contribute its local size to the sender's total.
    SizeRequest,
    /// Aggregate size, sent by a node's loop to itself.
    SizeResult { total: u64 },
    /// Stop the receiving loop. Only ever self-addressed.
    Terminate,
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Put { .. } => Tag::Put,
            Message::Get { .. } => Tag::Get,
            Message::GetResult { .. } => Tag::GetResult,
            Message::PutConfirm => Tag::PutConfirm,
            Message::SizeRequest => Tag::SizeRequest,
            Message::SizeResult { .. } => Tag::SizeResult,
            Message::Terminate => Tag::Terminate,
        }
    }

    /// Packs the message into its fixed-size wire form.
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0] = self.tag() as u8;

        let (key, value) = match self {
            Message::Put { key, value } => (Some(key), *value),
            Message::Get { key } => (Some(key), 0),
            Message::GetResult { value } => (None, *value),
            // Totals are node counts times store capacity; they fit in i64.
            Message::SizeResult { total } => (None, *total as i64),
            Message::PutConfirm | Message::SizeRequest | Message::Terminate => (None, 0),
        };
        if let Some(key) = key {
            buf[KEY_OFFSET..KEY_OFFSET + key.len()].copy_from_slice(key.as_bytes());
        }
        buf[VALUE_OFFSET..].copy_from_slice(&value.to_le_bytes());
        buf
    }

    /// Unpacks a wire buffer. Unknown tags and malformed buffers are protocol
    /// violations.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != MESSAGE_LEN {
            return Err(DhtError::MalformedMessage(format!(
                "expected {MESSAGE_LEN} bytes, got {}",
                buf.len()
            )));
        }

        let tag = Tag::try_from(buf[0])?;
        let mut value_bytes = [0u8; 8];
        value_bytes.copy_from_slice(&buf[VALUE_OFFSET..]);
        let value = i64::from_le_bytes(value_bytes);

        Ok(match tag {
            Tag::Put => Message::Put {
                key: decode_key(&buf[KEY_OFFSET..VALUE_OFFSET])?,
                value,
            },
            Tag::Get => Message::Get {
                key: decode_key(&buf[KEY_OFFSET..VALUE_OFFSET])?,
            },
            Tag::GetResult => Message::GetResult { value },
            Tag::PutConfirm => Message::PutConfirm,
            Tag::SizeRequest => Message::SizeRequest,
            Tag::SizeResult => {
                let total = u64::try_from(value).map_err(|_| {
                    DhtError::MalformedMessage(format!("negative size total {value}"))
                })?;
                Message::SizeResult { total }
            }
            Tag::Terminate => Message::Terminate,
        })
    }
}

fn decode_key(buf: &[u8]) -> Result<Key> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| DhtError::MalformedMessage("key buffer is not terminated".into()))?;
    let key = std::str::from_utf8(&buf[..end])
        .map_err(|err| DhtError::MalformedMessage(format!("key is not UTF-8: {err}")))?;
    Key::new(key)
}
