//! Key and payload encoding
//!
//! Keys are a pure function of the working-set index so the populate and
//! query phases agree on them across runs. Payloads start with a fixed
//! 16-byte header (element slot, then index, both little-endian) and are
//! zero-filled to the configured value size.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

/// Inline key buffer; both encodings fit without spilling.
pub type KeyBuf = SmallVec<[u8; 32]>;

/// Prefix of the textual key format
const TEXT_KEY_PREFIX: &[u8] = b"my-key-0x";

/// Length of the payload header
pub const PAYLOAD_HEADER_LEN: usize = 16;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// How a working-set index is turned into key bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyEncoding {
    /// The index as 8 little-endian bytes
    #[default]
    Binary,
    /// `my-key-0x` followed by the index as 16 lowercase hex digits
    Text,
}

impl KeyEncoding {
    /// Encoded key length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            KeyEncoding::Binary => 8,
            KeyEncoding::Text => TEXT_KEY_PREFIX.len() + 16,
        }
    }

    /// Encode `index` as a key
    pub fn encode(self, index: u64) -> KeyBuf {
        match self {
            KeyEncoding::Binary => SmallVec::from_slice(&index.to_le_bytes()),
            KeyEncoding::Text => {
                let mut key = KeyBuf::new();
                key.extend_from_slice(TEXT_KEY_PREFIX);
                for shift in (0..16).rev() {
                    key.push(HEX[((index >> (shift * 4)) & 0xF) as usize]);
                }
                key
            }
        }
    }
}

impl fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyEncoding::Binary => write!(f, "binary"),
            KeyEncoding::Text => write!(f, "text"),
        }
    }
}

impl FromStr for KeyEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(KeyEncoding::Binary),
            "text" | "hex" => Ok(KeyEncoding::Text),
            other => Err(format!("unknown key encoding '{}'", other)),
        }
    }
}

/// Identity carried at the front of every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Element array slot for this item
    pub slot: u64,
    /// Working-set index the item was populated for
    pub index: u64,
}

/// Fill `payload` for `index`: header first, zeroes after.
///
/// Payloads shorter than the header are zero-filled only.
pub fn write_payload(payload: &mut [u8], header: PayloadHeader) {
    payload.fill(0);
    if payload.len() >= PAYLOAD_HEADER_LEN {
        payload[..8].copy_from_slice(&header.slot.to_le_bytes());
        payload[8..PAYLOAD_HEADER_LEN].copy_from_slice(&header.index.to_le_bytes());
    }
}

/// Read the header back, or `None` if the payload is too short.
pub fn read_payload(payload: &[u8]) -> Option<PayloadHeader> {
    if payload.len() < PAYLOAD_HEADER_LEN {
        return None;
    }
    let mut slot = [0u8; 8];
    let mut index = [0u8; 8];
    slot.copy_from_slice(&payload[..8]);
    index.copy_from_slice(&payload[8..PAYLOAD_HEADER_LEN]);
    Some(PayloadHeader {
        slot: u64::from_le_bytes(slot),
        index: u64::from_le_bytes(index),
    })
}
