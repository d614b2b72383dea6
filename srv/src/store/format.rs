//! Record format module.
//!
//! Every record is laid out as (all integers little-endian):
//!
//! ```text
//! total_size : u32   // size of everything that follows
//! key_len    : u32
//! key        : key_len bytes
//! value_len  : u32
//! value      : value_len bytes
//! ```

use std::fmt::Display;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Size of one length field.
pub const LEN_SIZE: usize = 4;

/// Fixed overhead of one record: `total_size`, `key_len` and `value_len`.
pub const HEADER_SIZE: usize = 3 * LEN_SIZE;

/// Smallest legal `total_size`: an empty key and an empty value.
pub const MIN_BODY_SIZE: u32 = 2 * LEN_SIZE as u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("record needs {needed} bytes, only {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("declared record size {declared} does not match body of {actual} bytes")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("invalid utf-8 in record")]
    InvalidUtf8(#[from] FromUtf8Error),
}

/// Key value pair as stored in a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Exact number of bytes `encode` produces.
    pub fn size(&self) -> u64 {
        record_length(&self.key, &self.value)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.key, &self.value)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        decode(bytes)
    }
}

impl Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Entry(key='{}', value_len={}, size={})",
            self.key,
            self.value.len(),
            self.size()
        )
    }
}

pub fn record_length(key: &str, value: &str) -> u64 {
    (HEADER_SIZE + key.len() + value.len()) as u64
}

/// Serialize one record. Callers bound key and value sizes so every
/// length fits in a `u32`.
pub fn encode(key: &str, value: &str) -> Vec<u8> {
    let (key, value) = (key.as_bytes(), value.as_bytes());
    let body_size = 2 * LEN_SIZE + key.len() + value.len();

    let mut buf = Vec::with_capacity(LEN_SIZE + body_size);
    buf.extend_from_slice(&(body_size as u32).to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Parse one complete record, length prefix included.
pub fn decode(bytes: &[u8]) -> Result<Entry, FormatError> {
    let declared = read_u32(bytes, 0)?;
    let body = &bytes[LEN_SIZE..];
    if declared as usize != body.len() || declared < MIN_BODY_SIZE {
        return Err(FormatError::SizeMismatch {
            declared,
            actual: body.len(),
        });
    }

    let key_len = read_u32(body, 0)? as usize;
    let key = field(body, LEN_SIZE, key_len)?;

    let value_at = LEN_SIZE + key_len;
    let value_len = read_u32(body, value_at)? as usize;
    let value = field(body, value_at + LEN_SIZE, value_len)?;

    let consumed = value_at + LEN_SIZE + value_len;
    if consumed != body.len() {
        return Err(FormatError::SizeMismatch {
            declared,
            actual: consumed,
        });
    }

    Ok(Entry {
        key: String::from_utf8(key.to_vec())?,
        value: String::from_utf8(value.to_vec())?,
    })
}

/// Read the `total_size` prefix of a record.
pub fn body_size(prefix: [u8; LEN_SIZE]) -> u32 {
    u32::from_le_bytes(prefix)
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, FormatError> {
    let bytes = field(buf, at, LEN_SIZE)?;
    let mut raw = [0u8; LEN_SIZE];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

fn field(buf: &[u8], at: usize, len: usize) -> Result<&[u8], FormatError> {
    let end = at.checked_add(len).filter(|end| *end <= buf.len());
    match end {
        Some(end) => Ok(&buf[at..end]),
        None => Err(FormatError::Truncated {
            needed: at.saturating_add(len),
            available: buf.len(),
        }),
    }
}
