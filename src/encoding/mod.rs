//! Deterministic binary encoding for stored range values.
//!
//! This module provides the [`Encode`] and [`Decode`] traits used to lay out
//! the value half of every stored range. The format is owned by Whip, so the
//! bytes on disk never change because a serialization dependency changed.
//!
//! # Wire format
//!
//! | Rust type              | Encoding                                     |
//! |------------------------|----------------------------------------------|
//! | `u8`                   | 1 byte                                       |
//! | `u32`                  | 4 bytes, little-endian                       |
//! | `u64` / `i64`          | 8 bytes, little-endian                       |
//! | `f64`                  | IEEE-754 bits as `u64`                       |
//! | `bool`                 | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; N]`              | `N` raw bytes                                |
//! | `String`               | `[u32 len][utf-8 bytes]`                     |
//! | `Vec<T>`               | `[u32 count][T₁][T₂]…`                      |
//! | `serde_json::Value`    | `[u8 tag][payload]`, see [`value_tag`]       |
//! | `serde_json::Map`      | `[u32 count]([String key][Value])…`          |
//!
//! Map entries are written in the map's iteration order, which is sorted by
//! key for the default `serde_json` map, so equal maps encode to equal bytes.
//!
//! # Framing
//!
//! [`seal`] appends a CRC32 of the payload; [`unseal`] verifies and strips it.
//! Every stored value goes through this pair so corrupt bytes are reported
//! as [`CodecError::ChecksumMismatch`] instead of being decoded into garbage.
//!
//! # Safety limits
//!
//! - [`MAX_BYTE_LEN`]: maximum byte length of a single string (16 MiB).
//! - [`MAX_VEC_ELEMENTS`]: maximum element count of a sequence (1 M).
//! - [`MAX_NESTING`]: maximum nesting depth of a JSON value (64).
//!
//! The limits are enforced on both sides: anything [`Encode`] accepts,
//! [`Decode`] reads back.
//!
//! No function in this module panics on malformed input.

#[cfg(test)]
mod tests;

use crc32fast::Hasher as Crc32;
use serde_json::{Map, Number, Value};
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length of a single string (16 MiB).
pub const MAX_BYTE_LEN: u32 = 16 * 1024 * 1024;

/// Maximum element count of a sequence or map (1 M).
pub const MAX_VEC_ELEMENTS: u32 = 1024 * 1024;

/// Maximum nesting depth of arrays/objects inside a JSON value.
pub const MAX_NESTING: usize = 64;

const CRC_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding stored keys and values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A discriminant byte was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The type being decoded.
        type_name: &'static str,
    },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// A byte sequence decoded as a string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length, count, or nesting depth exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// The stored CRC32 does not match the payload.
    #[error("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch {
        /// Checksum found in the frame.
        stored: u32,
        /// Checksum computed over the payload.
        computed: u32,
    },

    /// A store key had the wrong width.
    #[error("invalid key length {0} (expected 16)")]
    InvalidKeyLength(usize),

    /// Decoding finished with unread bytes left over.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Structurally valid bytes describing an impossible value.
    #[error("{0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations must be deterministic: the same logical value always
/// yields the same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer holding
/// several encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Append the CRC32 of `buf` to `buf`.
pub fn seal(mut buf: Vec<u8>) -> Vec<u8> {
    let checksum = crc32(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// Verify the trailing CRC32 of `frame` and return the payload before it.
pub fn unseal(frame: &[u8]) -> Result<&[u8], CodecError> {
    require(frame, CRC_SIZE)?;
    let (payload, tail) = frame.split_at(frame.len() - CRC_SIZE);
    let (stored, _) = u32::decode_from(tail)?;
    let computed = crc32(payload);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }
    Ok(payload)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        Err(CodecError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Convert a `usize` length to `u32`, failing past `u32::MAX`.
#[inline]
fn len_to_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len)
        .map_err(|_| CodecError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

/// Read a `[u8; N]` from the front of `buf`.
#[inline]
fn take_array<const N: usize>(buf: &[u8]) -> Result<[u8; N], CodecError> {
    require(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    Ok(arr)
}

/// Check an element count against [`MAX_VEC_ELEMENTS`] before writing it.
fn encode_count(len: usize, what: &str, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let count = len_to_u32(len)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(CodecError::LengthOverflow(format!(
            "{what} count {count} exceeds MAX_VEC_ELEMENTS ({MAX_VEC_ELEMENTS})"
        )));
    }
    count.encode_to(buf)
}

fn check_nesting(depth: usize) -> Result<(), CodecError> {
    if depth > MAX_NESTING {
        return Err(CodecError::LengthOverflow(format!(
            "value nesting exceeds MAX_NESTING ({MAX_NESTING})"
        )));
    }
    Ok(())
}

/// Read a count prefix and check it against [`MAX_VEC_ELEMENTS`].
fn decode_count(buf: &[u8], what: &str) -> Result<(usize, usize), CodecError> {
    let (count, consumed) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(CodecError::LengthOverflow(format!(
            "{what} count {count} exceeds MAX_VEC_ELEMENTS ({MAX_VEC_ELEMENTS})"
        )));
    }
    Ok((count as usize, consumed))
}

// ------------------------------------------------------------------------------------------------
// Primitive implementations
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Ok((u32::from_le_bytes(take_array(buf)?), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Ok((u64::from_le_bytes(take_array(buf)?), 8))
    }
}

impl Encode for i64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for i64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Ok((i64::from_le_bytes(take_array(buf)?), 8))
    }
}

impl Encode for f64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.to_bits().encode_to(buf)
    }
}

impl Decode for f64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (bits, n) = u64::decode_from(buf)?;
        Ok((f64::from_bits(bits), n))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Ok((take_array(buf)?, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Strings: [u32 len][utf-8 bytes]
// ------------------------------------------------------------------------------------------------

impl Encode for str {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let len = len_to_u32(self.len())?;
        if len > MAX_BYTE_LEN {
            return Err(CodecError::LengthOverflow(format!(
                "string length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
            )));
        }
        len.encode_to(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.as_str().encode_to(buf)
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (len, offset) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(CodecError::LengthOverflow(format!(
                "string length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
            )));
        }
        let len = len as usize;
        require(&buf[offset..], len)?;
        let s = String::from_utf8(buf[offset..offset + len].to_vec())?;
        Ok((s, offset + len))
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences: [u32 count][T₁][T₂]…
// ------------------------------------------------------------------------------------------------

/// Encode a slice of `T` as `[u32 count][T₁][T₂]…`.
///
/// The element count is capped at [`MAX_VEC_ELEMENTS`].
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), CodecError> {
    encode_count(items.len(), "vector element", buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `Vec<T>` from `[u32 count][T₁][T₂]…`.
///
/// The element count is capped at [`MAX_VEC_ELEMENTS`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), CodecError> {
    let (count, mut offset) = decode_count(buf, "vector element")?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (item, consumed) = T::decode_from(&buf[offset..])?;
        offset += consumed;
        items.push(item);
    }
    Ok((items, offset))
}

// ------------------------------------------------------------------------------------------------
// JSON values
// ------------------------------------------------------------------------------------------------

/// Tag bytes identifying each [`Value`] variant on the wire.
pub mod value_tag {
    /// `null`
    pub const NULL: u8 = 0;
    /// `true` / `false`, followed by a bool byte.
    pub const BOOL: u8 = 1;
    /// Non-negative integer, followed by a `u64`.
    pub const UINT: u8 = 2;
    /// Negative integer, followed by an `i64`.
    pub const INT: u8 = 3;
    /// Finite float, followed by `f64` bits.
    pub const FLOAT: u8 = 4;
    /// String, followed by `[u32 len][utf-8]`.
    pub const STRING: u8 = 5;
    /// Array, followed by `[u32 count][Value]…`.
    pub const ARRAY: u8 = 6;
    /// Object, followed by `[u32 count]([String][Value])…`.
    pub const OBJECT: u8 = 7;
}

impl Encode for Number {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(u) = self.as_u64() {
            value_tag::UINT.encode_to(buf)?;
            u.encode_to(buf)
        } else if let Some(i) = self.as_i64() {
            value_tag::INT.encode_to(buf)?;
            i.encode_to(buf)
        } else if let Some(f) = self.as_f64() {
            value_tag::FLOAT.encode_to(buf)?;
            f.encode_to(buf)
        } else {
            Err(CodecError::Corrupt(format!(
                "number {self} has no 64-bit representation"
            )))
        }
    }
}

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_value(self, buf, 0)
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        decode_value(buf, 0)
    }
}

impl Encode for Map<String, Value> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_map(self, buf, 0)
    }
}

impl Decode for Map<String, Value> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        decode_map(buf, 0)
    }
}

fn encode_value(value: &Value, buf: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
    check_nesting(depth)?;
    match value {
        Value::Null => value_tag::NULL.encode_to(buf),
        Value::Bool(b) => {
            value_tag::BOOL.encode_to(buf)?;
            b.encode_to(buf)
        }
        Value::Number(n) => n.encode_to(buf),
        Value::String(s) => {
            value_tag::STRING.encode_to(buf)?;
            s.encode_to(buf)
        }
        Value::Array(items) => {
            value_tag::ARRAY.encode_to(buf)?;
            encode_count(items.len(), "array element", buf)?;
            for item in items {
                encode_value(item, buf, depth + 1)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            value_tag::OBJECT.encode_to(buf)?;
            encode_map(map, buf, depth + 1)
        }
    }
}

fn encode_map(
    map: &Map<String, Value>,
    buf: &mut Vec<u8>,
    depth: usize,
) -> Result<(), CodecError> {
    encode_count(map.len(), "map entry", buf)?;
    for (key, value) in map {
        key.encode_to(buf)?;
        encode_value(value, buf, depth)?;
    }
    Ok(())
}

fn decode_value(buf: &[u8], depth: usize) -> Result<(Value, usize), CodecError> {
    check_nesting(depth)?;
    let (tag, mut offset) = u8::decode_from(buf)?;
    let value = match tag {
        value_tag::NULL => Value::Null,
        value_tag::BOOL => {
            let (b, n) = bool::decode_from(&buf[offset..])?;
            offset += n;
            Value::Bool(b)
        }
        value_tag::UINT => {
            let (u, n) = u64::decode_from(&buf[offset..])?;
            offset += n;
            Value::Number(u.into())
        }
        value_tag::INT => {
            let (i, n) = i64::decode_from(&buf[offset..])?;
            offset += n;
            Value::Number(i.into())
        }
        value_tag::FLOAT => {
            let (f, n) = f64::decode_from(&buf[offset..])?;
            offset += n;
            let number = Number::from_f64(f)
                .ok_or_else(|| CodecError::Corrupt(format!("non-finite float {f}")))?;
            Value::Number(number)
        }
        value_tag::STRING => {
            let (s, n) = String::decode_from(&buf[offset..])?;
            offset += n;
            Value::String(s)
        }
        value_tag::ARRAY => {
            let (count, n) = decode_count(&buf[offset..], "array element")?;
            offset += n;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let (item, n) = decode_value(&buf[offset..], depth + 1)?;
                offset += n;
                items.push(item);
            }
            Value::Array(items)
        }
        value_tag::OBJECT => {
            let (map, n) = decode_map(&buf[offset..], depth + 1)?;
            offset += n;
            Value::Object(map)
        }
        other => {
            return Err(CodecError::InvalidTag {
                tag: u32::from(other),
                type_name: "Value",
            });
        }
    };
    Ok((value, offset))
}

fn decode_map(buf: &[u8], depth: usize) -> Result<(Map<String, Value>, usize), CodecError> {
    let (count, mut offset) = decode_count(buf, "map entry")?;
    let mut map = Map::new();
    for _ in 0..count {
        let (key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = decode_value(&buf[offset..], depth)?;
        offset += n;
        map.insert(key, value);
    }
    Ok((map, offset))
}
