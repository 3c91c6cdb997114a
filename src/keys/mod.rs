//! Store keys for stored ranges.
//!
//! A stored range is keyed by its **end** address, written as 16 big-endian
//! bytes. Byte order of keys therefore equals numeric order of addresses,
//! and a forward seek to `encode_key(addr)` positions the store at the first
//! range with `end >= addr`: the only range that can contain `addr`.
//! Whether it actually does is decided by the `begin` carried in the value.

use crate::address::Address;
use crate::encoding::CodecError;

/// Width of every store key in bytes.
pub const KEY_LEN: usize = 16;

/// Encodes an address as a fixed-width, lexicographically ordered key.
pub fn encode_key(addr: Address) -> [u8; KEY_LEN] {
    addr.value().to_be_bytes()
}

/// Decodes a key produced by [`encode_key`].
pub fn decode_key(key: &[u8]) -> Result<Address, CodecError> {
    let bytes: [u8; KEY_LEN] = key
        .try_into()
        .map_err(|_| CodecError::InvalidKeyLength(key.len()))?;
    Ok(Address::new(u128::from_be_bytes(bytes)))
}

/// Human-readable form of a raw key for error messages and logs.
///
/// Well-formed keys print as the address they encode; anything else as hex.
pub fn describe_key(key: &[u8]) -> String {
    match decode_key(key) {
        Ok(addr) => addr.to_string(),
        Err(_) => key.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
