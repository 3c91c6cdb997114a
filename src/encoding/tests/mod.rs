
use crate::encoding::{CodecError, Encode};

/// Encodes `value` into a fresh buffer.
fn encode<T: Encode + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}
