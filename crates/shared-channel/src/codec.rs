//! Encoding of a UTF-8 string into the fixed value region.

use crate::ChannelError;

/// Copy `value` into the start of `buffer`, returning the byte length written.
///
/// The value must be strictly shorter than the buffer. Oversized values are
/// rejected rather than truncated, and the buffer is left untouched.
pub fn encode(value: &str, buffer: &mut [u8]) -> Result<usize, ChannelError> {
    let bytes = value.as_bytes();
    if bytes.len() >= buffer.len() {
        return Err(ChannelError::CapacityExceeded {
            len: bytes.len(),
            capacity: buffer.len(),
        });
    }
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Read exactly `length` bytes from the start of `buffer` as UTF-8.
///
/// Whatever follows those bytes is stale data from earlier writes and is
/// ignored.
pub fn decode(buffer: &[u8], length: usize) -> Result<String, ChannelError> {
    let bytes = buffer.get(..length).ok_or(ChannelError::OutOfBounds {
        length,
        capacity: buffer.len(),
    })?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| ChannelError::InvalidUtf8(e.to_string()))
}
