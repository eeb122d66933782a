use crate::error::{Result, SaberError};

/// Decode a hex string into bytes
///
/// Each pair of hex digits becomes one byte. Upper and lower case digits
/// are accepted.
///
/// # Errors
///
/// Returns [`SaberError::InvalidHex`] if the string has odd length or
/// contains a non-hex character.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(SaberError::InvalidHex(format!(
            "odd length {} in {hex:?}",
            hex.len()
        )));
    }

    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let high = nibble(pair[0]);
            let low = nibble(pair[1]);
            match (high, low) {
                (Some(high), Some(low)) => Ok((high << 4) | low),
                _ => Err(SaberError::InvalidHex(format!(
                    "non-hex digit in {hex:?}"
                ))),
            }
        })
        .collect()
}

/// Encode bytes as lowercase hex
///
/// Accepts signed or unsigned bytes. Values are first normalized into the
/// unsigned range `[0, 255]`, so `-1i8` encodes as `"ff"`.
pub fn bytes_to_hex<T>(bytes: &[T]) -> String
where
    T: Copy + Into<i16>,
{
    bytes
        .iter()
        .map(|&byte| format!("{:02x}", normalize(byte.into())))
        .collect()
}

fn normalize(value: i16) -> u8 {
    // rem_euclid keeps the result in 0..256
    u8::try_from(value.rem_euclid(256)).unwrap_or_default()
}

const fn nibble(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
