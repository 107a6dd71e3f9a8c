//! UTF-8 boundary scanning over accumulated token bytes.
//!
//! Detokenizers hand back raw bytes, and a single character may straddle
//! two or more fragments. Before anything is forwarded to a consumer the
//! pending bytes are split at the last complete character.

/// What follows the complete prefix of a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Tail {
    /// The whole buffer is valid UTF-8.
    Empty,
    /// The buffer ends in the first bytes of a character; more input may complete it.
    Incomplete,
    /// The buffer contains a byte that can never start or continue a character here.
    Invalid,
}

/// Length of the longest prefix of `bytes` consisting of complete,
/// well-formed UTF-8 characters.
///
/// Scanning stops immediately before the first byte that cannot be part of
/// a well-formed character at its position (a stray continuation byte, an
/// invalid lead byte, an overlong or surrogate encoding) or before a
/// character whose remaining bytes have not arrived yet.
#[must_use]
pub fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => e.valid_up_to(),
    }
}

/// Classify the bytes that [`utf8_boundary`] leaves behind.
#[must_use]
pub fn utf8_tail(bytes: &[u8]) -> Utf8Tail {
    match std::str::from_utf8(bytes) {
        Ok(_) => Utf8Tail::Empty,
        Err(e) if e.error_len().is_none() => Utf8Tail::Incomplete,
        Err(_) => Utf8Tail::Invalid,
    }
}
