//! Literal marker detection over byte buffers.

/// ChatML end-of-turn marker. Output is truncated immediately before it.
pub const STOP_MARKER: &str = "<|im_end|>";

/// ChatML start-of-turn marker. Seeing it after the lead-in means the model
/// began writing the next turn.
pub const ROLE_SWITCH_MARKER: &str = "<|im_start|>";

/// Matches a fixed literal against accumulated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerMatcher {
    marker: &'static [u8],
}

impl MarkerMatcher {
    /// Create a matcher for `marker`.
    #[must_use]
    pub const fn new(marker: &'static str) -> Self {
        Self {
            marker: marker.as_bytes(),
        }
    }

    /// Matcher for [`STOP_MARKER`].
    #[must_use]
    pub const fn stop() -> Self {
        Self::new(STOP_MARKER)
    }

    /// Matcher for [`ROLE_SWITCH_MARKER`].
    #[must_use]
    pub const fn role_switch() -> Self {
        Self::new(ROLE_SWITCH_MARKER)
    }

    /// The marker bytes.
    #[must_use]
    pub fn marker(&self) -> &'static [u8] {
        self.marker
    }

    /// Byte offset of the first full occurrence of the marker in `haystack`.
    #[must_use]
    pub fn find_complete(&self, haystack: &[u8]) -> Option<usize> {
        if self.marker.is_empty() || haystack.len() < self.marker.len() {
            return None;
        }
        haystack
            .windows(self.marker.len())
            .position(|window| window == self.marker)
    }

    /// Like [`find_complete`](Self::find_complete), but only reports
    /// occurrences that include at least one byte at or after `from`.
    ///
    /// Used when the haystack only grows at the end, so earlier bytes have
    /// already been searched.
    #[must_use]
    pub fn find_complete_from(&self, haystack: &[u8], from: usize) -> Option<usize> {
        let start = from.saturating_sub(self.marker.len().saturating_sub(1));
        let start = start.min(haystack.len());
        self.find_complete(&haystack[start..])
            .map(|offset| start + offset)
    }

    /// Whether `tail` is a non-empty strict prefix of the marker, i.e. more
    /// bytes could still complete the marker starting at `tail`.
    #[must_use]
    pub fn tail_is_marker_prefix(&self, tail: &[u8]) -> bool {
        !tail.is_empty() && tail.len() < self.marker.len() && self.marker.starts_with(tail)
    }

    /// Length of the longest suffix of `buffer` that is a strict prefix of
    /// the marker, or zero.
    #[must_use]
    pub fn partial_suffix_len(&self, buffer: &[u8]) -> usize {
        let longest = self.marker.len().saturating_sub(1).min(buffer.len());
        (1..=longest)
            .rev()
            .find(|&len| buffer.ends_with(&self.marker[..len]))
            .unwrap_or(0)
    }
}
