//! Incremental emission of generated text.
//!
//! [`EmissionBuffer`] decides, after every fed fragment, how much of the
//! pending output can be forwarded to a consumer. A byte is held back while
//! it could still belong to an incomplete UTF-8 character or to the start of
//! the stop marker. [`MarkerCollector`] is the non-streaming counterpart and
//! only watches for the marker.

use tracing::{debug, warn};

use crate::marker::MarkerMatcher;
use crate::utf8::{Utf8Tail, utf8_boundary, utf8_tail};

/// Outcome of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Nothing can be released yet.
    Nothing,
    /// A chunk of complete text that is safe to forward.
    Chunk(String),
    /// The stop marker completed. The chunk holds everything before it
    /// (possibly empty) and no further fragments should be fed.
    ChunkThenStop(String),
}

/// Boundary-safe buffer between the detokenizer and the output sink.
#[derive(Debug)]
pub struct EmissionBuffer {
    pending: Vec<u8>,
    total: Vec<u8>,
    marker: MarkerMatcher,
    stopped: bool,
    warned_invalid: bool,
}

impl Default for EmissionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EmissionBuffer {
    /// Create an empty buffer watching for the stop marker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            total: Vec::new(),
            marker: MarkerMatcher::stop(),
            stopped: false,
            warned_invalid: false,
        }
    }

    /// Every byte fed so far, including anything past the marker.
    #[must_use]
    pub fn total(&self) -> &[u8] {
        &self.total
    }

    /// Bytes currently held back.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Whether the stop marker has been seen.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Append `fragment` and release whatever has become safe.
    pub fn feed(&mut self, fragment: &[u8]) -> Emission {
        if self.stopped {
            return Emission::Nothing;
        }

        self.pending.extend_from_slice(fragment);
        self.total.extend_from_slice(fragment);

        if let Some(pos) = self.marker.find_complete(&self.pending) {
            debug!("Found stop marker in pending output at byte {}", pos);
            self.stopped = true;
            let before = String::from_utf8_lossy(&self.pending[..pos]).into_owned();
            self.pending.clear();
            return Emission::ChunkThenStop(before);
        }

        let boundary = utf8_boundary(&self.pending);
        if boundary == 0 {
            self.note_invalid_tail();
            return Emission::Nothing;
        }

        if self.marker.tail_is_marker_prefix(&self.pending[boundary..]) {
            return Emission::Nothing;
        }

        // A marker prefix may also sit inside the complete part.
        let held_start = self.pending.len() - self.marker.partial_suffix_len(&self.pending);
        let cut = boundary.min(held_start);
        if cut == 0 {
            return Emission::Nothing;
        }
        if cut < self.pending.len() {
            self.note_invalid_tail();
        }

        let rest = self.pending.split_off(cut);
        let chunk = std::mem::replace(&mut self.pending, rest);
        match String::from_utf8(chunk) {
            Ok(text) => Emission::Chunk(text),
            Err(err) => Emission::Chunk(String::from_utf8_lossy(err.as_bytes()).into_owned()),
        }
    }

    /// Release everything still held, once generation has ended.
    ///
    /// Bytes that never formed valid UTF-8 are replaced with U+FFFD. Returns
    /// `None` when there is nothing left to emit.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }

        let end = match self.marker.find_complete(&self.pending) {
            Some(pos) => {
                debug!("Found stop marker during final flush at byte {}", pos);
                self.stopped = true;
                pos
            }
            None => self.pending.len(),
        };

        let text = String::from_utf8_lossy(&self.pending[..end]).into_owned();
        self.pending.clear();
        (!text.is_empty()).then_some(text)
    }

    fn note_invalid_tail(&mut self) {
        if !self.warned_invalid && utf8_tail(&self.pending) == Utf8Tail::Invalid {
            warn!("Detokenizer produced invalid UTF-8; holding bytes until the final flush");
            self.warned_invalid = true;
        }
    }
}

/// Accumulates output for the non-streaming path, truncating at the marker.
#[derive(Debug)]
pub struct MarkerCollector {
    total: Vec<u8>,
    marker: MarkerMatcher,
    stop_at: Option<usize>,
}

impl Default for MarkerCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerCollector {
    /// Create an empty collector watching for the stop marker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: Vec::new(),
            marker: MarkerMatcher::stop(),
            stop_at: None,
        }
    }

    /// Append `fragment`. Returns `true` once the marker is complete.
    pub fn push(&mut self, fragment: &[u8]) -> bool {
        if self.stop_at.is_some() {
            return true;
        }
        let searched = self.total.len();
        self.total.extend_from_slice(fragment);
        self.stop_at = self.marker.find_complete_from(&self.total, searched);
        if let Some(pos) = self.stop_at {
            debug!("Found stop marker in collected output at byte {}", pos);
        }
        self.stop_at.is_some()
    }

    /// Every byte pushed so far.
    #[must_use]
    pub fn total(&self) -> &[u8] {
        &self.total
    }

    /// Collected text up to the first marker, decoded lossily.
    #[must_use]
    pub fn text(&self) -> String {
        let end = self.stop_at.unwrap_or(self.total.len());
        String::from_utf8_lossy(&self.total[..end]).into_owned()
    }
}
