//! Immutable snapshot of buffered stereo audio handed to the upload path.

/// A fixed instant-in-time copy of the rolling capture window.
///
/// Created by the capture engine (buffer-full flush or hot-swap snapshot),
/// consumed exactly once by the upload dispatcher, then dropped. It never
/// aliases the live ring buffer.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    left: Vec<i16>,
    right: Vec<i16>,
    sample_rate: u32,
}

impl AudioWindow {
    /// Both channels must be index-aligned: sample `i` of `left` and `right`
    /// were captured at the same instant.
    pub fn new(left: Vec<i16>, right: Vec<i16>, sample_rate: u32) -> Self {
        debug_assert_eq!(left.len(), right.len());
        Self {
            left,
            right,
            sample_rate,
        }
    }

    pub fn left(&self) -> &[i16] {
        &self.left
    }

    pub fn right(&self) -> &[i16] {
        &self.right
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.left.len() as f64 / self.sample_rate as f64
    }
}
