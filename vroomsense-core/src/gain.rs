//! Closed-loop target-RMS gain normalization.
//!
//! ## Algorithm (per channel)
//!
//! 1. Every sample is multiplied by a fixed base gain and clipped to the
//!    16-bit range.
//! 2. `sample² / 32768²` accumulates into a running RMS estimator.
//! 3. When one second of audio has accumulated, the channel gain is
//!    recalculated as `min(target_rms / max(rms, ε), max_gain)` and applied
//!    to the whole current (already base-amplified) chunk, then the
//!    estimator resets.
//!
//! The recalculated gain applies to a full chunk at once rather than ramping
//! per sample, so a gain step can be audible at window boundaries. That batch
//! cadence is intentional and must not be smoothed — it is the audible
//! behavior the rest of the system is tuned against.

const I16_FULL_SCALE: f64 = 32_768.0;

/// Floor under the measured RMS so silent windows cannot divide by zero.
const RMS_EPSILON: f64 = 1e-9;

fn clip(value: f64) -> i16 {
    value.clamp(-32_768.0, 32_767.0) as i16
}

/// Adaptive gain state for a single channel.
#[derive(Debug, Clone)]
pub struct ChannelGain {
    base_gain: f64,
    target_rms: f64,
    max_gain: f64,
    rms_window: usize,
    accumulator: f64,
    count: usize,
}

impl ChannelGain {
    pub fn new(base_gain: f64, target_rms: f64, max_gain: f64, rms_window: usize) -> Self {
        Self {
            base_gain,
            target_rms,
            max_gain,
            rms_window: rms_window.max(1),
            accumulator: 0.0,
            count: 0,
        }
    }

    /// Gain-adjust one chunk in place.
    ///
    /// Returns the recalculated window gain when this chunk crossed an RMS
    /// window boundary, `None` otherwise. The count never exceeds the window
    /// size: the reset is forced the moment the boundary is reached, even
    /// mid-chunk.
    pub fn process(&mut self, samples: &mut [i16]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }

        let mut window_gain = None;
        for sample in samples.iter_mut() {
            *sample = clip(f64::from(*sample) * self.base_gain);

            let normalized = f64::from(*sample) / I16_FULL_SCALE;
            self.accumulator += normalized * normalized;
            self.count += 1;

            if self.count >= self.rms_window {
                let rms = (self.accumulator / self.count as f64).sqrt();
                let gain = (self.target_rms / rms.max(RMS_EPSILON)).min(self.max_gain);
                window_gain = Some(gain);
                self.accumulator = 0.0;
                self.count = 0;
            }
        }

        if let Some(gain) = window_gain {
            for sample in samples.iter_mut() {
                *sample = clip(f64::from(*sample) * gain);
            }
        }

        window_gain
    }

    /// Discard accumulated RMS state (e.g. when a new engine generation starts).
    pub fn reset(&mut self) {
        self.accumulator = 0.0;
        self.count = 0;
    }
}

/// Paired per-channel gain stages for a stereo stream.
#[derive(Debug, Clone)]
pub struct GainNormalizer {
    left: ChannelGain,
    right: ChannelGain,
}

impl GainNormalizer {
    pub fn new(base_gain: f64, target_rms: f64, max_gain: f64, rms_window: usize) -> Self {
        Self {
            left: ChannelGain::new(base_gain, target_rms, max_gain, rms_window),
            right: ChannelGain::new(base_gain, target_rms, max_gain, rms_window),
        }
    }

    /// Process both channels of one de-interleaved chunk.
    ///
    /// Returns `(left_window_gain, right_window_gain)` — `Some` only when the
    /// respective channel crossed an RMS window boundary in this chunk.
    pub fn process(&mut self, left: &mut [i16], right: &mut [i16]) -> (Option<f64>, Option<f64>) {
        (self.left.process(left), self.right.process(right))
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }
}
