//! Audio buffering: the lock-free capture ring and the rolling stereo window.
//!
//! Two distinct buffers live here:
//! - An SPSC `ringbuf` ring carrying raw interleaved i16 samples from the
//!   real-time capture callback to the engine thread. `push_slice` is
//!   wait-free and allocation-free, safe inside the audio callback.
//! - [`StereoRing`], the fixed-duration drop-oldest window of normalized
//!   samples the engine maintains. Mutated only by the engine's own thread,
//!   so it needs no internal locking.

pub mod window;

use std::collections::VecDeque;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

use window::AudioWindow;

/// Producer half of the capture ring — held by the audio callback.
pub type CaptureProducer = ringbuf::HeapProd<i16>;

/// Consumer half of the capture ring — held by the engine thread.
pub type CaptureConsumer = ringbuf::HeapCons<i16>;

/// Capture ring capacity: 2^19 = 524 288 interleaved i16 samples ≈ 16 s of
/// stereo at 16 kHz. Covers the brief halt during a snapshot swap without the
/// callback dropping frames.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 19;

/// Create a matched producer/consumer pair for the capture callback.
pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<i16>::new(CAPTURE_RING_CAPACITY).split()
}

/// Fixed-capacity, time-ordered rolling window of stereo samples.
///
/// Strict FIFO with drop-oldest semantics, synchronized across channels:
/// once at capacity, every push evicts exactly one oldest pair before the new
/// pair is appended. Channel lengths are equal at all times.
#[derive(Debug)]
pub struct StereoRing {
    left: VecDeque<i16>,
    right: VecDeque<i16>,
    capacity: usize,
    sample_rate: u32,
}

impl StereoRing {
    /// `capacity` is in samples per channel.
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            left: VecDeque::with_capacity(capacity),
            right: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate,
        }
    }

    /// Append one stereo pair, evicting the oldest pair first if at capacity.
    pub fn push(&mut self, left: i16, right: i16) {
        if self.left.len() >= self.capacity {
            self.left.pop_front();
            self.right.pop_front();
        }
        self.left.push_back(left);
        self.right.push_back(right);
    }

    /// Samples currently buffered per channel.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.left.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy the current contents into an immutable [`AudioWindow`].
    ///
    /// Non-destructive: the ring keeps sliding afterwards, so repeated
    /// snapshots of a full ring each see five fresh seconds of audio.
    pub fn snapshot(&self) -> AudioWindow {
        AudioWindow::new(
            self.left.iter().copied().collect(),
            self.right.iter().copied().collect(),
            self.sample_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_lengths_stay_equal_through_pushes() {
        let mut ring = StereoRing::new(4, 16_000);
        for i in 0..10i16 {
            ring.push(i, -i);
            assert_eq!(ring.len(), ring.snapshot().right().len());
        }
    }

    #[test]
    fn never_exceeds_capacity_and_evicts_exactly_one_pair() {
        let mut ring = StereoRing::new(3, 16_000);
        ring.push(1, 10);
        ring.push(2, 20);
        ring.push(3, 30);
        assert!(ring.is_full());

        ring.push(4, 40);
        assert_eq!(ring.len(), 3);

        let window = ring.snapshot();
        assert_eq!(window.left(), &[2, 3, 4]);
        assert_eq!(window.right(), &[20, 30, 40]);
    }

    #[test]
    fn snapshot_does_not_mutate_the_ring() {
        let mut ring = StereoRing::new(2, 16_000);
        ring.push(7, 8);
        let first = ring.snapshot();
        let second = ring.snapshot();
        assert_eq!(first.left(), second.left());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn snapshot_carries_the_sample_rate() {
        let mut ring = StereoRing::new(2, 44_100);
        ring.push(0, 0);
        assert_eq!(ring.snapshot().sample_rate(), 44_100);
    }

    #[test]
    fn capture_ring_round_trips_interleaved_samples() {
        let (mut producer, mut consumer) = create_capture_ring();
        let written = producer.push_slice(&[1i16, -1, 2, -2]);
        assert_eq!(written, 4);

        let mut out = [0i16; 4];
        let read = consumer.pop_slice(&mut out);
        assert_eq!(read, 4);
        assert_eq!(out, [1, -1, 2, -2]);
    }
}
