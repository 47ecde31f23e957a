//! `CaptureEngine` — one microphone generation.
//!
//! ## Capture loop (per iteration)
//!
//! ```text
//! 1. Read one interleaved chunk from the SampleSource (bounded wait)
//! 2. De-interleave into left/right
//! 3. GainNormalizer: base gain + once-per-second adaptive window gain
//! 4. Push pairs into the rolling StereoRing (drop-oldest)
//! 5. Ring at capacity → submit a snapshot to the UploadSink (streaming flush)
//! ```
//!
//! The whole loop runs in `spawn_blocking`, keeping the tokio executor free
//! for the upload path. cpal streams are `!Send`, so the source is created
//! *inside* the blocking closure via the `SourceFactory`; a sync mpsc channel
//! carries open success/failure back to `spawn()`.
//!
//! ## Hot-swap protocol
//!
//! Snapshot swaps need the buffered window out of a live engine without a
//! capture gap. `halt()` stops the loop and receives the materialized final
//! window while the thread parks with the device still open; `release()`
//! unparks it to drop the device. The session controller starts the
//! replacement engine between those two calls.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{ReadOutcome, SourceFactory},
    buffering::{window::AudioWindow, StereoRing},
    error::{Result, VroomError},
    events::LevelEvent,
    gain::GainNormalizer,
    upload::UploadSink,
};

/// Frames (stereo pairs) requested from the source per iteration.
/// 960 frames = 60 ms at 16 kHz.
const READ_CHUNK_FRAMES: usize = 960;

/// Sleep when the source has nothing (avoids busy-wait burning a core).
const EMPTY_SLEEP_MS: u64 = 5;

/// How long a halted thread holds the device waiting for `release()`.
/// An abandoned engine frees the device after this bound regardless.
const RELEASE_WAIT: Duration = Duration::from_secs(5);

/// Samples per channel between level-meter emissions.
const LEVEL_MONITOR_INTERVAL: usize = 100;

/// Immutable tuning knobs, built once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Capture sample rate in Hz. Default: 16000.
    pub sample_rate: u32,
    /// Rolling window duration per channel in seconds. Default: 5.
    pub window_seconds: u32,
    /// Samples per adaptive-gain RMS estimation window (one second of audio).
    pub rms_window_size: usize,
    /// Fixed multiplier applied to every raw sample. Default: 50.0.
    pub base_gain: f64,
    /// Upper bound on the adaptive window gain. Default: 100.0.
    pub max_gain: f64,
    /// RMS level the adaptive gain steers toward. Default: 0.95.
    pub target_rms: f64,
    /// Period of the non-destructive snapshot tick while recording.
    pub snapshot_interval: Duration,
    /// Confidence above which a notify decision is forced even when the
    /// server said no. Default: 0.97 — hard business rule.
    pub confidence_override: f64,
    /// Consecutive quiet results after which user-visible quiet
    /// notifications are suppressed. Default: 2.
    pub max_quiet_notifications: u32,
    /// Bound on the finalize network round trip (and the HTTP client
    /// timeouts). Default: 30 s.
    pub finalize_timeout: Duration,
    /// Streaming-flush endpoint (raw PCM channels).
    pub predict_url: String,
    /// Snapshot/finalize endpoint (WAV container).
    pub snapshot_url: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window_seconds: 5,
            rms_window_size: 16_000,
            base_gain: 50.0,
            max_gain: 100.0,
            target_rms: 0.95,
            snapshot_interval: Duration::from_secs(3),
            confidence_override: 0.97,
            max_quiet_notifications: 2,
            finalize_timeout: Duration::from_secs(30),
            predict_url: "http://211.211.177.45:8017/predict".into(),
            snapshot_url: "http://211.211.177.45:8017/test".into(),
        }
    }
}

impl CaptureConfig {
    /// Rolling window capacity in samples per channel.
    pub fn window_capacity(&self) -> usize {
        self.sample_rate as usize * self.window_seconds as usize
    }
}

/// A running capture generation.
///
/// Exactly one is alive per recording session at any instant; the session
/// controller swaps whole engines rather than mutating one in place.
#[derive(Debug)]
pub struct CaptureEngine {
    generation: u64,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    final_rx: Receiver<AudioWindow>,
    release_tx: Sender<()>,
    fault_rx: Receiver<VroomError>,
}

impl CaptureEngine {
    /// Spawn the capture loop. Blocks until the source is confirmed open
    /// (or failed), then returns; the loop continues on a blocking thread.
    pub(crate) fn spawn(
        config: &CaptureConfig,
        generation: u64,
        sources: Arc<dyn SourceFactory>,
        sink: Arc<dyn UploadSink>,
        level_tx: broadcast::Sender<LevelEvent>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (final_tx, final_rx) = bounded::<AudioWindow>(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let (fault_tx, fault_rx) = bounded::<VroomError>(1);

        let config = config.clone();
        let loop_running = Arc::clone(&running);

        tokio::task::spawn_blocking(move || {
            // Source must be created on this thread — cpal streams are !Send.
            let mut source = match sources.create() {
                Ok(source) => {
                    let _ = open_tx.send(Ok(source.sample_rate()));
                    source
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            let sample_rate = source.sample_rate();
            let mut ring = StereoRing::new(config.window_capacity(), sample_rate);
            let mut gains = GainNormalizer::new(
                config.base_gain,
                config.target_rms,
                config.max_gain,
                config.rms_window_size,
            );
            let mut left: Vec<i16> = Vec::with_capacity(READ_CHUNK_FRAMES);
            let mut right: Vec<i16> = Vec::with_capacity(READ_CHUNK_FRAMES);
            let mut meter = LevelMeter::new(LEVEL_MONITOR_INTERVAL);

            loop {
                if !loop_running.load(Ordering::Relaxed) {
                    break;
                }

                let chunk = match source.read_chunk(READ_CHUNK_FRAMES) {
                    Ok(ReadOutcome::Frames(chunk)) => chunk,
                    Ok(ReadOutcome::WouldBlock) => {
                        std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
                        continue;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(generation, error = %e, "transient capture read error");
                        continue;
                    }
                    Err(e) => {
                        error!(generation, error = %e, "fatal capture error — stopping engine");
                        let _ = fault_tx.try_send(e);
                        break;
                    }
                };

                left.clear();
                right.clear();
                for pair in chunk.chunks_exact(2) {
                    left.push(pair[0]);
                    right.push(pair[1]);
                }

                let (left_gain, right_gain) = gains.process(&mut left, &mut right);
                if left_gain.is_some() || right_gain.is_some() {
                    debug!(
                        generation,
                        left_gain = left_gain.unwrap_or(0.0),
                        right_gain = right_gain.unwrap_or(0.0),
                        "adaptive window gain recalculated"
                    );
                }

                for (&l, &r) in left.iter().zip(right.iter()) {
                    ring.push(l, r);
                    meter.record(l, r, &level_tx);
                }

                // Continuous-upload flow: once full, the ring keeps sliding
                // and every chunk triggers a fresh flush of the last window.
                if ring.is_full() {
                    sink.submit_stream(ring.snapshot());
                }
            }

            // Materialize the final window for halt()/finalize, then park
            // with the device open until the controller releases us.
            let _ = final_tx.try_send(ring.snapshot());
            if release_rx.recv_timeout(RELEASE_WAIT).is_err() {
                debug!(generation, "release signal never arrived — dropping source anyway");
            }
            drop(source);
            info!(generation, "capture engine exited");
        });

        match open_rx.recv() {
            Ok(Ok(sample_rate)) => {
                info!(generation, sample_rate, "capture engine started");
                Ok(Self {
                    generation,
                    sample_rate,
                    running,
                    final_rx,
                    release_tx,
                    fault_rx,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VroomError::FatalCapture(
                "capture task died before opening the device".into(),
            )),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// A fatal capture error reported by the loop, if any.
    pub fn fault(&self) -> Option<VroomError> {
        self.fault_rx.try_recv().ok()
    }

    /// Stop the capture loop and receive the materialized final window.
    ///
    /// The device stays open until [`release`](Self::release) so a
    /// replacement engine can be started before this one lets go.
    pub fn halt(&self, timeout: Duration) -> Result<AudioWindow> {
        self.running.store(false, Ordering::SeqCst);
        self.final_rx.recv_timeout(timeout).map_err(|_| {
            VroomError::FatalCapture("capture thread did not deliver a final window".into())
        })
    }

    /// Let the capture thread drop the device and exit.
    pub fn release(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.release_tx.try_send(());
    }
}

/// Mean-absolute level meter, emitting every `interval` samples.
struct LevelMeter {
    interval: usize,
    count: usize,
    left_sum: f32,
    right_sum: f32,
    seq: u64,
}

impl LevelMeter {
    fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            count: 0,
            left_sum: 0.0,
            right_sum: 0.0,
            seq: 0,
        }
    }

    fn record(&mut self, left: i16, right: i16, tx: &broadcast::Sender<LevelEvent>) {
        self.left_sum += f32::from(left).abs();
        self.right_sum += f32::from(right).abs();
        self.count += 1;

        if self.count >= self.interval {
            let event = LevelEvent {
                seq: self.seq,
                left: self.left_sum / self.count as f32,
                right: self.right_sum / self.count as f32,
            };
            self.seq = self.seq.saturating_add(1);
            let _ = tx.send(event);
            self.count = 0;
            self.left_sum = 0.0;
            self.right_sum = 0.0;
        }
    }
}
