//! Audio capture sources.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate after warm-up, block on a mutex, or perform I/O.
//! The callback therefore only converts frames to interleaved stereo i16 and
//! writes them into a lock-free SPSC ring; the engine thread drains the ring
//! through [`SampleSource::read_chunk`].
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). Sources are therefore created *on the engine thread* via
//! [`SourceFactory`], which is the only part of this module that crosses
//! thread boundaries.

use std::time::Duration;

use crate::error::{Result, VroomError};

/// One read from a capture source.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Interleaved stereo samples: `[l0, r0, l1, r1, ...]`, always an even count.
    Frames(Vec<i16>),
    /// No data arrived within the bounded wait; try again.
    WouldBlock,
}

/// A raw interleaved-stereo PCM stream delivered in chunks.
///
/// Errors split along the recovery boundary: `TransientRead` means the caller
/// should log and keep reading; `FatalCapture` means the device is gone and
/// the engine must stop. Closing the device is `Drop`.
pub trait SampleSource: 'static {
    /// Actual capture sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Blocking read with a bounded wait. Returns at most `max_frames`
    /// stereo frames (`2 * max_frames` interleaved samples).
    fn read_chunk(&mut self, max_frames: usize) -> Result<ReadOutcome>;
}

/// Creates capture sources on demand.
///
/// Every engine generation gets a fresh source; the factory itself is shared
/// across threads while the sources it creates stay on the engine thread.
pub trait SourceFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Box<dyn SampleSource>>;
}

/// How long a `read_chunk` waits for data before reporting `WouldBlock`.
const READ_WAIT: Duration = Duration::from_millis(5);

#[cfg(feature = "audio-cpal")]
pub use mic::{MicSource, MicSourceFactory};

#[cfg(feature = "audio-cpal")]
mod mic {
    use std::sync::Arc;

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, SampleRate, Stream, StreamConfig,
    };
    use parking_lot::Mutex;
    use tracing::{error, info, warn};

    use super::{ReadOutcome, SampleSource, SourceFactory, READ_WAIT};
    use crate::buffering::{create_capture_ring, CaptureConsumer, CaptureProducer, Consumer, Producer};
    use crate::error::{Result, VroomError};

    /// Microphone-backed capture source.
    ///
    /// **Not `Send`** — owns a `cpal::Stream`. Create and drop on the same
    /// OS thread (the engine thread does both).
    pub struct MicSource {
        /// Kept alive so the stream is not dropped prematurely.
        _stream: Stream,
        consumer: CaptureConsumer,
        /// Set by the cpal error callback; surfaced as `FatalCapture`.
        fault: Arc<Mutex<Option<String>>>,
        /// Odd trailing sample held back so reads always return whole pairs.
        carry: Option<i16>,
        sample_rate: u32,
    }

    impl MicSource {
        /// Open the default input device at `requested_rate` in stereo.
        ///
        /// If the stereo config is rejected, falls back once to the device's
        /// own default config before failing (`DeviceInit`).
        pub fn open(requested_rate: u32) -> Result<Self> {
            let host = cpal::default_host();
            let device = if let Some(default) = host.default_input_device() {
                default
            } else {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| map_device_error(e.to_string()))?;
                let fallback = devices
                    .next()
                    .ok_or_else(|| VroomError::DeviceInit("no input device found".into()))?;
                warn!("no default input device, falling back to first available input");
                fallback
            };

            info!(
                device = device.name().unwrap_or_default().as_str(),
                "opening input device"
            );

            let supported = device
                .default_input_config()
                .map_err(|e| map_device_error(e.to_string()))?;
            let format = supported.sample_format();

            let (producer, consumer) = create_capture_ring();
            let fault: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

            // Preferred: stereo at the requested rate. One fallback to the
            // device default config before giving up.
            let preferred = StreamConfig {
                channels: 2,
                sample_rate: SampleRate(requested_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            match build_stream(&device, &preferred, format, producer, Arc::clone(&fault)) {
                Ok(stream) => {
                    info!(sample_rate = requested_rate, channels = 2, "audio config selected");
                    stream
                        .play()
                        .map_err(|e| map_device_error(e.to_string()))?;
                    return Ok(Self {
                        _stream: stream,
                        consumer,
                        fault,
                        carry: None,
                        sample_rate: requested_rate,
                    });
                }
                Err(e) => {
                    warn!("preferred stereo config rejected ({e}), falling back to device default");
                }
            }

            let default_config: StreamConfig = supported.config();
            let sample_rate = default_config.sample_rate.0;
            let (producer, consumer) = create_capture_ring();
            let stream = build_stream(&device, &default_config, format, producer, Arc::clone(&fault))
                .map_err(|e| map_device_error(e.to_string()))?;
            info!(
                sample_rate,
                channels = default_config.channels,
                "audio config selected (fallback)"
            );
            stream
                .play()
                .map_err(|e| map_device_error(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                consumer,
                fault,
                carry: None,
                sample_rate,
            })
        }
    }

    impl SampleSource for MicSource {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn read_chunk(&mut self, max_frames: usize) -> Result<ReadOutcome> {
            if let Some(message) = self.fault.lock().take() {
                return Err(VroomError::FatalCapture(message));
            }

            let want = max_frames.max(1) * 2;
            let mut chunk = Vec::with_capacity(want);
            if let Some(held) = self.carry.take() {
                chunk.push(held);
            }

            let mut scratch = vec![0i16; want - chunk.len()];
            let mut read = self.consumer.pop_slice(&mut scratch);
            if read == 0 && chunk.is_empty() {
                std::thread::sleep(READ_WAIT);
                read = self.consumer.pop_slice(&mut scratch);
                if read == 0 {
                    return Ok(ReadOutcome::WouldBlock);
                }
            }
            chunk.extend_from_slice(&scratch[..read]);

            // Hold back an odd trailing sample so callers always see pairs.
            if chunk.len() % 2 != 0 {
                self.carry = chunk.pop();
            }
            if chunk.is_empty() {
                return Ok(ReadOutcome::WouldBlock);
            }
            Ok(ReadOutcome::Frames(chunk))
        }
    }

    /// [`SourceFactory`] producing [`MicSource`]s at a fixed requested rate.
    pub struct MicSourceFactory {
        requested_rate: u32,
    }

    impl MicSourceFactory {
        pub fn new(requested_rate: u32) -> Self {
            Self { requested_rate }
        }
    }

    impl SourceFactory for MicSourceFactory {
        fn create(&self) -> Result<Box<dyn SampleSource>> {
            Ok(Box::new(MicSource::open(self.requested_rate)?))
        }
    }

    fn map_device_error(message: String) -> VroomError {
        if message.to_ascii_lowercase().contains("permission") {
            VroomError::PermissionDenied
        } else {
            VroomError::DeviceInit(message)
        }
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        format: SampleFormat,
        mut producer: CaptureProducer,
        fault: Arc<Mutex<Option<String>>>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError> {
        let ch = config.channels as usize;
        let err_fault = Arc::clone(&fault);
        let on_error = move |err: cpal::StreamError| {
            error!("audio stream error: {err}");
            *err_fault.lock() = Some(err.to_string());
        };

        match format {
            SampleFormat::I16 => {
                let mut stereo_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    config,
                    move |data: &[i16], _info| {
                        to_stereo_i16(data, ch, &mut stereo_buf, |s| s);
                        push_frames(&mut producer, &stereo_buf);
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::F32 => {
                let mut stereo_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    config,
                    move |data: &[f32], _info| {
                        to_stereo_i16(data, ch, &mut stereo_buf, |s| {
                            (s.clamp(-1.0, 1.0) * 32_767.0) as i16
                        });
                        push_frames(&mut producer, &stereo_buf);
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::U8 => {
                let mut stereo_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    config,
                    move |data: &[u8], _info| {
                        to_stereo_i16(data, ch, &mut stereo_buf, |s| {
                            ((i16::from(s) - 128) << 8) as i16
                        });
                        push_frames(&mut producer, &stereo_buf);
                    },
                    on_error,
                    None,
                )
            }
            _ => Err(cpal::BuildStreamError::StreamConfigNotSupported),
        }
    }

    /// Convert an interleaved frame buffer of any channel count to stereo.
    /// Mono duplicates to both channels; wider layouts keep the first two.
    fn to_stereo_i16<T: Copy>(
        data: &[T],
        channels: usize,
        out: &mut Vec<i16>,
        convert: impl Fn(T) -> i16,
    ) {
        let frames = if channels == 0 { 0 } else { data.len() / channels };
        out.clear();
        out.reserve(frames * 2);
        for f in 0..frames {
            let base = f * channels;
            let left = convert(data[base]);
            let right = if channels >= 2 {
                convert(data[base + 1])
            } else {
                left
            };
            out.push(left);
            out.push(right);
        }
    }

    fn push_frames(producer: &mut CaptureProducer, stereo: &[i16]) {
        let written = producer.push_slice(stereo);
        if written < stereo.len() {
            warn!(
                "capture ring full: dropped {} interleaved samples",
                stereo.len() - written
            );
        }
    }
}
