//! # vroomsense-core
//!
//! Stereo road-sound capture and classification SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SampleSource → CaptureEngine(spawn_blocking)
//!                                   │
//!                      GainNormalizer (per-channel adaptive gain)
//!                                   │
//!                        StereoRing (rolling window)
//!                                   │
//!              UploadSink::submit_stream / submit_snapshot
//!                                   │
//!          broadcast: AlertEvent / QuietAudioEvent / SessionStatusEvent
//! ```
//!
//! The capture loop never blocks on the network: uploads are handed to the
//! tokio blocking pool while the ring keeps sliding. The `SessionController`
//! swaps whole engines every few seconds so classification runs on a fresh
//! snapshot without ever clearing the audio the user is recording.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;
pub mod gain;
pub mod session;
pub mod upload;

// Convenience re-exports for downstream crates
pub use engine::{CaptureConfig, CaptureEngine};
pub use error::VroomError;
pub use events::{
    AlertEvent, CompanionNotifier, Direction, LevelEvent, QuietAudioEvent, SessionState,
    SessionStatusEvent,
};
pub use session::SessionController;
pub use upload::{HttpDispatcher, InferenceOutcome, InferenceResult, UploadSink};

#[cfg(feature = "audio-cpal")]
pub use audio::{MicSource, MicSourceFactory};
