//! Asynchronous upload of audio windows to the remote inference service.
//!
//! ## Non-blocking contract
//!
//! `submit_*` enqueues onto `tokio::task::spawn_blocking` and returns
//! immediately — the capture thread is never blocked on the network. The
//! round trip completes on the blocking pool; outcomes come back either on
//! the dispatcher's shared outcome channel (streaming flushes) or on a
//! per-call receiver (snapshot/finalize, so `stop()` can await its own
//! result).
//!
//! Network and server failures are never fatal to capture: they degrade to
//! [`InferenceOutcome::Error`] and the session decides what to surface.

pub mod response;
pub mod wire;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::buffering::window::AudioWindow;
use crate::engine::CaptureConfig;
use crate::error::{Result, VroomError};

pub use response::{InferenceOutcome, InferenceResult};

/// Seam between the capture/session layer and the HTTP path.
pub trait UploadSink: Send + Sync + 'static {
    /// Fire-and-forget streaming flush (raw PCM channels). The outcome lands
    /// on the sink's shared outcome channel, if anyone is listening.
    fn submit_stream(&self, window: AudioWindow);

    /// Snapshot/finalize upload (WAV container). Returns a receiver carrying
    /// exactly this submission's outcome.
    fn submit_snapshot(&self, window: AudioWindow) -> Receiver<InferenceOutcome>;
}

/// Dispatcher backed by a blocking reqwest client on the tokio blocking pool.
pub struct HttpDispatcher {
    client: reqwest::blocking::Client,
    predict_url: String,
    snapshot_url: String,
    confidence_override: f64,
    outcome_tx: Sender<InferenceOutcome>,
    outcome_rx: Receiver<InferenceOutcome>,
}

impl HttpDispatcher {
    /// Must be called within a tokio runtime — submissions use
    /// `spawn_blocking`.
    pub fn new(config: &CaptureConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.finalize_timeout)
            .timeout(config.finalize_timeout)
            .build()
            .map_err(|e| VroomError::Network(e.to_string()))?;

        let (outcome_tx, outcome_rx) = unbounded();
        Ok(Self {
            client,
            predict_url: config.predict_url.clone(),
            snapshot_url: config.snapshot_url.clone(),
            confidence_override: config.confidence_override,
            outcome_tx,
            outcome_rx,
        })
    }

    /// Outcomes of streaming flushes, in submission-completion order.
    pub fn outcomes(&self) -> Receiver<InferenceOutcome> {
        self.outcome_rx.clone()
    }

    fn post_stream(
        client: &reqwest::blocking::Client,
        url: &str,
        confidence_override: f64,
        window: &AudioWindow,
    ) -> InferenceOutcome {
        let left = wire::encode_pcm16_le(window.left());
        let right = wire::encode_pcm16_le(window.right());
        debug!(
            left_bytes = left.len(),
            right_bytes = right.len(),
            sample_rate = window.sample_rate(),
            "sending streaming window"
        );

        let form = match build_stream_form(window.sample_rate(), left, right) {
            Ok(form) => form,
            Err(e) => return InferenceOutcome::Error(e),
        };

        Self::send(client, url, form, confidence_override)
    }

    fn post_snapshot(
        client: &reqwest::blocking::Client,
        url: &str,
        confidence_override: f64,
        window: &AudioWindow,
    ) -> InferenceOutcome {
        let wav = match wire::encode_wav(window) {
            Ok(wav) => wav,
            Err(e) => return InferenceOutcome::Error(e.to_string()),
        };
        debug!(
            wav_bytes = wav.len(),
            duration_secs = window.duration_secs(),
            "sending snapshot window"
        );

        let part = match reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("snapshot.wav")
            .mime_str("audio/wav")
        {
            Ok(part) => part,
            Err(e) => return InferenceOutcome::Error(format!("multipart part: {e}")),
        };
        let form = reqwest::blocking::multipart::Form::new().part("audio_file", part);

        Self::send(client, url, form, confidence_override)
    }

    fn send(
        client: &reqwest::blocking::Client,
        url: &str,
        form: reqwest::blocking::multipart::Form,
        confidence_override: f64,
    ) -> InferenceOutcome {
        let response = match client.post(url).multipart(form).send() {
            Ok(response) => response,
            Err(e) => {
                return InferenceOutcome::Error(VroomError::Network(e.to_string()).to_string())
            }
        };

        let status = response.status();
        let body = match response.text() {
            Ok(body) => body,
            Err(e) => {
                return InferenceOutcome::Error(VroomError::Network(e.to_string()).to_string())
            }
        };
        if !status.is_success() {
            return InferenceOutcome::Error(
                VroomError::Server(format!("{status}: {body}")).to_string(),
            );
        }

        response::parse_response(&body, confidence_override)
    }
}

impl UploadSink for HttpDispatcher {
    fn submit_stream(&self, window: AudioWindow) {
        let client = self.client.clone();
        let url = self.predict_url.clone();
        let confidence_override = self.confidence_override;
        let outcome_tx = self.outcome_tx.clone();

        tokio::task::spawn_blocking(move || {
            let outcome = Self::post_stream(&client, &url, confidence_override, &window);
            if let InferenceOutcome::Error(ref reason) = outcome {
                warn!(%reason, "streaming upload failed");
            }
            let _ = outcome_tx.send(outcome);
        });
    }

    fn submit_snapshot(&self, window: AudioWindow) -> Receiver<InferenceOutcome> {
        let client = self.client.clone();
        let url = self.snapshot_url.clone();
        let confidence_override = self.confidence_override;
        let (tx, rx) = bounded(1);

        tokio::task::spawn_blocking(move || {
            let outcome = Self::post_snapshot(&client, &url, confidence_override, &window);
            if let InferenceOutcome::Error(ref reason) = outcome {
                warn!(%reason, "snapshot upload failed");
            }
            let _ = tx.send(outcome);
        });

        rx
    }
}

fn build_stream_form(
    sample_rate: u32,
    left: Vec<u8>,
    right: Vec<u8>,
) -> std::result::Result<reqwest::blocking::multipart::Form, String> {
    use reqwest::blocking::multipart::{Form, Part};

    let left_part = Part::bytes(left)
        .file_name("left.raw")
        .mime_str("application/octet-stream")
        .map_err(|e| format!("multipart part: {e}"))?;
    let right_part = Part::bytes(right)
        .file_name("right.raw")
        .mime_str("application/octet-stream")
        .map_err(|e| format!("multipart part: {e}"))?;

    Ok(Form::new()
        .text("sample_rate", sample_rate.to_string())
        .part("left_channel", left_part)
        .part("right_channel", right_part))
}
