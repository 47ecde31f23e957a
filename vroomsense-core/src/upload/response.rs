//! Inference server response parsing.
//!
//! Expected shape:
//!
//! ```json
//! {
//!   "status": "success",
//!   "inference_result": {
//!     "vehicle_type": "siren",
//!     "direction": "L",
//!     "confidence": 0.99,
//!     "should_notify": true,
//!     "too_quiet": false
//!   }
//! }
//! ```
//!
//! Every inference attempt resolves to exactly one of three outcomes; a
//! malformed body degrades to `Error` and never affects session state.

use serde::Deserialize;
use tracing::debug;

use crate::events::Direction;

/// A successfully parsed, non-quiet classification.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub vehicle_type: String,
    pub direction: Direction,
    /// Confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Effective notify decision, with the high-confidence override applied.
    pub should_notify: bool,
}

/// One of three mutually exclusive outcomes per inference attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    Success(InferenceResult),
    /// The window was too quiet to classify.
    QuietAudio,
    /// Network, server, or parse failure. Never fatal to capture.
    Error(String),
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    status: String,
    error: Option<String>,
    inference_result: Option<RawInference>,
}

#[derive(Debug, Deserialize)]
struct RawInference {
    vehicle_type: Option<String>,
    direction: Option<String>,
    confidence: Option<f64>,
    should_notify: Option<bool>,
    too_quiet: Option<bool>,
}

/// Parse a response body into an [`InferenceOutcome`].
///
/// `confidence_override` is the hard business rule: when the server omits or
/// denies `should_notify` but confidence exceeds this threshold, the notify
/// decision is forced to true anyway.
pub fn parse_response(body: &str, confidence_override: f64) -> InferenceOutcome {
    let raw: RawResponse = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => return InferenceOutcome::Error(format!("malformed response: {e}")),
    };

    if raw.status == "error" {
        return InferenceOutcome::Error(
            raw.error.unwrap_or_else(|| "unspecified server error".into()),
        );
    }

    let Some(inference) = raw.inference_result else {
        return InferenceOutcome::Error("response missing inference_result".into());
    };

    if inference.too_quiet.unwrap_or(false) {
        return InferenceOutcome::QuietAudio;
    }

    let (Some(vehicle_type), Some(direction), Some(confidence)) = (
        inference.vehicle_type,
        inference.direction,
        inference.confidence,
    ) else {
        return InferenceOutcome::Error("inference_result missing required fields".into());
    };

    let mut should_notify = inference.should_notify.unwrap_or(false);
    if !should_notify && confidence > confidence_override {
        debug!(confidence, "forcing notify decision on high confidence");
        should_notify = true;
    }

    InferenceOutcome::Success(InferenceResult {
        vehicle_type,
        direction: Direction::from(direction),
        confidence,
        should_notify,
    })
}
