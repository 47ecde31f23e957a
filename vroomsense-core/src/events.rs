//! Event types broadcast to presentation collaborators.
//!
//! The core never renders anything itself: UI shells, notification surfaces
//! and the wearable bridge subscribe to these broadcast channels and decide
//! how to present each event.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which side of the listener a detected vehicle is approaching from.
///
/// The inference server reports direction as a bare string (`"L"`, `"R"`,
/// occasionally something else); parsing is case-insensitive and anything
/// unrecognised is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Direction {
    Left,
    Right,
    Other(String),
}

impl From<String> for Direction {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "L" | "l" => Direction::Left,
            "R" | "r" => Direction::Right,
            _ => Direction::Other(raw),
        }
    }
}

impl From<Direction> for String {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Left => "L".to_string(),
            Direction::Right => "R".to_string(),
            Direction::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Left => f.write_str("L"),
            Direction::Right => f.write_str("R"),
            Direction::Other(raw) => f.write_str(raw),
        }
    }
}

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Current state of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No capture engine alive.
    Idle,
    /// Continuous capture + periodic snapshot uploads in progress.
    Recording,
    /// Recording stopped; awaiting the final inference result.
    Processing,
}

/// Emitted whenever the session state machine transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    /// Optional human-readable detail (e.g. the fatal error that forced IDLE).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Detection alerts
// ---------------------------------------------------------------------------

/// A vehicle detection the user should be alerted about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Classification label from the server (e.g. "siren", "bike", "horn").
    pub vehicle_type: String,
    pub direction: Direction,
    /// Model confidence in [0.0, 1.0].
    pub confidence: f64,
}

/// Emitted when an inference pass reported the window too quiet to classify.
///
/// Suppression of repeat notifications is already applied: subscribers may
/// surface every event they receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietAudioEvent {
    /// Consecutive quiet results so far, including this one.
    pub streak: u32,
}

// ---------------------------------------------------------------------------
// Live capture levels
// ---------------------------------------------------------------------------

/// Per-channel mean absolute sample level, emitted periodically while
/// capturing. Used by level meters; values are in raw i16 amplitude units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    pub seq: u64,
    pub left: f32,
    pub right: f32,
}

// ---------------------------------------------------------------------------
// Companion device contract
// ---------------------------------------------------------------------------

/// Collaborator that delivers a haptic alert to a paired wearable.
///
/// Implementations must not block: the session controller calls this from its
/// outcome-handling path.
pub trait CompanionNotifier: Send + Sync + 'static {
    fn alert(&self, vehicle_type: &str, direction: &Direction);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_case_insensitively_and_preserves_unknowns() {
        assert_eq!(Direction::from("L".to_string()), Direction::Left);
        assert_eq!(Direction::from("r".to_string()), Direction::Right);
        assert_eq!(
            Direction::from("behind".to_string()),
            Direction::Other("behind".to_string())
        );
    }

    #[test]
    fn alert_event_serializes_with_camel_case_and_wire_direction() {
        let event = AlertEvent {
            seq: 4,
            vehicle_type: "siren".into(),
            direction: Direction::Right,
            confidence: 0.93,
        };

        let json = serde_json::to_value(&event).expect("serialize alert event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["vehicleType"], "siren");
        assert_eq!(json["direction"], "R");

        let round_trip: AlertEvent =
            serde_json::from_value(json).expect("deserialize alert event");
        assert_eq!(round_trip.direction, Direction::Right);
    }

    #[test]
    fn session_state_serializes_lowercase() {
        let event = SessionStatusEvent {
            state: SessionState::Recording,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["state"], "recording");
    }
}
