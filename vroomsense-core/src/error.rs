use thiserror::Error;

/// All errors produced by vroomsense-core.
#[derive(Debug, Error)]
pub enum VroomError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("capture device init failed: {0}")]
    DeviceInit(String),

    #[error("transient capture read error: {0}")]
    TransientRead(String),

    #[error("fatal capture error: {0}")]
    FatalCapture(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    #[error("session is already recording")]
    AlreadyRecording,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VroomError {
    /// Whether the capture loop may keep running after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, VroomError::TransientRead(_))
    }
}

pub type Result<T> = std::result::Result<T, VroomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_reads_allow_the_capture_loop_to_continue() {
        assert!(VroomError::TransientRead("glitch".into()).is_transient());
        assert!(!VroomError::FatalCapture("gone".into()).is_transient());
        assert!(!VroomError::Server("500: oops".into()).is_transient());
    }

    #[test]
    fn upload_failures_render_with_their_origin() {
        let server = VroomError::Server("503 Service Unavailable: busy".into());
        assert_eq!(server.to_string(), "server error: 503 Service Unavailable: busy");

        let network = VroomError::Network("connection refused".into());
        assert_eq!(network.to_string(), "network error: connection refused");
    }
}
