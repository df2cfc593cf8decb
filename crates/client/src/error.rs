use dispatch_protocol::SignalError;
use thiserror::Error;

/// Failures surfaced by the signaling core.
///
/// Connection-level kinds (`InvalidSignal`, `Negotiation`) stay contained in the
/// affected peer entry. Session-level kinds abort the requested action and carry
/// a user-visible message.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("signaling server unavailable (tried {})", .tried.join(", "))]
    TransportUnavailable { tried: Vec<String> },
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("participant id has not been assigned by the server yet")]
    IdentityNotAssigned,
    #[error("invalid signal from {remote_id}: {source}")]
    InvalidSignal {
        remote_id: String,
        #[source]
        source: SignalError,
    },
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("no pending call from {0}")]
    UnknownCall(String),
    #[error("no pending join request")]
    NoJoinRequest,
    #[error("no driver with employee id {0}")]
    UnknownDriver(String),
    #[error("negotiation with {remote_id} failed: {source:#}")]
    Negotiation {
        remote_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("call session controller has stopped")]
    ControllerStopped,
}

impl CoreError {
    /// Whether the failure aborts a session-level action and must be shown to the user.
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable { .. }
                | Self::NotConnected
                | Self::MediaUnavailable(_)
                | Self::ControllerStopped
        )
    }

    /// Message suitable for the UI layer.
    pub fn user_message(&self) -> String {
        match self {
            Self::TransportUnavailable { .. } => {
                "Cannot reach the dispatch server. Check your connection and try again.".to_string()
            }
            Self::NotConnected => "Connection to the dispatch server was lost.".to_string(),
            Self::MediaUnavailable(_) => {
                "Camera or microphone unavailable. Grant access and try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
