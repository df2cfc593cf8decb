use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address used by a Caller's broadcast offer before any participant accepts it.
/// ICE candidates for the broadcast connection are sent to this address.
pub const BROADCAST_PEER: &str = "all";

/// Participant role, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Citizen placing the emergency call
    Caller,
    /// Dispatch command center
    Agent,
    /// Field responder
    Driver,
}

impl Role {
    /// Route a login username to the page role it opens.
    pub fn from_username(username: &str) -> Option<Self> {
        match username {
            "caller" => Some(Self::Caller),
            "agent" => Some(Self::Agent),
            "driver" => Some(Self::Driver),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Agent => "agent",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "caller" => Ok(Self::Caller),
            "agent" => Ok(Self::Agent),
            "driver" => Ok(Self::Driver),
            other => Err(format!("unknown role '{other}' (expected caller, agent or driver)")),
        }
    }
}

/// A member of a room as reported by the signaling server.
///
/// Older server revisions list members as bare id strings; both forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ParticipantRepr")]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            display_name: String::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParticipantRepr {
    Id(String),
    Full(ParticipantFields),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantFields {
    id: String,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default, alias = "name")]
    display_name: String,
}

impl From<ParticipantRepr> for Participant {
    fn from(repr: ParticipantRepr) -> Self {
        match repr {
            ParticipantRepr::Id(id) => Participant::new(id),
            ParticipantRepr::Full(f) => Participant {
                id: f.id,
                role: f.role,
                display_name: f.display_name,
            },
        }
    }
}

/// Availability of a field responder. Changed only by explicit toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverStatus {
    #[default]
    Available,
    Busy,
}

impl DriverStatus {
    pub fn toggled(self) -> Self {
        match self {
            Self::Available => Self::Busy,
            Self::Busy => Self::Available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// Why a received session description was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("session description has no type")]
    MissingType,
    #[error("session description has no body")]
    MissingBody,
    #[error("expected {expected} but received {found}")]
    UnexpectedType { expected: SdpKind, found: SdpKind },
}

/// SDP offer or answer in the browser's `RTCSessionDescriptionInit` shape.
///
/// Both fields are optional on the wire so a malformed description still parses
/// and can be rejected by [`SessionDescription::validate`] instead of dropping the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SdpKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some(SdpKind::Offer),
            sdp: Some(sdp.into()),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some(SdpKind::Answer),
            sdp: Some(sdp.into()),
        }
    }

    /// Check that the description carries both a type and a body of the expected kind.
    /// Returns the SDP body on success.
    pub fn validate(&self, expected: SdpKind) -> Result<&str, SignalError> {
        let kind = self.kind.ok_or(SignalError::MissingType)?;
        let sdp = match self.sdp.as_deref() {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Err(SignalError::MissingBody),
        };
        if kind != expected {
            return Err(SignalError::UnexpectedType {
                expected,
                found: kind,
            });
        }
        Ok(sdp)
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Events sent from a client to the signaling server.
///
/// Each event travels as `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Request to join a room
    JoinRoom {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    /// Caller broadcasts its offer to every agent
    CallAllUsers {
        signal_data: SessionDescription,
        from: String,
        name: String,
    },
    Offer {
        to: String,
        offer: SessionDescription,
    },
    Answer {
        to: String,
        answer: SessionDescription,
    },
    SendIceCandidate {
        candidate: IceCandidate,
        to: String,
    },
    /// Answer targeted at the caller of a broadcast offer
    AnswerCall {
        signal: SessionDescription,
        to: String,
    },
    EndCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    UpdateDriverStatus {
        #[serde(rename = "employeeID")]
        employee_id: String,
        status: DriverStatus,
    },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::CallAllUsers { .. } => "callAllUsers",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::SendIceCandidate { .. } => "sendIceCandidate",
            Self::AnswerCall { .. } => "answerCall",
            Self::EndCall { .. } => "endCall",
            Self::UpdateDriverStatus { .. } => "updateDriverStatus",
        }
    }
}

/// Events pushed by the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Server-assigned participant id
    Me(String),
    RoomJoined {
        room: String,
    },
    /// Authoritative member snapshot of the joined room
    #[serde(alias = "roomParticipants")]
    RoomUsers {
        #[serde(alias = "participants")]
        users: Vec<Participant>,
    },
    RoomDetails {
        room_name: String,
        #[serde(default)]
        users: Vec<String>,
    },
    /// A participant joined after us
    NewParticipant {
        id: String,
        #[serde(default)]
        role: Option<Role>,
        #[serde(default)]
        display_name: Option<String>,
    },
    ParticipantLeft {
        id: String,
    },
    /// Broadcast offer from a caller
    CallAllUsers {
        from: String,
        #[serde(default)]
        name: String,
        signal_data: SessionDescription,
    },
    /// Answer to our broadcast offer
    CallAccepted {
        signal: SessionDescription,
        #[serde(default)]
        from: Option<String>,
    },
    Offer {
        from: String,
        offer: SessionDescription,
    },
    Answer {
        from: String,
        answer: SessionDescription,
    },
    #[serde(alias = "candidate")]
    ReceiveIceCandidate {
        candidate: IceCandidate,
        from: String,
    },
    #[serde(alias = "endCall")]
    CallEnded {
        #[serde(default)]
        id: Option<String>,
    },
    /// Prompts a driver to join a room
    JoinRoomNotification {
        room: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Me(_) => "me",
            Self::RoomJoined { .. } => "roomJoined",
            Self::RoomUsers { .. } => "roomUsers",
            Self::RoomDetails { .. } => "roomDetails",
            Self::NewParticipant { .. } => "newParticipant",
            Self::ParticipantLeft { .. } => "participantLeft",
            Self::CallAllUsers { .. } => "callAllUsers",
            Self::CallAccepted { .. } => "callAccepted",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::ReceiveIceCandidate { .. } => "receiveIceCandidate",
            Self::CallEnded { .. } => "callEnded",
            Self::JoinRoomNotification { .. } => "joinRoomNotification",
            Self::Error { .. } => "error",
        }
    }
}

/// Credentials posted to the login endpoint.
/// Password is redacted in Debug output to prevent accidental logging.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Login endpoint reply. A missing token means the credentials were refused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
