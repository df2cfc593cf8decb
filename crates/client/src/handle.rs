use dispatch_protocol::{DriverStatus, Role};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::registry::ConnectionState;
use crate::roster::Driver;
use crate::session::{CallState, IncomingCall, RoomState};

/// Requests served by the controller task.
#[derive(Debug)]
pub enum Command {
    StartCall {
        reply: oneshot::Sender<Result<()>>,
    },
    EndCall {
        reply: oneshot::Sender<Result<()>>,
    },
    JoinRoom {
        room: String,
        role: Option<Role>,
        reply: oneshot::Sender<Result<()>>,
    },
    AnswerCall {
        caller_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeclineCall {
        caller_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AcceptJoinRequest {
        reply: oneshot::Sender<Result<String>>,
    },
    DeclineJoinRequest {
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleDriverStatus {
        employee_id: String,
        reply: oneshot::Sender<Result<DriverStatus>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// One registry entry as seen from outside the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub remote_id: String,
    pub state: ConnectionState,
    pub pending_candidates: usize,
    pub remote_stream_id: Option<String>,
    pub remote_tracks: usize,
}

/// Point-in-time view of a session, for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub local_id: Option<String>,
    pub role: Role,
    pub state: CallState,
    pub room: Option<RoomState>,
    /// Sorted by remote id
    pub peers: Vec<PeerSummary>,
    pub incoming_calls: Vec<IncomingCall>,
    pub pending_join: Option<String>,
    pub drivers: Vec<Driver>,
    pub transport_lost: bool,
}

impl SessionSnapshot {
    pub fn peer(&self, remote_id: &str) -> Option<&PeerSummary> {
        self.peers.iter().find(|p| p.remote_id == remote_id)
    }
}

/// Cloneable front door to a running [`CallSessionController`](crate::CallSessionController).
///
/// The controller stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: EventBus,
}

impl SessionHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, events: EventBus) -> Self {
        Self { commands, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CoreError::ControllerStopped)?;
        rx.await.map_err(|_| CoreError::ControllerStopped)?
    }

    pub async fn start_call(&self) -> Result<()> {
        self.request(|reply| Command::StartCall { reply }).await
    }

    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn join_room(&self, room: impl Into<String>, role: Option<Role>) -> Result<()> {
        let room = room.into();
        self.request(|reply| Command::JoinRoom { room, role, reply })
            .await
    }

    pub async fn answer_call(&self, caller_id: impl Into<String>) -> Result<()> {
        let caller_id = caller_id.into();
        self.request(|reply| Command::AnswerCall { caller_id, reply })
            .await
    }

    pub async fn decline_call(&self, caller_id: impl Into<String>) -> Result<()> {
        let caller_id = caller_id.into();
        self.request(|reply| Command::DeclineCall { caller_id, reply })
            .await
    }

    pub async fn accept_join_request(&self) -> Result<String> {
        self.request(|reply| Command::AcceptJoinRequest { reply })
            .await
    }

    pub async fn decline_join_request(&self) -> Result<()> {
        self.request(|reply| Command::DeclineJoinRequest { reply })
            .await
    }

    pub async fn toggle_driver_status(&self, employee_id: impl Into<String>) -> Result<DriverStatus> {
        let employee_id = employee_id.into();
        self.request(|reply| Command::ToggleDriverStatus { employee_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| CoreError::ControllerStopped)?;
        rx.await.map_err(|_| CoreError::ControllerStopped)
    }
}
