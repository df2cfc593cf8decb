use dispatch_protocol::{DriverStatus, Participant};
use tokio::sync::broadcast;

use crate::registry::ConnectionState;
use crate::session::CallState;

/// Lifecycle events published by the core for rendering collaborators.
///
/// Subscribers look entries up by `remote_id` through a session snapshot rather
/// than holding references into the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    IdentityAssigned {
        id: String,
    },
    SessionState {
        from: CallState,
        to: CallState,
    },
    PeerAdded {
        remote_id: String,
    },
    PeerState {
        remote_id: String,
        state: ConnectionState,
    },
    PeerRemoved {
        remote_id: String,
    },
    /// First remote track of an entry arrived; the stream can be attached.
    StreamReady {
        remote_id: String,
        stream_id: String,
    },
    IncomingCall {
        caller_id: String,
        name: String,
    },
    JoinRequested {
        room: String,
    },
    RoomJoined {
        room: String,
    },
    RoomMembers {
        room: String,
        members: Vec<Participant>,
    },
    RoomDetails {
        room: String,
        users: Vec<String>,
    },
    DriverStatusChanged {
        employee_id: String,
        status: DriverStatus,
    },
    TransportLost {
        reason: String,
    },
    /// User-visible failure of a session-level action
    Error {
        message: String,
    },
}

/// Fan-out of [`CoreEvent`]s. Publishing never blocks; slow subscribers lag.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // No subscribers is fine: nothing is rendering yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}
