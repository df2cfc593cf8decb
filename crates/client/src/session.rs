use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dispatch_protocol::{
    BROADCAST_PEER, ClientMessage, DriverStatus, IceCandidate, Participant, Role, SdpKind,
    ServerMessage, SessionConfig, SessionDescription,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::handle::{Command, PeerSummary, SessionHandle, SessionSnapshot};
use crate::identity::SessionIdentity;
use crate::media::MediaSource;
use crate::negotiation::{AnswerRoute, NegotiationEngine, OfferRoute};
use crate::peer::{PeerConnector, PeerSignal};
use crate::registry::PeerConnectionRegistry;
use crate::roster::DriverRoster;
use crate::transport::{Inbound, Signaler};

/// Call-level state, independent of any single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    Accepted,
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Read-only projection of the server's room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomState {
    room_id: String,
    members: BTreeMap<String, Participant>,
}

impl RoomState {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn members(&self) -> impl Iterator<Item = &Participant> {
        self.members.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn replace_members(&mut self, members: impl IntoIterator<Item = Participant>) {
        self.members = members.into_iter().map(|p| (p.id.clone(), p)).collect();
    }

    fn insert(&mut self, participant: Participant) {
        self.members.insert(participant.id.clone(), participant);
    }

    fn remove(&mut self, id: &str) {
        self.members.remove(id);
    }
}

/// A broadcast call waiting for an agent to answer or decline.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub caller_id: String,
    pub name: String,
    offer: SessionDescription,
}

/// Orchestrates the participant-level protocol on top of the registry and the
/// negotiation engine. Runs as a single task; see [`CallSessionController::spawn`].
pub struct CallSessionController {
    role: Role,
    config: SessionConfig,
    identity: Arc<SessionIdentity>,
    signaler: Arc<dyn Signaler>,
    media: Arc<MediaSource>,
    registry: PeerConnectionRegistry,
    engine: NegotiationEngine,
    events: EventBus,
    state: CallState,
    room: Option<RoomState>,
    incoming: Vec<IncomingCall>,
    pending_join: Option<String>,
    roster: DriverRoster,
    transport_lost: bool,
    peer_signals: Option<mpsc::UnboundedReceiver<PeerSignal>>,
}

impl CallSessionController {
    pub fn new(
        role: Role,
        config: SessionConfig,
        signaler: Arc<dyn Signaler>,
        media: Arc<MediaSource>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let identity = Arc::new(SessionIdentity::new());
        let events = EventBus::new(config.event_capacity);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let registry =
            PeerConnectionRegistry::new(connector, Arc::clone(&media), signals_tx, events.clone());
        let engine = NegotiationEngine::new(
            Arc::clone(&signaler),
            Arc::clone(&identity),
            Duration::from_millis(config.failed_grace_ms),
        );
        Self {
            role,
            config,
            identity,
            signaler,
            media,
            registry,
            engine,
            events,
            state: CallState::Idle,
            room: None,
            incoming: Vec::new(),
            pending_join: None,
            roster: DriverRoster::default(),
            transport_lost: false,
            peer_signals: Some(signals_rx),
        }
    }

    pub fn with_roster(mut self, roster: DriverRoster) -> Self {
        self.roster = roster;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn identity(&self) -> Arc<SessionIdentity> {
        Arc::clone(&self.identity)
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn registry(&self) -> &PeerConnectionRegistry {
        &self.registry
    }

    pub fn room(&self) -> Option<&RoomState> {
        self.room.as_ref()
    }

    pub fn incoming_calls(&self) -> &[IncomingCall] {
        &self.incoming
    }

    pub fn pending_join_request(&self) -> Option<&str> {
        self.pending_join.as_deref()
    }

    pub fn roster(&self) -> &DriverRoster {
        &self.roster
    }

    fn set_state(&mut self, to: CallState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(%from, %to, "Call state changed");
        self.events.publish(CoreEvent::SessionState { from, to });
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.transport_lost {
            return Err(CoreError::NotConnected);
        }
        Ok(())
    }

    fn in_call(&self) -> bool {
        matches!(self.state, CallState::Calling | CallState::Accepted)
    }

    /// Broadcast an offer to every agent and wait for one to accept.
    pub async fn start_call(&mut self) -> Result<()> {
        self.ensure_connected()?;
        if self.in_call() {
            debug!(state = %self.state, "Call already in progress");
            return Ok(());
        }
        self.media.acquire().await?;
        let name = self.config.display_name.clone();
        self.engine
            .initiate(&mut self.registry, BROADCAST_PEER, OfferRoute::Broadcast { name })
            .await?;
        self.set_state(CallState::Calling);
        Ok(())
    }

    /// Close every connection, tell the server, and release the local stream.
    pub async fn end_call(&mut self) -> Result<()> {
        if self.state == CallState::Ended {
            debug!("Call already ended");
            return Ok(());
        }
        let id = self.identity.current_id().ok().map(str::to_string);
        if let Err(e) = self.signaler.send(ClientMessage::EndCall { id }) {
            warn!("Failed to send endCall: {e}");
        }
        self.teardown().await;
        Ok(())
    }

    async fn teardown(&mut self) {
        let closed = self.registry.clear().await;
        self.media.stop();
        self.incoming.clear();
        info!(closed, "Call torn down");
        self.set_state(CallState::Ended);
    }

    /// Ask the server to join `room`. Leaving a previous room drops its connections.
    pub async fn join_room(&mut self, room: &str, role: Option<Role>) -> Result<()> {
        self.ensure_connected()?;
        if let Some(current) = &self.room
            && current.room_id() != room
        {
            info!(from = current.room_id(), to = room, "Changing room");
            self.registry.clear().await;
        }
        self.room = Some(RoomState::new(room));
        self.signaler.send(ClientMessage::JoinRoom {
            room: room.to_string(),
            role,
        })?;
        info!(room, "Join requested");
        Ok(())
    }

    /// Answer a queued broadcast call.
    pub async fn answer_call(&mut self, caller_id: &str) -> Result<()> {
        self.ensure_connected()?;
        let index = self
            .incoming
            .iter()
            .position(|c| c.caller_id == caller_id)
            .ok_or_else(|| CoreError::UnknownCall(caller_id.to_string()))?;
        let call = self.incoming.remove(index);
        self.engine
            .receive_offer(
                &mut self.registry,
                &call.caller_id,
                &call.offer,
                AnswerRoute::AnswerCall,
            )
            .await?;
        info!(caller_id, name = %call.name, "Call answered");
        self.set_state(CallState::Accepted);
        Ok(())
    }

    pub fn decline_call(&mut self, caller_id: &str) -> Result<()> {
        let before = self.incoming.len();
        self.incoming.retain(|c| c.caller_id != caller_id);
        if self.incoming.len() == before {
            return Err(CoreError::UnknownCall(caller_id.to_string()));
        }
        info!(caller_id, "Call declined");
        Ok(())
    }

    /// Join the room of the pending driver prompt. Returns the room.
    pub async fn accept_join_request(&mut self) -> Result<String> {
        let room = self.pending_join.take().ok_or(CoreError::NoJoinRequest)?;
        self.join_room(&room, Some(Role::Driver)).await?;
        Ok(room)
    }

    pub fn decline_join_request(&mut self) -> Result<()> {
        let room = self.pending_join.take().ok_or(CoreError::NoJoinRequest)?;
        info!(room = %room, "Join request declined");
        Ok(())
    }

    /// Flip a driver's availability and sync it to the server.
    pub fn toggle_driver_status(&mut self, employee_id: &str) -> Result<DriverStatus> {
        let status = self.roster.toggle(employee_id)?;
        self.events.publish(CoreEvent::DriverStatusChanged {
            employee_id: employee_id.to_string(),
            status,
        });
        if let Err(e) = self.signaler.send(ClientMessage::UpdateDriverStatus {
            employee_id: employee_id.to_string(),
            status,
        }) {
            warn!(employee_id, "Driver status not synced: {e}");
        }
        Ok(status)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut peers: Vec<PeerSummary> = self
            .registry
            .all()
            .map(|e| PeerSummary {
                remote_id: e.remote_id().to_string(),
                state: e.state(),
                pending_candidates: e.pending_candidates(),
                remote_stream_id: e.remote_stream().stream_id().map(str::to_string),
                remote_tracks: e.remote_stream().tracks().len(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        SessionSnapshot {
            local_id: self.identity.current_id().ok().map(str::to_string),
            role: self.role,
            state: self.state,
            room: self.room.clone(),
            peers,
            incoming_calls: self.incoming.clone(),
            pending_join: self.pending_join.clone(),
            drivers: self.roster.drivers().to_vec(),
            transport_lost: self.transport_lost,
        }
    }

    /// React to one server event. Failures stay inside the affected entry.
    pub async fn handle_message(&mut self, message: ServerMessage) {
        debug!(event = message.event_name(), "Handling signal");
        match message {
            ServerMessage::Me(id) => {
                if self.identity.assign(id.clone()) {
                    self.events.publish(CoreEvent::IdentityAssigned { id });
                }
            }
            ServerMessage::RoomJoined { room } => {
                info!(room = %room, "Joined room");
                if self.room.as_ref().is_none_or(|r| r.room_id() != room) {
                    self.room = Some(RoomState::new(room.clone()));
                }
                self.events.publish(CoreEvent::RoomJoined { room });
            }
            ServerMessage::RoomUsers { users } => self.on_room_users(users).await,
            ServerMessage::RoomDetails { room_name, users } => {
                info!(room = %room_name, users = users.len(), "Room details received");
                let mut room = RoomState::new(room_name.clone());
                room.replace_members(users.iter().cloned().map(Participant::new));
                self.room = Some(room);
                self.events.publish(CoreEvent::RoomDetails {
                    room: room_name,
                    users,
                });
            }
            ServerMessage::NewParticipant {
                id,
                role,
                display_name,
            } => {
                let participant = Participant {
                    id,
                    role,
                    display_name: display_name.unwrap_or_default(),
                };
                self.on_new_participant(participant).await;
            }
            ServerMessage::ParticipantLeft { id } => {
                if let Some(room) = &mut self.room {
                    room.remove(&id);
                }
                if self.registry.remove(&id).await {
                    info!(remote_id = %id, "Participant left");
                }
            }
            ServerMessage::CallAllUsers {
                from,
                name,
                signal_data,
            } => self.on_incoming_call(from, name, signal_data).await,
            ServerMessage::CallAccepted { signal, from } => self.on_call_accepted(signal, from).await,
            ServerMessage::Offer { from, offer } => {
                if let Err(e) = self
                    .engine
                    .receive_offer(&mut self.registry, &from, &offer, AnswerRoute::Direct)
                    .await
                {
                    warn!(remote_id = %from, "Offer dropped: {e}");
                }
            }
            ServerMessage::Answer { from, answer } => {
                if let Err(e) = self
                    .engine
                    .receive_answer(&mut self.registry, &from, &answer)
                    .await
                {
                    warn!(remote_id = %from, "Answer dropped: {e}");
                }
            }
            ServerMessage::ReceiveIceCandidate { candidate, from } => {
                self.on_remote_candidate(from, candidate).await;
            }
            ServerMessage::CallEnded { id } => self.on_call_ended(id).await,
            ServerMessage::JoinRoomNotification { room } => {
                if self.role != Role::Driver {
                    debug!(room = %room, role = %self.role, "Ignoring join prompt");
                    return;
                }
                info!(room = %room, "Join requested by dispatch");
                self.pending_join = Some(room.clone());
                self.events.publish(CoreEvent::JoinRequested { room });
            }
            ServerMessage::Error { message } => {
                warn!(%message, "Signaling server reported an error");
                self.events.publish(CoreEvent::Error { message });
            }
        }
    }

    async fn on_room_users(&mut self, users: Vec<Participant>) {
        let Some(room) = &mut self.room else {
            debug!(count = users.len(), "Member list for a room we have not joined");
            return;
        };
        room.replace_members(users.iter().cloned());
        let room_id = room.room_id().to_string();
        info!(room = %room_id, members = users.len(), "Room members received");
        self.events.publish(CoreEvent::RoomMembers {
            room: room_id,
            members: users.clone(),
        });

        let Ok(local_id) = self.identity.current_id().map(str::to_string) else {
            warn!("Member list arrived before our id; not offering");
            return;
        };
        for member in users {
            if member.id == local_id || self.registry.contains(&member.id) {
                continue;
            }
            self.offer_to(&member.id).await;
        }
    }

    async fn on_new_participant(&mut self, participant: Participant) {
        let Some(room) = &mut self.room else {
            debug!(remote_id = %participant.id, "New participant outside a joined room");
            return;
        };
        let id = participant.id.clone();
        room.insert(participant);
        if self.identity.current_id().is_ok_and(|me| me == id) {
            return;
        }
        if self.registry.contains(&id) {
            debug!(remote_id = %id, "Duplicate new participant, already connected");
            return;
        }
        self.offer_to(&id).await;
    }

    async fn offer_to(&mut self, remote_id: &str) {
        if let Err(e) = self
            .engine
            .initiate(&mut self.registry, remote_id, OfferRoute::Direct)
            .await
        {
            warn!(remote_id, "Could not offer: {e}");
        }
    }

    async fn on_incoming_call(&mut self, from: String, name: String, offer: SessionDescription) {
        if self.role != Role::Agent {
            debug!(caller_id = %from, role = %self.role, "Ignoring broadcast call");
            return;
        }
        if let Err(e) = offer.validate(SdpKind::Offer) {
            warn!(caller_id = %from, "Dropping broadcast call: {e}");
            return;
        }
        // Latest offer from a caller replaces an older queued one.
        self.incoming.retain(|c| c.caller_id != from);
        self.incoming.push(IncomingCall {
            caller_id: from.clone(),
            name: name.clone(),
            offer,
        });
        info!(caller_id = %from, %name, "Incoming call");
        self.events.publish(CoreEvent::IncomingCall {
            caller_id: from.clone(),
            name,
        });

        if self.config.auto_answer
            && let Err(e) = self.answer_call(&from).await
        {
            warn!(caller_id = %from, "Auto-answer failed: {e}");
        }
    }

    async fn on_call_accepted(&mut self, signal: SessionDescription, from: Option<String>) {
        if self.state != CallState::Calling {
            debug!(state = %self.state, "callAccepted outside a pending call, dropping");
            return;
        }
        // The broadcast entry takes the answering agent's id when the server names it.
        let target = match from {
            Some(agent) if self.registry.contains(&agent) => agent,
            Some(agent) => {
                if self.registry.rekey(BROADCAST_PEER, &agent) {
                    agent
                } else {
                    BROADCAST_PEER.to_string()
                }
            }
            None => BROADCAST_PEER.to_string(),
        };
        match self
            .engine
            .receive_answer(&mut self.registry, &target, &signal)
            .await
        {
            Ok(true) => {
                info!(remote_id = %target, "Call accepted");
                self.set_state(CallState::Accepted);
            }
            Ok(false) => debug!(remote_id = %target, "Stale callAccepted"),
            Err(e) => warn!(remote_id = %target, "callAccepted dropped: {e}"),
        }
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) {
        // A caller whose accept carried no id still knows its single peer as the broadcast entry.
        let target = if !self.registry.contains(&from) && self.registry.contains(BROADCAST_PEER) {
            BROADCAST_PEER
        } else {
            from.as_str()
        };
        self.engine
            .receive_candidate(&mut self.registry, target, candidate)
            .await;
    }

    async fn on_call_ended(&mut self, id: Option<String>) {
        match id {
            Some(id) => {
                if self.identity.current_id().is_ok_and(|me| me == id) {
                    return;
                }
                let key = self.registry.resolve(&id).to_string();
                if !self.registry.remove(&key).await {
                    debug!(remote_id = %id, "Hang-up from a participant we are not connected to");
                    return;
                }
                info!(remote_id = %id, "Remote participant hung up");
                if self.registry.is_empty() && self.in_call() {
                    self.teardown().await;
                }
            }
            None => {
                if self.state == CallState::Ended {
                    return;
                }
                info!("Call ended by remote side");
                self.teardown().await;
            }
        }
    }

    /// Mark every connection failed; the user has to rejoin over a new transport.
    pub fn handle_transport_lost(&mut self, reason: String) {
        if self.transport_lost {
            return;
        }
        warn!(%reason, peers = self.registry.len(), "Signaling transport lost");
        self.transport_lost = true;
        self.registry.mark_all_failed();
        self.events.publish(CoreEvent::TransportLost { reason });
    }

    pub async fn handle_peer_signal(&mut self, signal: PeerSignal) {
        match signal {
            PeerSignal::LocalCandidate {
                remote_id,
                generation,
                candidate,
            } => {
                if !self.is_current(&remote_id, generation) {
                    return;
                }
                if let Err(e) = self
                    .engine
                    .local_candidate(&self.registry, &remote_id, candidate)
                {
                    debug!(remote_id = %remote_id, "Local candidate not sent: {e}");
                }
            }
            PeerSignal::StateChanged {
                remote_id,
                generation,
                state,
            } => {
                if !self.is_current(&remote_id, generation) {
                    return;
                }
                self.engine
                    .observe_state(&mut self.registry, &remote_id, state)
                    .await;
            }
            PeerSignal::RemoteTrack {
                remote_id,
                generation,
                track,
            } => {
                if !self.is_current(&remote_id, generation) {
                    return;
                }
                let key = self.registry.resolve(&remote_id).to_string();
                if let Some(stream_id) = self.registry.add_remote_track(&key, track) {
                    info!(remote_id = %key, stream_id = %stream_id, "Remote stream ready");
                    self.events.publish(CoreEvent::StreamReady {
                        remote_id: key,
                        stream_id,
                    });
                }
            }
            PeerSignal::GraceExpired { remote_id, epoch } => {
                self.engine
                    .grace_expired(&mut self.registry, &remote_id, epoch)
                    .await;
            }
        }
    }

    /// Callbacks from a connection that was closed or replaced are dropped.
    fn is_current(&self, remote_id: &str, generation: u64) -> bool {
        let current = self.registry.is_current(remote_id, generation);
        if !current {
            debug!(remote_id, generation, "Callback from a stale connection, dropping");
        }
        current
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall { reply } => {
                let result = self.start_call().await;
                self.reply(reply, result);
            }
            Command::EndCall { reply } => {
                let result = self.end_call().await;
                self.reply(reply, result);
            }
            Command::JoinRoom { room, role, reply } => {
                let result = self.join_room(&room, role).await;
                self.reply(reply, result);
            }
            Command::AnswerCall { caller_id, reply } => {
                let result = self.answer_call(&caller_id).await;
                self.reply(reply, result);
            }
            Command::DeclineCall { caller_id, reply } => {
                let result = self.decline_call(&caller_id);
                self.reply(reply, result);
            }
            Command::AcceptJoinRequest { reply } => {
                let result = self.accept_join_request().await;
                self.reply(reply, result);
            }
            Command::DeclineJoinRequest { reply } => {
                let result = self.decline_join_request();
                self.reply(reply, result);
            }
            Command::ToggleDriverStatus { employee_id, reply } => {
                let result = self.toggle_driver_status(&employee_id);
                self.reply(reply, result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Return a command result, surfacing session-level failures as an event.
    fn reply<T>(&self, reply: tokio::sync::oneshot::Sender<Result<T>>, result: Result<T>) {
        if let Err(e) = &result {
            if e.is_session_level() {
                self.events.publish(CoreEvent::Error {
                    message: e.user_message(),
                });
            }
            warn!("Command failed: {e}");
        }
        let _ = reply.send(result);
    }

    /// Process transport events, peer callbacks and commands until every
    /// [`SessionHandle`] is dropped.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let Some(mut peer_signals) = self.peer_signals.take() else {
            warn!("Call session controller started twice");
            return;
        };
        info!(role = %self.role, "Call session controller started");
        let mut inbound_open = true;

        loop {
            tokio::select! {
                event = inbound.recv(), if inbound_open => {
                    match event {
                        Some(Inbound::Message(message)) => self.handle_message(message).await,
                        Some(Inbound::Lost { reason }) => self.handle_transport_lost(reason),
                        None => {
                            inbound_open = false;
                            self.handle_transport_lost("transport dropped".to_string());
                        }
                    }
                }
                Some(signal) = peer_signals.recv() => {
                    self.handle_peer_signal(signal).await;
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
            }
        }

        if self.in_call() {
            let _ = self.end_call().await;
        } else {
            self.registry.clear().await;
        }
        info!("Call session controller stopped");
    }

    /// Start the controller task fed by `inbound`.
    pub fn spawn(self, inbound: mpsc::UnboundedReceiver<Inbound>) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = SessionHandle::new(tx, self.events.clone());
        let task = tokio::spawn(self.run(inbound, rx));
        (handle, task)
    }
}
