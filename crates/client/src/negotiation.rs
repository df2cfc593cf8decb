use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dispatch_protocol::{ClientMessage, IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::identity::SessionIdentity;
use crate::peer::{PeerSignal, TransportState};
use crate::registry::{ConnectionState, PeerConnectionRegistry};
use crate::transport::Signaler;

/// How a local offer reaches the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferRoute {
    /// `offer {to, offer}` to one participant
    Direct,
    /// `callAllUsers {signalData, from, name}` to every agent
    Broadcast { name: String },
}

/// How a local answer reaches the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerRoute {
    /// `answer {to, answer}`
    Direct,
    /// `answerCall {signal, to}` in reply to a broadcast call
    AnswerCall,
}

/// Offer/answer/ICE state machine over the entries of a [`PeerConnectionRegistry`].
pub struct NegotiationEngine {
    signaler: Arc<dyn Signaler>,
    identity: Arc<SessionIdentity>,
    failed_grace: Duration,
}

impl NegotiationEngine {
    pub fn new(
        signaler: Arc<dyn Signaler>,
        identity: Arc<SessionIdentity>,
        failed_grace: Duration,
    ) -> Self {
        Self {
            signaler,
            identity,
            failed_grace,
        }
    }

    /// Create and send a local offer to `remote_id`. Entries past `New` are left alone.
    /// Returns whether an offer was sent.
    pub async fn initiate(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        route: OfferRoute,
    ) -> Result<bool> {
        let local_id = self.identity.current_id()?.to_string();
        let entry = registry.get_or_create(remote_id).await?;
        if entry.state() != ConnectionState::New {
            debug!(remote_id, state = %entry.state(), "Offer already in progress, skipping");
            return Ok(false);
        }
        let connection = entry.connection();

        let sdp = match connection.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => return Err(self.fail(registry, remote_id, e)),
        };
        if let Err(e) = connection.set_local_description(SdpKind::Offer, &sdp).await {
            return Err(self.fail(registry, remote_id, e));
        }
        registry.transition(remote_id, ConnectionState::OfferSent);

        let offer = SessionDescription::offer(sdp);
        let message = match route {
            OfferRoute::Direct => ClientMessage::Offer {
                to: remote_id.to_string(),
                offer,
            },
            OfferRoute::Broadcast { name } => ClientMessage::CallAllUsers {
                signal_data: offer,
                from: local_id,
                name,
            },
        };
        self.signaler.send(message)?;
        info!(remote_id, "Offer sent");
        Ok(true)
    }

    /// Apply a remote offer and answer it.
    ///
    /// The offer is validated before any entry is created, so a malformed offer leaves
    /// the registry untouched. An offer for an entry that is already connected is a
    /// renegotiation and reuses it; one for an entry still answering the previous
    /// offer is a duplicate and is ignored. When both sides offered at once, the side
    /// with the greater id keeps its own offer and ignores the remote one.
    pub async fn receive_offer(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        offer: &SessionDescription,
        route: AnswerRoute,
    ) -> Result<()> {
        let sdp = offer
            .validate(SdpKind::Offer)
            .map_err(|source| CoreError::InvalidSignal {
                remote_id: remote_id.to_string(),
                source,
            })?;

        let mut carried = VecDeque::new();
        match registry.get(remote_id).map(|e| e.state()) {
            Some(ConnectionState::OfferReceived | ConnectionState::AnswerSent) => {
                debug!(remote_id, "Duplicate offer for the current round, ignoring");
                return Ok(());
            }
            Some(ConnectionState::OfferSent) => {
                let local_id = self.identity.current_id()?;
                if local_id > remote_id {
                    info!(remote_id, "Offer collision, keeping local offer");
                    return Ok(());
                }
                info!(remote_id, "Offer collision, yielding to remote offer");
                if let Some(entry) = registry.get_mut(remote_id) {
                    carried = entry.take_pending_candidates();
                }
                registry.remove(remote_id).await;
            }
            _ => {}
        }

        let entry = registry.get_or_create(remote_id).await?;
        for candidate in carried {
            entry.buffer_candidate(candidate);
        }
        let connection = entry.connection();
        if let Err(e) = connection.set_remote_description(SdpKind::Offer, sdp).await {
            return Err(self.fail(registry, remote_id, e));
        }
        if let Some(entry) = registry.get_mut(remote_id) {
            entry.mark_remote_description_set();
        }
        registry.transition(remote_id, ConnectionState::OfferReceived);
        self.flush_candidates(registry, remote_id).await;

        let answer_sdp = match connection.create_answer().await {
            Ok(sdp) => sdp,
            Err(e) => return Err(self.fail(registry, remote_id, e)),
        };
        if let Err(e) = connection
            .set_local_description(SdpKind::Answer, &answer_sdp)
            .await
        {
            return Err(self.fail(registry, remote_id, e));
        }
        registry.transition(remote_id, ConnectionState::AnswerSent);

        let answer = SessionDescription::answer(answer_sdp);
        let message = match route {
            AnswerRoute::Direct => ClientMessage::Answer {
                to: remote_id.to_string(),
                answer,
            },
            AnswerRoute::AnswerCall => ClientMessage::AnswerCall {
                signal: answer,
                to: remote_id.to_string(),
            },
        };
        self.signaler.send(message)?;
        info!(remote_id, "Answer sent");
        Ok(())
    }

    /// Apply a remote answer to a pending local offer. Answers for unknown entries or
    /// entries not in `OfferSent` are dropped. Returns whether the answer was applied.
    pub async fn receive_answer(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        answer: &SessionDescription,
    ) -> Result<bool> {
        let Some(entry) = registry.get(remote_id) else {
            debug!(remote_id, "Answer without a matching offer, dropping");
            return Ok(false);
        };
        if entry.state() != ConnectionState::OfferSent {
            debug!(remote_id, state = %entry.state(), "Late or duplicate answer, dropping");
            return Ok(false);
        }
        let sdp = answer
            .validate(SdpKind::Answer)
            .map_err(|source| CoreError::InvalidSignal {
                remote_id: remote_id.to_string(),
                source,
            })?;

        let connection = entry.connection();
        if let Err(e) = connection.set_remote_description(SdpKind::Answer, sdp).await {
            return Err(self.fail(registry, remote_id, e));
        }
        if let Some(entry) = registry.get_mut(remote_id) {
            entry.mark_remote_description_set();
        }
        registry.transition(remote_id, ConnectionState::AnswerReceived);
        self.flush_candidates(registry, remote_id).await;
        registry.transition(remote_id, ConnectionState::Connected);
        info!(remote_id, "Answer applied");
        Ok(true)
    }

    /// Apply a remote candidate, or hold it until the remote description is set.
    pub async fn receive_candidate(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        candidate: IceCandidate,
    ) {
        let Some(entry) = registry.get_mut(remote_id) else {
            debug!(remote_id, "Candidate for unknown peer, parking");
            registry.park_candidate(remote_id, candidate);
            return;
        };
        if !entry.remote_description_set() {
            entry.buffer_candidate(candidate);
            debug!(remote_id, buffered = entry.pending_candidates(), "Candidate buffered");
            return;
        }
        let connection = entry.connection();
        if let Err(e) = connection.add_ice_candidate(&candidate).await {
            warn!(remote_id, "Skipping ICE candidate: {e:#}");
        }
    }

    /// Apply buffered candidates in arrival order. Individual failures are skipped.
    async fn flush_candidates(&self, registry: &mut PeerConnectionRegistry, remote_id: &str) {
        let Some(entry) = registry.get_mut(remote_id) else {
            return;
        };
        let pending = entry.take_pending_candidates();
        if pending.is_empty() {
            return;
        }
        let connection = entry.connection();
        debug!(remote_id, count = pending.len(), "Flushing buffered candidates");
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(&candidate).await {
                warn!(remote_id, "Skipping buffered ICE candidate: {e:#}");
            }
        }
    }

    /// Send a locally gathered candidate to the entry's remote participant.
    pub fn local_candidate(
        &self,
        registry: &PeerConnectionRegistry,
        remote_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let remote_id = registry.resolve(remote_id);
        if !registry.contains(remote_id) {
            debug!(remote_id, "Local candidate for a removed peer, dropping");
            return Ok(());
        }
        self.signaler.send(ClientMessage::SendIceCandidate {
            candidate,
            to: remote_id.to_string(),
        })
    }

    /// Map a transport-level state change onto the entry.
    pub async fn observe_state(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        state: TransportState,
    ) {
        let resolved = registry.resolve(remote_id).to_string();
        let remote_id = resolved.as_str();
        let Some(entry) = registry.get(remote_id) else {
            return;
        };
        let current = entry.state();
        match state {
            TransportState::Connected => {
                if current == ConnectionState::Failed {
                    info!(remote_id, "Peer connection recovered");
                }
                registry.transition(remote_id, ConnectionState::Connected);
            }
            TransportState::Disconnected | TransportState::Failed => {
                if current != ConnectionState::Failed {
                    warn!(remote_id, ?state, "Peer connection lost");
                    registry.transition(remote_id, ConnectionState::Failed);
                    self.schedule_removal(registry, remote_id);
                }
            }
            TransportState::Closed => {
                registry.remove(remote_id).await;
            }
            TransportState::New | TransportState::Connecting => {
                debug!(remote_id, ?state, "Peer connection progressing");
            }
        }
    }

    /// Remove the entry if it is still failed in the same failure episode.
    pub async fn grace_expired(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        epoch: u64,
    ) -> bool {
        let still_failed = registry.get(remote_id).is_some_and(|e| {
            e.state() == ConnectionState::Failed && e.failure_epoch() == epoch
        });
        if !still_failed {
            return false;
        }
        info!(remote_id, "Peer did not recover, removing");
        registry.remove(remote_id).await
    }

    /// Contain a negotiation failure in its entry: mark it failed, schedule its
    /// removal, and hand back the error for logging.
    fn fail(
        &self,
        registry: &mut PeerConnectionRegistry,
        remote_id: &str,
        source: anyhow::Error,
    ) -> CoreError {
        warn!(remote_id, "Negotiation failed: {source:#}");
        if registry.transition(remote_id, ConnectionState::Failed) != Some(ConnectionState::Failed)
        {
            self.schedule_removal(registry, remote_id);
        }
        CoreError::Negotiation {
            remote_id: remote_id.to_string(),
            source,
        }
    }

    fn schedule_removal(&self, registry: &PeerConnectionRegistry, remote_id: &str) {
        let Some(epoch) = registry.get(remote_id).map(|e| e.failure_epoch()) else {
            return;
        };
        let signals = registry.signals();
        let grace = self.failed_grace;
        let remote_id = remote_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = signals.send(PeerSignal::GraceExpired { remote_id, epoch });
        });
    }
}
