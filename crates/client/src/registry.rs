use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use dispatch_protocol::IceCandidate;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::media::{LocalStream, MediaSource};
use crate::peer::{PeerConnection, PeerConnector, PeerSignal, RemoteTrack};

/// Candidates held per remote id that has no entry; later ones are dropped.
pub const MAX_PARKED_CANDIDATES: usize = 32;

/// Negotiation state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Remote media owned by a single entry.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn stream_id(&self) -> Option<&str> {
        self.tracks.first().map(|t| t.stream_id.as_str())
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

pub struct PeerConnectionEntry {
    remote_id: String,
    /// Tags the callbacks of this entry's connection
    generation: u64,
    state: ConnectionState,
    connection: Arc<dyn PeerConnection>,
    local_stream: Option<Arc<LocalStream>>,
    remote_stream: RemoteStream,
    /// Remote candidates held until the remote description is applied
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    /// Bumped on every transition into `Failed`; stale grace timers compare against it
    failure_epoch: u64,
}

impl PeerConnectionEntry {
    fn new(
        remote_id: &str,
        generation: u64,
        connection: Arc<dyn PeerConnection>,
        local_stream: Option<Arc<LocalStream>>,
    ) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            generation,
            state: ConnectionState::New,
            connection,
            local_stream,
            remote_stream: RemoteStream::default(),
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            failure_epoch: 0,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.connection)
    }

    pub fn local_stream(&self) -> Option<&Arc<LocalStream>> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn failure_epoch(&self) -> u64 {
        self.failure_epoch
    }

    pub(crate) fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push_back(candidate);
    }

    pub(crate) fn take_pending_candidates(&mut self) -> VecDeque<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }
}

impl fmt::Debug for PeerConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionEntry")
            .field("remote_id", &self.remote_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("remote_description_set", &self.remote_description_set)
            .field("remote_tracks", &self.remote_stream.tracks.len())
            .finish()
    }
}

/// Active peer connections of the current room, keyed by remote participant id.
///
/// Holds at most one entry per remote id. Creation attaches the current local
/// stream; removal closes the connection.
pub struct PeerConnectionRegistry {
    entries: HashMap<String, PeerConnectionEntry>,
    /// Candidates for remote ids that have no entry yet
    parked: HashMap<String, VecDeque<IceCandidate>>,
    /// Former key → current key, for callbacks bound before a re-key
    aliases: HashMap<String, String>,
    next_generation: u64,
    connector: Arc<dyn PeerConnector>,
    media: Arc<MediaSource>,
    signals: mpsc::UnboundedSender<PeerSignal>,
    events: EventBus,
}

impl PeerConnectionRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        media: Arc<MediaSource>,
        signals: mpsc::UnboundedSender<PeerSignal>,
        events: EventBus,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            parked: HashMap::new(),
            aliases: HashMap::new(),
            next_generation: 0,
            connector,
            media,
            signals,
            events,
        }
    }

    /// Return the entry for `remote_id`, creating it in state `New` if absent.
    pub async fn get_or_create(&mut self, remote_id: &str) -> Result<&mut PeerConnectionEntry> {
        match self.entries.entry(remote_id.to_string()) {
            Entry::Occupied(existing) => Ok(existing.into_mut()),
            Entry::Vacant(slot) => {
                let local = self.media.stream();
                self.next_generation += 1;
                let generation = self.next_generation;
                let connection = self
                    .connector
                    .connect(remote_id, generation, local.clone(), self.signals.clone())
                    .await
                    .map_err(|source| CoreError::Negotiation {
                        remote_id: remote_id.to_string(),
                        source,
                    })?;

                let mut entry = PeerConnectionEntry::new(remote_id, generation, connection, local);
                if let Some(parked) = self.parked.remove(remote_id) {
                    debug!(remote_id, count = parked.len(), "Adopting parked ICE candidates");
                    entry.pending_candidates.extend(parked);
                }
                info!(remote_id, generation, "Peer entry created");
                self.events.publish(CoreEvent::PeerAdded {
                    remote_id: remote_id.to_string(),
                });
                Ok(slot.insert(entry))
            }
        }
    }

    /// Close and drop the entry for `remote_id`. Returns false if there was none.
    pub async fn remove(&mut self, remote_id: &str) -> bool {
        self.parked.remove(remote_id);
        let Some(mut entry) = self.entries.remove(remote_id) else {
            return false;
        };
        self.aliases.retain(|_, current| current != remote_id);
        entry.state = ConnectionState::Closed;
        if let Err(e) = entry.connection.close().await {
            warn!(remote_id, "Failed to close peer connection: {e:#}");
        }
        info!(remote_id, "Peer entry removed");
        self.events.publish(CoreEvent::PeerRemoved {
            remote_id: remote_id.to_string(),
        });
        true
    }

    /// Remove every entry and forget parked candidates. Returns the number removed.
    pub async fn clear(&mut self) -> usize {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.remove(&id).await {
                removed += 1;
            }
        }
        self.parked.clear();
        self.aliases.clear();
        removed
    }

    pub fn get(&self, remote_id: &str) -> Option<&PeerConnectionEntry> {
        self.entries.get(remote_id)
    }

    pub fn get_mut(&mut self, remote_id: &str) -> Option<&mut PeerConnectionEntry> {
        self.entries.get_mut(remote_id)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.entries.contains_key(remote_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &PeerConnectionEntry> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a callback tagged `generation` comes from the connection currently
    /// held for `remote_id` (after alias resolution).
    pub fn is_current(&self, remote_id: &str, generation: u64) -> bool {
        self.entries
            .get(self.resolve(remote_id))
            .is_some_and(|e| e.generation == generation)
    }

    /// Map an id captured by a connection callback to the entry's current key.
    pub fn resolve<'a>(&'a self, remote_id: &'a str) -> &'a str {
        self.aliases
            .get(remote_id)
            .map(String::as_str)
            .unwrap_or(remote_id)
    }

    /// Move the entry under `from` to `to`. Fails if `from` is absent or `to` is taken.
    /// Candidates parked for `to` join the entry's buffer.
    pub fn rekey(&mut self, from: &str, to: &str) -> bool {
        if from == to || self.entries.contains_key(to) {
            return false;
        }
        let Some(mut entry) = self.entries.remove(from) else {
            return false;
        };
        entry.remote_id = to.to_string();
        if let Some(parked) = self.parked.remove(to) {
            entry.pending_candidates.extend(parked);
        }
        self.entries.insert(to.to_string(), entry);
        self.aliases.insert(from.to_string(), to.to_string());
        info!(from, to, "Peer entry re-keyed");
        self.events.publish(CoreEvent::PeerRemoved {
            remote_id: from.to_string(),
        });
        self.events.publish(CoreEvent::PeerAdded {
            remote_id: to.to_string(),
        });
        true
    }

    /// Hold a candidate for a remote id that has no entry yet. At most
    /// [`MAX_PARKED_CANDIDATES`] are kept per id. Returns whether it was kept.
    pub fn park_candidate(&mut self, remote_id: &str, candidate: IceCandidate) -> bool {
        let parked = self.parked.entry(remote_id.to_string()).or_default();
        if parked.len() >= MAX_PARKED_CANDIDATES {
            debug!(remote_id, "Parked candidate limit reached, dropping");
            return false;
        }
        parked.push_back(candidate);
        true
    }

    pub fn parked_candidates(&self, remote_id: &str) -> usize {
        self.parked.get(remote_id).map_or(0, VecDeque::len)
    }

    /// Set an entry's state and publish the change. Returns the previous state.
    pub fn transition(&mut self, remote_id: &str, to: ConnectionState) -> Option<ConnectionState> {
        let entry = self.entries.get_mut(remote_id)?;
        let from = entry.state;
        if from == to {
            return Some(from);
        }
        entry.state = to;
        if to == ConnectionState::Failed {
            entry.failure_epoch += 1;
        }
        debug!(remote_id, %from, %to, "Peer state transition");
        self.events.publish(CoreEvent::PeerState {
            remote_id: remote_id.to_string(),
            state: to,
        });
        Some(from)
    }

    /// Mark every entry `Failed` (signaling transport lost).
    pub fn mark_all_failed(&mut self) {
        for id in self.ids() {
            self.transition(&id, ConnectionState::Failed);
        }
    }

    /// Record a remote track. Returns the stream id when it is the entry's first track.
    pub fn add_remote_track(&mut self, remote_id: &str, track: RemoteTrack) -> Option<String> {
        let entry = self.entries.get_mut(remote_id)?;
        let first = entry.remote_stream.tracks.is_empty();
        let stream_id = track.stream_id.clone();
        entry.remote_stream.tracks.push(track);
        first.then_some(stream_id)
    }

    pub(crate) fn signals(&self) -> mpsc::UnboundedSender<PeerSignal> {
        self.signals.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, media_with_stream};

    async fn registry() -> (PeerConnectionRegistry, MockConnector, EventBus) {
        let connector = MockConnector::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let events = EventBus::new(32);
        let registry = PeerConnectionRegistry::new(
            Arc::new(connector.clone()),
            media_with_stream().await,
            tx,
            events.clone(),
        );
        (registry, connector, events)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (mut registry, connector, _events) = registry().await;
        registry.get_or_create("x").await.unwrap();
        registry.get_or_create("x").await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(connector.created(), vec!["x".to_string()]);
        assert_eq!(registry.get("x").unwrap().state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn new_entry_shares_local_stream() {
        let (mut registry, _connector, _events) = registry().await;
        let local = registry.media.stream().unwrap();
        let entry = registry.get_or_create("x").await.unwrap();
        assert!(Arc::ptr_eq(entry.local_stream().unwrap(), &local));
    }

    #[tokio::test]
    async fn remove_closes_and_is_idempotent() {
        let (mut registry, connector, events) = registry().await;
        let mut rx = events.subscribe();
        registry.get_or_create("x").await.unwrap();
        assert!(registry.remove("x").await);
        assert!(!registry.remove("x").await);
        assert!(registry.is_empty());
        assert_eq!(connector.peer("x").unwrap().close_count(), 1);

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::PeerAdded {
                remote_id: "x".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::PeerRemoved {
                remote_id: "x".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_entry() {
        let (mut registry, connector, _events) = registry().await;
        connector.fail_connect("x");
        assert!(matches!(
            registry.get_or_create("x").await,
            Err(CoreError::Negotiation { .. })
        ));
        assert!(!registry.contains("x"));
    }

    #[tokio::test]
    async fn parked_candidates_are_adopted_on_creation() {
        let (mut registry, _connector, _events) = registry().await;
        registry.park_candidate("x", IceCandidate::new("c1"));
        registry.park_candidate("x", IceCandidate::new("c2"));
        assert_eq!(registry.parked_candidates("x"), 2);
        let entry = registry.get_or_create("x").await.unwrap();
        assert_eq!(entry.pending_candidates(), 2);
        assert_eq!(registry.parked_candidates("x"), 0);
    }

    #[tokio::test]
    async fn parked_candidates_are_capped_per_id() {
        let (mut registry, _connector, _events) = registry().await;
        for i in 0..MAX_PARKED_CANDIDATES {
            assert!(registry.park_candidate("x", IceCandidate::new(format!("c{i}"))));
        }
        assert!(!registry.park_candidate("x", IceCandidate::new("overflow")));
        assert_eq!(registry.parked_candidates("x"), MAX_PARKED_CANDIDATES);
        assert!(registry.park_candidate("y", IceCandidate::new("c0")));

        // Creation adopts what was kept, in order.
        let entry = registry.get_or_create("x").await.unwrap();
        assert_eq!(entry.pending_candidates(), MAX_PARKED_CANDIDATES);
    }

    #[tokio::test]
    async fn recreated_entry_gets_a_new_generation() {
        let (mut registry, _connector, _events) = registry().await;
        let first = registry.get_or_create("x").await.unwrap().generation();
        assert!(registry.is_current("x", first));

        registry.remove("x").await;
        assert!(!registry.is_current("x", first));
        let second = registry.get_or_create("x").await.unwrap().generation();
        assert_ne!(first, second);
        assert!(registry.is_current("x", second));
        assert!(!registry.is_current("x", first));
    }

    #[tokio::test]
    async fn rekey_moves_entry_and_records_alias() {
        let (mut registry, _connector, _events) = registry().await;
        registry.get_or_create("all").await.unwrap();
        registry.park_candidate("agent-1", IceCandidate::new("c1"));
        assert!(registry.rekey("all", "agent-1"));
        assert!(!registry.contains("all"));
        let entry = registry.get("agent-1").unwrap();
        assert_eq!(entry.remote_id(), "agent-1");
        assert_eq!(entry.pending_candidates(), 1);
        assert_eq!(registry.resolve("all"), "agent-1");
        assert_eq!(registry.resolve("other"), "other");
        assert!(registry.is_current("all", entry.generation()));

        // Target taken or source missing
        registry.get_or_create("b").await.unwrap();
        assert!(!registry.rekey("b", "agent-1"));
        assert!(!registry.rekey("missing", "c"));
    }

    #[tokio::test]
    async fn failed_transition_bumps_epoch() {
        let (mut registry, _connector, _events) = registry().await;
        registry.get_or_create("x").await.unwrap();
        registry.transition("x", ConnectionState::Failed);
        assert_eq!(registry.get("x").unwrap().failure_epoch(), 1);
        registry.transition("x", ConnectionState::Connected);
        registry.transition("x", ConnectionState::Failed);
        assert_eq!(registry.get("x").unwrap().failure_epoch(), 2);
        assert_eq!(registry.transition("missing", ConnectionState::Failed), None);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let (mut registry, connector, _events) = registry().await;
        for id in ["a", "b", "c"] {
            registry.get_or_create(id).await.unwrap();
        }
        registry.park_candidate("d", IceCandidate::new("c"));
        assert_eq!(registry.clear().await, 3);
        assert!(registry.is_empty());
        assert_eq!(registry.parked_candidates("d"), 0);
        for id in ["a", "b", "c"] {
            assert_eq!(connector.peer(id).unwrap().close_count(), 1);
        }
    }

    #[tokio::test]
    async fn first_remote_track_reports_stream() {
        let (mut registry, _connector, _events) = registry().await;
        registry.get_or_create("x").await.unwrap();
        let track = |id: &str| RemoteTrack {
            id: id.to_string(),
            stream_id: "s1".to_string(),
            kind: crate::media::TrackKind::Video,
            handle: None,
        };
        assert_eq!(registry.add_remote_track("x", track("v")), Some("s1".to_string()));
        assert_eq!(registry.add_remote_track("x", track("a")), None);
        assert_eq!(registry.get("x").unwrap().remote_stream().tracks().len(), 2);
        assert_eq!(registry.add_remote_track("missing", track("a")), None);
    }
}
