//! In-memory doubles for the peer-connection and signaling seams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dispatch_protocol::{ClientMessage, IceCandidate, MediaConfig, SdpKind};
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};
use crate::media::{LocalStream, MediaSource, SampleTrackDevice};
use crate::peer::{PeerConnection, PeerConnector, PeerSignal, TransportState};
use crate::transport::Signaler;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Peer connection that records every call. Candidates whose text starts with
/// `bad` fail to apply. Closing reports `Closed` through the signal channel, as
/// webrtc-rs does.
#[derive(Default)]
pub struct MockPeer {
    pub remote_id: String,
    pub generation: u64,
    pub has_local_stream: bool,
    signals: Option<mpsc::UnboundedSender<PeerSignal>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    local: Mutex<Vec<(SdpKind, String)>>,
    remote: Mutex<Vec<(SdpKind, String)>>,
    candidates: Mutex<Vec<String>>,
    closes: AtomicUsize,
    fail_remote: AtomicBool,
}

impl MockPeer {
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.candidates).clone()
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        lock(&self.remote).clone()
    }

    pub fn local_descriptions(&self) -> Vec<(SdpKind, String)> {
        lock(&self.local).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_remote_descriptions(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    pub fn report_state(&self, state: TransportState) {
        if let Some(tx) = &self.signals {
            let _ = tx.send(PeerSignal::StateChanged {
                remote_id: self.remote_id.clone(),
                generation: self.generation,
                state,
            });
        }
    }

    pub fn report_candidate(&self, candidate: &str) {
        if let Some(tx) = &self.signals {
            let _ = tx.send(PeerSignal::LocalCandidate {
                remote_id: self.remote_id.clone(),
                generation: self.generation,
                candidate: IceCandidate::new(candidate),
            });
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> anyhow::Result<String> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("v=0 offer-for-{} #{n}", self.remote_id))
    }

    async fn create_answer(&self) -> anyhow::Result<String> {
        if lock(&self.remote).last().map(|(kind, _)| *kind) != Some(SdpKind::Offer) {
            anyhow::bail!("no remote offer to answer");
        }
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("v=0 answer-for-{} #{n}", self.remote_id))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<()> {
        lock(&self.local).push((kind, sdp.to_string()));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<()> {
        if self.fail_remote.load(Ordering::SeqCst) {
            anyhow::bail!("remote description rejected");
        }
        lock(&self.remote).push((kind, sdp.to_string()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        if candidate.candidate.starts_with("bad") {
            anyhow::bail!("unparsable candidate");
        }
        lock(&self.candidates).push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.report_state(TransportState::Closed);
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    created: Vec<String>,
    peers: HashMap<String, Arc<MockPeer>>,
    failing: HashSet<String>,
}

/// Connector handing out [`MockPeer`]s. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Remote ids in creation order, including recreations.
    pub fn created(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    /// Most recent peer created for `remote_id`.
    pub fn peer(&self, remote_id: &str) -> Option<Arc<MockPeer>> {
        lock(&self.state).peers.get(remote_id).cloned()
    }

    pub fn fail_connect(&self, remote_id: &str) {
        lock(&self.state).failing.insert(remote_id.to_string());
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        remote_id: &str,
        generation: u64,
        local: Option<Arc<LocalStream>>,
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        let mut state = lock(&self.state);
        if state.failing.contains(remote_id) {
            anyhow::bail!("peer connection refused");
        }
        let peer = Arc::new(MockPeer {
            remote_id: remote_id.to_string(),
            generation,
            has_local_stream: local.is_some(),
            signals: Some(signals),
            ..Default::default()
        });
        state.created.push(remote_id.to_string());
        state.peers.insert(remote_id.to_string(), Arc::clone(&peer));
        Ok(peer)
    }
}

/// Signaler that records outgoing messages instead of sending them.
#[derive(Default)]
pub struct RecordingSignaler {
    sent: Mutex<Vec<ClientMessage>>,
    disconnected: AtomicBool,
}

impl RecordingSignaler {
    pub fn sent(&self) -> Vec<ClientMessage> {
        lock(&self.sent).clone()
    }

    pub fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

impl Signaler for RecordingSignaler {
    fn send(&self, message: ClientMessage) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(CoreError::NotConnected);
        }
        lock(&self.sent).push(message);
        Ok(())
    }
}

/// Media source with an audio+video stream already acquired.
pub async fn media_with_stream() -> Arc<MediaSource> {
    let media = Arc::new(MediaSource::new(
        Arc::new(SampleTrackDevice),
        MediaConfig::default(),
    ));
    media.acquire().await.unwrap();
    media
}

/// Media source that has not acquired anything.
pub fn media_without_stream() -> Arc<MediaSource> {
    Arc::new(MediaSource::new(
        Arc::new(SampleTrackDevice),
        MediaConfig::default(),
    ))
}
