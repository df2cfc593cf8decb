use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dispatch_protocol::{IceCandidate, IceConfig, SdpKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{LocalStream, TrackKind};

/// Transport-layer state reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// A track received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub handle: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Callbacks from a peer connection, delivered to the controller loop.
///
/// Connection callbacks carry the generation the connection was created with, so
/// callbacks from a closed or replaced connection can be told apart from the
/// current one under the same remote id.
#[derive(Debug)]
pub enum PeerSignal {
    LocalCandidate {
        remote_id: String,
        generation: u64,
        candidate: IceCandidate,
    },
    StateChanged {
        remote_id: String,
        generation: u64,
        state: TransportState,
    },
    RemoteTrack {
        remote_id: String,
        generation: u64,
        track: RemoteTrack,
    },
    /// A failed entry's recovery window closed
    GraceExpired {
        remote_id: String,
        epoch: u64,
    },
}

/// One negotiated media connection to a remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<String>;
    async fn create_answer(&self) -> anyhow::Result<String>;
    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<()>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Builds peer connections with the local tracks attached and callbacks wired
/// to the controller's signal channel.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote_id: &str,
        generation: u64,
        local: Option<Arc<LocalStream>>,
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

/// webrtc-rs backed connector.
pub struct RtcPeerConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerConnector {
    pub fn new(ice: &IceConfig) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers_from_config(ice),
        })
    }
}

fn ice_servers_from_config(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        remote_id: &str,
        generation: u64,
        local: Option<Arc<LocalStream>>,
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        if let Some(stream) = &local {
            for local_track in stream.tracks() {
                let sender = pc
                    .add_track(Arc::clone(&local_track.track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .with_context(|| format!("Failed to add {:?} track", local_track.kind))?;
                // RTCP must be drained for the interceptors (NACK, reports) to run.
                tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
            }
        }

        let ice_tx = signals.clone();
        let rid = remote_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let _ = ice_tx.send(PeerSignal::LocalCandidate {
                            remote_id: rid.clone(),
                            generation,
                            candidate: IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                                username_fragment: json.username_fragment,
                            },
                        });
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = signals.clone();
        let rid = remote_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(remote_id = %rid, generation, ?state, "Peer connection state changed");
            let _ = state_tx.send(PeerSignal::StateChanged {
                remote_id: rid.clone(),
                generation,
                state: state.into(),
            });
            Box::pin(async {})
        }));

        let track_tx = signals;
        let rid = remote_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = track_tx.send(PeerSignal::RemoteTrack {
                remote_id: rid.clone(),
                generation,
                track: RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(Arc::clone(&track)),
                },
            });
            Box::pin(async {})
        }));

        info!(remote_id, generation, "WebRTC peer connection created");
        Ok(Arc::new(RtcPeer { pc }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

fn description(kind: SdpKind, sdp: &str) -> anyhow::Result<RTCSessionDescription> {
    let desc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
    };
    desc.with_context(|| format!("Failed to parse SDP {kind}"))
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> anyhow::Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> anyhow::Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<()> {
        self.pc
            .set_local_description(description(kind, sdp)?)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<()> {
        self.pc
            .set_remote_description(description(kind, sdp)?)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Disconnected),
            TransportState::Disconnected
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }

    #[test]
    fn ice_servers_include_turn_credentials() {
        let ice = IceConfig {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_urls: vec!["turn:turn.example.com:3478".to_string()],
            turn_username: Some("user".to_string()),
            turn_credential: Some("secret".to_string()),
        };
        let servers = ice_servers_from_config(&ice);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn no_ice_servers_when_unconfigured() {
        let ice = IceConfig {
            stun_urls: Vec::new(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        };
        assert!(ice_servers_from_config(&ice).is_empty());
    }

    #[tokio::test]
    async fn rtc_offer_contains_local_tracks() {
        use crate::media::{CaptureDevice, SampleTrackDevice};
        use dispatch_protocol::MediaConfig;

        let connector = RtcPeerConnector::new(&IceConfig {
            stun_urls: Vec::new(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        })
        .unwrap();
        let stream = Arc::new(
            SampleTrackDevice
                .open(&MediaConfig::default())
                .await
                .unwrap(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = connector.connect("remote", 1, Some(stream), tx).await.unwrap();
        let sdp = peer.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        peer.close().await.unwrap();
    }
}
