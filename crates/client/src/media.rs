use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dispatch_protocol::MediaConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

pub struct LocalTrack {
    pub kind: TrackKind,
    pub track: Arc<TrackLocalStaticSample>,
}

/// The local capture stream. Shared read-only by every peer connection; only
/// [`MediaSource`] stops it.
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    stopped: AtomicBool,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Feed one encoded sample into the track of the given kind.
    /// Samples written after the stream was stopped are discarded.
    pub async fn write_sample(
        &self,
        kind: TrackKind,
        data: bytes::Bytes,
        duration: Duration,
    ) -> anyhow::Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let Some(local) = self.tracks.iter().find(|t| t.kind == kind) else {
            anyhow::bail!("stream {} has no {kind:?} track", self.id);
        };
        local
            .track
            .write_sample(&webrtc::media::Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to write {kind:?} sample"))?;
        Ok(())
    }
}

/// Device media API: opens one audio+video capture and returns its tracks.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self, constraints: &MediaConfig) -> anyhow::Result<LocalStream>;
}

/// Capture backed by sample tracks (Opus audio, VP8 video) that an external
/// encoder pipeline writes into via [`LocalStream::write_sample`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleTrackDevice;

#[async_trait]
impl CaptureDevice for SampleTrackDevice {
    async fn open(&self, constraints: &MediaConfig) -> anyhow::Result<LocalStream> {
        let stream_id = format!("dispatch-{}", Uuid::new_v4());
        let mut tracks = Vec::new();

        if constraints.audio {
            tracks.push(LocalTrack {
                kind: TrackKind::Audio,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio".to_string(),
                    stream_id.clone(),
                )),
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                kind: TrackKind::Video,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_string(),
                    stream_id.clone(),
                )),
            });
        }

        Ok(LocalStream::new(stream_id, tracks))
    }
}

/// Acquires and owns the local capture stream.
pub struct MediaSource {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConfig,
    stream: Mutex<Option<Arc<LocalStream>>>,
}

impl MediaSource {
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConfig) -> Self {
        Self {
            device,
            constraints,
            stream: Mutex::new(None),
        }
    }

    /// Open the capture device, or return the stream already acquired.
    pub async fn acquire(&self) -> Result<Arc<LocalStream>> {
        if let Some(stream) = self.stream() {
            return Ok(stream);
        }
        if !self.constraints.audio && !self.constraints.video {
            return Err(CoreError::MediaUnavailable(
                "neither audio nor video was requested".to_string(),
            ));
        }

        let stream = self
            .device
            .open(&self.constraints)
            .await
            .map_err(|e| CoreError::MediaUnavailable(format!("{e:#}")))?;
        if stream.tracks().is_empty() {
            return Err(CoreError::MediaUnavailable(
                "capture device returned no tracks".to_string(),
            ));
        }

        let stream = Arc::new(stream);
        info!(
            stream_id = stream.id(),
            tracks = stream.tracks().len(),
            "Local capture stream acquired"
        );
        *self.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&stream));
        Ok(stream)
    }

    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop every local track and release the stream. A later `acquire` opens a new one.
    pub fn stop(&self) {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match stream {
            Some(stream) => {
                stream.stop();
                info!(stream_id = stream.id(), "Local capture stream stopped");
            }
            None => debug!("No local capture stream to stop"),
        }
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("constraints", &self.constraints)
            .field("acquired", &self.stream().is_some())
            .finish()
    }
}

/// Capture device that always fails, used when capture is denied or absent.
#[derive(Debug, Clone)]
pub struct UnavailableDevice {
    pub reason: String,
}

#[async_trait]
impl CaptureDevice for UnavailableDevice {
    async fn open(&self, _constraints: &MediaConfig) -> anyhow::Result<LocalStream> {
        warn!(reason = %self.reason, "Capture device unavailable");
        anyhow::bail!("{}", self.reason)
    }
}
