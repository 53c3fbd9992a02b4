//! Local capture tracks
//!
//! Capture itself is platform code behind [`MediaSource`]. Whatever produces
//! frames writes encoded samples into a [`LocalTrack`], which wraps a
//! `TrackLocalStaticSample` shared by every peer connection of the call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{ClientError, Result};
use huddle_proto::MediaKind;

const STREAM_ID: &str = "huddle-local";

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// One outgoing track
///
/// Clones share the enabled flag and the underlying sample sink.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    sink: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    #[must_use]
    pub fn new(kind: MediaKind, sink: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            sink,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Camera track (VP8)
    #[must_use]
    pub fn camera(track_id: impl Into<String>) -> Self {
        let sink = TrackLocalStaticSample::new(vp8_capability(), track_id.into(), STREAM_ID.to_owned());
        Self::new(MediaKind::Video, Arc::new(sink))
    }

    /// Display capture track (VP8)
    #[must_use]
    pub fn display(track_id: impl Into<String>) -> Self {
        let sink = TrackLocalStaticSample::new(vp8_capability(), track_id.into(), STREAM_ID.to_owned());
        Self::new(MediaKind::Screen, Arc::new(sink))
    }

    /// Microphone track (Opus)
    #[must_use]
    pub fn microphone(track_id: impl Into<String>) -> Self {
        let sink = TrackLocalStaticSample::new(opus_capability(), track_id.into(), STREAM_ID.to_owned());
        Self::new(MediaKind::Audio, Arc::new(sink))
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.sink.id()
    }

    /// The sink handed to peer connections
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.sink)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Push one encoded sample to every peer; dropped while disabled
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Err(ClientError::Media(format!("{} track stopped", self.kind)));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.sink.write_sample(sample).await?;
        Ok(())
    }

    /// Push one encoded frame lasting `duration`
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Tracks returned by one camera/microphone acquisition
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub video: Option<LocalTrack>,
    pub audio: Option<LocalTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.video.iter().chain(self.audio.iter())
    }
}

/// Platform capture
///
/// Failures (permission denied, no device) are reported as
/// [`ClientError::Media`].
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn user_media(&self, video: bool, audio: bool) -> Result<LocalStream>;

    async fn display_media(&self) -> Result<LocalTrack>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_enabled_flag() {
        let track = LocalTrack::camera("cam");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(track.id(), "cam");
        assert_eq!(track.kind(), MediaKind::Video);
    }

    #[tokio::test]
    async fn test_write_after_stop_fails() {
        let track = LocalTrack::microphone("mic");
        let frame = Bytes::from_static(&[0u8; 4]);
        let duration = Duration::from_millis(20);
        track.set_enabled(false);
        assert!(track.write_frame(frame.clone(), duration).await.is_ok());

        track.stop();
        assert!(matches!(
            track.write_frame(frame, duration).await,
            Err(ClientError::Media(_))
        ));
    }

    #[test]
    fn test_stream_tracks() {
        let stream = LocalStream {
            video: Some(LocalTrack::camera("cam")),
            audio: None,
        };
        assert_eq!(stream.tracks().count(), 1);
    }
}
