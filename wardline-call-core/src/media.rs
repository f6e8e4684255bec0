//! Local media acquisition and track control.
//!
//! Capture hardware sits behind the [`MediaDevices`] seam so the call
//! engine can run without devices (and so tests can model denial). The
//! [`TrackController`] owns whatever tracks were captured for one session:
//! a denied or busy device leaves it empty and the call continues without
//! local media instead of aborting.

use crate::peer::{PeerError, PeerLink};
use crate::types::{MediaConstraints, TrackKind};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Errors raised while acquiring local media.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The user or platform refused access to the devices.
    #[error("media access denied: {0}")]
    AccessDenied(String),
    /// A capture device exists but is held by another application.
    #[error("capture device busy: {0}")]
    DeviceBusy(String),
    /// Any other capture failure.
    #[error("media capture failed: {0}")]
    Capture(String),
}

impl MediaError {
    /// Returns `true` for failures a call survives in no-media mode.
    ///
    /// Denied or busy devices degrade the call; anything else aborts
    /// session setup.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AccessDenied(_) | Self::DeviceBusy(_))
    }
}

/// One local capture track held by a session.
pub trait LocalTrack: Send + Sync {
    /// Stable id of the track within its session.
    fn id(&self) -> &str;

    /// Audio or video.
    fn kind(&self) -> TrackKind;

    /// Mutes or unmutes the track without renegotiating.
    fn set_enabled(&self, enabled: bool);

    /// Returns `true` while the track is live and unmuted.
    fn is_enabled(&self) -> bool;

    /// Stops capture permanently. Safe to call more than once.
    fn stop(&self);

    /// Underlying driver track, when this track can feed a peer connection.
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Capture capability of the platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Opens the devices named by `constraints` and returns their tracks.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::AccessDenied`] or [`MediaError::DeviceBusy`]
    /// when capture is unavailable but the call may continue, and
    /// [`MediaError::Capture`] for failures that should abort setup.
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;
}

/// Owns the local tracks of one session.
pub struct TrackController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    tracks: Vec<Arc<dyn LocalTrack>>,
    attached: HashSet<String>,
}

impl TrackController {
    /// Creates a controller that will capture with `constraints`.
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            tracks: Vec::new(),
            attached: HashSet::new(),
        }
    }

    /// Acquires local tracks once; a repeat call while tracks are held is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Propagates [`MediaError`] from the devices; check
    /// [`MediaError::is_recoverable`] to decide between degrading and
    /// aborting.
    pub async fn acquire(&mut self) -> Result<usize, MediaError> {
        if !self.tracks.is_empty() {
            return Ok(self.tracks.len());
        }
        let tracks = self.devices.acquire(&self.constraints).await?;
        tracing::debug!(count = tracks.len(), "local media acquired");
        self.tracks = tracks;
        Ok(self.tracks.len())
    }

    /// Adds every not-yet-attached track to `peer`.
    ///
    /// Returns how many tracks were newly attached; tracks attached by an
    /// earlier call are skipped, so this is safe to invoke on every
    /// negotiation round.
    ///
    /// # Errors
    ///
    /// Propagates the first [`PeerError`] from the driver.
    pub async fn attach(&mut self, peer: &dyn PeerLink) -> Result<usize, PeerError> {
        let mut added = 0;
        for track in &self.tracks {
            if self.attached.contains(track.id()) {
                continue;
            }
            peer.add_track(Arc::clone(track)).await?;
            self.attached.insert(track.id().to_string());
            added += 1;
        }
        if added > 0 {
            tracing::debug!(added, "local tracks attached to peer");
        }
        Ok(added)
    }

    /// Mutes or unmutes the microphone tracks. Returns how many tracks
    /// changed; zero when the session holds no media.
    pub fn set_audio_enabled(&self, enabled: bool) -> usize {
        self.set_kind_enabled(TrackKind::Audio, enabled)
    }

    /// Mutes or unmutes the camera tracks. Returns how many tracks
    /// changed; zero when the session holds no media.
    pub fn set_video_enabled(&self, enabled: bool) -> usize {
        self.set_kind_enabled(TrackKind::Video, enabled)
    }

    fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in &self.tracks {
            if track.kind() == kind {
                track.set_enabled(enabled);
                changed += 1;
            }
        }
        changed
    }

    /// Stops and drops every track. Safe to call more than once.
    pub fn release(&mut self) {
        if self.tracks.is_empty() {
            return;
        }
        for track in self.tracks.drain(..) {
            track.stop();
        }
        self.attached.clear();
        tracing::debug!("local media released");
    }

    /// Returns `true` while the session holds capture tracks.
    #[must_use]
    pub fn has_tracks(&self) -> bool {
        !self.tracks.is_empty()
    }
}

impl fmt::Debug for TrackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackController")
            .field("constraints", &self.constraints)
            .field("tracks", &self.tracks.len())
            .field("attached", &self.attached.len())
            .finish_non_exhaustive()
    }
}

/// A capture track backed by a webrtc sample track.
///
/// The engine creates the track; the embedding platform's capture pipeline
/// writes media samples into [`RtcLocalTrack::sample_track`].
pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    /// Creates a track of `kind` with the portal's codec parameters
    /// (Opus 48kHz stereo audio, VP8 video).
    #[must_use]
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            Self::codec(kind),
            id.clone(),
            "wardline-call".to_owned(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    fn codec(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }

    /// Handle the capture pipeline writes samples into.
    #[must_use]
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl LocalTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
    }
}

impl fmt::Debug for RtcLocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcLocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

/// Production [`MediaDevices`] built on webrtc sample tracks.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcMediaDevices;

impl RtcMediaDevices {
    /// Creates the device source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.has_audio() {
            tracks.push(Arc::new(RtcLocalTrack::new(
                TrackKind::Audio,
                format!("audio-{}", tracks.len()),
            )));
        }
        if constraints.has_video() {
            tracks.push(Arc::new(RtcLocalTrack::new(
                TrackKind::Video,
                format!("video-{}", tracks.len()),
            )));
        }
        Ok(tracks)
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<TrackController>();
    assert_send_sync::<RtcMediaDevices>();
    assert_send_sync::<RtcLocalTrack>();
};
