use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::AudioConstraints;
use crate::connection::{PeerConnection, RemoteAudioTrack};
use crate::error::MediaError;

/// Handle on the captured microphone stream. Clones share enablement and
/// liveness with the original.
#[derive(Clone)]
pub struct LocalAudioTrack {
    id: String,
    settings: AudioConstraints,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl std::fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, settings: AudioConstraints) -> Self {
        let id = id.into();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: settings.sample_rate,
                channels: settings.channels,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.into(),
        ));
        Self {
            id,
            settings,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> AudioConstraints {
        self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Ends the track. Returns true only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Feeds one encoded frame. Muted or stopped tracks drop the frame and
    /// return `Ok(false)`.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<bool, MediaError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|err| MediaError::Backend(err.to_string()))?;
        Ok(true)
    }
}

/// Owns the call's local capture handle and its one outbound/inbound track
/// pair.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Requests microphone access with the configured processing enabled.
    async fn acquire(&self) -> Result<LocalAudioTrack, MediaError>;

    /// Binds the acquired track to the connection's audio transceiver by
    /// replacement, so repeated calls never add a media line.
    async fn attach(&self, connection: &dyn PeerConnection) -> Result<(), MediaError>;

    /// Flips local enablement and returns the new muted flag. Never
    /// renegotiates.
    fn toggle_mute(&self) -> bool;

    fn is_muted(&self) -> bool;

    /// Stops every local track. Returns how many tracks this call stopped.
    fn release(&self) -> usize;

    /// Starts rendering inbound audio, or returns `PlaybackBlocked` and keeps
    /// the track until `resume_playback`.
    async fn play_remote(&self, track: RemoteAudioTrack) -> Result<(), MediaError>;

    async fn resume_playback(&self) -> Result<(), MediaError>;
}

/// Track bookkeeping shared by the media session implementations.
#[derive(Debug, Default)]
pub struct TrackSlot {
    current: Mutex<Option<LocalAudioTrack>>,
}

impl TrackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, track: LocalAudioTrack) -> Option<LocalAudioTrack> {
        self.current.lock().replace(track)
    }

    pub fn current(&self) -> Option<LocalAudioTrack> {
        self.current.lock().clone()
    }

    pub fn live(&self) -> Option<LocalAudioTrack> {
        self.current().filter(LocalAudioTrack::is_live)
    }

    pub fn toggle_mute(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                !enabled
            }
            None => false,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|track| !track.is_enabled())
            .unwrap_or(false)
    }

    pub fn release(&self) -> usize {
        match self.current.lock().take() {
            Some(track) if track.stop() => 1,
            _ => 0,
        }
    }

    pub async fn attach(&self, connection: &dyn PeerConnection) -> Result<(), MediaError> {
        let track = self.live().ok_or(MediaError::TrackUnavailable)?;
        connection
            .replace_audio_track(&track)
            .await
            .map_err(|err| MediaError::Backend(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_enablement_only() {
        let slot = TrackSlot::new();
        assert!(!slot.toggle_mute());
        let track = LocalAudioTrack::new("mic", "call", AudioConstraints::default());
        slot.install(track.clone());

        assert!(slot.toggle_mute());
        assert!(!track.is_enabled());
        assert!(track.is_live());
        assert!(slot.is_muted());

        assert!(!slot.toggle_mute());
        assert!(track.is_enabled());
    }

    #[test]
    fn release_stops_once() {
        let slot = TrackSlot::new();
        let track = LocalAudioTrack::new("mic", "call", AudioConstraints::default());
        slot.install(track.clone());
        assert_eq!(slot.release(), 1);
        assert!(!track.is_live());
        assert_eq!(slot.release(), 0);
        assert!(!track.stop());
    }

    #[tokio::test]
    async fn muted_track_drops_frames() {
        let track = LocalAudioTrack::new("mic", "call", AudioConstraints::default());
        track.set_enabled(false);
        let written = track
            .write_frame(Bytes::from_static(&[0xf8, 0xff, 0xfe]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!written);
    }
}
