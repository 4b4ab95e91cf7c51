use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{AudioConstraints, CallConfig};
use crate::connection::{PeerConnection, RemoteAudioTrack};
use crate::error::MediaError;
use crate::media::{LocalAudioTrack, MediaSession, TrackSlot};

/// Outcome of the platform's microphone permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePermission {
    Granted,
    Denied,
}

/// One RTP payload received on the remote audio track.
#[derive(Debug, Clone)]
pub struct RemoteAudioFrame {
    pub track_id: String,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Media session whose microphone is a sample-fed webrtc-rs track. The host
/// application writes encoded frames through `LocalAudioTrack::write_frame`
/// and receives remote audio on the playback channel.
pub struct RtcMediaSession {
    permission: CapturePermission,
    devices: Vec<String>,
    constraints: AudioConstraints,
    autoplay: AtomicBool,
    slot: TrackSlot,
    held: Mutex<Option<RemoteAudioTrack>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    playback: Option<mpsc::UnboundedSender<RemoteAudioFrame>>,
}

impl RtcMediaSession {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            permission: CapturePermission::Granted,
            devices: vec!["default".to_string()],
            constraints: config.audio,
            autoplay: AtomicBool::new(config.autoplay),
            slot: TrackSlot::new(),
            held: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            playback: None,
        }
    }

    pub fn with_permission(mut self, permission: CapturePermission) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = devices;
        self
    }

    /// Remote frames are delivered here once playback is allowed.
    pub fn with_playback(mut self, sink: mpsc::UnboundedSender<RemoteAudioFrame>) -> Self {
        self.playback = Some(sink);
        self
    }

    pub fn local_track(&self) -> Option<LocalAudioTrack> {
        self.slot.live()
    }

    fn spawn_reader(&self, track: RemoteAudioTrack) {
        let Some(rtc) = track.rtc else {
            return;
        };
        let sink = self.playback.clone();
        let handle = tokio::spawn(read_remote(rtc, track.id, sink));
        self.readers.lock().push(handle);
    }
}

async fn read_remote(
    track: Arc<TrackRemote>,
    track_id: String,
    sink: Option<mpsc::UnboundedSender<RemoteAudioFrame>>,
) {
    tracing::debug!(target = "webrtc", track_id = %track_id, "remote audio playback started");
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let Some(sink) = sink.as_ref() else {
                    continue;
                };
                let frame = RemoteAudioFrame {
                    track_id: track_id.clone(),
                    sequence: packet.header.sequence_number,
                    timestamp: packet.header.timestamp,
                    payload: packet.payload,
                };
                if sink.send(frame).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(target = "webrtc", track_id = %track_id, error = %err, "remote audio ended");
                break;
            }
        }
    }
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn acquire(&self) -> Result<LocalAudioTrack, MediaError> {
        if self.permission == CapturePermission::Denied {
            return Err(MediaError::PermissionDenied);
        }
        let Some(device) = self.devices.first() else {
            return Err(MediaError::DeviceUnavailable("no audio input devices".into()));
        };
        let track = LocalAudioTrack::new(
            format!("audio-{}", Uuid::new_v4()),
            format!("mic-{device}"),
            self.constraints,
        );
        if let Some(previous) = self.slot.install(track.clone()) {
            previous.stop();
        }
        tracing::info!(
            target = "webrtc",
            track_id = track.id(),
            device = %device,
            echo_cancellation = self.constraints.echo_cancellation,
            noise_suppression = self.constraints.noise_suppression,
            auto_gain_control = self.constraints.auto_gain_control,
            "microphone acquired"
        );
        Ok(track)
    }

    async fn attach(&self, connection: &dyn PeerConnection) -> Result<(), MediaError> {
        self.slot.attach(connection).await
    }

    fn toggle_mute(&self) -> bool {
        self.slot.toggle_mute()
    }

    fn is_muted(&self) -> bool {
        self.slot.is_muted()
    }

    fn release(&self) -> usize {
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        self.held.lock().take();
        self.slot.release()
    }

    async fn play_remote(&self, track: RemoteAudioTrack) -> Result<(), MediaError> {
        if !self.autoplay.load(Ordering::SeqCst) {
            *self.held.lock() = Some(track);
            return Err(MediaError::PlaybackBlocked);
        }
        self.spawn_reader(track);
        Ok(())
    }

    async fn resume_playback(&self) -> Result<(), MediaError> {
        self.autoplay.store(true, Ordering::SeqCst);
        let held = self.held.lock().take();
        if let Some(track) = held {
            self.spawn_reader(track);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteAudioTrack {
        RemoteAudioTrack {
            id: "remote".into(),
            stream_id: "peer".into(),
            rtc: None,
        }
    }

    #[tokio::test]
    async fn denied_permission_fails_acquire() {
        let media = RtcMediaSession::new(&CallConfig::default())
            .with_permission(CapturePermission::Denied);
        assert_eq!(media.acquire().await.unwrap_err(), MediaError::PermissionDenied);
    }

    #[tokio::test]
    async fn no_devices_fails_acquire() {
        let media = RtcMediaSession::new(&CallConfig::default()).with_devices(vec![]);
        assert!(matches!(
            media.acquire().await.unwrap_err(),
            MediaError::DeviceUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn reacquire_stops_the_previous_track() {
        let media = RtcMediaSession::new(&CallConfig::default());
        let first = media.acquire().await.unwrap();
        let second = media.acquire().await.unwrap();
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(media.release(), 1);
        assert_eq!(media.release(), 0);
    }

    #[tokio::test]
    async fn blocked_playback_resumes_on_request() {
        let mut config = CallConfig::default();
        config.autoplay = false;
        let media = RtcMediaSession::new(&config);
        assert_eq!(
            media.play_remote(remote()).await.unwrap_err(),
            MediaError::PlaybackBlocked
        );
        media.resume_playback().await.unwrap();
        media.play_remote(remote()).await.unwrap();
    }
}
