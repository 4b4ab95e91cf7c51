use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::error::ConnectionError;
use crate::media::LocalAudioTrack;
use crate::signal::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Inbound audio reported by the connection. Fakes carry no rtc track.
#[derive(Clone)]
pub struct RemoteAudioTrack {
    pub id: String,
    pub stream_id: String,
    pub rtc: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAudioTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("rtc", &self.rtc.is_some())
            .finish()
    }
}

/// Everything the connection reports on its own, in the order it happened.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    ConnectionStateChanged(ConnectionState),
    IceConnectionStateChanged(IceConnectionState),
    SignalingStateChanged(SignalingState),
    RemoteTrack(RemoteAudioTrack),
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;
pub type ConnectionEventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// The negotiated transport for one call attempt.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), ConnectionError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Reverts a pending local offer back to `stable`.
    async fn rollback(&self) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn has_remote_description(&self) -> bool {
        self.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Puts `track` on the single audio transceiver's sender.
    async fn replace_audio_track(&self, track: &LocalAudioTrack) -> Result<(), ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Builds a fresh connection per call attempt. The connection reports its
/// events on `events` instead of through callbacks.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallConfig,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}
