use thiserror::Error;

use crate::connection::SignalingState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio input unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no live local audio track to attach")]
    TrackUnavailable,
    #[error("remote audio playback blocked until user interaction")]
    PlaybackBlocked,
    #[error("media backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling send not acknowledged: {0}")]
    NotAcknowledged(String),
    #[error("signaling encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("operation {operation} invalid in signaling state {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("webrtc error: {0}")]
    Rtc(String),
}

impl From<webrtc::Error> for ConnectionError {
    fn from(err: webrtc::Error) -> Self {
        ConnectionError::Rtc(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("rollback failed: {0}")]
    RollbackFailed(ConnectionError),
    #[error("{step} failed: {source}")]
    Connection {
        step: &'static str,
        #[source]
        source: ConnectionError,
    },
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl NegotiationError {
    pub(crate) fn step(step: &'static str) -> impl FnOnce(ConnectionError) -> Self {
        move |source| NegotiationError::Connection { step, source }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already active")]
    AlreadyActive,
    #[error("call start cancelled by end()")]
    Cancelled,
    #[error("local participant {0} is not part of call")]
    NotAParticipant(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("connection setup failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("signaling setup failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("negotiation startup failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("config parse error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Toml(value.to_string())
    }
}
