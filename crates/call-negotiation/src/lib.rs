//! Peer-to-peer audio call negotiation.
//!
//! A `CallLifecycle` owns one call at a time. It acquires the microphone,
//! builds a `PeerConnection`, and runs a `NegotiationEngine` that exchanges
//! offers, answers and ICE candidates over a `SignalingTransport` using the
//! perfect-negotiation pattern: the Callee is polite and yields on glare, the
//! Caller is not.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod fake;
pub mod ice_buffer;
pub mod lifecycle;
pub mod media;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod transport;

pub use config::{AudioConstraints, CallConfig, CallConfigBuilder, IceServer};
pub use connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceConnectionState, PeerConnection,
    RemoteAudioTrack, SignalingState,
};
pub use engine::{
    CallEpoch, EpochCounter, FallbackOffer, InboundEvent, NegotiationEngine, NegotiationPhase,
    NegotiationState, Transition,
};
pub use error::{
    CallError, ConfigError, ConnectionError, MediaError, NegotiationError, SignalingError,
};
pub use lifecycle::{CallEvent, CallLifecycle, CallStatus};
pub use media::{LocalAudioTrack, MediaSession};
pub use session::{CallId, CallSession, ParticipantId, Role};
pub use signal::{IceCandidate, SdpKind, SessionDescription, SignalBody, SignalMessage};
pub use transport::{Ack, BusSignalingTransport, SignalingTransport, Subscription};
