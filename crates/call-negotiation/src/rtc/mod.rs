//! webrtc-rs backed implementations of the connection and media seams.

mod media;

pub use media::{CapturePermission, RemoteAudioFrame, RtcMediaSession};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::connection::{
    ConnectionEvent, ConnectionEventSink, ConnectionFactory, ConnectionState, IceConnectionState,
    PeerConnection, RemoteAudioTrack, SignalingState,
};
use crate::error::ConnectionError;
use crate::media::LocalAudioTrack;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

/// ICE agent timeouts: (disconnected, failed, keepalive).
#[derive(Debug, Clone, Copy)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(3),
            failed: Duration::from_secs(10),
            keepalive: Duration::from_millis(500),
        }
    }
}

fn build_api(timeouts: IceTimeouts) -> Result<API, ConnectionError> {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(timeouts.disconnected),
        Some(timeouts.failed),
        Some(timeouts.keepalive),
    );

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RtcConnectionFactory {
    timeouts: IceTimeouts,
}

impl RtcConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ice_timeouts(mut self, timeouts: IceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        config: &CallConfig,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let api = build_api(self.timeouts)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        // One sendrecv audio line for the whole call; the microphone track is
        // swapped in later through the sender.
        let audio = pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;

        forward_events(&pc, events);
        tracing::debug!(
            target = "webrtc",
            ice_servers = config.ice_servers.len(),
            "peer connection created"
        );
        Ok(Arc::new(RtcPeerConnection { pc, audio }))
    }
}

fn forward_events(pc: &Arc<RTCPeerConnection>, events: ConnectionEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let event = match candidate {
            Some(candidate) => match candidate.to_json() {
                Ok(init) => ConnectionEvent::LocalCandidate(Some(IceCandidate::from(init))),
                Err(err) => {
                    tracing::warn!(target = "webrtc", error = %err, "unable to encode local candidate");
                    return Box::pin(async {});
                }
            },
            None => ConnectionEvent::LocalCandidate(None),
        };
        let _ = sink.send(event);
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = sink.send(ConnectionEvent::ConnectionStateChanged(connection_state(state)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = sink.send(ConnectionEvent::IceConnectionStateChanged(ice_state(state)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let _ = sink.send(ConnectionEvent::SignalingStateChanged(signaling_state(state)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            if track.kind() == RTPCodecType::Audio {
                let _ = events.send(ConnectionEvent::RemoteTrack(RemoteAudioTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    rtc: Some(track),
                }));
            } else {
                tracing::debug!(target = "webrtc", kind = ?track.kind(), "ignoring non-audio track");
            }
            Box::pin(async {})
        },
    ));
}

/// `PeerConnection` over a webrtc-rs `RTCPeerConnection`.
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    audio: Arc<RTCRtpTransceiver>,
}

impl RtcPeerConnection {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Rollback => rollback_description(desc.sdp),
    })
}

/// webrtc-rs parses the SDP of every local description, rollbacks included,
/// so the rollback carries the pending offer's body.
fn rollback_description(sdp: String) -> RTCSessionDescription {
    let mut desc = RTCSessionDescription::default();
    desc.sdp_type = RTCSdpType::Rollback;
    desc.sdp = sdp;
    desc
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, ConnectionError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(ConnectionError::Rtc(format!(
                "unsupported description type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
    }
}

fn ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceConnectionState::New,
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let state = self.signaling_state();
        if state == SignalingState::Stable {
            return Err(ConnectionError::InvalidState {
                operation: "rollback",
                state,
            });
        }
        let pending = self
            .pc
            .pending_local_description()
            .await
            .or(self.pc.pending_remote_description().await)
            .map(|desc| desc.sdp)
            .unwrap_or_default();
        self.pc
            .set_local_description(rollback_description(pending))
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|desc| from_rtc(desc).ok())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc
            .remote_description()
            .await
            .and_then(|desc| from_rtc(desc).ok())
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        ice_state(self.pc.ice_connection_state())
    }

    async fn replace_audio_track(&self, track: &LocalAudioTrack) -> Result<(), ConnectionError> {
        let sender = self.audio.sender().await;
        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        tracing::debug!(target = "webrtc", track_id = track.id(), "local audio track attached");
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConstraints;
    use tokio::sync::mpsc;

    #[test]
    fn rollback_keeps_the_pending_body() {
        let desc = rollback_description("v=0".into());
        assert_eq!(desc.sdp_type, RTCSdpType::Rollback);
        assert_eq!(desc.sdp, "v=0");
    }

    #[test]
    fn unspecified_states_map_to_initial_values() {
        assert_eq!(signaling_state(RTCSignalingState::Unspecified), SignalingState::Stable);
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), IceConnectionState::New);
    }

    #[tokio::test]
    async fn offer_carries_exactly_one_audio_line() {
        let (events, _rx) = mpsc::unbounded_channel();
        let connection = RtcConnectionFactory::new()
            .create(&CallConfig::localhost(), events)
            .await
            .unwrap();
        let track = LocalAudioTrack::new("mic", "call", AudioConstraints::default());
        connection.replace_audio_track(&track).await.unwrap();
        connection.replace_audio_track(&track).await.unwrap();

        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert_eq!(offer.sdp.matches("m=audio").count(), 1);

        connection.set_local_description(offer).await.unwrap();
        assert_eq!(connection.signaling_state(), SignalingState::HaveLocalOffer);
        connection.rollback().await.unwrap();
        assert_eq!(connection.signaling_state(), SignalingState::Stable);
        connection.close().await.unwrap();
    }
}
