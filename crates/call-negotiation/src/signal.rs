use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::session::{CallId, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    #[serde(rename = "ice")]
    IceCandidate(IceCandidate),
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::IceCandidate(_) => "ice",
        }
    }
}

/// One signaling message relayed between the two participants of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: ParticipantId,
    pub call_id: CallId,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalMessage {
    pub fn new(from: ParticipantId, call_id: CallId, body: SignalBody) -> Self {
        Self {
            from,
            call_id,
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn offer_uses_flat_wire_shape() {
        let message = SignalMessage::new(
            "alice".into(),
            "123".into(),
            SignalBody::Offer(SessionDescription::offer("v=0")),
        );
        let value: Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "offer",
                "from": "alice",
                "call_id": "123",
                "payload": { "type": "offer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn ice_payload_matches_browser_candidate_init() {
        let raw = json!({
            "kind": "ice",
            "from": "bob",
            "call_id": "123",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        });
        let message = SignalMessage::from_json(raw.to_string().as_bytes()).unwrap();
        assert_eq!(message.kind(), "ice");
        let SignalBody::IceCandidate(candidate) = message.body else {
            panic!("expected ice candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = br#"{"kind":"bye","from":"bob","call_id":"123","payload":{}}"#;
        assert!(SignalMessage::from_json(raw).is_err());
    }
}
