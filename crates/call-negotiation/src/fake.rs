//! Deterministic stand-ins for the connection, media and signaling seams.
//!
//! `FakePeerConnection` follows the offer/answer rules of a real peer
//! connection closely enough to reproduce glare, early candidates and stale
//! answers, and reports its events on the same channel a real connection
//! would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::config::{AudioConstraints, CallConfig};
use crate::connection::{
    ConnectionEvent, ConnectionEventSink, ConnectionFactory, ConnectionState, IceConnectionState,
    PeerConnection, RemoteAudioTrack, SignalingState,
};
use crate::error::{ConnectionError, MediaError, SignalingError};
use crate::media::{LocalAudioTrack, MediaSession, TrackSlot};
use crate::session::CallId;
use crate::signal::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
use crate::transport::{Ack, SignalingTransport, Subscription};

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    connection: ConnectionState,
    ice: IceConnectionState,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    offers_created: usize,
    answers_created: usize,
    rollbacks: usize,
    close_calls: usize,
    gathered: bool,
    applied_candidates: Vec<IceCandidate>,
    replaced_tracks: Vec<String>,
    fail_next_rollback: bool,
}

pub struct FakePeerConnection {
    label: String,
    candidates_per_gather: usize,
    auto_connect: bool,
    events: ConnectionEventSink,
    state: Mutex<FakeState>,
}

impl FakePeerConnection {
    pub fn new(label: impl Into<String>, events: ConnectionEventSink) -> Self {
        Self {
            label: label.into(),
            candidates_per_gather: 2,
            auto_connect: true,
            events,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                ice: IceConnectionState::New,
                pending_local: None,
                pending_remote: None,
                current_local: None,
                current_remote: None,
                offers_created: 0,
                answers_created: 0,
                rollbacks: 0,
                close_calls: 0,
                gathered: false,
                applied_candidates: Vec::new(),
                replaced_tracks: Vec::new(),
                fail_next_rollback: false,
            }),
        }
    }

    /// Number of local candidates emitted after the first local description.
    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates_per_gather = count;
        self
    }

    /// When false the fake stays in `new` after negotiation completes.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fail_next_rollback(&self) {
        self.state.lock().fail_next_rollback = true;
    }

    /// Reports a transport failure as the ICE agent would.
    pub fn fail(&self) {
        let mut state = self.state.lock();
        state.connection = ConnectionState::Failed;
        state.ice = IceConnectionState::Failed;
        drop(state);
        self.emit(ConnectionEvent::IceConnectionStateChanged(
            IceConnectionState::Failed,
        ));
        self.emit(ConnectionEvent::ConnectionStateChanged(
            ConnectionState::Failed,
        ));
    }

    /// Reports that the remote side closed the transport.
    pub fn remote_closed(&self) {
        self.state.lock().connection = ConnectionState::Closed;
        self.emit(ConnectionEvent::ConnectionStateChanged(
            ConnectionState::Closed,
        ));
    }

    pub fn emit_remote_track(&self, id: impl Into<String>) {
        self.emit(ConnectionEvent::RemoteTrack(RemoteAudioTrack {
            id: id.into(),
            stream_id: self.label.clone(),
            rtc: None,
        }));
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn replaced_tracks(&self) -> Vec<String> {
        self.state.lock().replaced_tracks.clone()
    }

    /// A fake connection always carries exactly one audio transceiver.
    pub fn audio_transceivers(&self) -> usize {
        1
    }

    /// Committed `(local, remote)` descriptions.
    pub fn current_descriptions(&self) -> (Option<SessionDescription>, Option<SessionDescription>) {
        let state = self.state.lock();
        (state.current_local.clone(), state.current_remote.clone())
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(state: &FakeState, operation: &'static str) -> Result<(), ConnectionError> {
        if state.signaling == SignalingState::Closed {
            return Err(ConnectionError::InvalidState {
                operation,
                state: SignalingState::Closed,
            });
        }
        Ok(())
    }

    fn set_signaling(&self, state: &mut FakeState, next: SignalingState) {
        if state.signaling != next {
            state.signaling = next;
            self.emit(ConnectionEvent::SignalingStateChanged(next));
        }
    }

    fn gather_if_first(&self, state: &mut FakeState) {
        if state.gathered {
            return;
        }
        state.gathered = true;
        for index in 0..self.candidates_per_gather {
            self.emit(ConnectionEvent::LocalCandidate(Some(IceCandidate::new(
                format!(
                    "candidate:{index} 1 udp 2122260223 10.0.0.{} {} typ host",
                    index + 1,
                    50_000 + index
                ),
            ))));
        }
        self.emit(ConnectionEvent::LocalCandidate(None));
    }

    fn maybe_connect(&self, state: &mut FakeState) {
        if !self.auto_connect
            || state.connection != ConnectionState::New
            || state.current_local.is_none()
            || state.current_remote.is_none()
        {
            return;
        }
        state.connection = ConnectionState::Connected;
        state.ice = IceConnectionState::Connected;
        self.emit(ConnectionEvent::ConnectionStateChanged(
            ConnectionState::Connecting,
        ));
        self.emit(ConnectionEvent::IceConnectionStateChanged(
            IceConnectionState::Connected,
        ));
        self.emit(ConnectionEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ));
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "create_offer")?;
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 o={} offer-{} m=audio",
            self.label, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "create_answer")?;
        let Some(remote) = state.pending_remote.clone() else {
            return Err(ConnectionError::InvalidState {
                operation: "create_answer",
                state: state.signaling,
            });
        };
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "v=0 o={} answer-to[{}] m=audio",
            self.label, remote.sdp
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "set_local_description")?;
        match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.pending_local = Some(desc);
                self.set_signaling(&mut state, SignalingState::HaveLocalOffer);
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                state.current_local = Some(desc);
                state.current_remote = state.pending_remote.take();
                state.pending_local = None;
                self.set_signaling(&mut state, SignalingState::Stable);
            }
            (_, current) => {
                return Err(ConnectionError::InvalidState {
                    operation: "set_local_description",
                    state: current,
                });
            }
        }
        self.gather_if_first(&mut state);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "set_remote_description")?;
        match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                state.pending_remote = Some(desc);
                self.set_signaling(&mut state, SignalingState::HaveRemoteOffer);
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                state.current_remote = Some(desc);
                state.current_local = state.pending_local.take();
                self.set_signaling(&mut state, SignalingState::Stable);
                self.maybe_connect(&mut state);
            }
            (_, current) => {
                return Err(ConnectionError::InvalidState {
                    operation: "set_remote_description",
                    state: current,
                });
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "rollback")?;
        if std::mem::take(&mut state.fail_next_rollback) {
            return Err(ConnectionError::Rtc("rollback rejected".into()));
        }
        match state.signaling {
            SignalingState::HaveLocalOffer => state.pending_local = None,
            SignalingState::HaveRemoteOffer => state.pending_remote = None,
            current => {
                return Err(ConnectionError::InvalidState {
                    operation: "rollback",
                    state: current,
                });
            }
        }
        state.rollbacks += 1;
        self.set_signaling(&mut state, SignalingState::Stable);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "add_ice_candidate")?;
        if state.pending_remote.is_none() && state.current_remote.is_none() {
            return Err(ConnectionError::InvalidState {
                operation: "add_ice_candidate",
                state: state.signaling,
            });
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_remote
            .clone()
            .or_else(|| state.current_remote.clone())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn replace_audio_track(&self, track: &LocalAudioTrack) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "replace_audio_track")?;
        state.replaced_tracks.push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
        state.ice = IceConnectionState::Closed;
        Ok(())
    }
}

/// Hands out `FakePeerConnection`s and remembers each one.
pub struct FakeConnectionFactory {
    label: String,
    candidates_per_gather: usize,
    auto_connect: bool,
    fail_creation: AtomicBool,
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
}

impl FakeConnectionFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            candidates_per_gather: 2,
            auto_connect: true,
            fail_creation: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates_per_gather = count;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakePeerConnection>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakePeerConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(ConnectionError::Rtc("connection construction refused".into()));
        }
        let mut created = self.created.lock();
        let connection = Arc::new(
            FakePeerConnection::new(format!("{}-{}", self.label, created.len() + 1), events)
                .with_candidates(self.candidates_per_gather)
                .with_auto_connect(self.auto_connect),
        );
        created.push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Granted,
    Denied,
    NoDevice,
}

/// Microphone stand-in that counts what happened to its tracks.
pub struct FakeMediaSession {
    capture: Capture,
    autoplay: bool,
    constraints: AudioConstraints,
    slot: TrackSlot,
    acquired: AtomicUsize,
    stopped: AtomicUsize,
    blocked: Mutex<Option<RemoteAudioTrack>>,
    playing: Mutex<Option<RemoteAudioTrack>>,
}

impl FakeMediaSession {
    pub fn new() -> Self {
        Self::with_capture(Capture::Granted)
    }

    pub fn denied() -> Self {
        Self::with_capture(Capture::Denied)
    }

    pub fn without_device() -> Self {
        Self::with_capture(Capture::NoDevice)
    }

    fn with_capture(capture: Capture) -> Self {
        Self {
            capture,
            autoplay: true,
            constraints: AudioConstraints::default(),
            slot: TrackSlot::new(),
            acquired: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            blocked: Mutex::new(None),
            playing: Mutex::new(None),
        }
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn tracks_stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn current_track(&self) -> Option<LocalAudioTrack> {
        self.slot.current()
    }

    pub fn playing(&self) -> Option<String> {
        self.playing.lock().as_ref().map(|track| track.id.clone())
    }
}

impl Default for FakeMediaSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn acquire(&self) -> Result<LocalAudioTrack, MediaError> {
        match self.capture {
            Capture::Denied => return Err(MediaError::PermissionDenied),
            Capture::NoDevice => {
                return Err(MediaError::DeviceUnavailable("no input devices".into()));
            }
            Capture::Granted => {}
        }
        let index = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let track = LocalAudioTrack::new(format!("mic-{index}"), "fake", self.constraints);
        if let Some(previous) = self.slot.install(track.clone()) {
            if previous.stop() {
                self.stopped.fetch_add(1, Ordering::SeqCst);
            }
        }
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
        let stopped = self.slot.release();
        self.stopped.fetch_add(stopped, Ordering::SeqCst);
        self.blocked.lock().take();
        self.playing.lock().take();
        stopped
    }

    async fn play_remote(&self, track: RemoteAudioTrack) -> Result<(), MediaError> {
        if self.autoplay {
            *self.playing.lock() = Some(track);
            Ok(())
        } else {
            *self.blocked.lock() = Some(track);
            Err(MediaError::PlaybackBlocked)
        }
    }

    async fn resume_playback(&self) -> Result<(), MediaError> {
        if let Some(track) = self.blocked.lock().take() {
            *self.playing.lock() = Some(track);
        }
        Ok(())
    }
}

/// Signaling transport that records what was sent and lets a test inject
/// inbound messages by hand.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SignalMessage>>,
    inbound: Mutex<Vec<(Uuid, mpsc::UnboundedSender<SignalMessage>)>>,
    reject_sends: AtomicBool,
    unsubscribed: AtomicUsize,
    hold_subscriptions: AtomicBool,
    subscriptions_opened: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    /// Drains everything sent so far.
    pub fn take_sent(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn inject(&self, message: SignalMessage) {
        for (_, tx) in self.inbound.lock().iter() {
            let _ = tx.send(message.clone());
        }
    }

    pub fn unsubscribed(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    /// While held, `subscribe` does not complete.
    pub fn hold_subscriptions(&self, hold: bool) {
        self.hold_subscriptions.store(hold, Ordering::SeqCst);
        if !hold {
            self.subscriptions_opened.notify_waiters();
        }
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError> {
        loop {
            let opened = self.subscriptions_opened.notified();
            if !self.hold_subscriptions.load(Ordering::SeqCst) {
                break;
            }
            opened.await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::new(call_id.clone(), rx);
        self.inbound.lock().push((subscription.id(), tx));
        Ok(subscription)
    }

    async fn send(&self, message: &SignalMessage) -> Result<Ack, SignalingError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::NotAcknowledged("rejected by test".into()));
        }
        self.sent.lock().push(message.clone());
        Ok(Ack { delivered_to: 1 })
    }

    async fn unsubscribe(&self, subscription: Uuid) {
        let mut inbound = self.inbound.lock();
        let before = inbound.len();
        inbound.retain(|(id, _)| *id != subscription);
        if inbound.len() != before {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
