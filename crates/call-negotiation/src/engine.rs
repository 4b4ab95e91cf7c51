use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::{ConnectionEvent, ConnectionState, PeerConnection, SignalingState};
use crate::error::NegotiationError;
use crate::ice_buffer::IceCandidateBuffer;
use crate::session::{CallId, CallSession, ParticipantId, Role};
use crate::signal::{IceCandidate, SessionDescription, SignalBody, SignalMessage};
use crate::transport::SignalingTransport;

/// Where this side stands in the offer/answer exchange. Layered on top of the
/// connection's own signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    AwaitingLocalOffer,
    AwaitingRemoteAnswer,
    AwaitingRemoteOffer,
    AwaitingLocalAnswer,
    /// Rolling back a local offer to yield to the remote one.
    Collision,
    /// Descriptions exchanged; waiting for the transport to come up.
    Negotiated,
    Connected,
    Closed,
    Failed,
}

impl NegotiationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationPhase::Closed | NegotiationPhase::Failed)
    }
}

/// Single-shot offer the Callee sends when the Caller's never shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOffer {
    Disarmed,
    Armed { deadline: Instant },
    Sent,
}

#[derive(Debug, Clone)]
pub struct NegotiationState {
    pub phase: NegotiationPhase,
    pub making_offer: bool,
    pub received_offer: bool,
    pub candidates: IceCandidateBuffer,
    pub fallback: FallbackOffer,
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self {
            phase: NegotiationPhase::Idle,
            making_offer: false,
            received_offer: false,
            candidates: IceCandidateBuffer::new(),
            fallback: FallbackOffer::Disarmed,
        }
    }
}

impl NegotiationState {
    fn reset(&mut self, phase: NegotiationPhase) {
        *self = NegotiationState {
            phase,
            ..NegotiationState::default()
        };
    }
}

/// Hands out call epochs. Advancing the counter turns every older epoch
/// stale.
#[derive(Debug, Clone, Default)]
pub struct EpochCounter(Arc<AtomicU64>);

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> CallEpoch {
        let issued = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        CallEpoch {
            counter: Arc::clone(&self.0),
            issued,
        }
    }

    pub fn invalidate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct CallEpoch {
    counter: Arc<AtomicU64>,
    issued: u64,
}

impl CallEpoch {
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.issued
    }

    pub fn value(&self) -> u64 {
        self.issued
    }
}

/// Input to `NegotiationEngine::dispatch`.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Signal(SignalMessage),
    Connection(ConnectionEvent),
    FallbackTimerElapsed,
}

/// What a dispatched event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
    /// The call epoch moved on while the event was being handled.
    Stale,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Perfect-negotiation state machine for one call attempt.
///
/// The Callee is the polite peer: on an offer collision it rolls back its own
/// offer and accepts the remote one. The Caller ignores colliding offers.
/// Every await is followed by an epoch check so work that completes after the
/// call ended has no effect.
pub struct NegotiationEngine {
    call_id: CallId,
    local: ParticipantId,
    role: Role,
    connection: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalingTransport>,
    epoch: CallEpoch,
    fallback_timeout: Duration,
    state: NegotiationState,
}

impl NegotiationEngine {
    pub fn new(
        session: &CallSession,
        local: ParticipantId,
        connection: Arc<dyn PeerConnection>,
        transport: Arc<dyn SignalingTransport>,
        epoch: CallEpoch,
        fallback_timeout: Duration,
    ) -> Self {
        let role = session.role_of(&local);
        Self {
            call_id: session.call_id.clone(),
            local,
            role,
            connection,
            transport,
            epoch,
            fallback_timeout,
            state: NegotiationState::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    /// Deadline of the armed fallback offer, if any.
    pub fn fallback_deadline(&self) -> Option<Instant> {
        match self.state.fallback {
            FallbackOffer::Armed { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Role-based startup. The Caller offers right away; the Callee waits and
    /// arms the fallback timer.
    pub async fn start(&mut self) -> Result<Transition, NegotiationError> {
        tracing::info!(
            target = "webrtc",
            call_id = %self.call_id,
            role = %self.role,
            "starting negotiation"
        );
        match self.role {
            Role::Caller => self.make_offer().await,
            Role::Callee => {
                let deadline = Instant::now() + self.fallback_timeout;
                self.state.fallback = FallbackOffer::Armed { deadline };
                self.state.phase = NegotiationPhase::AwaitingRemoteOffer;
                Ok(Transition::Applied)
            }
        }
    }

    pub async fn dispatch(&mut self, event: InboundEvent) -> Result<Transition, NegotiationError> {
        if !self.epoch.is_current() || self.state.phase.is_terminal() {
            return Ok(Transition::Stale);
        }
        match event {
            InboundEvent::Signal(message) => self.on_signal(message).await,
            InboundEvent::Connection(event) => self.on_connection_event(event).await,
            InboundEvent::FallbackTimerElapsed => self.on_fallback_timer().await,
        }
    }

    /// Clears flags and buffered candidates. The connection itself is closed
    /// by whoever tears the call down.
    pub fn close(&mut self) {
        self.state.reset(NegotiationPhase::Closed);
    }

    async fn on_signal(&mut self, message: SignalMessage) -> Result<Transition, NegotiationError> {
        if message.from == self.local {
            tracing::trace!(target = "webrtc", call_id = %self.call_id, kind = message.kind(), "ignoring own signal");
            return Ok(Transition::Ignored);
        }
        if message.call_id != self.call_id {
            tracing::debug!(
                target = "webrtc",
                call_id = %self.call_id,
                other = %message.call_id,
                "ignoring signal for another call"
            );
            return Ok(Transition::Ignored);
        }
        match message.body {
            SignalBody::Offer(offer) => self.on_offer(offer).await,
            SignalBody::Answer(answer) => self.on_answer(answer).await,
            SignalBody::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<Transition, NegotiationError> {
        self.state.received_offer = true;
        if matches!(self.state.fallback, FallbackOffer::Armed { .. }) {
            self.state.fallback = FallbackOffer::Disarmed;
        }

        let signaling = self.connection.signaling_state();
        let collision = self.state.making_offer || signaling != SignalingState::Stable;
        tracing::debug!(
            target = "webrtc",
            call_id = %self.call_id,
            role = %self.role,
            signaling_state = %signaling,
            collision,
            "offer received"
        );

        if collision {
            if !self.role.is_polite() {
                tracing::debug!(
                    target = "webrtc",
                    call_id = %self.call_id,
                    signaling_state = %signaling,
                    "ignoring colliding offer"
                );
                return Ok(Transition::Ignored);
            }
            self.state.phase = NegotiationPhase::Collision;
            if signaling != SignalingState::Stable {
                if let Err(err) = self.connection.rollback().await {
                    tracing::warn!(
                        target = "webrtc",
                        call_id = %self.call_id,
                        signaling_state = %signaling,
                        error = %err,
                        "rollback failed; dropping remote offer"
                    );
                    self.state.phase = NegotiationPhase::AwaitingRemoteAnswer;
                    return Err(NegotiationError::RollbackFailed(err));
                }
                if !self.epoch.is_current() {
                    return Ok(Transition::Stale);
                }
            }
            self.state.making_offer = false;
        }

        self.state.phase = NegotiationPhase::AwaitingLocalAnswer;
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(NegotiationError::step("set_remote_description"))?;
        if !self.epoch.is_current() {
            return Ok(Transition::Stale);
        }
        self.flush_candidates().await;

        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(NegotiationError::step("create_answer"))?;
        if !self.epoch.is_current() {
            return Ok(Transition::Stale);
        }
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(NegotiationError::step("set_local_description"))?;
        if !self.epoch.is_current() {
            return Ok(Transition::Stale);
        }

        self.send(SignalBody::Answer(answer)).await;
        self.advance_to_negotiated();
        Ok(Transition::Applied)
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<Transition, NegotiationError> {
        let signaling = self.connection.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            tracing::debug!(
                target = "webrtc",
                call_id = %self.call_id,
                signaling_state = %signaling,
                "discarding stale answer"
            );
            return Ok(Transition::Ignored);
        }

        self.connection
            .set_remote_description(answer)
            .await
            .map_err(NegotiationError::step("set_remote_description"))?;
        if !self.epoch.is_current() {
            return Ok(Transition::Stale);
        }
        self.state.making_offer = false;
        self.flush_candidates().await;
        self.advance_to_negotiated();
        tracing::debug!(target = "webrtc", call_id = %self.call_id, role = %self.role, "answer applied");
        Ok(Transition::Applied)
    }

    async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<Transition, NegotiationError> {
        if !self.connection.has_remote_description().await {
            self.state.candidates.push(candidate);
            tracing::trace!(
                target = "webrtc",
                call_id = %self.call_id,
                buffered = self.state.candidates.len(),
                "buffered early candidate"
            );
            return Ok(Transition::Applied);
        }
        if !self.epoch.is_current() {
            return Ok(Transition::Stale);
        }
        self.connection
            .add_ice_candidate(candidate)
            .await
            .map_err(NegotiationError::step("add_ice_candidate"))?;
        Ok(Transition::Applied)
    }

    async fn on_connection_event(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<Transition, NegotiationError> {
        match event {
            ConnectionEvent::LocalCandidate(Some(candidate)) => {
                self.send(SignalBody::IceCandidate(candidate)).await;
                Ok(Transition::Applied)
            }
            ConnectionEvent::LocalCandidate(None) => Ok(Transition::Ignored),
            ConnectionEvent::ConnectionStateChanged(state) => {
                tracing::info!(
                    target = "webrtc",
                    call_id = %self.call_id,
                    role = %self.role,
                    state = ?state,
                    "connection state changed"
                );
                Ok(match state {
                    ConnectionState::Connected => {
                        self.state.phase = NegotiationPhase::Connected;
                        Transition::Connected
                    }
                    ConnectionState::Disconnected => Transition::Disconnected,
                    ConnectionState::Failed => {
                        self.state.reset(NegotiationPhase::Failed);
                        Transition::Failed
                    }
                    ConnectionState::Closed => {
                        self.state.reset(NegotiationPhase::Closed);
                        Transition::Closed
                    }
                    ConnectionState::New | ConnectionState::Connecting => Transition::Applied,
                })
            }
            ConnectionEvent::IceConnectionStateChanged(state) => {
                tracing::debug!(target = "webrtc", call_id = %self.call_id, state = ?state, "ice connection state changed");
                Ok(Transition::Applied)
            }
            ConnectionEvent::SignalingStateChanged(state) => {
                tracing::trace!(target = "webrtc", call_id = %self.call_id, signaling_state = %state, "signaling state changed");
                Ok(Transition::Applied)
            }
            // Remote media is routed by the lifecycle, not negotiated here.
            ConnectionEvent::RemoteTrack(_) => Ok(Transition::Ignored),
        }
    }

    async fn on_fallback_timer(&mut self) -> Result<Transition, NegotiationError> {
        let FallbackOffer::Armed { deadline } = self.state.fallback else {
            return Ok(Transition::Ignored);
        };
        if Instant::now() < deadline {
            return Ok(Transition::Ignored);
        }
        let signaling = self.connection.signaling_state();
        if self.state.received_offer || signaling != SignalingState::Stable {
            self.state.fallback = FallbackOffer::Disarmed;
            return Ok(Transition::Ignored);
        }
        self.state.fallback = FallbackOffer::Sent;
        tracing::info!(
            target = "webrtc",
            call_id = %self.call_id,
            role = %self.role,
            timeout_ms = self.fallback_timeout.as_millis() as u64,
            "no offer received; sending fallback offer"
        );
        self.make_offer().await
    }

    async fn make_offer(&mut self) -> Result<Transition, NegotiationError> {
        self.state.making_offer = true;
        self.state.phase = NegotiationPhase::AwaitingLocalOffer;
        let result = self.create_and_apply_offer().await;
        self.state.making_offer = false;

        let Some(offer) = result? else {
            return Ok(Transition::Stale);
        };
        self.state.phase = NegotiationPhase::AwaitingRemoteAnswer;
        self.send(SignalBody::Offer(offer)).await;
        Ok(Transition::Applied)
    }

    async fn create_and_apply_offer(&self) -> Result<Option<SessionDescription>, NegotiationError> {
        let offer = self
            .connection
            .create_offer()
            .await
            .map_err(NegotiationError::step("create_offer"))?;
        if !self.epoch.is_current() {
            return Ok(None);
        }
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::step("set_local_description"))?;
        if !self.epoch.is_current() {
            return Ok(None);
        }
        Ok(Some(offer))
    }

    async fn flush_candidates(&mut self) {
        let pending = self.state.candidates.take_all();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(
            target = "webrtc",
            call_id = %self.call_id,
            count = pending.len(),
            "applying buffered candidates"
        );
        for candidate in pending {
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                tracing::warn!(
                    target = "webrtc",
                    call_id = %self.call_id,
                    error = %err,
                    "buffered candidate rejected"
                );
            }
        }
    }

    fn advance_to_negotiated(&mut self) {
        if self.state.phase != NegotiationPhase::Connected {
            self.state.phase = NegotiationPhase::Negotiated;
        }
    }

    async fn send(&self, body: SignalBody) {
        let message = SignalMessage::new(self.local.clone(), self.call_id.clone(), body);
        match self.transport.send(&message).await {
            Ok(ack) => tracing::debug!(
                target = "webrtc",
                call_id = %self.call_id,
                kind = message.kind(),
                delivered_to = ack.delivered_to,
                "signal sent"
            ),
            Err(err) => tracing::warn!(
                target = "webrtc",
                call_id = %self.call_id,
                kind = message.kind(),
                error = %err,
                "signal send failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEventSink, ConnectionEvents};
    use crate::fake::{FakePeerConnection, RecordingTransport};
    use crate::signal::SdpKind;
    use tokio::sync::mpsc;

    const CALL: &str = "call-1";

    struct Peer {
        engine: NegotiationEngine,
        connection: Arc<FakePeerConnection>,
        transport: Arc<RecordingTransport>,
        events: ConnectionEvents,
        counter: EpochCounter,
    }

    impl Peer {
        fn new(identity: &str) -> Self {
            Self::with_connection(identity, |events| FakePeerConnection::new(identity, events))
        }

        fn with_connection(
            identity: &str,
            build: impl FnOnce(ConnectionEventSink) -> FakePeerConnection,
        ) -> Self {
            let session = CallSession::new(CALL, "alice", "bob");
            let (tx, events) = mpsc::unbounded_channel();
            let connection = Arc::new(build(tx));
            let transport = Arc::new(RecordingTransport::new());
            let counter = EpochCounter::new();
            let engine = NegotiationEngine::new(
                &session,
                identity.into(),
                connection.clone(),
                transport.clone(),
                counter.begin(),
                Duration::from_secs(2),
            );
            Self {
                engine,
                connection,
                transport,
                events,
                counter,
            }
        }

        async fn pump_connection_events(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.engine
                    .dispatch(InboundEvent::Connection(event))
                    .await
                    .unwrap();
            }
        }
    }

    async fn deliver(from: &Peer, to: &mut Peer) -> usize {
        let sent = from.transport.take_sent();
        let count = sent.len();
        for message in sent {
            to.engine.dispatch(InboundEvent::Signal(message)).await.unwrap();
        }
        count
    }

    async fn settle(caller: &mut Peer, callee: &mut Peer) {
        loop {
            caller.pump_connection_events().await;
            callee.pump_connection_events().await;
            let moved = deliver(caller, callee).await + deliver(callee, caller).await;
            if moved == 0 {
                break;
            }
        }
    }

    fn remote(from: &str, body: SignalBody) -> SignalMessage {
        SignalMessage::new(from.into(), CALL.into(), body)
    }

    #[tokio::test]
    async fn caller_offers_and_callee_answers() {
        let mut caller = Peer::new("alice");
        let mut callee = Peer::new("bob");
        assert_eq!(caller.engine.role(), Role::Caller);
        assert_eq!(callee.engine.role(), Role::Callee);

        caller.engine.start().await.unwrap();
        callee.engine.start().await.unwrap();
        assert_eq!(caller.engine.state().phase, NegotiationPhase::AwaitingRemoteAnswer);
        assert_eq!(callee.engine.state().phase, NegotiationPhase::AwaitingRemoteOffer);

        settle(&mut caller, &mut callee).await;

        assert_eq!(caller.engine.state().phase, NegotiationPhase::Connected);
        assert_eq!(callee.engine.state().phase, NegotiationPhase::Connected);
        assert_eq!(caller.connection.offers_created(), 1);
        assert_eq!(callee.connection.offers_created(), 0);
        assert!(callee.engine.fallback_deadline().is_none());
        assert_eq!(caller.connection.applied_candidates().len(), 2);
        assert_eq!(callee.connection.applied_candidates().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn glare_resolves_in_favour_of_the_caller() {
        let mut caller = Peer::new("alice");
        let mut callee = Peer::new("bob");
        caller.engine.start().await.unwrap();
        callee.engine.start().await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let fired = callee
            .engine
            .dispatch(InboundEvent::FallbackTimerElapsed)
            .await
            .unwrap();
        assert_eq!(fired, Transition::Applied);
        assert_eq!(callee.connection.signaling_state(), SignalingState::HaveLocalOffer);

        settle(&mut caller, &mut callee).await;

        assert_eq!(callee.connection.rollbacks(), 1);
        assert_eq!(caller.connection.rollbacks(), 0);
        assert_eq!(caller.connection.answers_created(), 0);
        assert_eq!(callee.connection.answers_created(), 1);

        let (caller_local, caller_remote) = caller.connection.current_descriptions();
        let (callee_local, callee_remote) = callee.connection.current_descriptions();
        assert_eq!(caller_local, callee_remote);
        assert_eq!(caller_remote, callee_local);
        assert!(caller_local.unwrap().sdp.contains("o=alice offer-1"));
    }

    #[tokio::test]
    async fn early_candidates_flush_in_arrival_order() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();

        for index in 0..3 {
            callee
                .engine
                .dispatch(InboundEvent::Signal(remote(
                    "alice",
                    SignalBody::IceCandidate(IceCandidate::new(format!("candidate:{index}"))),
                )))
                .await
                .unwrap();
        }
        assert_eq!(callee.engine.state().candidates.len(), 3);
        assert!(callee.connection.applied_candidates().is_empty());

        callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::Offer(SessionDescription::offer("v=0 o=alice")),
            )))
            .await
            .unwrap();

        let applied: Vec<_> = callee
            .connection
            .applied_candidates()
            .into_iter()
            .map(|candidate| candidate.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:0", "candidate:1", "candidate:2"]);
        assert!(callee.engine.state().candidates.is_empty());

        callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::IceCandidate(IceCandidate::new("candidate:3")),
            )))
            .await
            .unwrap();
        assert_eq!(callee.connection.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn stale_answer_changes_nothing() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();
        let before = callee.engine.state().phase;

        let outcome = callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::Answer(SessionDescription::answer("v=0 late")),
            )))
            .await
            .unwrap();

        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(callee.engine.state().phase, before);
        assert_eq!(callee.connection.signaling_state(), SignalingState::Stable);
        assert!(callee.connection.remote_description().await.is_none());
        assert_eq!(callee.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_answer_is_discarded() {
        let mut caller = Peer::new("alice");
        caller.engine.start().await.unwrap();
        let answer = remote("bob", SignalBody::Answer(SessionDescription::answer("v=0 o=bob")));

        let first = caller.engine.dispatch(InboundEvent::Signal(answer.clone())).await.unwrap();
        let second = caller.engine.dispatch(InboundEvent::Signal(answer)).await.unwrap();
        assert_eq!(first, Transition::Applied);
        assert_eq!(second, Transition::Ignored);
        assert!(!caller.engine.state().making_offer);
    }

    #[tokio::test]
    async fn impolite_peer_ignores_colliding_offer() {
        let mut caller = Peer::new("alice");
        caller.engine.start().await.unwrap();
        let outcome = caller
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "bob",
                SignalBody::Offer(SessionDescription::offer("v=0 o=bob")),
            )))
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(caller.connection.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(caller.engine.state().received_offer);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_drops_the_offer() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        callee.engine.dispatch(InboundEvent::FallbackTimerElapsed).await.unwrap();
        callee.connection.fail_next_rollback();

        let err = callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::Offer(SessionDescription::offer("v=0 o=alice")),
            )))
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::RollbackFailed(_)));
        assert_eq!(callee.connection.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(callee.connection.answers_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_offer_is_sent_once() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();

        let early = callee.engine.dispatch(InboundEvent::FallbackTimerElapsed).await.unwrap();
        assert_eq!(early, Transition::Ignored);

        tokio::time::advance(Duration::from_secs(2)).await;
        callee.engine.dispatch(InboundEvent::FallbackTimerElapsed).await.unwrap();
        callee.engine.dispatch(InboundEvent::FallbackTimerElapsed).await.unwrap();
        assert_eq!(callee.engine.state().fallback, FallbackOffer::Sent);

        callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::Offer(SessionDescription::offer("v=0 o=alice")),
            )))
            .await
            .unwrap();
        callee.engine.dispatch(InboundEvent::FallbackTimerElapsed).await.unwrap();

        let offers = callee
            .transport
            .take_sent()
            .into_iter()
            .filter(|message| matches!(&message.body, SignalBody::Offer(desc) if desc.kind == SdpKind::Offer))
            .count();
        assert_eq!(offers, 1);
        assert_eq!(callee.connection.offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_disarms_when_offer_arrives_first() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();
        callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::Offer(SessionDescription::offer("v=0 o=alice")),
            )))
            .await
            .unwrap();
        assert!(callee.engine.fallback_deadline().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let outcome = callee.engine.dispatch(InboundEvent::FallbackTimerElapsed).await.unwrap();
        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(callee.connection.offers_created(), 0);
    }

    #[tokio::test]
    async fn own_and_foreign_signals_are_ignored() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();

        let echo = remote("bob", SignalBody::Offer(SessionDescription::offer("v=0")));
        let foreign = SignalMessage::new(
            "alice".into(),
            "other-call".into(),
            SignalBody::Offer(SessionDescription::offer("v=0")),
        );
        for message in [echo, foreign] {
            let outcome = callee.engine.dispatch(InboundEvent::Signal(message)).await.unwrap();
            assert_eq!(outcome, Transition::Ignored);
        }
        assert!(!callee.engine.state().received_offer);
        assert_eq!(callee.connection.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn send_failure_is_not_retried() {
        let mut caller = Peer::new("alice");
        caller.transport.reject_sends(true);
        let outcome = caller.engine.start().await.unwrap();
        assert_eq!(outcome, Transition::Applied);
        assert_eq!(caller.engine.state().phase, NegotiationPhase::AwaitingRemoteAnswer);
        assert_eq!(caller.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn gathering_complete_is_silent() {
        let mut caller = Peer::with_connection("alice", |events| {
            FakePeerConnection::new("alice", events).with_candidates(0)
        });
        caller.engine.start().await.unwrap();
        caller.transport.take_sent();
        caller.pump_connection_events().await;
        assert_eq!(caller.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn stale_epoch_turns_events_into_noops() {
        let mut callee = Peer::new("bob");
        callee.engine.start().await.unwrap();
        callee.counter.invalidate();

        let outcome = callee
            .engine
            .dispatch(InboundEvent::Signal(remote(
                "alice",
                SignalBody::Offer(SessionDescription::offer("v=0 o=alice")),
            )))
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Stale);
        assert_eq!(callee.connection.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn connection_failure_is_terminal() {
        let mut caller = Peer::new("alice");
        caller.engine.start().await.unwrap();
        caller.transport.take_sent();
        caller.pump_connection_events().await;
        caller.connection.fail();

        let mut outcomes = Vec::new();
        while let Ok(event) = caller.events.try_recv() {
            outcomes.push(caller.engine.dispatch(InboundEvent::Connection(event)).await.unwrap());
        }
        assert!(outcomes.contains(&Transition::Failed));
        assert_eq!(caller.engine.state().phase, NegotiationPhase::Failed);
        assert!(!caller.engine.state().making_offer);
    }
}
