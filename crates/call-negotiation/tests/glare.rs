use std::sync::Arc;
use std::time::Duration;

use call_negotiation::connection::ConnectionEvents;
use call_negotiation::fake::FakePeerConnection;
use call_negotiation::{
    BusSignalingTransport, CallSession, EpochCounter, InboundEvent, NegotiationEngine,
    NegotiationPhase, PeerConnection, SignalingState, SignalingTransport, Subscription, Transition,
};
use signal_bus::LocalBus;
use tokio::sync::mpsc;

struct Endpoint {
    engine: NegotiationEngine,
    connection: Arc<FakePeerConnection>,
    subscription: Subscription,
    events: ConnectionEvents,
}

impl Endpoint {
    async fn join(bus: &Arc<LocalBus>, identity: &str) -> Self {
        let session = CallSession::new("glare", "alice", "bob");
        let transport: Arc<dyn SignalingTransport> =
            Arc::new(BusSignalingTransport::new(bus.clone()));
        let subscription = transport.subscribe(&session.call_id).await.unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let connection = Arc::new(FakePeerConnection::new(identity, tx));
        let engine = NegotiationEngine::new(
            &session,
            identity.into(),
            connection.clone(),
            transport,
            EpochCounter::new().begin(),
            Duration::from_secs(2),
        );
        Self {
            engine,
            connection,
            subscription,
            events,
        }
    }

    async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.engine
                .dispatch(InboundEvent::Connection(event))
                .await
                .unwrap();
            handled += 1;
        }
        while let Some(message) = self.subscription.try_recv() {
            let _ = self.engine.dispatch(InboundEvent::Signal(message)).await;
            handled += 1;
        }
        handled
    }
}

/// Runs both endpoints until neither has anything left to handle. The
/// paused clock only advances once every task is idle, so the sleep doubles
/// as a barrier for the bus pump tasks.
async fn settle(a: &mut Endpoint, b: &mut Endpoint) {
    loop {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if a.pump().await + b.pump().await == 0 {
            break;
        }
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn simultaneous_offers_converge_on_the_callers_offer() {
    let bus = Arc::new(LocalBus::new());
    let mut alice = Endpoint::join(&bus, "alice").await;
    let mut bob = Endpoint::join(&bus, "bob").await;

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let fallback = bob
        .engine
        .dispatch(InboundEvent::FallbackTimerElapsed)
        .await
        .unwrap();
    assert_eq!(fallback, Transition::Applied);
    assert_eq!(alice.connection.signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(bob.connection.signaling_state(), SignalingState::HaveLocalOffer);

    settle(&mut alice, &mut bob).await;

    assert_eq!(alice.connection.signaling_state(), SignalingState::Stable);
    assert_eq!(bob.connection.signaling_state(), SignalingState::Stable);
    assert_eq!(bob.connection.rollbacks(), 1);
    assert_eq!(alice.connection.answers_created(), 0);
    assert_eq!(bob.connection.answers_created(), 1);

    let (alice_local, alice_remote) = alice.connection.current_descriptions();
    let (bob_local, bob_remote) = bob.connection.current_descriptions();
    assert_eq!(alice_local, bob_remote);
    assert_eq!(alice_remote, bob_local);
    assert!(alice_local.unwrap().sdp.contains("o=alice"));

    assert_eq!(alice.engine.state().phase, NegotiationPhase::Connected);
    assert_eq!(bob.engine.state().phase, NegotiationPhase::Connected);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn trickled_candidates_are_applied_in_order() {
    let bus = Arc::new(LocalBus::new());
    let mut alice = Endpoint::join(&bus, "alice").await;
    let mut bob = Endpoint::join(&bus, "bob").await;
    bob.engine.start().await.unwrap();
    alice.engine.start().await.unwrap();

    settle(&mut alice, &mut bob).await;

    let applied: Vec<_> = bob
        .connection
        .applied_candidates()
        .into_iter()
        .map(|candidate| candidate.candidate)
        .collect();
    assert_eq!(applied.len(), 2);
    assert!(applied[0].starts_with("candidate:0"));
    assert!(applied[1].starts_with("candidate:1"));
    assert!(bob.engine.state().candidates.is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn late_duplicate_answer_is_ignored() {
    let bus = Arc::new(LocalBus::new());
    let mut alice = Endpoint::join(&bus, "alice").await;
    let mut bob = Endpoint::join(&bus, "bob").await;
    bob.engine.start().await.unwrap();
    alice.engine.start().await.unwrap();
    settle(&mut alice, &mut bob).await;

    let (local_before, remote_before) = alice.connection.current_descriptions();
    let replay = call_negotiation::SignalMessage::new(
        "bob".into(),
        "glare".into(),
        call_negotiation::SignalBody::Answer(remote_before.clone().unwrap()),
    );
    let outcome = alice
        .engine
        .dispatch(InboundEvent::Signal(replay))
        .await
        .unwrap();
    assert_eq!(outcome, Transition::Ignored);
    assert_eq!(
        alice.connection.current_descriptions(),
        (local_before, remote_before)
    );
}
