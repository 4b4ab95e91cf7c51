use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::CallConfig;
use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, PeerConnection, RemoteAudioTrack,
};
use crate::engine::{CallEpoch, EpochCounter, InboundEvent, NegotiationEngine, Transition};
use crate::error::{CallError, MediaError};
use crate::media::MediaSession;
use crate::session::{CallId, CallSession, ParticipantId};
use crate::transport::{SignalingTransport, Subscription};

const EVENT_CAPACITY: usize = 64;

/// Coarse call status for UI consumption. After a call ends the last outcome
/// (`Ended` or `Failed`) stays visible until the next `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Starting,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StatusChanged(CallStatus),
    RemoteAudio { track_id: String },
    /// Remote audio is held until `CallLifecycle::resume_playback`.
    PlaybackBlocked,
    Failed { call_id: CallId },
    Ended { call_id: CallId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Local,
    RemoteClosed,
    Failed,
}

struct ActiveCall {
    epoch: u64,
    call_id: CallId,
    connection: Arc<dyn PeerConnection>,
    subscription: Uuid,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Resources a `start` has built so far. Kept in the slot so a concurrent
/// `end` can release them without waiting for `start` to notice.
#[derive(Default)]
struct Starting {
    epoch: u64,
    call_id: Option<CallId>,
    connection: Option<Arc<dyn PeerConnection>>,
    subscription: Option<Uuid>,
}

enum Slot {
    Idle,
    Starting(Starting),
    Active(ActiveCall),
}

impl Slot {
    fn epoch(&self) -> Option<u64> {
        match self {
            Slot::Idle => None,
            Slot::Starting(starting) => Some(starting.epoch),
            Slot::Active(call) => Some(call.epoch),
        }
    }

    fn starting_mut(&mut self, epoch: &CallEpoch) -> Option<&mut Starting> {
        match self {
            Slot::Starting(starting) if starting.epoch == epoch.value() => Some(starting),
            _ => None,
        }
    }
}

struct Established {
    engine: NegotiationEngine,
    subscription: Subscription,
    events: ConnectionEvents,
}

struct Inner {
    config: CallConfig,
    media: Arc<dyn MediaSession>,
    factory: Arc<dyn ConnectionFactory>,
    transport: Arc<dyn SignalingTransport>,
    epochs: EpochCounter,
    slot: Mutex<Slot>,
    status: watch::Sender<CallStatus>,
    events: broadcast::Sender<CallEvent>,
}

/// Owns at most one call at a time: builds it in `start`, tears it down in
/// `end` or when the connection fails or is closed by the remote side.
#[derive(Clone)]
pub struct CallLifecycle {
    inner: Arc<Inner>,
}

impl CallLifecycle {
    pub fn new(
        config: CallConfig,
        media: Arc<dyn MediaSession>,
        factory: Arc<dyn ConnectionFactory>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        let (status, _) = watch::channel(CallStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                media,
                factory,
                transport,
                epochs: EpochCounter::new(),
                slot: Mutex::new(Slot::Idle),
                status,
                events,
            }),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Idle)
    }

    /// Acquires the microphone, builds the connection, attaches the track,
    /// joins the call's signaling channel and starts negotiating for
    /// `local`'s role. Any failure before the call is running is returned
    /// here and leaves nothing behind.
    pub async fn start(&self, session: CallSession, local: ParticipantId) -> Result<(), CallError> {
        if !session.includes(&local) {
            return Err(CallError::NotAParticipant(local.to_string()));
        }
        let epoch = {
            let mut slot = self.inner.slot.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(CallError::AlreadyActive);
            }
            let epoch = self.inner.epochs.begin();
            *slot = Slot::Starting(Starting {
                epoch: epoch.value(),
                call_id: Some(session.call_id.clone()),
                ..Starting::default()
            });
            epoch
        };
        self.inner.set_status(CallStatus::Starting);
        tracing::info!(
            target = "webrtc",
            call_id = %session.call_id,
            participant = %local,
            role = %session.role_of(&local),
            "starting call"
        );

        match self.establish(&session, local, &epoch).await {
            Ok(established) => self.install(session.call_id, epoch, established),
            Err(err) => {
                self.inner.abandon_starting(&epoch).await;
                tracing::warn!(
                    target = "webrtc",
                    call_id = %session.call_id,
                    error = %err,
                    "call start failed"
                );
                Err(err)
            }
        }
    }

    /// Stops local tracks, closes the connection, leaves the signaling
    /// channel and drops negotiation state. Safe to call repeatedly and
    /// while `start` is still running.
    pub async fn end(&self) {
        self.inner.teardown(None, Termination::Local).await;
    }

    /// Flips the local track's enablement. No signaling is involved.
    pub fn toggle_mute(&self) -> bool {
        let muted = self.inner.media.toggle_mute();
        tracing::debug!(target = "webrtc", muted, "toggled microphone");
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.inner.media.is_muted()
    }

    pub async fn resume_playback(&self) -> Result<(), MediaError> {
        self.inner.media.resume_playback().await
    }

    async fn establish(
        &self,
        session: &CallSession,
        local: ParticipantId,
        epoch: &CallEpoch,
    ) -> Result<Established, CallError> {
        let inner = &self.inner;
        let track = inner.media.acquire().await?;
        if !epoch.is_current() {
            track.stop();
            return Err(CallError::Cancelled);
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let connection = inner.factory.create(&inner.config, events_tx).await?;
        if !inner.adopt(epoch, |starting| starting.connection = Some(Arc::clone(&connection))) {
            close_quietly(connection.as_ref(), "closing orphaned connection failed").await;
            return Err(CallError::Cancelled);
        }

        inner.media.attach(connection.as_ref()).await?;
        ensure_current(epoch)?;

        let subscription = inner.transport.subscribe(&session.call_id).await?;
        let subscription_id = subscription.id();
        if !inner.adopt(epoch, |starting| starting.subscription = Some(subscription_id)) {
            inner.transport.unsubscribe(subscription_id).await;
            return Err(CallError::Cancelled);
        }

        let mut engine = NegotiationEngine::new(
            session,
            local,
            connection,
            Arc::clone(&inner.transport),
            epoch.clone(),
            inner.config.fallback_offer_timeout,
        );
        engine.start().await?;
        ensure_current(epoch)?;

        Ok(Established {
            engine,
            subscription,
            events,
        })
    }

    fn install(
        &self,
        call_id: CallId,
        epoch: CallEpoch,
        established: Established,
    ) -> Result<(), CallError> {
        let Established {
            engine,
            subscription,
            events,
        } = established;
        let connection = Arc::clone(engine.connection());
        let subscription_id = subscription.id();
        let mut slot = self.inner.slot.lock();
        if !epoch.is_current() || slot.starting_mut(&epoch).is_none() {
            // A concurrent teardown already released what this start built.
            return Err(CallError::Cancelled);
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            Arc::clone(&self.inner),
            epoch.clone(),
            engine,
            subscription,
            events,
            shutdown_rx,
        ));
        *slot = Slot::Active(ActiveCall {
            epoch: epoch.value(),
            call_id: call_id.clone(),
            connection,
            subscription: subscription_id,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        });
        drop(slot);
        self.inner.set_status(CallStatus::Connecting);
        tracing::info!(target = "webrtc", call_id = %call_id, "call negotiating");
        Ok(())
    }
}

async fn close_quietly(connection: &dyn PeerConnection, message: &'static str) {
    if let Err(err) = connection.close().await {
        tracing::warn!(target = "webrtc", error = %err, "{}", message);
    }
}

fn ensure_current(epoch: &CallEpoch) -> Result<(), CallError> {
    if epoch.is_current() {
        Ok(())
    } else {
        Err(CallError::Cancelled)
    }
}

impl Inner {
    fn set_status(&self, status: CallStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            let _ = self.events.send(CallEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Records a resource built by the `start` owning `epoch`. Returns false
    /// when that start has already been torn down; the caller then releases
    /// the resource itself.
    fn adopt(&self, epoch: &CallEpoch, record: impl FnOnce(&mut Starting)) -> bool {
        let mut slot = self.slot.lock();
        match slot.starting_mut(epoch) {
            Some(starting) if epoch.is_current() => {
                record(starting);
                true
            }
            _ => false,
        }
    }

    /// Undoes a failed `start`, unless a teardown got there first.
    async fn abandon_starting(&self, epoch: &CallEpoch) {
        let starting = {
            let mut slot = self.slot.lock();
            if slot.starting_mut(epoch).is_none() {
                return;
            }
            self.media.release();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Starting(starting) => starting,
                _ => return,
            }
        };
        if let Some(connection) = starting.connection {
            close_quietly(connection.as_ref(), "closing abandoned connection failed").await;
        }
        if let Some(subscription) = starting.subscription {
            self.transport.unsubscribe(subscription).await;
        }
        self.set_status(CallStatus::Idle);
    }

    /// Returns false when there was nothing (matching) to tear down.
    async fn teardown(&self, epoch: Option<u64>, termination: Termination) -> bool {
        let previous = {
            let mut slot = self.slot.lock();
            match (slot.epoch(), epoch) {
                (None, _) => return false,
                (Some(current), Some(expected)) if current != expected => return false,
                _ => {}
            }
            self.epochs.invalidate();
            self.media.release();
            std::mem::replace(&mut *slot, Slot::Idle)
        };

        let call_id = match previous {
            Slot::Active(mut call) => {
                if let Some(shutdown) = call.shutdown.take() {
                    let _ = shutdown.send(());
                }
                if let Err(err) = call.connection.close().await {
                    tracing::warn!(
                        target = "webrtc",
                        call_id = %call.call_id,
                        error = %err,
                        "closing connection failed"
                    );
                }
                self.transport.unsubscribe(call.subscription).await;
                // Failures and remote hang-ups run teardown from inside the
                // event loop itself, which must not wait on its own handle.
                if termination == Termination::Local {
                    if let Some(task) = call.task.take() {
                        let _ = task.await;
                    }
                }
                Some(call.call_id)
            }
            Slot::Starting(starting) => {
                if let Some(connection) = starting.connection {
                    close_quietly(connection.as_ref(), "closing connection failed").await;
                }
                if let Some(subscription) = starting.subscription {
                    self.transport.unsubscribe(subscription).await;
                }
                starting.call_id
            }
            Slot::Idle => None,
        };

        let status = match termination {
            Termination::Failed => CallStatus::Failed,
            Termination::Local | Termination::RemoteClosed => CallStatus::Ended,
        };
        tracing::info!(
            target = "webrtc",
            call_id = call_id.as_ref().map(CallId::as_str).unwrap_or("-"),
            ?termination,
            "call ended"
        );
        self.set_status(status);
        if let Some(call_id) = call_id {
            self.emit(match termination {
                Termination::Failed => CallEvent::Failed { call_id },
                Termination::Local | Termination::RemoteClosed => CallEvent::Ended { call_id },
            });
        }
        true
    }

    async fn route_remote_track(&self, track: RemoteAudioTrack) {
        let track_id = track.id.clone();
        match self.media.play_remote(track).await {
            Ok(()) => self.emit(CallEvent::RemoteAudio { track_id }),
            Err(MediaError::PlaybackBlocked) => {
                tracing::info!(target = "webrtc", track_id = %track_id, "remote playback blocked");
                self.emit(CallEvent::RemoteAudio { track_id });
                self.emit(CallEvent::PlaybackBlocked);
            }
            Err(err) => {
                tracing::warn!(target = "webrtc", track_id = %track_id, error = %err, "remote playback failed");
            }
        }
    }
}

async fn fallback_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Single event loop per call. Every engine mutation happens here.
async fn drive(
    inner: Arc<Inner>,
    epoch: CallEpoch,
    mut engine: NegotiationEngine,
    mut subscription: Subscription,
    mut events: ConnectionEvents,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let deadline = engine.fallback_deadline();
        let event = tokio::select! {
            _ = &mut shutdown => break,
            message = subscription.recv() => match message {
                Some(message) => InboundEvent::Signal(message),
                None => break,
            },
            event = events.recv() => match event {
                Some(ConnectionEvent::RemoteTrack(track)) => {
                    inner.route_remote_track(track).await;
                    continue;
                }
                Some(event) => InboundEvent::Connection(event),
                None => break,
            },
            _ = fallback_timer(deadline) => InboundEvent::FallbackTimerElapsed,
        };

        match engine.dispatch(event).await {
            Ok(Transition::Connected) => inner.set_status(CallStatus::Connected),
            Ok(Transition::Disconnected) => inner.set_status(CallStatus::Disconnected),
            Ok(Transition::Failed) => {
                inner.teardown(Some(epoch.value()), Termination::Failed).await;
                break;
            }
            Ok(Transition::Closed) => {
                inner.teardown(Some(epoch.value()), Termination::RemoteClosed).await;
                break;
            }
            Ok(Transition::Stale) => break,
            Ok(Transition::Applied | Transition::Ignored) => {}
            Err(err) => {
                tracing::warn!(
                    target = "webrtc",
                    call_id = %engine.call_id(),
                    role = %engine.role(),
                    error = %err,
                    "negotiation round dropped"
                );
            }
        }
    }
    engine.close();
    tracing::debug!(target = "webrtc", call_id = %engine.call_id(), "call event loop stopped");
}
