use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_bus::Bus;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SignalingError;
use crate::session::CallId;
use crate::signal::SignalMessage;

/// Acknowledgement for a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub delivered_to: usize,
}

/// Live membership in a call's signaling channel.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    call_id: CallId,
    inbound: mpsc::UnboundedReceiver<SignalMessage>,
}

impl Subscription {
    pub fn new(call_id: CallId, inbound: mpsc::UnboundedReceiver<SignalMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id,
            inbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Next inbound message; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalMessage> {
        self.inbound.try_recv().ok()
    }
}

/// Broadcast channel scoped to a call. Delivery is at-least-once and
/// best-effort ordered; a participant may see its own messages.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Resolves once the channel is active for `call_id`.
    async fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError>;

    async fn send(&self, message: &SignalMessage) -> Result<Ack, SignalingError>;

    /// Leaves the channel. Unknown ids are ignored.
    async fn unsubscribe(&self, subscription: Uuid);
}

/// Signaling over a topic-per-call `Bus`, JSON encoded.
pub struct BusSignalingTransport {
    bus: Arc<dyn Bus>,
    pumps: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl BusSignalingTransport {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            pumps: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.pumps.lock().len()
    }

    fn spawn_pump(
        call_id: CallId,
        mut rx: broadcast::Receiver<signal_bus::BusMessage>,
        tx: mpsc::UnboundedSender<SignalMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => match SignalMessage::from_json(&message.payload) {
                        Ok(signal) if signal.call_id == call_id => {
                            if tx.send(signal).is_err() {
                                break;
                            }
                        }
                        Ok(signal) => {
                            tracing::debug!(
                                target = "webrtc",
                                call_id = %call_id,
                                other = %signal.call_id,
                                "dropping signal for another call"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "webrtc",
                                call_id = %call_id,
                                error = %err,
                                "dropping undecodable signal"
                            );
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target = "webrtc",
                            call_id = %call_id,
                            skipped,
                            "signaling subscriber lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl SignalingTransport for BusSignalingTransport {
    async fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError> {
        let rx = self.bus.subscribe(&call_id.topic());
        let (tx, inbound) = mpsc::unbounded_channel();
        let subscription = Subscription::new(call_id.clone(), inbound);
        let pump = Self::spawn_pump(call_id.clone(), rx, tx);
        self.pumps.lock().insert(subscription.id(), pump);
        tracing::debug!(
            target = "webrtc",
            call_id = %call_id,
            subscription = %subscription.id(),
            "joined signaling channel"
        );
        Ok(subscription)
    }

    async fn send(&self, message: &SignalMessage) -> Result<Ack, SignalingError> {
        let payload = message
            .to_json()
            .map_err(|err| SignalingError::Encode(err.to_string()))?;
        let delivered_to = self
            .bus
            .publish(&message.call_id.topic(), Bytes::from(payload))
            .map_err(|err| SignalingError::NotAcknowledged(err.to_string()))?;
        tracing::trace!(
            target = "webrtc",
            call_id = %message.call_id,
            kind = message.kind(),
            delivered_to,
            "signal published"
        );
        Ok(Ack { delivered_to })
    }

    async fn unsubscribe(&self, subscription: Uuid) {
        if let Some(pump) = self.pumps.lock().remove(&subscription) {
            pump.abort();
            tracing::debug!(
                target = "webrtc",
                subscription = %subscription,
                "left signaling channel"
            );
        }
    }
}

impl Drop for BusSignalingTransport {
    fn drop(&mut self) {
        for (_, pump) in self.pumps.lock().drain() {
            pump.abort();
        }
    }
}
