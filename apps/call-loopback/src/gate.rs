use std::sync::Arc;

use async_trait::async_trait;
use call_negotiation::{Ack, CallId, SignalMessage, SignalingError, SignalingTransport, Subscription};
use parking_lot::Mutex;
use uuid::Uuid;

/// Signaling that queues outbound messages until `release`. Holding both
/// sides until each has sent its offer makes the offers cross on the wire.
pub struct GatedSignaling {
    inner: Arc<dyn SignalingTransport>,
    held: Mutex<Option<Vec<SignalMessage>>>,
}

impl GatedSignaling {
    pub fn closed(inner: Arc<dyn SignalingTransport>) -> Self {
        Self {
            inner,
            held: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn held(&self) -> usize {
        self.held.lock().as_ref().map_or(0, Vec::len)
    }

    /// Opens the gate and publishes everything queued so far, in order.
    pub async fn release(&self) -> Result<usize, SignalingError> {
        let queued = self.held.lock().take().unwrap_or_default();
        for message in &queued {
            self.inner.send(message).await?;
        }
        tracing::debug!(released = queued.len(), "signaling gate opened");
        Ok(queued.len())
    }
}

#[async_trait]
impl SignalingTransport for GatedSignaling {
    async fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError> {
        self.inner.subscribe(call_id).await
    }

    async fn send(&self, message: &SignalMessage) -> Result<Ack, SignalingError> {
        {
            let mut held = self.held.lock();
            if let Some(queue) = held.as_mut() {
                queue.push(message.clone());
                return Ok(Ack { delivered_to: 0 });
            }
        }
        self.inner.send(message).await
    }

    async fn unsubscribe(&self, subscription: Uuid) {
        self.inner.unsubscribe(subscription).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_negotiation::{BusSignalingTransport, SessionDescription, SignalBody};
    use signal_bus::LocalBus;

    fn offer(from: &str) -> SignalMessage {
        SignalMessage::new(
            from.into(),
            "loop".into(),
            SignalBody::Offer(SessionDescription::offer("v=0")),
        )
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn queued_messages_flow_after_release() {
        let bus = Arc::new(LocalBus::new());
        let transport: Arc<dyn SignalingTransport> = Arc::new(BusSignalingTransport::new(bus));
        let gate = GatedSignaling::closed(transport.clone());
        let mut subscription = transport.subscribe(&"loop".into()).await.unwrap();

        let ack = gate.send(&offer("alice")).await.unwrap();
        assert_eq!(ack.delivered_to, 0);
        gate.send(&offer("bob")).await.unwrap();
        assert_eq!(gate.held(), 2);
        assert!(subscription.try_recv().is_none());

        assert_eq!(gate.release().await.unwrap(), 2);
        assert_eq!(subscription.recv().await.unwrap().from.as_str(), "alice");
        assert_eq!(subscription.recv().await.unwrap().from.as_str(), "bob");

        let ack = gate.send(&offer("alice")).await.unwrap();
        assert_eq!(ack.delivered_to, 1);
    }
}
