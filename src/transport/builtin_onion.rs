//! Built-in onion adapter (§4.1) — delegates availability to the Circuit
//! Manager (C4); wraps outbound packets into `RelayEnvelope`s addressed
//! along `[relays…, target]`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::circuit::{CircuitManager, CircuitStatus, RelaySender};
use crate::error::CoreError;
use crate::packet::TransportPacket;
use crate::relay::{RelayEnvelope, RelayPayload};
use crate::transport::{ObserverRegistry, TransportAdapter, TransportObserver, TransportState};

pub struct BuiltinOnionAdapter {
    circuit: Arc<CircuitManager>,
    sender: Arc<dyn RelaySender>,
    self_peer_id: String,
    registry: Arc<ObserverRegistry>,
    clock: Arc<dyn crate::context::Clock>,
}

impl BuiltinOnionAdapter {
    pub fn new(
        circuit: Arc<CircuitManager>,
        sender: Arc<dyn RelaySender>,
        self_peer_id: impl Into<String>,
        clock: Arc<dyn crate::context::Clock>,
    ) -> Arc<Self> {
        Arc::new(BuiltinOnionAdapter {
            circuit,
            sender,
            self_peer_id: self_peer_id.into(),
            registry: Arc::new(ObserverRegistry::default()),
            clock,
        })
    }
}

#[async_trait]
impl TransportAdapter for BuiltinOnionAdapter {
    fn name(&self) -> &'static str {
        "selfOnion"
    }

    async fn start(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn stop(&self) {
        self.circuit.stop(CircuitStatus::Idle).await;
        self.registry.notify_state(TransportState::Idle).await;
    }

    async fn send(&self, packet: TransportPacket) -> Result<(), CoreError> {
        let snapshot = self.circuit.snapshot().await;
        if snapshot.status != CircuitStatus::Ready {
            return Err(CoreError::InternalOnionNotReady);
        }

        let to_device_id = packet.to.clone().ok_or_else(|| CoreError::FatalMisconfig("missing destination".into()))?;
        let mut chain: Vec<String> = snapshot.hops.iter().filter_map(|h| h.peer_id.clone()).collect();
        chain.push(to_device_id.clone());
        let first_hop = chain.first().cloned().ok_or(CoreError::InternalOnionNotReady)?;

        let envelope = RelayEnvelope::new(
            snapshot.circuit_id.clone(),
            self.self_peer_id.clone(),
            chain,
            RelayPayload::Data { packet },
            self.clock.now_ms(),
        );

        self.sender.send_envelope(&first_hop, envelope).await
    }

    fn add_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.registry.add(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::packet::PacketPayload;
    use crate::signing::AcceptAll;
    use tokio::sync::Mutex;

    struct FakeSender {
        sent: Mutex<Vec<(String, RelayEnvelope)>>,
    }

    #[async_trait]
    impl RelaySender for FakeSender {
        async fn send_envelope(&self, to: &str, envelope: RelayEnvelope) -> Result<(), CoreError> {
            self.sent.lock().await.push((to.to_string(), envelope));
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_before_circuit_ready_is_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let sender = Arc::new(FakeSender { sent: Mutex::new(vec![]) });
        let circuit = CircuitManager::new("self", sender.clone(), Arc::new(AcceptAll), clock.clone());
        let adapter = BuiltinOnionAdapter::new(circuit, sender, "self", clock);

        let packet = TransportPacket::new("m1", PacketPayload::Text("hi".into())).with_to("target");
        let result = adapter.send(packet).await;
        assert!(matches!(result, Err(CoreError::InternalOnionNotReady)));
    }
}
