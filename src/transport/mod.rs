//! Transport Adapters (C1, §4.1) — uniform send/receive/state surface over
//! Direct WebRTC, External Onion, and Built-in Onion. Modeled as a trait
//! (§9 design note: "duck typing on an `adapter` object" becomes an
//! interface), not a tagged union, since each adapter's extension surface
//! (signalling codes, relay envelopes) differs.

pub mod builtin_onion;
pub mod direct;
pub mod external_onion;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::packet::TransportPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

/// Observer callback invoked on inbound messages, acks, and state changes.
/// Held by the adapter's registry (§9: "listeners hold a back-reference
/// used only for lookup, never for ownership" — observers are plain
/// `Arc<dyn ...>` the adapter calls out to, never the reverse).
#[async_trait]
pub trait TransportObserver: Send + Sync {
    async fn on_message(&self, packet: TransportPacket);
    async fn on_ack(&self, id: &str, rtt_ms: u64);
    async fn on_state(&self, state: TransportState);
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent: calling `start` on an already-started adapter is a no-op.
    async fn start(&self) -> Result<(), CoreError>;

    /// Always permitted; must never return an error.
    async fn stop(&self);

    async fn send(&self, packet: TransportPacket) -> Result<(), CoreError>;

    fn add_observer(&self, observer: Arc<dyn TransportObserver>);
}

/// Shared observer-registry plumbing each concrete adapter embeds.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn TransportObserver>>>,
}

impl ObserverRegistry {
    pub fn add(&self, observer: Arc<dyn TransportObserver>) {
        // best-effort synchronous push via try_write; registries are only
        // mutated during adapter setup, never on the hot send/receive path
        if let Ok(mut guard) = self.observers.try_write() {
            guard.push(observer);
        }
    }

    pub async fn notify_message(&self, packet: TransportPacket) {
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            observer.on_message(packet.clone()).await;
        }
    }

    pub async fn notify_ack(&self, id: &str, rtt_ms: u64) {
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            observer.on_ack(id, rtt_ms).await;
        }
    }

    pub async fn notify_state(&self, state: TransportState) {
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            observer.on_state(state).await;
        }
    }
}
