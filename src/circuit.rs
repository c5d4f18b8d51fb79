//! Built-in Onion Circuit Manager (C4, §4.4) — builds and maintains one
//! source-routed circuit through known relay peers: HELLO/ACK build,
//! keepalive ping/pong, degrade-and-rebuild with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::relay::{ControlFrame, RelayEnvelope, RelayPayload};
use crate::signing::HopAuthenticator;

pub const MIN_HOPS: u32 = 1;
pub const MAX_HOPS: u32 = 6;
const HELLO_ACK_TIMEOUT: Duration = Duration::from_secs(4);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MISS_LIMIT: u32 = 2;
const REBUILD_BACKOFF: [Duration; 4] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(6 * 60 * 60),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Idle,
    Building,
    Ready,
    Degraded,
    Rebuilding,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopStatus {
    Pending,
    Ok,
    Dead,
}

#[derive(Debug, Clone)]
pub struct Hop {
    pub hop_index: u32,
    pub peer_id: Option<String>,
    pub status: HopStatus,
    pub last_seen_ts: Option<i64>,
    pub rtt_ms: Option<u64>,
    misses: u32,
}

/// Clamp `desired` into `[MIN_HOPS, MAX_HOPS]` with no error (§8: boundary
/// values are normalized silently).
pub fn clamp_desired_hops(desired: u32) -> u32 {
    desired.clamp(MIN_HOPS, MAX_HOPS)
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub desired_hops: u32,
    pub established_hops: u32,
    pub status: CircuitStatus,
    pub circuit_id: String,
    pub hops: Vec<Hop>,
    pub updated_at_ts: i64,
    pub last_error: Option<String>,
}

impl CircuitState {
    fn invariant_holds(&self) -> bool {
        let established = self.hops.iter().filter(|h| h.status == HopStatus::Ok).count() as u32;
        if established != self.established_hops {
            return false;
        }
        if self.status == CircuitStatus::Ready {
            return self.established_hops == self.desired_hops;
        }
        true
    }
}

/// Abstraction over "send this control envelope to a peer", satisfied by
/// whichever transport adapter is carrying relay traffic. Kept separate from
/// `TransportAdapter` so the circuit manager does not depend on the adapter
/// trait directly (it only needs outbound delivery of envelopes).
#[async_trait::async_trait]
pub trait RelaySender: Send + Sync {
    async fn send_envelope(&self, to_peer_id: &str, envelope: RelayEnvelope) -> Result<(), crate::error::CoreError>;
}

fn random_circuit_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct CircuitManager {
    self_peer_id: String,
    sender: Arc<dyn RelaySender>,
    authenticator: Arc<dyn HopAuthenticator>,
    clock: Arc<dyn crate::context::Clock>,
    state: RwLock<CircuitState>,
    ack_waiters: Mutex<HashMap<(String, u32), mpsc::Sender<ControlFrame>>>,
    backoff_index: Mutex<usize>,
}

impl CircuitManager {
    pub fn new(
        self_peer_id: impl Into<String>,
        sender: Arc<dyn RelaySender>,
        authenticator: Arc<dyn HopAuthenticator>,
        clock: Arc<dyn crate::context::Clock>,
    ) -> Arc<Self> {
        let now = clock.now_ms();
        Arc::new(CircuitManager {
            self_peer_id: self_peer_id.into(),
            sender,
            authenticator,
            clock,
            state: RwLock::new(CircuitState {
                desired_hops: 0,
                established_hops: 0,
                status: CircuitStatus::Idle,
                circuit_id: String::new(),
                hops: Vec::new(),
                updated_at_ts: now,
                last_error: None,
            }),
            ack_waiters: Mutex::new(HashMap::new()),
            backoff_index: Mutex::new(0),
        })
    }

    pub async fn snapshot(&self) -> CircuitState {
        self.state.read().await.clone()
    }

    /// Build algorithm (§4.4). `candidate_relays` excludes self and is
    /// already deduped by the caller.
    pub async fn start(self: &Arc<Self>, desired_hops: u32, candidate_relays: Vec<String>) {
        let desired_hops = clamp_desired_hops(desired_hops);
        if (candidate_relays.len() as u32) < desired_hops {
            let mut state = self.state.write().await;
            state.status = CircuitStatus::Idle;
            state.last_error = Some("NO_RELAY_PEERS".to_string());
            state.updated_at_ts = self.clock.now_ms();
            self.schedule_rebuild(desired_hops, candidate_relays).await;
            return;
        }

        let circuit_id = random_circuit_id();
        let was_rebuild = {
            let state = self.state.read().await;
            matches!(state.status, CircuitStatus::Degraded | CircuitStatus::Rebuilding)
        };

        {
            let mut state = self.state.write().await;
            state.desired_hops = desired_hops;
            state.circuit_id = circuit_id.clone();
            state.status = if was_rebuild { CircuitStatus::Rebuilding } else { CircuitStatus::Building };
            state.hops = (0..desired_hops)
                .map(|i| Hop {
                    hop_index: i,
                    peer_id: candidate_relays.get(i as usize).cloned(),
                    status: HopStatus::Pending,
                    last_seen_ts: None,
                    rtt_ms: None,
                    misses: 0,
                })
                .collect();
            state.established_hops = 0;
            state.last_error = None;
        }

        for hop_index in 0..desired_hops {
            let peer_id = candidate_relays[hop_index as usize].clone();
            match self.build_hop(&circuit_id, hop_index, &peer_id).await {
                Ok(()) => {
                    let mut state = self.state.write().await;
                    if let Some(hop) = state.hops.get_mut(hop_index as usize) {
                        hop.status = HopStatus::Ok;
                        hop.last_seen_ts = Some(self.clock.now_ms());
                    }
                    state.established_hops += 1;
                }
                Err(reason) => {
                    let mut state = self.state.write().await;
                    if let Some(hop) = state.hops.get_mut(hop_index as usize) {
                        hop.status = HopStatus::Dead;
                    }
                    state.status = CircuitStatus::Degraded;
                    state.last_error = Some(reason);
                    state.updated_at_ts = self.clock.now_ms();
                    drop(state);
                    self.schedule_rebuild(desired_hops, candidate_relays).await;
                    return;
                }
            }
        }

        let mut state = self.state.write().await;
        state.status = CircuitStatus::Ready;
        state.updated_at_ts = self.clock.now_ms();
        *self.backoff_index.lock().await = 0;
        debug_assert!(state.invariant_holds());
        info!(circuit_id = %circuit_id, hops = desired_hops, "circuit ready");
    }

    async fn build_hop(&self, circuit_id: &str, hop_index: u32, peer_id: &str) -> Result<(), String> {
        let (tx, mut rx) = mpsc::channel(1);
        self.ack_waiters.lock().await.insert((circuit_id.to_string(), hop_index), tx);

        let hello = RelayEnvelope::new(
            circuit_id,
            self.self_peer_id.clone(),
            vec![peer_id.to_string()],
            RelayPayload::Control {
                frame: ControlFrame::HopHello {
                    circuit_id: circuit_id.to_string(),
                    hop_index,
                    ts: self.clock.now_ms(),
                    sender_peer_id: self.self_peer_id.clone(),
                },
            },
            self.clock.now_ms(),
        );

        self.sender
            .send_envelope(peer_id, hello)
            .await
            .map_err(|e| e.to_string())?;

        let result = timeout(HELLO_ACK_TIMEOUT, rx.recv()).await;
        self.ack_waiters.lock().await.remove(&(circuit_id.to_string(), hop_index));

        match result {
            Ok(Some(ControlFrame::HopAck { relay_peer_id, ok, .. })) if ok && relay_peer_id == peer_id => Ok(()),
            Ok(Some(_)) => Err("HOP_ACK peer mismatch".to_string()),
            Ok(None) => Err("ack channel closed".to_string()),
            Err(_) => Err("HOP_ACK timeout".to_string()),
        }
    }

    /// Feed an inbound control frame observed by the relay layer (§4.5
    /// "dispatch to the Circuit Manager handler registry").
    pub async fn handle_control_frame(&self, circuit_id: &str, hop_index: u32, frame: ControlFrame) {
        match &frame {
            ControlFrame::HopAck { .. } => {
                let waiters = self.ack_waiters.lock().await;
                if let Some(tx) = waiters.get(&(circuit_id.to_string(), hop_index)) {
                    let _ = tx.send(frame).await;
                }
            }
            ControlFrame::HopPong { .. } => {
                let mut state = self.state.write().await;
                if let Some(hop) = state.hops.iter_mut().find(|h| h.hop_index == hop_index) {
                    hop.misses = 0;
                    hop.last_seen_ts = Some(self.clock.now_ms());
                }
            }
            _ => {}
        }
    }

    /// One keepalive tick (§4.4). Callers drive this on a 15s interval from
    /// a long-running task; kept as a discrete method so tests can step it
    /// deterministically without a real timer.
    pub async fn keepalive_tick(self: &Arc<Self>) {
        let ok_hops: Vec<(u32, String)> = {
            let state = self.state.read().await;
            if state.status != CircuitStatus::Ready && state.status != CircuitStatus::Degraded {
                return;
            }
            state
                .hops
                .iter()
                .filter(|h| h.status == HopStatus::Ok)
                .filter_map(|h| h.peer_id.clone().map(|p| (h.hop_index, p)))
                .collect()
        };

        let circuit_id = self.state.read().await.circuit_id.clone();
        for (hop_index, peer_id) in ok_hops {
            let ping = RelayEnvelope::new(
                circuit_id.clone(),
                self.self_peer_id.clone(),
                vec![peer_id.clone()],
                RelayPayload::Control { frame: ControlFrame::HopPing { circuit_id: circuit_id.clone(), hop_index } },
                self.clock.now_ms(),
            );
            if self.sender.send_envelope(&peer_id, ping).await.is_err() {
                warn!(peer_id = %peer_id, "keepalive ping send failed");
            }

            let mut state = self.state.write().await;
            if let Some(hop) = state.hops.iter_mut().find(|h| h.hop_index == hop_index) {
                hop.misses += 1;
                if hop.misses > KEEPALIVE_MISS_LIMIT {
                    hop.status = HopStatus::Dead;
                    state.status = CircuitStatus::Degraded;
                    state.established_hops = state.hops.iter().filter(|h| h.status == HopStatus::Ok).count() as u32;
                }
            }
        }
    }

    async fn schedule_rebuild(self: &Arc<Self>, desired_hops: u32, candidate_relays: Vec<String>) {
        let mut idx = self.backoff_index.lock().await;
        let delay = REBUILD_BACKOFF[(*idx).min(REBUILD_BACKOFF.len() - 1)];
        *idx = (*idx + 1).min(REBUILD_BACKOFF.len() - 1);
        drop(idx);

        {
            let mut state = self.state.write().await;
            state.status = CircuitStatus::Rebuilding;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.start(desired_hops, candidate_relays).await;
        });
    }

    pub async fn stop(&self, final_status: CircuitStatus) {
        let mut state = self.state.write().await;
        state.status = final_status;
        state.updated_at_ts = self.clock.now_ms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSender {
        sent: Mutex<Vec<(String, RelayEnvelope)>>,
    }

    #[async_trait::async_trait]
    impl RelaySender for FakeSender {
        async fn send_envelope(&self, to: &str, envelope: RelayEnvelope) -> Result<(), crate::error::CoreError> {
            self.sent.lock().await.push((to.to_string(), envelope));
            Ok(())
        }
    }

    #[test]
    fn desired_hops_clamps_to_valid_range() {
        assert_eq!(clamp_desired_hops(0), 1);
        assert_eq!(clamp_desired_hops(9), 6);
        assert_eq!(clamp_desired_hops(3), 3);
    }

    #[tokio::test]
    async fn start_with_too_few_relays_sets_no_relay_peers_error() {
        let sender = Arc::new(FakeSender { sent: Mutex::new(vec![]) });
        let clock = Arc::new(ManualClock::new(0));
        let mgr = CircuitManager::new("self", sender, Arc::new(crate::signing::AcceptAll), clock);

        mgr.start(3, vec!["a".into()]).await;
        let snap = mgr.snapshot().await;
        assert_eq!(snap.status, CircuitStatus::Rebuilding);
        assert_eq!(snap.last_error.as_deref(), Some("NO_RELAY_PEERS"));
    }

    #[tokio::test(start_paused = true)]
    async fn hop_timeout_degrades_and_preserves_earlier_progress() {
        let sender = Arc::new(FakeSender { sent: Mutex::new(vec![]) });
        let clock = Arc::new(ManualClock::new(0));
        let mgr = CircuitManager::new("self", sender, Arc::new(crate::signing::AcceptAll), clock);

        // ack hop 0 immediately via a background task, leave hop 1 unanswered
        // so its HELLO_ACK_TIMEOUT fires (virtual time, advanced below).
        let mgr_clone = Arc::clone(&mgr);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let state = mgr_clone.state.read().await;
            let circuit_id = state.circuit_id.clone();
            drop(state);
            if !circuit_id.is_empty() {
                mgr_clone
                    .handle_control_frame(
                        &circuit_id,
                        0,
                        ControlFrame::HopAck { circuit_id: circuit_id.clone(), hop_index: 0, relay_peer_id: "relay-0".into(), ok: true },
                    )
                    .await;
            }
        });

        mgr.start(2, vec!["relay-0".into(), "relay-1".into()]).await;
        let snap = mgr.snapshot().await;
        assert_eq!(snap.status, CircuitStatus::Rebuilding);
        assert_eq!(snap.hops[0].status, HopStatus::Ok, "hop 0 progress must survive hop 1's failure");
    }
}
