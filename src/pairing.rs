//! Pairing Core (C9, §4.9) — sync-code issuance and rendezvous-mediated
//! WebRTC offer/answer exchange, multiplexed over a local broadcast bus and
//! the remote rendezvous client (C3).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::rendezvous::RendezvousClient;
use crate::transport::direct::DirectAdapter;

const CROCKFORD_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const SYNC_CODE_TTL_MS: i64 = 10 * 60 * 1000;
const DEDUP_CAP: usize = 1000;
const PAIRING_POLL_MS: u64 = 1500;

/// Crockford-style base32 over 5 random bytes, rendered `NKC-SYNC-XXXX-XXXX`.
fn encode_crockford(bytes: &[u8]) -> String {
    // 5 bytes = 40 bits = 8 symbols of 5 bits each.
    let mut bits = 0u64;
    for &b in bytes {
        bits = (bits << 8) | b as u64;
    }
    let mut out = String::with_capacity(8);
    for i in (0..8).rev() {
        let idx = ((bits >> (i * 5)) & 0x1f) as usize;
        out.push(CROCKFORD_ALPHABET[idx] as char);
    }
    out
}

pub fn issue_sync_code() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);
    let symbols = encode_crockford(&bytes);
    format!("NKC-SYNC-{}-{}", &symbols[0..4], &symbols[4..8])
}

#[derive(Debug, Clone)]
pub struct SyncCodeState {
    pub code: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub used: bool,
}

impl SyncCodeState {
    pub fn new(code: String, now_ms: i64) -> Self {
        SyncCodeState { code, issued_at: now_ms, expires_at: now_ms + SYNC_CODE_TTL_MS, used: false }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Idle,
    Connecting,
    Exchanging,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResultStatus {
    Approved,
    Rejected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub request_id: String,
    pub code: String,
    pub device_id: String,
    pub identity_pub: String,
    pub dh_pub: String,
    pub ts: i64,
}

#[derive(Debug, Clone)]
pub struct PairingResult {
    pub request_id: String,
    pub status: PairingResultStatus,
    pub message: Option<String>,
}

/// Registry of outstanding sync codes and de-duplicated results, held by
/// `CoreContext` conceptually (§2.1); kept as its own struct here so it can
/// be constructed independently in tests.
pub struct SyncCodeRegistry {
    codes: Mutex<HashMap<String, SyncCodeState>>,
    seen_results: Mutex<VecDeque<(String, String)>>,
}

impl SyncCodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(SyncCodeRegistry { codes: Mutex::new(HashMap::new()), seen_results: Mutex::new(VecDeque::new()) })
    }

    pub async fn issue(&self, now_ms: i64) -> String {
        let code = issue_sync_code();
        self.codes.lock().await.insert(code.clone(), SyncCodeState::new(code.clone(), now_ms));
        code
    }

    /// Atomic check-and-set of `used` (§8: "a sync code with `used=true`
    /// never produces a second accepted `PAIR_REQ`; concurrent submissions
    /// yield exactly one success and one failure"). Callers must hold the
    /// per-code mutex from `CoreContext::pairing_lock_for` across this call.
    pub async fn try_consume(&self, code: &str, now_ms: i64) -> Result<(), CoreError> {
        let mut codes = self.codes.lock().await;
        let Some(state) = codes.get_mut(code) else {
            return Err(CoreError::Other("unknown sync code".to_string()));
        };
        if state.is_expired(now_ms) {
            return Err(CoreError::PairingExpired);
        }
        if state.used {
            return Err(CoreError::PairingReused);
        }
        state.used = true;
        Ok(())
    }

    /// De-dup results by `{requestId, status}` with an LRU cap of 1000.
    pub async fn remember_result(&self, request_id: &str, status: &str) -> bool {
        let key = (request_id.to_string(), status.to_string());
        let mut seen = self.seen_results.lock().await;
        if seen.contains(&key) {
            return false;
        }
        seen.push_back(key);
        if seen.len() > DEDUP_CAP {
            seen.pop_front();
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PairingWireMessage {
    #[serde(rename = "PAIR_REQ")]
    Req(PairingRequest),
    #[serde(rename = "PAIR_RES")]
    Res { request_id: String, status: String, message: Option<String> },
}

/// Local broadcast bus for same-host pairing (single process tree) (§4.9).
pub struct LocalPairingBus {
    tx: broadcast::Sender<PairingWireMessage>,
}

impl LocalPairingBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        LocalPairingBus { tx }
    }

    pub fn publish(&self, message: PairingWireMessage) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingWireMessage> {
        self.tx.subscribe()
    }
}

/// Feeds one rendezvous/local-bus payload into `adapter`. An offer produces
/// an answer, which is published back over both channels; an answer or ICE
/// candidate is simply applied. Advances `status` through
/// `exchanging → connected | error` (§4.9).
async fn relay_signal(
    adapter: &DirectAdapter,
    rendezvous: &RendezvousClient,
    local_bus: &LocalPairingBus,
    status: &Mutex<PairingStatus>,
    code: &str,
    device_id: &str,
    signal_code: &str,
) {
    *status.lock().await = PairingStatus::Exchanging;
    match adapter.accept_signal_code(signal_code).await {
        Ok(Some(response_code)) => {
            if rendezvous.publish(code, device_id, vec![response_code.clone()]).await.is_ok() {
                local_bus.publish(PairingWireMessage::Res {
                    request_id: format!("signal:{code}"),
                    status: "signal".to_string(),
                    message: Some(response_code),
                });
            }
        }
        Ok(None) => {}
        Err(_) => {
            *status.lock().await = PairingStatus::Error;
            return;
        }
    }
    if adapter.is_channel_open() {
        *status.lock().await = PairingStatus::Connected;
    }
}

/// Background poll loop shared by host and guest: reads `code`'s rendezvous
/// topic on an interval and hands every item to [`relay_signal`] until told
/// to stop.
fn spawn_poll_loop(
    rendezvous: Arc<RendezvousClient>,
    local_bus: Arc<LocalPairingBus>,
    adapter: Arc<DirectAdapter>,
    status: Arc<Mutex<PairingStatus>>,
    code: String,
    device_id: String,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut after_ts = 0i64;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match rendezvous.poll(&code, &device_id, after_ts).await {
                Ok((items, next_after)) => {
                    after_ts = next_after;
                    for item in items {
                        relay_signal(&adapter, &rendezvous, &local_bus, &status, &code, &device_id, &item.payload).await;
                    }
                }
                Err(_) => *status.lock().await = PairingStatus::Error,
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(PAIRING_POLL_MS)) => {},
                _ = shutdown_rx.changed() => break,
            }
        }
    });
    shutdown_tx
}

/// Drives host-mode pairing: publish an encoded offer under the code, poll
/// the rendezvous topic for answers/ICE, feed them into the direct adapter.
pub struct PairingHost {
    ctx: Arc<CoreContext>,
    registry: Arc<SyncCodeRegistry>,
    rendezvous: Arc<RendezvousClient>,
    local_bus: Arc<LocalPairingBus>,
    status: Arc<Mutex<PairingStatus>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl PairingHost {
    pub fn new(ctx: Arc<CoreContext>, registry: Arc<SyncCodeRegistry>, rendezvous: Arc<RendezvousClient>, local_bus: Arc<LocalPairingBus>) -> Self {
        PairingHost {
            ctx,
            registry,
            rendezvous,
            local_bus,
            status: Arc::new(Mutex::new(PairingStatus::Idle)),
            shutdown: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> PairingStatus {
        *self.status.lock().await
    }

    /// Publish an offer signal code under `code`'s rendezvous topic and over
    /// the local bus simultaneously (§4.9 dual channel).
    pub async fn publish_offer(&self, code: &str, device_id: &str, offer_signal_code: String) -> Result<(), CoreError> {
        self.rendezvous.publish(code, device_id, vec![offer_signal_code.clone()]).await?;
        self.local_bus.publish(PairingWireMessage::Res {
            request_id: format!("offer:{code}"),
            status: "offer".to_string(),
            message: Some(offer_signal_code),
        });
        Ok(())
    }

    /// Create an offer on `adapter`, publish it under `code`, then start
    /// polling for the guest's answer/ICE signals until [`Self::stop`] is
    /// called (§4.9).
    pub async fn start(&self, adapter: Arc<DirectAdapter>, code: &str, device_id: &str) -> Result<(), CoreError> {
        *self.status.lock().await = PairingStatus::Connecting;
        let offer = adapter.create_offer_code().await?;
        self.publish_offer(code, device_id, offer).await?;

        let shutdown_tx = spawn_poll_loop(
            self.rendezvous.clone(),
            self.local_bus.clone(),
            adapter,
            self.status.clone(),
            code.to_string(),
            device_id.to_string(),
        );
        *self.shutdown.lock().await = Some(shutdown_tx);
        Ok(())
    }

    /// Stops the background poll loop started by [`Self::start`], if any.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
    }

    /// Accept a `PAIR_REQ` for `code`, enforcing single-use atomically via
    /// the per-code mutex (§5, §8 scenario 5).
    pub async fn accept_request(&self, request: PairingRequest) -> PairingResult {
        let lock = self.ctx.pairing_lock_for(&request.code).await;
        let _guard = lock.lock().await;

        match self.registry.try_consume(&request.code, self.ctx.now_ms()).await {
            Ok(()) => PairingResult { request_id: request.request_id, status: PairingResultStatus::Approved, message: None },
            Err(CoreError::PairingReused) => PairingResult {
                request_id: request.request_id,
                status: PairingResultStatus::Error,
                message: Some("code already used".to_string()),
            },
            Err(CoreError::PairingExpired) => PairingResult {
                request_id: request.request_id,
                status: PairingResultStatus::Error,
                message: Some("code expired".to_string()),
            },
            Err(e) => PairingResult { request_id: request.request_id, status: PairingResultStatus::Error, message: Some(e.to_string()) },
        }
    }
}

/// Drives guest-mode pairing: poll `code`'s rendezvous topic (and local bus)
/// for the host's offer, apply it to the direct adapter, and publish the
/// resulting answer/ICE signals back (§4.9).
pub struct PairingGuest {
    rendezvous: Arc<RendezvousClient>,
    local_bus: Arc<LocalPairingBus>,
    status: Arc<Mutex<PairingStatus>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl PairingGuest {
    pub fn new(rendezvous: Arc<RendezvousClient>, local_bus: Arc<LocalPairingBus>) -> Self {
        PairingGuest {
            rendezvous,
            local_bus,
            status: Arc::new(Mutex::new(PairingStatus::Idle)),
            shutdown: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> PairingStatus {
        *self.status.lock().await
    }

    /// Start polling `code`'s rendezvous topic for the host's offer on
    /// behalf of `device_id`, applying it (and any later ICE) to `adapter`
    /// and publishing the resulting answer/ICE back, until [`Self::stop`]
    /// is called (§4.9).
    pub async fn start(&self, adapter: Arc<DirectAdapter>, code: &str, device_id: &str) {
        *self.status.lock().await = PairingStatus::Connecting;
        let shutdown_tx = spawn_poll_loop(
            self.rendezvous.clone(),
            self.local_bus.clone(),
            adapter,
            self.status.clone(),
            code.to_string(),
            device_id.to_string(),
        );
        *self.shutdown.lock().await = Some(shutdown_tx);
    }

    /// Stops the background poll loop started by [`Self::start`], if any.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_code_matches_the_wire_format() {
        let code = issue_sync_code();
        assert!(code.starts_with("NKC-SYNC-"));
        let parts: Vec<&str> = code.trim_start_matches("NKC-SYNC-").split('-').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[1].len(), 4);
        for c in code.chars().filter(|c| c.is_ascii_alphanumeric()) {
            assert!(CROCKFORD_ALPHABET.contains(&(c as u8)), "{c} not in crockford alphabet");
        }
    }

    #[tokio::test]
    async fn concurrent_consume_of_the_same_code_yields_one_success_one_failure() {
        let registry = SyncCodeRegistry::new();
        let code = registry.issue(0).await;

        let ctx = Arc::new(CoreContext::for_tests(0));
        let lock = ctx.pairing_lock_for(&code).await;

        let first = {
            let _g = lock.lock().await;
            registry.try_consume(&code, 0).await
        };
        let second = {
            let _g = lock.lock().await;
            registry.try_consume(&code, 0).await
        };

        assert!(first.is_ok());
        assert!(matches!(second, Err(CoreError::PairingReused)));
    }

    #[tokio::test]
    async fn expired_code_is_rejected_even_if_unused() {
        let registry = SyncCodeRegistry::new();
        let code = registry.issue(0).await;
        let result = registry.try_consume(&code, SYNC_CODE_TTL_MS + 1).await;
        assert!(matches!(result, Err(CoreError::PairingExpired)));
    }

    #[tokio::test]
    async fn remember_result_deduplicates_by_request_id_and_status() {
        let registry = SyncCodeRegistry::new();
        assert!(registry.remember_result("req-1", "approved").await);
        assert!(!registry.remember_result("req-1", "approved").await);
        assert!(registry.remember_result("req-1", "rejected").await, "different status is a distinct key");
    }

    use crate::transport::direct::{encode_signal_code, PeerConnection, SignalMessage, SignalType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePeer {
        open: AtomicBool,
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn create_offer(&self) -> Result<String, CoreError> {
            Ok("offer-sdp".to_string())
        }
        async fn create_answer(&self, _remote_sdp: &str) -> Result<String, CoreError> {
            self.open.store(true, Ordering::SeqCst);
            Ok("answer-sdp".to_string())
        }
        async fn set_remote_description(&self, _sdp: &str) -> Result<(), CoreError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn create_data_channel(&self, _label: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn send_on_channel(&self, _bytes: &[u8]) -> Result<(), CoreError> {
            Ok(())
        }
        fn is_channel_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn fake_adapter() -> DirectAdapter {
        DirectAdapter::new(Arc::new(FakePeer { open: AtomicBool::new(false) }), crate::config::DeviceKind::UserToUser)
    }

    /// An unparseable base URL makes `RendezvousClient::publish` fail fast
    /// with no network I/O, so the guest/host status transition can be
    /// exercised without a real rendezvous server.
    fn unreachable_rendezvous() -> Arc<RendezvousClient> {
        RendezvousClient::new(reqwest::Client::new(), "not a url", false)
    }

    #[tokio::test]
    async fn relaying_an_offer_reaches_connected_even_if_the_publish_back_fails() {
        let adapter = fake_adapter();
        let rendezvous = unreachable_rendezvous();
        let local_bus = LocalPairingBus::new();
        let status = Arc::new(Mutex::new(PairingStatus::Connecting));

        let offer = encode_signal_code(&SignalMessage { v: 1, t: SignalType::Offer, sdp: Some("remote-sdp".into()), candidate: None }).unwrap();
        relay_signal(&adapter, &rendezvous, &local_bus, &status, "NKC-SYNC-AAAA-BBBB", "guest-device", &offer).await;

        assert!(adapter.is_channel_open());
        assert_eq!(*status.lock().await, PairingStatus::Connected);
    }

    #[tokio::test]
    async fn relaying_a_malformed_signal_sets_error_status() {
        let adapter = fake_adapter();
        let rendezvous = unreachable_rendezvous();
        let local_bus = LocalPairingBus::new();
        let status = Arc::new(Mutex::new(PairingStatus::Connecting));

        relay_signal(&adapter, &rendezvous, &local_bus, &status, "NKC-SYNC-AAAA-BBBB", "guest-device", "not-a-signal-code").await;

        assert_eq!(*status.lock().await, PairingStatus::Error);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_harmless_no_op() {
        let rendezvous = unreachable_rendezvous();
        let guest = PairingGuest::new(rendezvous, Arc::new(LocalPairingBus::new()));
        guest.stop().await;
        assert_eq!(guest.status().await, PairingStatus::Idle);
    }
}
