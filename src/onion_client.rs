//! Onion Inbox Client (C2, §4.2) — HTTP client against a local onion
//! controller daemon (Tor/Lokinet), with request coalescing and a shared
//! polling loop per `(baseUrl, deviceId)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::error::CoreError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_BASE_MS: u64 = 1000;
const POLL_MAX_MS: u64 = 8000;
const POLL_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthNetworkDetail {
    pub active: bool,
    #[serde(default)]
    pub socks_proxy: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub network: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub tor: Option<HealthNetworkDetail>,
    #[serde(default)]
    pub lokinet: Option<HealthNetworkDetail>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tor_onion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lokinet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub to_device_id: String,
    pub from_device_id: String,
    pub envelope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenericResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    msg_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboxItem {
    pub id: String,
    pub ts: i64,
    pub from: String,
    pub envelope: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxResponse {
    ok: bool,
    #[serde(default)]
    items: Vec<InboxItem>,
    #[serde(default)]
    next_after: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub ok: bool,
    #[serde(default)]
    pub tor_onion: Option<String>,
    #[serde(default)]
    pub lokinet: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

/// A GET response reduced to its status and body text, shared verbatim
/// between a coalesced request's leader and its followers.
#[derive(Clone)]
struct RawHttp {
    status: u16,
    body: String,
}

type CoalesceResult = Result<RawHttp, String>;

/// Coalesces concurrent callers of the same request so only one HTTP call
/// is in flight per key (§4.2: keys are `health`, `inbox:{deviceId}`; `send`
/// is never coalesced).
#[derive(Default)]
struct Coalescer {
    inflight: Mutex<HashMap<String, Arc<broadcast::Sender<CoalesceResult>>>>,
}

pub struct OnionInboxClient {
    http: reqwest::Client,
    base_url: String,
    coalescer: Coalescer,
}

impl OnionInboxClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        OnionInboxClient {
            http,
            base_url: base_url.into(),
            coalescer: Coalescer::default(),
        }
    }

    pub fn default_controller(http: reqwest::Client) -> Self {
        Self::new(http, "http://127.0.0.1:3210")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn coalesced_get<T>(&self, key: &str, path: &str) -> Result<T, CoreError>
    where
        T: for<'de> Deserialize<'de>,
    {
        // First-arrival pattern: if nobody is in flight for this key, this
        // caller becomes the leader and performs the single HTTP request;
        // everyone else subscribes to the leader's broadcast and parses the
        // same raw response the leader received — no follower ever issues
        // its own GET.
        enum Role {
            Leader(Arc<broadcast::Sender<CoalesceResult>>),
            Follower(broadcast::Receiver<CoalesceResult>),
        }

        let role = {
            let mut inflight = self.coalescer.inflight.lock().await;
            if let Some(tx) = inflight.get(key) {
                Role::Follower(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                let tx = Arc::new(tx);
                inflight.insert(key.to_string(), tx.clone());
                Role::Leader(tx)
            }
        };

        let raw: CoalesceResult = match role {
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // Leader's sender closed without sending (should not
                // happen; defensive only) — fall back to this caller's own
                // request rather than hanging.
                Err(_) => self.fetch_raw(path).await,
            },
            Role::Leader(tx) => {
                let raw = self.fetch_raw(path).await;
                {
                    let mut inflight = self.coalescer.inflight.lock().await;
                    inflight.remove(key);
                }
                let _ = tx.send(raw.clone());
                raw
            }
        };

        let raw = raw.map_err(CoreError::Http)?;
        map_body(raw.status, &raw.body)
    }

    async fn fetch_raw(&self, path: &str) -> CoalesceResult {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(RawHttp { status, body })
    }

    pub async fn health(&self) -> Result<HealthResponse, CoreError> {
        self.coalesced_get("health", "/onion/health").await
    }

    pub async fn address(&self) -> Result<AddressResponse, CoreError> {
        self.coalesced_get("address", "/onion/address").await
    }

    pub async fn send(&self, req: SendRequest) -> Result<String, CoreError> {
        let url = format!("{}/onion/send", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;

        let parsed: GenericResponse = parse_response(response).await?;
        if !parsed.ok {
            return Err(parsed
                .error
                .map(CoreError::forward_failed)
                .unwrap_or_else(|| CoreError::Other("send failed".into())));
        }
        Ok(parsed.msg_id.unwrap_or_default())
    }

    pub async fn inbox(
        &self,
        device_id: &str,
        after: Option<i64>,
        limit: u32,
    ) -> Result<(Vec<InboxItem>, Option<i64>), CoreError> {
        let mut path = format!("/onion/inbox?deviceId={device_id}&limit={limit}");
        if let Some(after) = after {
            path.push_str(&format!("&after={after}"));
        }
        let key = format!("inbox:{device_id}");
        let parsed: InboxResponse = self.coalesced_get(&key, &path).await?;
        if !parsed.ok {
            return Err(parsed
                .error
                .map(CoreError::forward_failed)
                .unwrap_or_else(|| CoreError::Other("inbox fetch failed".into())));
        }
        Ok((parsed.items, parsed.next_after))
    }
}

/// Error mapping per §4.2: a non-2xx body with `{ok:false, error}` surfaces
/// that error verbatim; otherwise a fallback `Send failed (status X)`. A 2xx
/// response with an empty/unparseable body is treated as a failure too
/// (resolved open question, SPEC_FULL §4.2/§9).
async fn parse_response<T>(response: reqwest::Response) -> Result<T, CoreError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| CoreError::Http(e.to_string()))?;
    map_body(status, &body)
}

/// Pure body-mapping half of [`parse_response`], split out so the error
/// mapping (§4.2) is unit-testable without a live `reqwest::Response`.
fn map_body<T>(status: u16, body: &str) -> Result<T, CoreError>
where
    T: for<'de> Deserialize<'de>,
{
    if body.trim().is_empty() {
        return Err(CoreError::Other(format!("Send failed (status {status})")));
    }

    match serde_json::from_str::<T>(body) {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            if let Ok(generic) = serde_json::from_str::<GenericResponse>(body) {
                if !generic.ok {
                    return Err(generic
                        .error
                        .map(CoreError::Other)
                        .unwrap_or_else(|| CoreError::Other(format!("Send failed (status {status})"))));
                }
            }
            Err(CoreError::Other(format!("Send failed (status {status})")))
        }
    }
}

/// Shared polling loop (§4.2): base 1000ms + jitter, exponential backoff to
/// 8000ms on failure, reset on success. One logical poller per
/// `(baseUrl, deviceId)`; stops when its last subscriber drops the handle.
pub struct InboxPoller {
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl InboxPoller {
    pub fn spawn(
        client: Arc<OnionInboxClient>,
        device_id: String,
        on_items: impl Fn(Vec<InboxItem>) + Send + 'static,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let mut after: Option<i64> = None;
        let mut failures: u32 = 0;

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match client.inbox(&device_id, after, 50).await {
                    Ok((items, next_after)) => {
                        failures = 0;
                        if !items.is_empty() {
                            on_items(items);
                        }
                        if next_after.is_some() {
                            after = next_after;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(device_id = %device_id, error = %e, "onion inbox poll failed");
                    }
                }

                let delay_ms = if failures == 0 {
                    POLL_BASE_MS
                } else {
                    (POLL_BASE_MS * 2u64.saturating_pow(failures)).min(POLL_MAX_MS)
                };
                let jitter = (pseudo_jitter() % POLL_JITTER_MS) as u64;
                debug!(delay_ms, jitter, "scheduling next inbox poll");

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms + jitter)) => {},
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        InboxPoller { shutdown: shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for InboxPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

type ItemCallback = Box<dyn Fn(Vec<InboxItem>) + Send + Sync>;

struct SharedPollerEntry {
    poller: InboxPoller,
    listeners: Arc<StdMutex<HashMap<u64, ItemCallback>>>,
    next_id: AtomicU64,
    refcount: AtomicUsize,
}

fn spawn_shared_entry(client: Arc<OnionInboxClient>, device_id: String) -> SharedPollerEntry {
    let listeners: Arc<StdMutex<HashMap<u64, ItemCallback>>> = Arc::new(StdMutex::new(HashMap::new()));
    let fan_out = listeners.clone();
    let poller = InboxPoller::spawn(client, device_id, move |items| {
        for cb in fan_out.lock().unwrap().values() {
            cb(items.clone());
        }
    });
    SharedPollerEntry {
        poller,
        listeners,
        next_id: AtomicU64::new(0),
        refcount: AtomicUsize::new(0),
    }
}

/// Process-wide registry sharing one [`InboxPoller`] across callers with the
/// same `(baseUrl, deviceId)` (§4.2). The underlying poller is torn down once
/// its last [`InboxSubscription`] is dropped.
#[derive(Default)]
pub struct InboxPollerRegistry {
    pollers: StdMutex<HashMap<(String, String), Arc<SharedPollerEntry>>>,
}

impl InboxPollerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(InboxPollerRegistry::default())
    }

    /// Subscribes `on_items` to the shared poller for `(base_url, device_id)`,
    /// spawning one if this is the first subscriber. `client` is only used to
    /// spawn a fresh poller; an existing poller keeps using whichever client
    /// its first subscriber supplied.
    pub fn subscribe(
        self: &Arc<Self>,
        client: Arc<OnionInboxClient>,
        base_url: &str,
        device_id: &str,
        on_items: impl Fn(Vec<InboxItem>) + Send + Sync + 'static,
    ) -> InboxSubscription {
        let key = (base_url.to_string(), device_id.to_string());

        let entry = {
            let mut pollers = self.pollers.lock().unwrap();
            pollers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(spawn_shared_entry(client, device_id.to_string())))
                .clone()
        };

        let id = entry.next_id.fetch_add(1, Ordering::SeqCst);
        entry.listeners.lock().unwrap().insert(id, Box::new(on_items));
        entry.refcount.fetch_add(1, Ordering::SeqCst);

        InboxSubscription {
            registry: self.clone(),
            key,
            id,
            entry,
        }
    }
}

/// Handle returned by [`InboxPollerRegistry::subscribe`]. Dropping it
/// unregisters the callback and, if it was the last subscriber for this
/// `(baseUrl, deviceId)`, stops and removes the shared poller.
pub struct InboxSubscription {
    registry: Arc<InboxPollerRegistry>,
    key: (String, String),
    id: u64,
    entry: Arc<SharedPollerEntry>,
}

impl Drop for InboxSubscription {
    fn drop(&mut self) {
        self.entry.listeners.lock().unwrap().remove(&self.id);
        if self.entry.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut pollers = self.registry.pollers.lock().unwrap();
            if let Some(current) = pollers.get(&self.key) {
                if Arc::ptr_eq(current, &self.entry) {
                    pollers.remove(&self.key);
                }
            }
        }
    }
}

/// Cheap, non-cryptographic jitter source — this is scheduling noise, not a
/// security boundary, so no `rand::Rng` dependency is warranted here.
fn pseudo_jitter() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0)
}
