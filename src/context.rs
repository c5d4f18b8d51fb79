//! `CoreContext` (§2.1) — the one process-wide handle, constructed once by
//! the host and threaded explicitly through the call graph. Nothing in this
//! crate reaches for a module-level `static`/`OnceLock`; tests build their
//! own context so state never leaks between test cases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::onion_client::InboxPollerRegistry;
use crate::outbox::{InMemoryOutboxStore, OutboxStore};
use crate::route_controller::RouteStats;

/// Clock seam (§2.1) so backoff/TTL logic is deterministically testable.
/// The default implementation reads the wall clock; tests substitute a
/// `ManualClock` they can advance by hand.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when told to.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: i64) {
        self.now_ms.store(value, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// `CoreContext` owns the shared HTTP client, the sync-code/pairing
/// registries (C9), the outbox store handle (C10), the route controller's
/// rolling statistics (C6), and the clock seam.
pub struct CoreContext {
    pub http: reqwest::Client,
    pub outbox: Arc<dyn OutboxStore>,
    pub route_stats: Mutex<RouteStats>,
    pub clock: Arc<dyn Clock>,
    /// `toDeviceId → currentDeviceId` (§3.1 AliasTable).
    pub alias_table: Mutex<HashMap<String, String>>,
    /// Per-code single-use guard for pairing (§5: "outbox invite-guard").
    pub pairing_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Process-wide shared onion-inbox pollers, one per `(baseUrl, deviceId)`
    /// (§4.2).
    pub inbox_pollers: Arc<InboxPollerRegistry>,
}

impl CoreContext {
    /// Production context: real HTTP client, real clock, in-memory outbox.
    /// Swap `outbox` for `SqliteOutboxStore` via `with_outbox` for durability.
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(CoreContext {
            http,
            outbox: InMemoryOutboxStore::new(),
            route_stats: Mutex::new(RouteStats::default()),
            clock: Arc::new(SystemClock),
            alias_table: Mutex::new(HashMap::new()),
            pairing_locks: Mutex::new(HashMap::new()),
            inbox_pollers: InboxPollerRegistry::new(),
        })
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Test context: manual clock pinned at `start_ms`, in-memory outbox.
    pub fn for_tests(start_ms: i64) -> Self {
        CoreContext {
            http: reqwest::Client::new(),
            outbox: InMemoryOutboxStore::new(),
            route_stats: Mutex::new(RouteStats::default()),
            clock: Arc::new(ManualClock::new(start_ms)),
            alias_table: Mutex::new(HashMap::new()),
            pairing_locks: Mutex::new(HashMap::new()),
            inbox_pollers: InboxPollerRegistry::new(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Resolve a `toDeviceId` through the alias table (§4.7 step 1). An
    /// unknown id is returned unchanged — callers decide whether that
    /// constitutes a `FatalMisconfig`.
    pub async fn resolve_alias(&self, to_device_id: &str) -> String {
        let table = self.alias_table.lock().await;
        let mut current = to_device_id.to_string();
        // follow at most one indirection level; aliases are not chained
        if let Some(resolved) = table.get(to_device_id) {
            current = resolved.clone();
        }
        current
    }

    /// Fetch (or create) the per-code mutex enforcing single-use pairing
    /// attempts (§5). Holding the returned guard across the check-and-set
    /// of `SyncCodeState.used` makes the race in §8 scenario 5 atomic.
    pub async fn pairing_lock_for(&self, code: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pairing_locks.lock().await;
        locks
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_request_only() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
    }

    #[tokio::test]
    async fn unknown_alias_resolves_to_itself() {
        let ctx = CoreContext::for_tests(0);
        assert_eq!(ctx.resolve_alias("device-x").await, "device-x");
    }

    #[tokio::test]
    async fn known_alias_resolves_to_current_device() {
        let ctx = CoreContext::for_tests(0);
        ctx.alias_table
            .lock()
            .await
            .insert("old-device".to_string(), "new-device".to_string());
        assert_eq!(ctx.resolve_alias("old-device").await, "new-device");
    }

    #[tokio::test]
    async fn pairing_lock_is_shared_across_lookups_for_same_code() {
        let ctx = CoreContext::for_tests(0);
        let a = ctx.pairing_lock_for("CODE1").await;
        let b = ctx.pairing_lock_for("CODE1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
