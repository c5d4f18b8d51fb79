//! SQLite-backed `OutboxStore`, following the teacher's `db.rs` migration
//! style: a single idempotent `CREATE TABLE IF NOT EXISTS` run once at
//! startup, plain `sqlx::query` calls, `thiserror` for the error surface.
//!
//! This does not replace the (externally owned) encrypted local storage
//! engine named in §1 — it is a standalone durable option for hosts that
//! have no such engine wired in yet.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::outbox::{OutboxError, OutboxPatch, OutboxRecord, OutboxStatus, OutboxStore};

fn status_to_str(s: OutboxStatus) -> &'static str {
    match s {
        OutboxStatus::Pending => "pending",
        OutboxStatus::InFlight => "in_flight",
        OutboxStatus::Acked => "acked",
        OutboxStatus::Expired => "expired",
    }
}

fn status_from_str(s: &str) -> OutboxStatus {
    match s {
        "in_flight" => OutboxStatus::InFlight,
        "acked" => OutboxStatus::Acked,
        "expired" => OutboxStatus::Expired,
        _ => OutboxStatus::Pending,
    }
}

pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub async fn connect(url: &str) -> Result<Self, OutboxError> {
        // `:memory:` databases are per-connection; a pool with more than one
        // connection would silently scatter reads/writes across unrelated
        // in-memory databases. A single connection is correct for both the
        // on-disk and in-memory cases.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Self::run_migrations(&pool).await?;
        Ok(SqliteOutboxStore { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id                  TEXT PRIMARY KEY,
                conv_id             TEXT NOT NULL,
                ciphertext          BLOB NOT NULL,
                to_device_id        TEXT NOT NULL,
                created_at_ms       INTEGER NOT NULL,
                expires_at_ms       INTEGER NOT NULL,
                next_attempt_at_ms  INTEGER NOT NULL,
                attempts            INTEGER NOT NULL DEFAULT 0,
                status              TEXT NOT NULL,
                in_flight_at_ms     INTEGER,
                ack_deadline_ms     INTEGER,
                last_error          TEXT
            );
            CREATE INDEX IF NOT EXISTS outbox_due_idx ON outbox(conv_id, status, next_attempt_at_ms);
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> OutboxRecord {
        OutboxRecord {
            id: row.get("id"),
            conv_id: row.get("conv_id"),
            ciphertext: row.get("ciphertext"),
            to_device_id: row.get("to_device_id"),
            created_at_ms: row.get("created_at_ms"),
            expires_at_ms: row.get("expires_at_ms"),
            next_attempt_at_ms: row.get("next_attempt_at_ms"),
            attempts: row.get::<i64, _>("attempts") as u32,
            status: status_from_str(row.get("status")),
            in_flight_at_ms: row.get("in_flight_at_ms"),
            ack_deadline_ms: row.get("ack_deadline_ms"),
            last_error: row.get("last_error"),
        }
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn put(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox (id, conv_id, ciphertext, to_device_id, created_at_ms,
                                 expires_at_ms, next_attempt_at_ms, attempts, status,
                                 in_flight_at_ms, ack_deadline_ms, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                conv_id = excluded.conv_id,
                ciphertext = excluded.ciphertext,
                to_device_id = excluded.to_device_id,
                created_at_ms = excluded.created_at_ms,
                expires_at_ms = excluded.expires_at_ms,
                next_attempt_at_ms = excluded.next_attempt_at_ms,
                attempts = excluded.attempts,
                status = excluded.status,
                in_flight_at_ms = excluded.in_flight_at_ms,
                ack_deadline_ms = excluded.ack_deadline_ms,
                last_error = excluded.last_error
            "#,
        )
        .bind(&record.id)
        .bind(&record.conv_id)
        .bind(&record.ciphertext)
        .bind(&record.to_device_id)
        .bind(record.created_at_ms)
        .bind(record.expires_at_ms)
        .bind(record.next_attempt_at_ms)
        .bind(record.attempts as i64)
        .bind(status_to_str(record.status))
        .bind(record.in_flight_at_ms)
        .bind(record.ack_deadline_ms)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<(), OutboxError> {
        let existing = self.get(id).await?.ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        let merged = OutboxRecord {
            status: patch.status.unwrap_or(existing.status),
            attempts: patch.attempts.unwrap_or(existing.attempts),
            next_attempt_at_ms: patch.next_attempt_at_ms.unwrap_or(existing.next_attempt_at_ms),
            in_flight_at_ms: patch.in_flight_at_ms.unwrap_or(existing.in_flight_at_ms),
            ack_deadline_ms: patch.ack_deadline_ms.unwrap_or(existing.ack_deadline_ms),
            last_error: patch.last_error.unwrap_or(existing.last_error),
            ..existing
        };
        self.put(merged).await
    }

    async fn delete(&self, id: &str) -> Result<(), OutboxError> {
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_expired(&self, now_ms: i64) -> Result<u64, OutboxError> {
        let result = sqlx::query("DELETE FROM outbox WHERE expires_at_ms < ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn list_due_by_conv(
        &self,
        conv_id: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query(
            r#"SELECT * FROM outbox WHERE conv_id = ? AND status = 'pending' AND next_attempt_at_ms <= ?
               ORDER BY next_attempt_at_ms ASC LIMIT ?"#,
        )
        .bind(conv_id)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(rows.iter().map(Self::row_to_record).collect())
    }

    async fn try_claim(&self, id: &str, now_ms: i64) -> Result<Option<OutboxRecord>, OutboxError> {
        let result = sqlx::query(
            r#"UPDATE outbox SET status = 'in_flight', in_flight_at_ms = ?
               WHERE id = ? AND status = 'pending' AND next_attempt_at_ms <= ?"#,
        )
        .bind(now_ms)
        .bind(id)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>, OutboxError> {
        let row = sqlx::query("SELECT * FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(row.as_ref().map(Self::row_to_record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteOutboxStore {
        SqliteOutboxStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn put_and_get_round_trips() {
        let store = test_store().await;
        let record = OutboxRecord::new("m1", "conv-1", b"ct".to_vec(), "device-a", 0, 10_000);
        store.put(record.clone()).await.unwrap();

        let fetched = store.get("m1").await.unwrap().unwrap();
        assert_eq!(fetched.conv_id, "conv-1");
        assert_eq!(fetched.ciphertext, b"ct");
    }

    #[tokio::test]
    async fn try_claim_is_exclusive_under_sqlite() {
        let store = test_store().await;
        let record = OutboxRecord::new("m1", "conv-1", b"ct".to_vec(), "device-a", 0, 10_000);
        store.put(record).await.unwrap();

        assert!(store.try_claim("m1", 0).await.unwrap().is_some());
        assert!(store.try_claim("m1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_terminal_record() {
        let store = test_store().await;
        let record = OutboxRecord::new("m1", "conv-1", b"ct".to_vec(), "device-a", 0, 10_000);
        store.put(record).await.unwrap();
        store.delete("m1").await.unwrap();
        assert!(store.get("m1").await.unwrap().is_none());
    }
}
