//! Rendezvous Client (C3, §4.3) — publish/poll ephemeral signed signalling
//! items keyed by a short code. Used directly by pairing (C9) and indirectly
//! by the external-onion sliding-window inbox.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CoreError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_LIMIT: u32 = 50;
const SEEN_ID_CAP: usize = 1000;
const SEEN_ID_TRIM_TO: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousItem {
    pub id: String,
    pub ts: i64,
    pub payload: String,
}

#[derive(Debug, Serialize)]
struct PublishBody<'a> {
    device_id: &'a str,
    items: Vec<RendezvousItem>,
}

#[derive(Debug, Deserialize)]
struct PollResponseRaw {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

fn random_item_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Publishes filter out items whose `id` is missing or whose `payload` is
/// not a string (§4.3); a de-dup window of previously published/seen ids is
/// kept so `poll` never re-delivers what this client already returned.
pub struct RendezvousClient {
    http: reqwest::Client,
    base_url: String,
    use_onion_proxy: bool,
    seen_ids: Mutex<VecDeque<String>>,
    seen_set: Mutex<HashSet<String>>,
}

impl RendezvousClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, use_onion_proxy: bool) -> Arc<Self> {
        Arc::new(RendezvousClient {
            http,
            base_url: base_url.into(),
            use_onion_proxy,
            seen_ids: Mutex::new(VecDeque::new()),
            seen_set: Mutex::new(HashSet::new()),
        })
    }

    pub async fn publish(&self, code: &str, device_id: &str, payloads: Vec<String>) -> Result<(), CoreError> {
        let items: Vec<RendezvousItem> = payloads
            .into_iter()
            .map(|payload| RendezvousItem { id: random_item_id(), ts: 0, payload })
            .collect();

        self.remember_seen(items.iter().map(|i| i.id.clone())).await;

        let url = format!("{}/rendezvous/{}/signals", self.base_url, code);
        let body = PublishBody { device_id, items };
        let response = self
            .http
            .put(&url)
            .timeout(DEFAULT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Http(format!("rendezvous publish failed: {}", response.status())));
        }
        Ok(())
    }

    /// `poll(code, deviceId, afterTs) -> {items, nextAfterTs}` (§4.3). Items
    /// already returned by this client (by id) are filtered out even if the
    /// server re-sends them.
    pub async fn poll(&self, code: &str, device_id: &str, after_ts: i64) -> Result<(Vec<RendezvousItem>, i64), CoreError> {
        let url = format!(
            "{}/rendezvous/{}/signals?afterTs={}&limit={}&deviceId={}",
            self.base_url, code, after_ts, POLL_LIMIT, device_id
        );
        let response = self
            .http
            .get(&url)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;

        let raw: PollResponseRaw = response.json().await.map_err(|e| CoreError::Http(e.to_string()))?;

        let mut valid = Vec::new();
        for value in raw.items {
            let Some(id) = value.get("id").and_then(|v| v.as_str()) else { continue };
            let Some(payload) = value.get("payload").and_then(|v| v.as_str()) else { continue };
            let ts = value.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
            valid.push(RendezvousItem { id: id.to_string(), ts, payload: payload.to_string() });
        }

        let mut fresh = Vec::new();
        {
            let seen = self.seen_set.lock().await;
            for item in valid {
                if !seen.contains(&item.id) {
                    fresh.push(item);
                }
            }
        }
        self.remember_seen(fresh.iter().map(|i| i.id.clone())).await;

        let next_after_ts = fresh.iter().map(|i| i.ts).max().unwrap_or(after_ts).max(after_ts);
        Ok((fresh, next_after_ts))
    }

    async fn remember_seen(&self, ids: impl Iterator<Item = String>) {
        let mut queue = self.seen_ids.lock().await;
        let mut set = self.seen_set.lock().await;
        for id in ids {
            if set.insert(id.clone()) {
                queue.push_back(id);
            }
        }
        if queue.len() > SEEN_ID_CAP {
            while queue.len() > SEEN_ID_TRIM_TO {
                if let Some(old) = queue.pop_front() {
                    set.remove(&old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remember_seen_trims_down_to_five_hundred_once_over_cap() {
        let client = RendezvousClient::new(reqwest::Client::new(), "http://example", false);
        let ids: Vec<String> = (0..1001).map(|i| format!("id-{i}")).collect();
        client.remember_seen(ids.into_iter()).await;

        let queue = client.seen_ids.lock().await;
        assert_eq!(queue.len(), SEEN_ID_TRIM_TO);
        // the most recent ids survive the trim
        assert!(queue.back().unwrap().ends_with("1000"));
    }

    #[tokio::test]
    async fn duplicate_ids_are_not_double_counted() {
        let client = RendezvousClient::new(reqwest::Client::new(), "http://example", false);
        client.remember_seen(vec!["a".to_string(), "a".to_string()].into_iter()).await;
        assert_eq!(client.seen_ids.lock().await.len(), 1);
    }
}
