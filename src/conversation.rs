//! Conversation Transport Manager (C8, §4.8) — per-conversation lifecycle
//! wrapping the Router/adapters with backoff, rate limiting, and an outbox
//! flusher.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ApprovalPolicy, DeviceKind};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::packet::TransportPacket;

const BACKOFF_INITIAL_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 30_000;
const BACKOFF_RESET_AFTER_CONNECTED_MS: i64 = 10_000;
const MAX_FRAME_BYTES: usize = 256 * 1024;
const RATE_LIMIT_FRAMES: usize = 20;
const RATE_LIMIT_WINDOW_MS: i64 = 1_000;
const OUTBOX_FLUSH_BATCH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Onion,
}

/// `decideConversationTransport({allowDirect})` (§4.8).
pub fn decide_conversation_transport(allow_direct: bool, device_kind: DeviceKind, policy: ApprovalPolicy) -> (TransportKind, Option<TransportKind>) {
    if device_kind == DeviceKind::DeviceToDevice && policy == ApprovalPolicy::DirectOnly {
        return (TransportKind::Direct, None);
    }
    if allow_direct {
        (TransportKind::Direct, Some(TransportKind::Onion))
    } else {
        (TransportKind::Onion, None)
    }
}

/// Injected per-conversation send target — typically a thin wrapper over
/// the Router (C7) scoped to one conversation's transport choice.
#[async_trait]
pub trait ConversationTransport: Send + Sync {
    async fn send(&self, packet: TransportPacket) -> Result<(), CoreError>;
}

/// Approval hook consulted before using a direct transport under a policy
/// that requires it (§4.8); result is cached per conversation on success.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, conv_id: &str) -> bool;
}

struct RateLimitWindow {
    timestamps: VecDeque<i64>,
}

impl RateLimitWindow {
    fn new() -> Self {
        RateLimitWindow { timestamps: VecDeque::new() }
    }

    fn allow(&mut self, now_ms: i64) -> bool {
        while let Some(&front) = self.timestamps.front() {
            if now_ms - front > RATE_LIMIT_WINDOW_MS {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.timestamps.len() >= RATE_LIMIT_FRAMES {
            return false;
        }
        self.timestamps.push_back(now_ms);
        true
    }

    fn reset(&mut self) {
        self.timestamps.clear();
    }
}

struct ConnState {
    status: ConversationState,
    backoff_ms: u64,
    connected_since_ms: Option<i64>,
    approval_cached: bool,
    pending_outbox_ids: VecDeque<String>,
    reconnect_task: Option<JoinHandle<()>>,
}

pub struct ConversationManager {
    conv_id: String,
    ctx: Arc<CoreContext>,
    transport: Arc<dyn ConversationTransport>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    transport_kind: TransportKind,
    policy: ApprovalPolicy,
    state: Mutex<ConnState>,
    rate_limit: Mutex<RateLimitWindow>,
}

impl ConversationManager {
    /// `transport_kind` is the resolved primary transport for this
    /// conversation (§4.8's `decideConversationTransport`); `policy` gates
    /// the approval hook when that resolved transport is `Direct`.
    pub fn new(
        conv_id: impl Into<String>,
        ctx: Arc<CoreContext>,
        transport: Arc<dyn ConversationTransport>,
        approval: Option<Arc<dyn ApprovalHandler>>,
        transport_kind: TransportKind,
        policy: ApprovalPolicy,
    ) -> Arc<Self> {
        Arc::new(ConversationManager {
            conv_id: conv_id.into(),
            ctx,
            transport,
            approval,
            transport_kind,
            policy,
            state: Mutex::new(ConnState {
                status: ConversationState::Idle,
                backoff_ms: BACKOFF_INITIAL_MS,
                connected_since_ms: None,
                approval_cached: false,
                pending_outbox_ids: VecDeque::new(),
                reconnect_task: None,
            }),
            rate_limit: Mutex::new(RateLimitWindow::new()),
        })
    }

    pub async fn status(&self) -> ConversationState {
        self.state.lock().await.status
    }

    /// Approval hook (§4.8): consulted once per conversation, cached on
    /// success, re-asked after a failure.
    async fn ensure_approved(&self, policy: ApprovalPolicy) -> bool {
        if policy == ApprovalPolicy::NoApproval {
            return true;
        }
        let mut state = self.state.lock().await;
        if state.approval_cached {
            return true;
        }
        drop(state);

        let approved = match &self.approval {
            Some(handler) => handler.approve(&self.conv_id).await,
            None => false,
        };
        if approved {
            self.state.lock().await.approval_cached = true;
        }
        approved
    }

    /// Mark the connection established; resets backoff after it has held
    /// for `BACKOFF_RESET_AFTER_CONNECTED_MS`.
    pub async fn on_connected(self: &Arc<Self>) {
        let now = self.ctx.now_ms();
        let mut state = self.state.lock().await;
        state.status = ConversationState::Connected;
        state.connected_since_ms = Some(now);
        drop(state);
        self.flush_outbox().await;
    }

    pub async fn on_disconnected(&self) {
        let mut state = self.state.lock().await;
        let held_ms = state.connected_since_ms.map(|since| self.ctx.now_ms() - since).unwrap_or(0);
        if held_ms >= BACKOFF_RESET_AFTER_CONNECTED_MS {
            state.backoff_ms = BACKOFF_INITIAL_MS;
        } else {
            state.backoff_ms = (state.backoff_ms * 2).min(BACKOFF_MAX_MS);
        }
        state.status = ConversationState::Failed;
        state.connected_since_ms = None;
    }

    /// Send semantics (§4.8): forward if connected, else enqueue to the
    /// outbox and (conceptually) trigger a reconnect — actual reconnect
    /// scheduling is owned by the host's event loop driving `on_disconnected`.
    pub async fn send(&self, packet: TransportPacket, ciphertext: Vec<u8>, to_device_id: String, ttl_ms: i64) -> Result<(), CoreError> {
        let connected = self.state.lock().await.status == ConversationState::Connected;
        if connected {
            let may_send = if self.transport_kind == TransportKind::Direct {
                self.ensure_approved(self.policy).await
            } else {
                true
            };
            if may_send {
                match self.transport.send(packet.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(conv_id = %self.conv_id, error = %e, "send while connected failed, enqueueing");
                    }
                }
            } else {
                debug!(conv_id = %self.conv_id, "direct transport not yet approved, deferring to outbox");
            }
        }

        let now = self.ctx.now_ms();
        let record = crate::outbox::OutboxRecord::new(packet.id.clone(), self.conv_id.clone(), ciphertext, to_device_id, now, now + ttl_ms);
        self.ctx
            .outbox
            .put(record)
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        self.state.lock().await.pending_outbox_ids.push_back(packet.id);
        Ok(())
    }

    /// Drains due outbox records in batches of 10 while connected (§4.8).
    pub async fn flush_outbox(&self) {
        loop {
            if self.state.lock().await.status != ConversationState::Connected {
                return;
            }
            let now = self.ctx.now_ms();
            let due = match self.ctx.outbox.list_due_by_conv(&self.conv_id, now, OUTBOX_FLUSH_BATCH).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(conv_id = %self.conv_id, error = %e, "outbox flush list failed");
                    return;
                }
            };
            if due.is_empty() {
                return;
            }
            for record in due {
                let packet = TransportPacket::new(record.id.clone(), crate::packet::PacketPayload::Bytes(record.ciphertext.clone()))
                    .with_to(record.to_device_id.clone());
                match self.transport.send(packet).await {
                    Ok(()) => {
                        let _ = self.ctx.outbox.delete(&record.id).await;
                    }
                    Err(e) => {
                        debug!(conv_id = %self.conv_id, id = %record.id, error = %e, "flush attempt failed, will retry");
                        return;
                    }
                }
            }
        }
    }

    /// Inbound guard: drop frames over 256 KiB or past the 20fps/1s budget
    /// (§4.8). Returns `true` if the frame should be delivered upward.
    pub async fn admit_inbound(&self, frame_len: usize) -> bool {
        if frame_len > MAX_FRAME_BYTES {
            warn!(conv_id = %self.conv_id, frame_len, "dropping oversized inbound frame");
            return false;
        }
        let now = self.ctx.now_ms();
        let mut window = self.rate_limit.lock().await;
        if !window.allow(now) {
            warn!(conv_id = %self.conv_id, "dropping inbound frame: rate limit exceeded");
            return false;
        }
        true
    }

    pub async fn backoff_ms(&self) -> u64 {
        self.state.lock().await.backoff_ms
    }

    /// Full teardown (§4.8): stop transports (caller's responsibility at
    /// the adapter level), cancel retry timers, reset rate-limit state and
    /// backoff.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        state.status = ConversationState::Idle;
        state.backoff_ms = BACKOFF_INITIAL_MS;
        state.connected_since_ms = None;
        drop(state);
        self.rate_limit.lock().await.reset();
    }
}
