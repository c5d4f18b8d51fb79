//! Router (C7, §4.7) — given a message and the live `NetConfig`, picks a
//! transport, tries it with a fallback ladder, and persists the outbox
//! entry before the first attempt.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::NetConfig;
use crate::context::CoreContext;
use crate::error::{CoreError, ForwardFailReason};
use crate::outbox::{OutboxPatch, OutboxRecord, OutboxStatus};
use crate::packet::{PacketPayload, RouteHint, TransportPacket};
use crate::route_controller::{decide_transport, TransportChoice};
use crate::transport::TransportAdapter;

pub struct SendRequest {
    pub conv_id: String,
    pub message_id: String,
    pub ciphertext: Vec<u8>,
    pub to_device_id: Option<String>,
    pub ttl_ms: i64,
    pub allow_direct: bool,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub transport: &'static str,
}

pub struct PrewarmOutcome {
    pub chosen: &'static str,
    pub requested: Vec<&'static str>,
    pub started: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

/// Holds the three concrete adapters by the names their `TransportAdapter`
/// impls report (`direct`, `selfOnion`, `onionRouter`).
pub struct Router {
    ctx: Arc<CoreContext>,
    adapters: HashMap<&'static str, Arc<dyn TransportAdapter>>,
}

fn choice_name(choice: TransportChoice) -> &'static str {
    match choice {
        TransportChoice::DirectP2p => "direct",
        TransportChoice::SelfOnion => "selfOnion",
        TransportChoice::OnionRouter => "onionRouter",
    }
}

impl Router {
    pub fn new(ctx: Arc<CoreContext>, adapters: HashMap<&'static str, Arc<dyn TransportAdapter>>) -> Self {
        Router { ctx, adapters }
    }

    fn adapter(&self, name: &str) -> Option<Arc<dyn TransportAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Step 2 of §4.7: choose the primary transport given policy, falling
    /// through to the Route Controller's pure scoring function.
    async fn choose_primary(&self, config: &NetConfig) -> TransportChoice {
        if config.onion_enabled {
            return TransportChoice::OnionRouter;
        }
        if config.mode == crate::config::NetworkMode::OnionRouter {
            return TransportChoice::OnionRouter;
        }
        if config.mode == crate::config::NetworkMode::SelfOnion {
            return TransportChoice::SelfOnion;
        }
        let mut stats = self.ctx.route_stats.lock().await;
        decide_transport(config, &mut stats, self.ctx.now_ms())
    }

    pub async fn send(&self, request: SendRequest, config: &NetConfig) -> Result<SendOutcome, CoreError> {
        // Step 1: resolve destination.
        let Some(to_device_id) = request.to_device_id.as_deref() else {
            return Err(CoreError::FatalMisconfig("missing destination".to_string()));
        };
        let resolved_to = self.ctx.resolve_alias(to_device_id).await;

        // Step 2: choose primary.
        let primary = self.choose_primary(config).await;

        // Step 3: persist outbox entry before the first attempt.
        let now = self.ctx.now_ms();
        let record = OutboxRecord::new(
            request.message_id.clone(),
            request.conv_id.clone(),
            request.ciphertext.clone(),
            resolved_to.clone(),
            now,
            now + request.ttl_ms,
        );
        self.ctx
            .outbox
            .put(record)
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;

        let packet = TransportPacket::new(request.message_id.clone(), PacketPayload::Bytes(request.ciphertext.clone()))
            .with_to(resolved_to.clone())
            .with_route(RouteHint { to_device_id: Some(resolved_to.clone()), ..Default::default() });

        // Step 4: try primary, then walk the fallback ladder.
        match self.try_transport(primary, packet.clone()).await {
            Ok(()) => self.on_success(&request.message_id, primary).await,
            Err(err) => self.run_fallback_ladder(primary, err, packet, &request, config).await,
        }
    }

    async fn try_transport(&self, choice: TransportChoice, packet: TransportPacket) -> Result<(), CoreError> {
        let name = choice_name(choice);
        let Some(adapter) = self.adapter(name) else {
            return Err(CoreError::FatalMisconfig(format!("no adapter registered for {name}")));
        };
        adapter.send(packet).await
    }

    async fn on_success(&self, message_id: &str, transport: TransportChoice) -> Result<SendOutcome, CoreError> {
        let _ = self.ctx.outbox.delete(message_id).await;
        self.ctx.route_stats.lock().await.report_ack(0);
        Ok(SendOutcome { transport: choice_name(transport) })
    }

    async fn on_terminal_failure(&self, message_id: &str, next_attempt_delay_ms: i64, error: &CoreError) -> Result<SendOutcome, CoreError> {
        self.ctx.route_stats.lock().await.report_send_fail();
        let now = self.ctx.now_ms();
        let _ = self
            .ctx
            .outbox
            .update(
                message_id,
                OutboxPatch {
                    status: Some(OutboxStatus::Pending),
                    next_attempt_at_ms: Some(now + next_attempt_delay_ms),
                    last_error: Some(Some(error.to_string())),
                    ..Default::default()
                },
            )
            .await;
        Err(CoreError::RetryableSendFailure(error.to_string()))
    }

    /// Step 4's fallback ladder (§4.7), followed by steps 5/6.
    async fn run_fallback_ladder(
        &self,
        primary: TransportChoice,
        first_error: CoreError,
        packet: TransportPacket,
        request: &SendRequest,
        config: &NetConfig,
    ) -> Result<SendOutcome, CoreError> {
        warn!(transport = choice_name(primary), error = %first_error, "primary transport send failed");

        let fallback_sequence: Vec<TransportChoice> = match primary {
            TransportChoice::DirectP2p if config.mode == crate::config::NetworkMode::DirectP2p => {
                vec![TransportChoice::OnionRouter]
            }
            TransportChoice::OnionRouter => match &first_error {
                CoreError::ForwardFailed(ForwardFailReason::NoRouteTarget) => vec![TransportChoice::DirectP2p],
                CoreError::ForwardFailed(ForwardFailReason::NoRoute)
                | CoreError::ForwardFailed(ForwardFailReason::ProxyUnreachable)
                | CoreError::AbortedTimeout
                | CoreError::AbortedParent => {
                    let mut seq = vec![TransportChoice::SelfOnion];
                    if request.allow_direct {
                        seq.push(TransportChoice::DirectP2p);
                    }
                    seq
                }
                _ => vec![],
            },
            TransportChoice::SelfOnion => {
                if matches!(first_error, CoreError::InternalOnionNotReady) {
                    if request.allow_direct {
                        vec![TransportChoice::DirectP2p]
                    } else {
                        return self.on_terminal_failure(&request.message_id, 1_000, &first_error).await;
                    }
                } else {
                    vec![TransportChoice::OnionRouter]
                }
            }
            _ => vec![],
        };

        let mut last_error = first_error;
        for candidate in fallback_sequence {
            match self.try_transport(candidate, packet.clone()).await {
                Ok(()) => return self.on_success(&request.message_id, candidate).await,
                Err(e) => {
                    warn!(transport = choice_name(candidate), error = %e, "fallback transport send failed");
                    last_error = e;
                }
            }
        }

        self.on_terminal_failure(&request.message_id, 5_000, &last_error).await
    }

    /// `prewarmRouter` (§4.7 step 7): start the chosen transport plus its
    /// permitted fallbacks in parallel.
    pub async fn prewarm(&self, config: &NetConfig, allow_direct: bool) -> PrewarmOutcome {
        let chosen = self.choose_primary(config).await;
        let mut requested = vec![choice_name(chosen)];
        if allow_direct && chosen != TransportChoice::DirectP2p {
            requested.push(choice_name(TransportChoice::DirectP2p));
        }
        if chosen != TransportChoice::OnionRouter {
            requested.push(choice_name(TransportChoice::OnionRouter));
        }

        let mut started = Vec::new();
        let mut failed = Vec::new();
        for name in &requested {
            match self.adapter(name) {
                Some(adapter) => match adapter.start().await {
                    Ok(()) => started.push(*name),
                    Err(e) => {
                        warn!(transport = %name, error = %e, "prewarm start failed");
                        failed.push(*name);
                    }
                },
                None => failed.push(*name),
            }
        }

        info!(chosen = choice_name(chosen), ?started, ?failed, "router prewarm complete");
        PrewarmOutcome { chosen: choice_name(chosen), requested, started, failed }
    }
}
