//! External onion adapter (§4.1) — composes with the Onion Inbox Client
//! (C2) to carry traffic over an externally-managed Tor/Lokinet overlay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{CoreError, ForwardFailReason};
use crate::onion_client::{InboxPollerRegistry, InboxSubscription, OnionInboxClient, RouteSpec, SendRequest};
use crate::packet::{PacketPayload, TransportPacket};
use crate::transport::{ObserverRegistry, TransportAdapter, TransportObserver, TransportState};

const RETRY_DELAYS_MS: [u64; 3] = [0, 250, 700];
const DEDUP_WINDOW: usize = 500;

pub struct ExternalOnionAdapter {
    client: Arc<OnionInboxClient>,
    self_device_id: String,
    registry: Arc<ObserverRegistry>,
    pollers: Arc<InboxPollerRegistry>,
    subscription: Mutex<Option<InboxSubscription>>,
    seen_ids: Arc<Mutex<VecDeque<String>>>,
}

impl ExternalOnionAdapter {
    /// `pollers` is the process-wide registry (from `CoreContext`) so this
    /// adapter shares its poller with any other caller on the same
    /// `(baseUrl, deviceId)` (§4.2).
    pub fn new(client: Arc<OnionInboxClient>, self_device_id: impl Into<String>, pollers: Arc<InboxPollerRegistry>) -> Arc<Self> {
        Arc::new(ExternalOnionAdapter {
            client,
            self_device_id: self_device_id.into(),
            registry: Arc::new(ObserverRegistry::default()),
            pollers,
            subscription: Mutex::new(None),
            seen_ids: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    async fn remember_and_check_duplicate(&self, id: &str) -> bool {
        let mut seen = self.seen_ids.lock().await;
        if seen.contains(&id.to_string()) {
            return true;
        }
        seen.push_back(id.to_string());
        if seen.len() > DEDUP_WINDOW {
            seen.pop_front();
        }
        false
    }
}

#[async_trait]
impl TransportAdapter for ExternalOnionAdapter {
    fn name(&self) -> &'static str {
        "onionRouter"
    }

    async fn start(&self) -> Result<(), CoreError> {
        let mut subscription_slot = self.subscription.lock().await;
        if subscription_slot.is_some() {
            return Ok(());
        }
        let device_id = self.self_device_id.clone();
        let registry = Arc::clone(&self.registry);
        let this_seen = Arc::clone(&self.seen_ids);

        let subscription = self.pollers.subscribe(
            Arc::clone(&self.client),
            self.client.base_url(),
            &device_id,
            move |items| {
                let registry = Arc::clone(&registry);
                let this_seen = Arc::clone(&this_seen);
                tokio::spawn(async move {
                    for item in items {
                        let mut seen = this_seen.lock().await;
                        if seen.contains(&item.id) {
                            continue;
                        }
                        seen.push_back(item.id.clone());
                        if seen.len() > DEDUP_WINDOW {
                            seen.pop_front();
                        }
                        drop(seen);

                        let Ok(bytes) = URL_SAFE_NO_PAD.decode(item.envelope.as_bytes()) else {
                            continue;
                        };
                        let packet = TransportPacket::new(item.id.clone(), PacketPayload::Bytes(bytes)).with_to(item.from.clone());
                        registry.notify_message(packet).await;
                    }
                });
            },
        );

        *subscription_slot = Some(subscription);
        drop(subscription_slot);
        self.registry.notify_state(TransportState::Connected).await;
        Ok(())
    }

    async fn stop(&self) {
        *self.subscription.lock().await = None;
        self.registry.notify_state(TransportState::Idle).await;
    }

    async fn send(&self, packet: TransportPacket) -> Result<(), CoreError> {
        let to_device_id = packet.to.clone().ok_or_else(|| CoreError::FatalMisconfig("missing destination".into()))?;
        let route = packet.route.clone();
        let envelope_bytes = match &packet.payload {
            PacketPayload::Bytes(b) => b.clone(),
            PacketPayload::Base64Url(s) => URL_SAFE_NO_PAD.decode(s.as_bytes()).unwrap_or_default(),
            PacketPayload::Text(t) => t.clone().into_bytes(),
        };
        let envelope = URL_SAFE_NO_PAD.encode(envelope_bytes);

        let mut last_err = CoreError::ForwardFailed(ForwardFailReason::Other);
        let mut needs_proxy_resync = false;
        for (attempt, delay_ms) in RETRY_DELAYS_MS.iter().enumerate() {
            if *delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }

            if needs_proxy_resync {
                // re-sync the controller's forward proxy before retrying
                // (§4.1): a health probe makes the controller re-check its
                // Tor/Lokinet proxy connection rather than repeating the
                // identical send against a still-stale proxy.
                if let Err(e) = self.client.health().await {
                    warn!(attempt, error = %e, "onion controller proxy resync probe failed");
                }
                needs_proxy_resync = false;
            }

            let route_spec = route.as_ref().and_then(|r| {
                r.tor_onion.clone().map(|tor_onion| RouteSpec {
                    mode: r.mode.clone().unwrap_or_else(|| "auto".to_string()),
                    tor_onion: Some(tor_onion),
                    lokinet: r.lokinet.clone(),
                })
            });

            let request = SendRequest {
                to: None,
                to_device_id: to_device_id.clone(),
                from_device_id: self.self_device_id.clone(),
                envelope: envelope.clone(),
                ttl_ms: None,
                route: route_spec,
            };

            match self.client.send(request).await {
                Ok(_msg_id) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "external onion send attempt failed");
                    last_err = e;
                    if matches!(
                        &last_err,
                        CoreError::ForwardFailed(ForwardFailReason::ProxyUnreachable)
                            | CoreError::ForwardFailed(ForwardFailReason::NoProxy)
                    ) {
                        needs_proxy_resync = true;
                    } else {
                        // other failures fall straight through to the caller
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    fn add_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.registry.add(observer);
    }
}
