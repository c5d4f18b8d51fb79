//! Direct adapter (§4.1, §4.1.1) — wraps an injected `PeerConnection`
//! collaborator carrying a data channel labelled `nkc-direct-v1`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::warn;

use crate::config::DeviceKind;
use crate::error::CoreError;
use crate::packet::TransportPacket;
use crate::transport::{ObserverRegistry, TransportAdapter, TransportObserver, TransportState};

const SIGNAL_PREFIX: &str = "NKC-RTC1.";
const DIRECT_CHANNEL_LABEL: &str = "nkc-direct-v1";
const USER_TO_USER_TIMEOUT: Duration = Duration::from_secs(8);
const DEVICE_TO_DEVICE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
    Ice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub v: u8,
    pub t: SignalType,
    pub sdp: Option<String>,
    pub candidate: Option<String>,
}

/// Encode a signal message into the `NKC-RTC1.<base64url(json)>` wire form.
pub fn encode_signal_code(message: &SignalMessage) -> Result<String, CoreError> {
    let json = serde_json::to_vec(message).map_err(|e| CoreError::Other(e.to_string()))?;
    Ok(format!("{SIGNAL_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
}

/// Decode a signal code back into its message. `decode(encode(m)) = m` must
/// hold for any valid `m` (§8 round-trip property).
pub fn decode_signal_code(code: &str) -> Result<SignalMessage, CoreError> {
    let Some(encoded) = code.strip_prefix(SIGNAL_PREFIX) else {
        return Err(CoreError::Other("not an NKC-RTC1 signal code".to_string()));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| CoreError::Other(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| CoreError::Other(e.to_string()))
}

/// The injected ICE/DTLS/SCTP collaborator (§4.1.1). Production
/// implementations wrap the `webrtc` crate's `RTCPeerConnection`; test
/// implementations are in-memory fakes exchanging offers/answers directly.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, CoreError>;
    async fn create_answer(&self, remote_sdp: &str) -> Result<String, CoreError>;
    async fn set_remote_description(&self, sdp: &str) -> Result<(), CoreError>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), CoreError>;
    async fn create_data_channel(&self, label: &str) -> Result<(), CoreError>;
    async fn send_on_channel(&self, bytes: &[u8]) -> Result<(), CoreError>;
    /// True once the data channel has reached the `open` state.
    fn is_channel_open(&self) -> bool;
}

pub struct DirectAdapter {
    peer: Arc<dyn PeerConnection>,
    device_kind: DeviceKind,
    registry: Arc<ObserverRegistry>,
    state: RwLock<TransportState>,
    ice_queue: Mutex<Vec<String>>,
    remote_description_set: RwLock<bool>,
}

impl DirectAdapter {
    pub fn new(peer: Arc<dyn PeerConnection>, device_kind: DeviceKind) -> Self {
        DirectAdapter {
            peer,
            device_kind,
            registry: Arc::new(ObserverRegistry::default()),
            state: RwLock::new(TransportState::Idle),
            ice_queue: Mutex::new(Vec::new()),
            remote_description_set: RwLock::new(false),
        }
    }

    fn connect_timeout(&self) -> Duration {
        match self.device_kind {
            DeviceKind::UserToUser => USER_TO_USER_TIMEOUT,
            DeviceKind::DeviceToDevice => DEVICE_TO_DEVICE_TIMEOUT,
        }
    }

    pub async fn create_offer_code(&self) -> Result<String, CoreError> {
        self.peer.create_data_channel(DIRECT_CHANNEL_LABEL).await?;
        let sdp = self.peer.create_offer().await?;
        encode_signal_code(&SignalMessage { v: 1, t: SignalType::Offer, sdp: Some(sdp), candidate: None })
    }

    /// Accept a signal code: an `offer` produces and returns an `answer`
    /// code; an `answer`/`ice` code is applied and returns `None`. ICE
    /// candidates arriving before the remote description is set are queued
    /// and flushed atomically once it is (§4.1).
    pub async fn accept_signal_code(&self, code: &str) -> Result<Option<String>, CoreError> {
        let message = decode_signal_code(code)?;
        match message.t {
            SignalType::Offer => {
                let sdp = message.sdp.ok_or_else(|| CoreError::Other("offer missing sdp".into()))?;
                let answer_sdp = timeout(self.connect_timeout(), self.peer.create_answer(&sdp))
                    .await
                    .map_err(|_| CoreError::AbortedTimeout)??;
                *self.remote_description_set.write().await = true;
                self.flush_ice_queue().await?;
                let answer = encode_signal_code(&SignalMessage {
                    v: 1,
                    t: SignalType::Answer,
                    sdp: Some(answer_sdp),
                    candidate: None,
                })?;
                Ok(Some(answer))
            }
            SignalType::Answer => {
                let sdp = message.sdp.ok_or_else(|| CoreError::Other("answer missing sdp".into()))?;
                timeout(self.connect_timeout(), self.peer.set_remote_description(&sdp))
                    .await
                    .map_err(|_| CoreError::AbortedTimeout)??;
                *self.remote_description_set.write().await = true;
                self.flush_ice_queue().await?;
                Ok(None)
            }
            SignalType::Ice => {
                let candidate = message.candidate.ok_or_else(|| CoreError::Other("ice missing candidate".into()))?;
                if *self.remote_description_set.read().await {
                    self.peer.add_ice_candidate(&candidate).await?;
                } else {
                    self.ice_queue.lock().await.push(candidate);
                }
                Ok(None)
            }
        }
    }

    /// True once the underlying data channel has reached the `open` state
    /// (§4.9: guest/host pairing status reaches `connected` from this).
    pub fn is_channel_open(&self) -> bool {
        self.peer.is_channel_open()
    }

    async fn flush_ice_queue(&self) -> Result<(), CoreError> {
        let mut queue = self.ice_queue.lock().await;
        for candidate in queue.drain(..) {
            self.peer.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for DirectAdapter {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn start(&self) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        if *state == TransportState::Idle {
            *state = TransportState::Connecting;
            drop(state);
            self.registry.notify_state(TransportState::Connecting).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        *self.state.write().await = TransportState::Idle;
        self.registry.notify_state(TransportState::Idle).await;
    }

    async fn send(&self, packet: TransportPacket) -> Result<(), CoreError> {
        if !self.peer.is_channel_open() {
            return Err(CoreError::DirectNotOpen);
        }
        let bytes = serde_json::to_vec(&packet).map_err(|e| CoreError::Other(e.to_string()))?;
        self.peer.send_on_channel(&bytes).await?;
        Ok(())
    }

    fn add_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.registry.add(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPayload;
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

    #[test]
    fn signal_code_encoding_is_a_bijection() {
        let message = SignalMessage { v: 1, t: SignalType::Offer, sdp: Some("abc".into()), candidate: None };
        let code = encode_signal_code(&message).unwrap();
        assert!(code.starts_with(SIGNAL_PREFIX));
        let decoded = decode_signal_code(&code).unwrap();
        assert_eq!(decoded.sdp, message.sdp);
        assert_eq!(decoded.t, message.t);
    }

    #[test]
    fn decode_rejects_codes_without_the_prefix() {
        assert!(decode_signal_code("not-a-signal-code").is_err());
    }

    #[tokio::test]
    async fn ice_candidates_before_remote_description_are_queued_then_flushed() {
        let peer = Arc::new(FakePeer { open: AtomicBool::new(false) });
        let adapter = DirectAdapter::new(peer.clone(), DeviceKind::UserToUser);

        let ice_code = encode_signal_code(&SignalMessage { v: 1, t: SignalType::Ice, sdp: None, candidate: Some("cand-1".into()) }).unwrap();
        adapter.accept_signal_code(&ice_code).await.unwrap();
        assert_eq!(adapter.ice_queue.lock().await.len(), 1);

        let answer_code = encode_signal_code(&SignalMessage { v: 1, t: SignalType::Answer, sdp: Some("remote-sdp".into()), candidate: None }).unwrap();
        adapter.accept_signal_code(&answer_code).await.unwrap();
        assert_eq!(adapter.ice_queue.lock().await.len(), 0, "queue must flush once remote description is set");
    }

    #[tokio::test]
    async fn send_before_channel_open_is_direct_not_open() {
        let peer = Arc::new(FakePeer { open: AtomicBool::new(false) });
        let adapter = DirectAdapter::new(peer, DeviceKind::UserToUser);
        let packet = TransportPacket::new("m1", PacketPayload::Text("hi".into()));
        let result = adapter.send(packet).await;
        assert!(matches!(result, Err(CoreError::DirectNotOpen)));
    }
}
