//! `NetConfig` (§3) and the reducer that enforces the `onionRouter` implication
//! rule. Mirrors the teacher's habit of keeping config as a plain struct with
//! a dedicated constructor/reducer rather than mutating fields ad hoc.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    DirectP2p,
    SelfOnion,
    OnionRouter,
    LokinetOnion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnionNetwork {
    Tor,
    Lokinet,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConfig {
    pub mode: NetworkMode,
    pub onion_proxy_enabled: bool,
    pub self_onion_enabled: bool,
    pub self_onion_min_relays: u32,
    pub onion_enabled: bool,
    pub onion_selected_network: OnionNetwork,
    /// Set by the reducer when `mode = onionRouter`; forces outbound traffic
    /// through the onion proxy and disables link previews.
    pub webrtc_relay_only: bool,
    pub disable_link_preview: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            mode: NetworkMode::SelfOnion,
            onion_proxy_enabled: false,
            self_onion_enabled: true,
            self_onion_min_relays: 2,
            onion_enabled: false,
            onion_selected_network: OnionNetwork::None,
            webrtc_relay_only: false,
            disable_link_preview: false,
        }
    }
}

impl NetConfig {
    /// Apply a mode change, enforcing §3's rule: `mode=onionRouter` implies
    /// `onionProxyEnabled ∧ webrtcRelayOnly ∧ disableLinkPreview`.
    pub fn set_mode(&mut self, mode: NetworkMode) {
        self.mode = mode;
        if mode == NetworkMode::OnionRouter {
            self.onion_proxy_enabled = true;
            self.webrtc_relay_only = true;
            self.disable_link_preview = true;
        }
    }

    pub fn with_mode(mut self, mode: NetworkMode) -> Self {
        self.set_mode(mode);
        self
    }
}

/// Selects the direct-connect timeout (8s/20s) and gates `directOnly`
/// policy in the Conversation Manager (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    UserToUser,
    DeviceToDevice,
}

/// Consulted by the Conversation Manager's approval hook (§3.1, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    NoApproval,
    RequireApproval,
    DirectOnly,
}

/// Wraps the live, reducer-guarded `NetConfig` together with the timeouts,
/// backoff tables, and controller/rendezvous URLs named throughout §4 (§1.1
/// ambient stack). Loaded from a TOML/JSON settings file owned by the
/// (out-of-scope) settings-persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    pub net: NetConfig,
    pub onion_controller_url: String,
    pub rendezvous_url: String,
    pub onion_http_timeout_ms: u64,
    pub onion_send_timeout_ms: u64,
    pub rendezvous_http_timeout_ms: u64,
    pub use_onion_proxy_for_rendezvous: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            net: NetConfig::default(),
            onion_controller_url: "http://127.0.0.1:3210".to_string(),
            rendezvous_url: "https://rendezvous.example.invalid".to_string(),
            onion_http_timeout_ms: 10_000,
            onion_send_timeout_ms: 30_000,
            rendezvous_http_timeout_ms: 10_000,
            use_onion_proxy_for_rendezvous: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_deserializes_from_json_with_defaults_for_missing_net() {
        let json = r#"{
            "net": {
                "mode": "selfOnion",
                "onionProxyEnabled": false,
                "selfOnionEnabled": true,
                "selfOnionMinRelays": 2,
                "onionEnabled": false,
                "onionSelectedNetwork": "none",
                "webrtcRelayOnly": false,
                "disableLinkPreview": false
            },
            "onionControllerUrl": "http://127.0.0.1:3210",
            "rendezvousUrl": "https://example.invalid",
            "onionHttpTimeoutMs": 10000,
            "onionSendTimeoutMs": 30000,
            "rendezvousHttpTimeoutMs": 10000,
            "useOnionProxyForRendezvous": false
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.net.mode, NetworkMode::SelfOnion);
    }

    #[test]
    fn setting_onion_router_mode_forces_implied_flags() {
        let mut cfg = NetConfig::default();
        cfg.onion_proxy_enabled = false;
        cfg.webrtc_relay_only = false;
        cfg.disable_link_preview = false;

        cfg.set_mode(NetworkMode::OnionRouter);

        assert!(cfg.onion_proxy_enabled);
        assert!(cfg.webrtc_relay_only);
        assert!(cfg.disable_link_preview);
    }

    #[test]
    fn other_modes_do_not_force_flags() {
        let mut cfg = NetConfig::default();
        cfg.set_mode(NetworkMode::DirectP2p);
        assert!(!cfg.onion_proxy_enabled);
        assert!(!cfg.webrtc_relay_only);
        assert!(!cfg.disable_link_preview);
    }
}
