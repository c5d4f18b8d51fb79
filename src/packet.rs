//! Wire-level packet shape shared by every transport adapter (§3 `TransportPacket`).
//!
//! The core never inspects `payload` — it is opaque ciphertext — but it must
//! round-trip exactly across transports that can only carry JSON text, hence
//! the base64url-wrapped variant.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

/// Route hint threaded alongside a packet so an adapter knows which concrete
/// destination/network to address without the router re-deriving it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteHint {
    pub mode: Option<String>,
    pub tor_onion: Option<String>,
    pub lokinet: Option<String>,
    pub to_device_id: Option<String>,
}

/// Payload carried by a `TransportPacket`. Binary data is wrapped in the
/// `Base64Url` variant so JSON-only transports (HTTP, data-channel text
/// frames) can carry it without corruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PacketPayload {
    Bytes(#[serde(with = "bytes_as_base64")] Vec<u8>),
    Text(String),
    Base64Url(String),
}

mod bytes_as_base64 {
    use super::{URL_SAFE_NO_PAD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl PacketPayload {
    /// Wrap arbitrary bytes into the base64url form used when a transport
    /// can only carry JSON text (§3: "a base64url-wrapped form exists so
    /// binary data survives JSON transports").
    pub fn wrap_base64url(bytes: &[u8]) -> Self {
        PacketPayload::Base64Url(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Unwrap the base64url form back to raw bytes. Returns `None` for
    /// non-`Base64Url` variants or malformed base64.
    pub fn unwrap_base64url(&self) -> Option<Vec<u8>> {
        match self {
            PacketPayload::Base64Url(s) => URL_SAFE_NO_PAD.decode(s.as_bytes()).ok(),
            _ => None,
        }
    }
}

/// A single outbound/inbound unit handed to and from transport adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportPacket {
    /// Unique per send; duplicate ids are the caller's responsibility.
    pub id: String,
    pub payload: PacketPayload,
    pub to: Option<String>,
    pub route: Option<RouteHint>,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl TransportPacket {
    pub fn new(id: impl Into<String>, payload: PacketPayload) -> Self {
        TransportPacket {
            id: id.into(),
            payload,
            to: None,
            route: None,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_route(mut self, route: RouteHint) -> Self {
        self.route = Some(route);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_wrapper_round_trips_arbitrary_bytes() {
        let original: Vec<u8> = (0..=255u8).collect();
        let wrapped = PacketPayload::wrap_base64url(&original);
        let recovered = wrapped.unwrap_base64url().expect("valid base64url");
        assert_eq!(recovered, original);
    }

    #[test]
    fn base64url_wrapper_round_trips_empty_bytes() {
        let wrapped = PacketPayload::wrap_base64url(&[]);
        assert_eq!(wrapped.unwrap_base64url(), Some(Vec::new()));
    }

    #[test]
    fn non_base64_variant_unwraps_to_none() {
        let text = PacketPayload::Text("hello".into());
        assert_eq!(text.unwrap_base64url(), None);
    }

    #[test]
    fn packet_serializes_and_deserializes_through_json() {
        let packet = TransportPacket::new("msg-1", PacketPayload::wrap_base64url(b"hi"))
            .with_to("device-a")
            .with_route(RouteHint {
                mode: Some("auto".into()),
                ..Default::default()
            });

        let json = serde_json::to_string(&packet).unwrap();
        let back: TransportPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "msg-1");
        assert_eq!(back.to.as_deref(), Some("device-a"));
        assert_eq!(back.payload.unwrap_base64url(), Some(b"hi".to_vec()));
    }
}
