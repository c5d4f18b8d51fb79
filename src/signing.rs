//! `HopAuthenticator` — optional signature verification seam for circuit
//! control frames (§4.4, §9 open question). The build algorithm works with
//! the `AcceptAll` default; a host wanting authenticated `HOP_ACK`/`HOP_PONG`
//! supplies a real Ed25519-backed implementation instead.
//!
//! Envelope *contents* stay opaque to this crate (§1: crypto primitives are
//! an external collaborator) — this module only covers the narrow signing
//! seam the circuit manager explicitly calls out.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

pub trait HopAuthenticator: Send + Sync {
    /// Sign `message` (typically a canonical encoding of a `HOP_ACK`/`HOP_PONG`
    /// frame) as the given relay peer. Returns `None` if this authenticator
    /// has no signing key for that peer (e.g. verify-only hosts).
    fn sign(&self, peer_id: &str, message: &[u8]) -> Option<Vec<u8>>;

    /// Verify a signature claimed to be from `peer_id` over `message`.
    /// `AcceptAll` always returns `true`; real implementations look up the
    /// peer's known verifying key and reject on mismatch.
    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool;
}

/// No-op default (§9): every signature verifies, nothing is signed. Used
/// until a host wires in real relay identity keys.
pub struct AcceptAll;

impl HopAuthenticator for AcceptAll {
    fn sign(&self, _peer_id: &str, _message: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn verify(&self, _peer_id: &str, _message: &[u8], _signature: &[u8]) -> bool {
        true
    }
}

/// Reference Ed25519 implementation: one signing key per local peer
/// identity, a registry of known peers' verifying keys.
pub struct Ed25519HopAuthenticator {
    signing_key: SigningKey,
    known_peers: std::collections::HashMap<String, VerifyingKey>,
}

impl Ed25519HopAuthenticator {
    pub fn new(signing_key: SigningKey) -> Self {
        Ed25519HopAuthenticator {
            signing_key,
            known_peers: std::collections::HashMap::new(),
        }
    }

    pub fn trust_peer(&mut self, peer_id: impl Into<String>, key: VerifyingKey) {
        self.known_peers.insert(peer_id.into(), key);
    }
}

impl HopAuthenticator for Ed25519HopAuthenticator {
    fn sign(&self, _peer_id: &str, message: &[u8]) -> Option<Vec<u8>> {
        Some(self.signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.known_peers.get(peer_id) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn accept_all_verifies_anything() {
        let auth = AcceptAll;
        assert!(auth.verify("peer-1", b"frame", b"garbage"));
        assert!(auth.sign("peer-1", b"frame").is_none());
    }

    #[test]
    fn ed25519_authenticator_round_trips_a_trusted_peer() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let mut auth = Ed25519HopAuthenticator::new(signing_key);
        auth.trust_peer("relay-a", verifying_key);

        let message = b"HOP_ACK:circuit-1:hop-0";
        let signature = auth.sign("relay-a", message).unwrap();
        assert!(auth.verify("relay-a", message, &signature));
    }

    #[test]
    fn ed25519_authenticator_rejects_unknown_peer() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let auth = Ed25519HopAuthenticator::new(signing_key);
        assert!(!auth.verify("stranger", b"frame", &[0u8; 64]));
    }

    #[test]
    fn ed25519_authenticator_rejects_tampered_message() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let mut auth = Ed25519HopAuthenticator::new(signing_key);
        auth.trust_peer("relay-a", verifying_key);

        let signature = auth.sign("relay-a", b"original").unwrap();
        assert!(!auth.verify("relay-a", b"tampered", &signature));
    }
}
