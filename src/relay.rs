//! Relay Forwarding (C5, §4.5) — source-routed envelope forwarding with a
//! hop cursor and an explicit peer chain.

use serde::{Deserialize, Serialize};

pub const RELAY_ENVELOPE_TYPE: &str = "internal_onion_relay";
pub const RELAY_ENVELOPE_VERSION: u8 = 1;
pub const MAX_CHAIN_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ControlFrame {
    HopHello { circuit_id: String, hop_index: u32, ts: i64, sender_peer_id: String },
    HopAck { circuit_id: String, hop_index: u32, relay_peer_id: String, ok: bool },
    HopPing { circuit_id: String, hop_index: u32 },
    HopPong { circuit_id: String, hop_index: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayPayload {
    Data { packet: crate::packet::TransportPacket },
    Control { frame: ControlFrame },
}

/// `{type:"internal_onion_relay", v:1, ts, circuitId, senderPeerId, chain, hopCursor, payload}` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub v: u8,
    pub ts: i64,
    pub circuit_id: String,
    pub sender_peer_id: String,
    pub chain: Vec<String>,
    pub hop_cursor: usize,
    pub payload: RelayPayload,
}

impl RelayEnvelope {
    pub fn new(
        circuit_id: impl Into<String>,
        sender_peer_id: impl Into<String>,
        chain: Vec<String>,
        payload: RelayPayload,
        ts: i64,
    ) -> Self {
        RelayEnvelope {
            kind: RELAY_ENVELOPE_TYPE.to_string(),
            v: RELAY_ENVELOPE_VERSION,
            ts,
            circuit_id: circuit_id.into(),
            sender_peer_id: sender_peer_id.into(),
            chain,
            hop_cursor: 0,
            payload,
        }
    }

    fn is_final_hop(&self) -> bool {
        self.hop_cursor == self.chain.len() - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRejectReason {
    WrongType,
    WrongVersion,
    ChainTooShort,
    ChainTooLong,
    CursorOutOfBounds,
    NotAddressedToSelf,
}

/// Outcome of processing one envelope at the local node (§4.5).
#[derive(Debug, Clone)]
pub enum RelayAction {
    /// Drop silently — validation failed; `reason` is for logging only.
    Drop(RelayRejectReason),
    /// Forward `envelope` (cursor already advanced, `ts` refreshed) to `next_peer_id`.
    Forward { next_peer_id: String, envelope: RelayEnvelope },
    /// Final hop, data payload: deliver the inner packet upward.
    DeliverData(crate::packet::TransportPacket),
    /// Final hop, control payload: a reply envelope ready to send back.
    Reply { to_peer_id: String, envelope: RelayEnvelope },
    /// Final hop, `HOP_ACK`/`HOP_PONG`: dispatch to the circuit manager.
    DispatchToCircuit(ControlFrame),
}

/// Validate and decide what to do with an envelope arriving at `self_peer_id`.
/// Implements the validation + forwarding rule of §4.5 and the invariant of
/// §8 ("receiver's peer id equals `chain[hopCursor]` before forwarding;
/// cursor increments by exactly 1 after").
pub fn process_envelope(envelope: RelayEnvelope, self_peer_id: &str, now_ms: i64) -> RelayAction {
    if envelope.kind != RELAY_ENVELOPE_TYPE {
        return RelayAction::Drop(RelayRejectReason::WrongType);
    }
    if envelope.v != RELAY_ENVELOPE_VERSION {
        return RelayAction::Drop(RelayRejectReason::WrongVersion);
    }
    if envelope.chain.is_empty() {
        return RelayAction::Drop(RelayRejectReason::ChainTooShort);
    }
    if envelope.chain.len() > MAX_CHAIN_LEN {
        return RelayAction::Drop(RelayRejectReason::ChainTooLong);
    }
    if envelope.hop_cursor >= envelope.chain.len() {
        return RelayAction::Drop(RelayRejectReason::CursorOutOfBounds);
    }
    if envelope.chain[envelope.hop_cursor] != self_peer_id {
        return RelayAction::Drop(RelayRejectReason::NotAddressedToSelf);
    }

    if !envelope.is_final_hop() {
        let next_cursor = envelope.hop_cursor + 1;
        let next_peer_id = envelope.chain[next_cursor].clone();
        let mut forwarded = envelope;
        forwarded.hop_cursor = next_cursor;
        forwarded.ts = now_ms;
        return RelayAction::Forward { next_peer_id, envelope: forwarded };
    }

    match envelope.payload {
        RelayPayload::Data { packet } => RelayAction::DeliverData(packet),
        RelayPayload::Control { frame: ControlFrame::HopHello { circuit_id, hop_index, sender_peer_id, .. } } => {
            let reply = RelayEnvelope::new(
                circuit_id.clone(),
                self_peer_id,
                vec![sender_peer_id.clone()],
                RelayPayload::Control {
                    frame: ControlFrame::HopAck {
                        circuit_id,
                        hop_index,
                        relay_peer_id: self_peer_id.to_string(),
                        ok: true,
                    },
                },
                now_ms,
            );
            RelayAction::Reply { to_peer_id: sender_peer_id, envelope: reply }
        }
        RelayPayload::Control { frame: ControlFrame::HopPing { circuit_id, hop_index } } => {
            let reply = RelayEnvelope::new(
                circuit_id.clone(),
                self_peer_id,
                vec![envelope.sender_peer_id.clone()],
                RelayPayload::Control { frame: ControlFrame::HopPong { circuit_id, hop_index } },
                now_ms,
            );
            RelayAction::Reply { to_peer_id: envelope.sender_peer_id, envelope: reply }
        }
        RelayPayload::Control { frame } => RelayAction::DispatchToCircuit(frame),
    }
}
