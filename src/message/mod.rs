//! This module contains the types traded between gateways and between
//! a gateway and its local fronts: the routable `PpcMessage`, the two
//! distinct "sequence" concepts used to correlate replies, and the
//! three-token ack vocabulary exchanged over the wire.

pub mod codec;

use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Link-local sequence number used by the transport to pair an
/// outbound frame with its wire-level reply.
///
/// Kept distinct from [`CorrelationId`] in the type system: the two
/// "seq" concepts in the original protocol (transport `seq` vs.
/// application `uuid`) must never be confused by the gateway.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct TransportSeq(pub u32);

impl From<u32> for TransportSeq {
    #[inline]
    fn from(seq: u32) -> Self {
        TransportSeq(seq)
    }
}

impl From<TransportSeq> for u32 {
    #[inline]
    fn from(seq: TransportSeq) -> u32 {
        seq.0
    }
}

impl fmt::Display for TransportSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// End-to-end identifier linking a message and its application-level
/// ack, independent of whatever transport carried it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Returns a new, globally-unique correlation id.
    pub fn generate() -> Self {
        CorrelationId(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId(s.to_owned())
    }
}

/// The three literal tokens exchanged as ack payloads on the wire.
/// Internal error kinds never leak across the wire; this is the only
/// vocabulary a peer ever observes in a reply.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckStatus {
    Success,
    Error,
    Timeout,
}

impl AckStatus {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            AckStatus::Success => b"success",
            AckStatus::Error => b"error",
            AckStatus::Timeout => b"timeout",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"success" => Some(AckStatus::Success),
            b"error" => Some(AckStatus::Error),
            b"timeout" => Some(AckStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckStatus::Success => "success",
            AckStatus::Error => "error",
            AckStatus::Timeout => "timeout",
        })
    }
}

/// The current wire protocol version.
pub const CURRENT_VERSION: u8 = 0;

/// A routable unit traded between gateways (and, once dispatched,
/// between a gateway and a local front).
///
/// Invariant: `uuid` is non-empty for every message that requires an
/// application-level ack.
#[derive(Debug, Clone)]
pub struct PpcMessage {
    pub version: u8,
    pub task_type: u8,
    pub algorithm_type: u8,
    pub message_type: u8,
    pub seq: u32,
    pub task_id: String,
    pub sender: String,
    pub uuid: CorrelationId,
    pub response: bool,
    pub payload: Vec<u8>,
}

impl PpcMessage {
    /// Builds a new message, stamping a freshly generated correlation
    /// id if the caller does not already have one to propagate.
    pub fn new(
        task_type: u8,
        algorithm_type: u8,
        message_type: u8,
        task_id: impl Into<String>,
        sender: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        PpcMessage {
            version: CURRENT_VERSION,
            task_type,
            algorithm_type,
            message_type,
            seq: 0,
            task_id: task_id.into(),
            sender: sender.into(),
            uuid: CorrelationId::generate(),
            response: false,
            payload,
        }
    }

    /// A message with an empty `taskID` is routed to every known
    /// local front, rather than to a single task-bound front.
    pub fn is_broadcast(&self) -> bool {
        self.task_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_status_round_trips_through_wire_tokens() {
        for status in [AckStatus::Success, AckStatus::Error, AckStatus::Timeout] {
            let bytes = status.as_bytes();
            assert_eq!(AckStatus::from_bytes(bytes), Some(status));
        }
        assert_eq!(AckStatus::from_bytes(b"bogus"), None);
    }

    #[test]
    fn broadcast_is_detected_via_empty_task_id() {
        let msg = PpcMessage::new(0, 0, 0, "", "agencyA", vec![1, 2, 3]);
        assert!(msg.is_broadcast());
        let msg = PpcMessage::new(0, 0, 0, "T1", "agencyA", vec![1, 2, 3]);
        assert!(!msg.is_broadcast());
    }
}
