//! The transport envelope carrying a binary `seq` and an opaque
//! payload between two gateways' peer connections.
//!
//! Distinct from [`crate::message::codec`], which encodes the
//! `PpcMessage` payload carried *inside* one of these envelopes; this
//! framing only concerns itself with pairing a frame with its
//! wire-level reply.

use crate::error::*;
use crate::message::TransportSeq;

/// A single frame exchanged between two peer connections.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub seq: TransportSeq,
    pub is_response: bool,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + 4 + self.payload.len());
        buf.push(if self.is_response { 1 } else { 0 });
        buf.extend_from_slice(&self.seq.0.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err("frame header too short").simple(ErrorKind::Protocol);
        }
        let is_response = buf[0] != 0;
        let seq = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        let payload = buf
            .get(9..9 + len)
            .ok_or(())
            .simple(ErrorKind::Protocol)?
            .to_vec();
        Ok(WireFrame {
            seq: TransportSeq(seq),
            is_response,
            payload,
        })
    }
}
