//! Wire encoding for [`PpcMessage`](super::PpcMessage), as described in
//! the on-wire frame format: a flat concatenation of fixed-width
//! integer fields and length-prefixed strings/payload, all integers
//! big-endian.

use super::{CorrelationId, PpcMessage};
use crate::error::*;

const SENDER_LEN_MAX: usize = u16::MAX as usize;
const TASK_ID_LEN_MAX: usize = u16::MAX as usize;
const UUID_LEN_MAX: usize = u16::MAX as usize;

/// Encodes a [`PpcMessage`] into its wire representation.
pub fn encode(msg: &PpcMessage) -> Result<Vec<u8>> {
    if msg.sender.len() > SENDER_LEN_MAX {
        return Err("sender field too long").simple(ErrorKind::Protocol);
    }
    if msg.task_id.len() > TASK_ID_LEN_MAX {
        return Err("taskID field too long").simple(ErrorKind::Protocol);
    }
    if msg.uuid.0.len() > UUID_LEN_MAX {
        return Err("uuid field too long").simple(ErrorKind::Protocol);
    }

    let mut buf = Vec::with_capacity(
        1 + 1 + 1 + 1 + 4 + 2 + msg.sender.len() + 2 + msg.task_id.len() + 2 + msg.uuid.0.len()
            + 1
            + 4
            + msg.payload.len(),
    );

    buf.push(msg.version);
    buf.push(msg.task_type);
    buf.push(msg.algorithm_type);
    buf.push(msg.message_type);
    buf.extend_from_slice(&msg.seq.to_be_bytes());

    buf.extend_from_slice(&(msg.sender.len() as u16).to_be_bytes());
    buf.extend_from_slice(msg.sender.as_bytes());

    buf.extend_from_slice(&(msg.task_id.len() as u16).to_be_bytes());
    buf.extend_from_slice(msg.task_id.as_bytes());

    buf.extend_from_slice(&(msg.uuid.0.len() as u16).to_be_bytes());
    buf.extend_from_slice(msg.uuid.0.as_bytes());

    buf.push(if msg.response { 1 } else { 0 });

    buf.extend_from_slice(&(msg.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&msg.payload);

    Ok(buf)
}

/// Decodes a [`PpcMessage`] from its wire representation.
///
/// Any structural problem (short buffer, length prefix overrunning the
/// remaining bytes, non-UTF8 string field) is reported as a
/// `Protocol`-kind error; the caller is expected to turn this into an
/// `"error"` ack and discard the message.
pub fn decode(buf: &[u8]) -> Result<PpcMessage> {
    let mut cur = Cursor::new(buf);

    let version = cur.take_u8()?;
    let task_type = cur.take_u8()?;
    let algorithm_type = cur.take_u8()?;
    let message_type = cur.take_u8()?;
    let seq = cur.take_u32()?;

    let sender = cur.take_string_u16()?;
    let task_id = cur.take_string_u16()?;
    let uuid = cur.take_string_u16()?;

    let response = cur.take_u8()? != 0;
    let payload = cur.take_bytes_u32()?;

    Ok(PpcMessage {
        version,
        task_type,
        algorithm_type,
        message_type,
        seq,
        task_id,
        sender,
        uuid: CorrelationId(uuid),
        response,
        payload,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err("buffer too short while decoding PpcMessage").simple(ErrorKind::Protocol);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_string_u16(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).simple(ErrorKind::Protocol)
    }

    fn take_bytes_u32(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PpcMessage;

    #[test]
    fn encode_then_decode_preserves_every_field() {
        let mut msg = PpcMessage::new(1, 2, 3, "task-42", "agencyA", vec![9, 9, 9, 9]);
        msg.seq = 7;
        msg.response = true;

        let bytes = encode(&msg).expect("encode");
        let decoded = decode(&bytes).expect("decode");

        assert_eq!(decoded.version, msg.version);
        assert_eq!(decoded.task_type, msg.task_type);
        assert_eq!(decoded.algorithm_type, msg.algorithm_type);
        assert_eq!(decoded.message_type, msg.message_type);
        assert_eq!(decoded.seq, msg.seq);
        assert_eq!(decoded.task_id, msg.task_id);
        assert_eq!(decoded.sender, msg.sender);
        assert_eq!(decoded.uuid, msg.uuid);
        assert_eq!(decoded.response, msg.response);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn decode_rejects_truncated_buffers() {
        let msg = PpcMessage::new(0, 0, 0, "T1", "agencyA", vec![1, 2, 3]);
        let mut bytes = encode(&msg).expect("encode");
        bytes.truncate(bytes.len() - 1);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_empty_buffer_is_a_protocol_error_not_a_panic() {
        assert!(decode(&[]).is_err());
    }
}
