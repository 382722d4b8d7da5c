//! OP_MSG framing for commands and replies.

use std::{
    io::Read,
    sync::atomic::{AtomicI32, Ordering},
};

use bitflags::bitflags;
use bson::Document;

use crate::error::{Error, Result};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Obtains a new, process-unique request ID.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Message = 2013,
}

impl OpCode {
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            2013 => Ok(OpCode::Message),
            other => Err(Error::invalid_response(format!(
                "Invalid wire protocol opcode: {}",
                other
            ))),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug, PartialEq)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    pub(crate) fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LENGTH {
            return Err(Error::invalid_response(format!(
                "message header must be {} bytes, got {}",
                Self::LENGTH,
                bytes.len()
            )));
        }
        Ok(Self {
            length: read_i32(&bytes[0..4]),
            request_id: read_i32(&bytes[4..8]),
            response_to: read_i32(&bytes[8..12]),
            op_code: OpCode::from_i32(read_i32(&bytes[12..16]))?,
        })
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(buf)
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents an OP_MSG wire protocol operation carrying a single document payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: Document,
}

impl Message {
    /// Creates a `Message` carrying `command`, which must already contain `$db`.
    pub(crate) fn from_command(command: Document, request_id: i32) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::empty(),
            document_payload: command,
        }
    }

    /// Creates a reply to the message with the given request ID.
    pub(crate) fn reply_to(request_id: i32, reply: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: request_id,
            flags: MessageFlags::empty(),
            document_payload: reply,
        }
    }

    /// Serializes this message into its wire representation.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.document_payload.to_writer(&mut payload)?;

        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + 1 + payload.len();
        let length = i32::try_from(total_length).map_err(|_| {
            Error::invalid_argument(format!("message of {} bytes is too large", total_length))
        })?;

        let mut buf = Vec::with_capacity(total_length);
        Header {
            length,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        }
        .write_to(&mut buf);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        // Payload type 0: a single document.
        buf.push(0);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Deserializes a complete wire message.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::read_from(bytes)?;
        let length = usize::try_from(header.length)
            .map_err(|_| Error::invalid_response("negative message length"))?;
        if length != bytes.len() {
            return Err(Error::invalid_response(format!(
                "message header claims {} bytes but {} were received",
                length,
                bytes.len()
            )));
        }

        let mut body = &bytes[Header::LENGTH..];
        if body.len() < 5 {
            return Err(Error::invalid_response("OP_MSG body is truncated"));
        }
        let flags = MessageFlags::from_bits_truncate(read_i32(&body[..4]) as u32);
        body = &body[4..];
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            if body.len() < 4 {
                return Err(Error::invalid_response("OP_MSG checksum is truncated"));
            }
            body = &body[..body.len() - 4];
        }

        let mut document_payload = None;
        while !body.is_empty() {
            let kind = body[0];
            body = &body[1..];
            match kind {
                0 => {
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    let mut reader = body;
                    let document = Document::from_reader(&mut reader)?;
                    body = reader;
                    document_payload = Some(document);
                }
                1 => {
                    // Document sequences are never sent by servers in replies to commands this
                    // crate issues; skip them.
                    if body.len() < 4 {
                        return Err(Error::invalid_response("OP_MSG section is truncated"));
                    }
                    let size = usize::try_from(read_i32(&body[..4]))
                        .map_err(|_| Error::invalid_response("negative section size"))?;
                    if size > body.len() {
                        return Err(Error::invalid_response("OP_MSG section is truncated"));
                    }
                    body = &body[size..];
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "invalid OP_MSG payload type: {}",
                        other
                    )))
                }
            }
        }

        let document_payload = document_payload.ok_or_else(|| {
            Error::invalid_response("an OP_MSG response must contain a payload type 0 section")
        })?;

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document_payload,
        })
    }

    /// Reads one complete wire message from `reader`.
    pub(crate) fn read_bytes_from<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
        let mut length_bytes = [0u8; 4];
        reader.read_exact(&mut length_bytes)?;
        let length = i32::from_le_bytes(length_bytes);
        if length < Header::LENGTH as i32 || length > DEFAULT_MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::invalid_response(format!(
                "message length {} is out of bounds",
                length
            )));
        }

        let mut buf = vec![0u8; length as usize];
        buf[..4].copy_from_slice(&length_bytes);
        reader.read_exact(&mut buf[4..])?;
        Ok(buf)
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::{Message, MessageFlags};

    #[test]
    fn decode_rejects_wrong_length() {
        let message = Message::from_command(doc! { "ping": 1, "$db": "admin" }, 7);
        let mut bytes = message.encode().unwrap();
        bytes.push(0);
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn decode_strips_checksum() {
        let mut message = Message::reply_to(3, doc! { "ok": 1 });
        message.flags = MessageFlags::CHECKSUM_PRESENT;
        let mut bytes = message.encode().unwrap();
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let length = bytes.len() as i32;
        bytes[..4].copy_from_slice(&length.to_le_bytes());

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.response_to, 3);
        assert_eq!(decoded.document_payload, doc! { "ok": 1 });
    }

    #[test]
    fn read_bytes_from_reads_one_message() {
        let first = Message::from_command(doc! { "hello": 1, "$db": "admin" }, 1)
            .encode()
            .unwrap();
        let second = Message::from_command(doc! { "ping": 1, "$db": "admin" }, 2)
            .encode()
            .unwrap();
        let stream: Vec<u8> = first.iter().chain(second.iter()).copied().collect();
        let mut reader: &[u8] = &stream;

        assert_eq!(Message::read_bytes_from(&mut reader).unwrap(), first);
        assert_eq!(Message::read_bytes_from(&mut reader).unwrap(), second);
    }
}
