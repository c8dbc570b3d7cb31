//! # Wire Codec
//!
//! Encodes [`Message`]s as a sequence of CBOR data items: the variant tag first,
//! then each field in a fixed per-variant order. There is no frame header; the
//! self-describing encoding tells the reader where each field ends.
//!
//! ## Wire Format
//! ```text
//! Hello       = tag(12) id:bstr  count:uint  capability:tstr*
//! Data        = tag(2)  target:bstr  type:tstr  payload:bstr  count:uint  (node:bstr id:int)*
//! NodeDetails = tag(20) count:uint  (id:bstr version:int count:uint (neighbor:bstr latency:int)*)*
//! ```
//! Every repeated field is written as an explicit CBOR count followed by that
//! many items, which keeps the format byte-for-byte compatible with other
//! implementations of the protocol.
//!
//! ## Failure modes
//! - Unknown tag: [`ProtocolError::UnknownMessage`]
//! - Truncated input, wrong CBOR type, out-of-range integer: [`ProtocolError::MalformedMessage`]
//!
//! Neither ever panics; the caller decides to drop the message and close the link.

use crate::config::MAX_MESSAGE_SIZE;
use crate::core::message::{tags, Message, Neighbor, NodeVersion, PathEntry, RoutingEntry};
use crate::core::node_id::NodeId;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use ciborium::value::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Encode a message into a fresh buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_into(message, &mut out)?;
    Ok(out)
}

/// Encode a message onto any writer, one CBOR item per field.
pub fn encode_into<W: io::Write>(message: &Message, out: &mut W) -> Result<()> {
    let mut w = FieldWriter { out };
    w.uint(u64::from(message.tag()))?;

    match message {
        Message::Ping
        | Message::Pong
        | Message::Ok
        | Message::Reject
        | Message::Begin
        | Message::Bye => {}
        Message::Data {
            target,
            message_type,
            payload,
            path,
        } => {
            w.node_id(target)?;
            w.text(message_type)?;
            w.bytes(payload)?;
            w.count(path.len())?;
            for entry in path {
                w.node_id(&entry.node)?;
                w.int(entry.id)?;
            }
        }
        Message::DataAck { id } | Message::DataReject { id } => w.int(*id)?,
        Message::Hello { id, capabilities } | Message::Select { id, capabilities } => {
            w.node_id(id)?;
            w.strings(capabilities)?;
        }
        Message::Auth { method, data } => {
            w.text(method)?;
            w.bytes(data)?;
        }
        Message::AuthData { data } => w.bytes(data)?,
        Message::NodeSummary { own_version, nodes } => {
            w.int(*own_version)?;
            w.count(nodes.len())?;
            for node in nodes {
                w.node_id(&node.id)?;
                w.int(node.version)?;
            }
        }
        Message::NodeRequest { nodes } => {
            w.count(nodes.len())?;
            for id in nodes {
                w.node_id(id)?;
            }
        }
        Message::NodeDetails { nodes } => {
            w.count(nodes.len())?;
            for entry in nodes {
                w.node_id(&entry.id)?;
                w.int(entry.version)?;
                w.count(entry.neighbors.len())?;
                for neighbor in &entry.neighbors {
                    w.node_id(&neighbor.id)?;
                    w.int(neighbor.latency)?;
                }
            }
        }
    }

    Ok(())
}

/// Decode exactly one message from `bytes`.
///
/// Trailing bytes after the message are reported as malformed.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let mut input = bytes;
    let message = decode_from(&mut input)?;
    if !input.is_empty() {
        return Err(ProtocolError::MalformedMessage(format!(
            "{} trailing bytes after {}",
            input.len(),
            message.name()
        )));
    }
    Ok(message)
}

/// Decode the next message from the front of `input`, advancing it past the
/// bytes consumed.
pub fn decode_from(input: &mut &[u8]) -> Result<Message> {
    read_message(input).map_err(ReadError::into_protocol_error)
}

/// Reasons a read can stop short. `Incomplete` is separate so the streaming
/// decoder can wait for more bytes instead of failing.
#[derive(Debug)]
enum ReadError {
    Incomplete,
    Malformed(String),
    Unknown(i64),
}

impl ReadError {
    fn into_protocol_error(self) -> ProtocolError {
        match self {
            ReadError::Incomplete => {
                ProtocolError::MalformedMessage(constants::ERR_TRUNCATED.to_string())
            }
            ReadError::Malformed(reason) => ProtocolError::MalformedMessage(reason),
            ReadError::Unknown(tag) => ProtocolError::UnknownMessage(tag),
        }
    }
}

type ReadResult<T> = std::result::Result<T, ReadError>;

fn read_message(input: &mut &[u8]) -> ReadResult<Message> {
    let mut r = FieldReader { input };
    let tag = r.int("tag")?;
    let tag = match u8::try_from(tag) {
        Ok(tag) => tag,
        Err(_) => return Err(ReadError::Unknown(tag)),
    };

    let message = match tag {
        tags::PING => Message::Ping,
        tags::PONG => Message::Pong,
        tags::OK => Message::Ok,
        tags::REJECT => Message::Reject,
        tags::BEGIN => Message::Begin,
        tags::BYE => Message::Bye,
        tags::DATA => {
            let target = r.node_id("target")?;
            let message_type = r.text("type")?;
            let payload = r.bytes("payload")?;
            let count = r.count("path")?;
            let mut path = Vec::with_capacity(r.capacity_for(count));
            for _ in 0..count {
                let node = r.node_id("path node")?;
                let id = r.int32("path id")?;
                path.push(PathEntry { node, id });
            }
            Message::Data {
                target,
                message_type,
                payload,
                path,
            }
        }
        tags::DATA_ACK => Message::DataAck {
            id: r.int32("id")?,
        },
        tags::DATA_REJECT => Message::DataReject {
            id: r.int32("id")?,
        },
        tags::HELLO => Message::Hello {
            id: r.node_id("id")?,
            capabilities: r.strings("capabilities")?,
        },
        tags::SELECT => Message::Select {
            id: r.node_id("id")?,
            capabilities: r.strings("capabilities")?,
        },
        tags::AUTH => Message::Auth {
            method: r.text("method")?,
            data: r.bytes("data")?,
        },
        tags::AUTH_DATA => Message::AuthData {
            data: r.bytes("data")?,
        },
        tags::NODE_SUMMARY => {
            let own_version = r.int32("own version")?;
            let count = r.count("nodes")?;
            let mut nodes = Vec::with_capacity(r.capacity_for(count));
            for _ in 0..count {
                let id = r.node_id("node id")?;
                let version = r.int32("node version")?;
                nodes.push(NodeVersion { id, version });
            }
            Message::NodeSummary { own_version, nodes }
        }
        tags::NODE_REQUEST => {
            let count = r.count("nodes")?;
            let mut nodes = Vec::with_capacity(r.capacity_for(count));
            for _ in 0..count {
                nodes.push(r.node_id("node id")?);
            }
            Message::NodeRequest { nodes }
        }
        tags::NODE_DETAILS => {
            let count = r.count("nodes")?;
            let mut nodes = Vec::with_capacity(r.capacity_for(count));
            for _ in 0..count {
                let id = r.node_id("node id")?;
                let version = r.int32("node version")?;
                let neighbor_count = r.count("neighbors")?;
                let mut neighbors = Vec::with_capacity(r.capacity_for(neighbor_count));
                for _ in 0..neighbor_count {
                    let id = r.node_id("neighbor id")?;
                    let latency = r.int32("latency")?;
                    neighbors.push(Neighbor { id, latency });
                }
                nodes.push(RoutingEntry {
                    id,
                    version,
                    neighbors,
                });
            }
            Message::NodeDetails { nodes }
        }
        other => return Err(ReadError::Unknown(i64::from(other))),
    };

    Ok(message)
}

struct FieldWriter<'a, W> {
    out: &'a mut W,
}

impl<W: io::Write> FieldWriter<'_, W> {
    fn value(&mut self, value: &Value) -> Result<()> {
        ciborium::ser::into_writer(value, &mut *self.out).map_err(|e| match e {
            ciborium::ser::Error::Io(io) => ProtocolError::Io(io),
            ciborium::ser::Error::Value(reason) => ProtocolError::MalformedMessage(reason),
        })
    }

    fn uint(&mut self, v: u64) -> Result<()> {
        self.value(&Value::Integer(v.into()))
    }

    fn int(&mut self, v: i32) -> Result<()> {
        self.value(&Value::Integer(v.into()))
    }

    fn count(&mut self, len: usize) -> Result<()> {
        self.uint(len as u64)
    }

    fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.value(&Value::Bytes(v.to_vec()))
    }

    fn node_id(&mut self, id: &NodeId) -> Result<()> {
        self.bytes(id.as_bytes())
    }

    fn text(&mut self, v: &str) -> Result<()> {
        self.value(&Value::Text(v.to_owned()))
    }

    fn strings(&mut self, values: &[String]) -> Result<()> {
        self.count(values.len())?;
        for v in values {
            self.text(v)?;
        }
        Ok(())
    }
}

struct FieldReader<'a, 'b> {
    input: &'a mut &'b [u8],
}

impl FieldReader<'_, '_> {
    fn value(&mut self, field: &'static str) -> ReadResult<Value> {
        match ciborium::de::from_reader::<Value, _>(&mut *self.input) {
            Ok(value) => Ok(value),
            Err(ciborium::de::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ReadError::Incomplete)
            }
            Err(e) => Err(ReadError::Malformed(format!("{field}: {e}"))),
        }
    }

    fn int(&mut self, field: &'static str) -> ReadResult<i64> {
        match self.value(field)? {
            Value::Integer(v) => i64::try_from(i128::from(v))
                .map_err(|_| ReadError::Malformed(format!("{field}: integer out of range"))),
            other => Err(unexpected(field, "integer", &other)),
        }
    }

    fn int32(&mut self, field: &'static str) -> ReadResult<i32> {
        let v = self.int(field)?;
        i32::try_from(v).map_err(|_| ReadError::Malformed(format!("{field}: {v} exceeds int32")))
    }

    fn count(&mut self, field: &'static str) -> ReadResult<usize> {
        let v = self.int(field)?;
        usize::try_from(v).map_err(|_| ReadError::Malformed(format!("{field}: negative count {v}")))
    }

    /// Preallocation bound for `count` items: each item takes at least one
    /// byte, so never reserve more than the input could still hold.
    fn capacity_for(&self, count: usize) -> usize {
        count.min(self.input.len())
    }

    fn bytes(&mut self, field: &'static str) -> ReadResult<Vec<u8>> {
        match self.value(field)? {
            Value::Bytes(v) => Ok(v),
            Value::Null => Ok(Vec::new()),
            other => Err(unexpected(field, "byte string", &other)),
        }
    }

    fn node_id(&mut self, field: &'static str) -> ReadResult<NodeId> {
        self.bytes(field).map(NodeId::from)
    }

    fn text(&mut self, field: &'static str) -> ReadResult<String> {
        match self.value(field)? {
            Value::Text(v) => Ok(v),
            other => Err(unexpected(field, "text string", &other)),
        }
    }

    fn strings(&mut self, field: &'static str) -> ReadResult<Vec<String>> {
        let count = self.count(field)?;
        let mut values = Vec::with_capacity(self.capacity_for(count));
        for _ in 0..count {
            values.push(self.text(field)?);
        }
        Ok(values)
    }
}

fn unexpected(field: &'static str, expected: &str, found: &Value) -> ReadError {
    let kind = match found {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "byte string",
        Value::Float(_) => "float",
        Value::Text(_) => "text string",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tag(..) => "tag",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        _ => "unknown item",
    };
    ReadError::Malformed(format!("{field}: expected {expected}, found {kind}"))
}

/// Streaming codec for use with `tokio_util::codec::Framed`.
///
/// Messages are self-delimiting, so decoding simply retries once more bytes
/// have arrived. A partial message that grows past `max_message_size` is
/// rejected instead of buffered forever.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_message_size: usize,
}

impl WireCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut input: &[u8] = &src[..];
        match read_message(&mut input) {
            Ok(message) => {
                let consumed = src.len() - input.len();
                if consumed > self.max_message_size {
                    return Err(ProtocolError::OversizedMessage(consumed));
                }
                src.advance(consumed);
                trace!(tag = message.tag(), bytes = consumed, "Decoded message");
                Ok(Some(message))
            }
            Err(ReadError::Incomplete) => {
                if src.len() > self.max_message_size {
                    return Err(ProtocolError::OversizedMessage(src.len()));
                }
                Ok(None)
            }
            Err(other) => Err(other.into_protocol_error()),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        {
            let mut writer = BufMut::writer(&mut *dst);
            encode_into(&item, &mut writer)?;
        }
        let written = dst.len() - start;
        if written > self.max_message_size {
            dst.truncate(start);
            return Err(ProtocolError::OversizedMessage(written));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_is_single_byte() {
        assert_eq!(encode(&Message::Ping).unwrap(), vec![0x00]);
        assert_eq!(encode(&Message::Bye).unwrap(), vec![0x11]);
    }

    #[test]
    fn test_hello_wire_bytes() {
        let hello = Message::Hello {
            id: NodeId::from("test"),
            capabilities: vec!["a".into(), "b".into()],
        };
        // tag 12, bstr(4) "test", count 2, tstr "a", tstr "b"
        let expected = vec![
            0x0c, 0x44, b't', b'e', b's', b't', 0x02, 0x61, b'a', 0x61, b'b',
        ];
        assert_eq!(encode(&hello).unwrap(), expected);
        assert_eq!(decode(&expected).unwrap(), hello);
    }

    #[test]
    fn test_negative_int32_roundtrip() {
        let msg = Message::DataReject { id: -5 };
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes, vec![0x04, 0x24]);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            decode(&[0x05]),
            Err(ProtocolError::UnknownMessage(5))
        ));
        // -1 as a tag
        assert!(matches!(
            decode(&[0x20]),
            Err(ProtocolError::UnknownMessage(-1))
        ));
    }

    #[test]
    fn test_truncated_is_malformed() {
        let bytes = encode(&Message::Auth {
            method: "token".into(),
            data: vec![1, 2, 3],
        })
        .unwrap();
        for cut in 0..bytes.len() {
            assert!(matches!(
                decode(&bytes[..cut]),
                Err(ProtocolError::MalformedMessage(_))
            ));
        }
    }

    #[test]
    fn test_wrong_field_type_is_malformed() {
        // DataAck whose id is a text string
        let bytes = vec![0x03, 0x61, b'x'];
        match decode(&bytes) {
            Err(ProtocolError::MalformedMessage(reason)) => {
                assert!(reason.contains("expected integer"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_int32_overflow_is_malformed() {
        // DataAck id = 2^32 (uint64 follows)
        let bytes = vec![0x03, 0x1b, 0, 0, 0, 1, 0, 0, 0, 0];
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_null_bytes_decode_as_empty() {
        // AuthData with a null payload
        let bytes = vec![0x0f, 0xf6];
        assert_eq!(
            decode(&bytes).unwrap(),
            Message::AuthData { data: Vec::new() }
        );
    }

    #[test]
    fn test_huge_count_does_not_preallocate() {
        // NodeRequest claiming u32::MAX ids with no bytes behind it
        let bytes = vec![0x13, 0x1a, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(matches!(
            decode(&[0x00, 0x00]),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_from_stream_in_order() {
        let mut bytes = encode(&Message::Ping).unwrap();
        bytes.extend(encode(&Message::DataAck { id: 7 }).unwrap());
        let mut input = &bytes[..];
        assert_eq!(decode_from(&mut input).unwrap(), Message::Ping);
        assert_eq!(decode_from(&mut input).unwrap(), Message::DataAck { id: 7 });
        assert!(input.is_empty());
    }

    #[test]
    fn test_codec_waits_for_more_bytes() {
        let full = encode(&Message::AuthData {
            data: vec![9; 300],
        })
        .unwrap();
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&full[10..]);
        buf.extend_from_slice(&encode(&Message::Pong).unwrap());
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::AuthData { .. })
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Pong));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_partial() {
        let mut codec = WireCodec::new(64);
        // AuthData announcing 1000 bytes, only 100 present
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x0f, 0x59, 0x03, 0xe8]);
        buf.extend_from_slice(&[0u8; 100]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedMessage(_))
        ));
    }

    #[test]
    fn test_codec_encoder_enforces_limit() {
        let mut codec = WireCodec::new(16);
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Message::AuthData {
                data: vec![0; 64],
            },
            &mut buf,
        );
        assert!(matches!(result, Err(ProtocolError::OversizedMessage(_))));
        assert!(buf.is_empty());
    }
}
