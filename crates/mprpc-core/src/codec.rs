//! Wire messages and the MessagePack codec.
//!
//! Every message is a MessagePack array whose first element is the type tag:
//!
//! ```text
//! Request:      [0, id, method, params]
//! Response:     [1, id, error, result]
//! Notification: [3, method, params]
//! ```
//!
//! Frames are self-delimiting, so the [`Decoder`] accepts arbitrary chunks of
//! the byte stream and yields whole messages as they complete.

use crate::config::{NetworkConfig, ProtocolConfig};
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use rmpv::Value as Wire;
use serde_json::{Map, Number, Value};
use tracing::warn;

/// MessagePack marker byte that never starts a valid value.
const RESERVED_MARKER: u8 = 0xc1;

/// Connection-scoped identifier of an outbound call.
pub type CallId = u32;

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: CallId,
        method: String,
        params: Vec<Value>,
    },
    /// `error` is `Null` on success; `result` is `Null` on failure.
    Response {
        id: CallId,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Notification { .. } => "notification",
        }
    }

    fn to_wire(&self) -> Wire {
        match self {
            Message::Request { id, method, params } => Wire::Array(vec![
                Wire::from(ProtocolConfig::REQUEST_TYPE),
                Wire::from(u64::from(*id)),
                Wire::from(method.as_str()),
                Wire::Array(params.iter().map(to_wire).collect()),
            ]),
            Message::Response { id, error, result } => Wire::Array(vec![
                Wire::from(ProtocolConfig::RESPONSE_TYPE),
                Wire::from(u64::from(*id)),
                to_wire(error),
                to_wire(result),
            ]),
            Message::Notification { method, params } => Wire::Array(vec![
                Wire::from(ProtocolConfig::NOTIFICATION_TYPE),
                Wire::from(method.as_str()),
                Wire::Array(params.iter().map(to_wire).collect()),
            ]),
        }
    }
}

/// A classified inbound value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    /// A request frame with a usable id but an unusable method or params.
    /// The caller can still be told about it with an `INVALID_REQUEST` error.
    Malformed { id: CallId, reason: String },
}

/// Encode a message into one self-delimiting frame.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut buf, &message.to_wire())
        .map_err(|e| Error::codec(format!("failed to encode {}: {}", message.kind(), e)))?;
    Ok(Bytes::from(buf))
}

/// Incremental frame decoder.
///
/// Frame boundaries are found by walking MessagePack headers and declared
/// lengths. A partial frame records how many bytes it needs at least, and
/// `drain` does no work until that many have arrived.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    max_buffered: usize,
    needed: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(NetworkConfig::MAX_BUFFERED_BYTES)
    }
}

impl Decoder {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_buffered,
            needed: 0,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode every complete frame currently buffered.
    ///
    /// Unrecognized values are logged and skipped. An error means the stream
    /// can no longer be delimited or a frame is larger than the configured
    /// maximum; the buffer is discarded in that case.
    pub fn drain(&mut self) -> Result<Vec<Decoded>> {
        let mut decoded = Vec::new();

        while !self.buffer.is_empty() && self.buffer.len() >= self.needed {
            match scan_frame(&self.buffer) {
                Scan::Reserved => return Err(self.fail(Error::codec("undecodable stream: reserved marker 0xc1"))),
                Scan::Incomplete(needed) => {
                    if needed > self.max_buffered {
                        return Err(self.fail(Error::BufferOverflow {
                            size: needed,
                            max: self.max_buffered,
                        }));
                    }
                    self.needed = needed;
                    break;
                }
                Scan::Complete(len) => {
                    if len > self.max_buffered {
                        return Err(self.fail(Error::BufferOverflow {
                            size: len,
                            max: self.max_buffered,
                        }));
                    }
                    let value = rmpv::decode::read_value(&mut &self.buffer[..len]);
                    self.buffer.advance(len);
                    self.needed = 0;
                    match value {
                        Ok(value) => match classify(value) {
                            Ok(item) => decoded.push(item),
                            Err(reason) => warn!("Unknown message discarded: {}", reason),
                        },
                        Err(e) => {
                            return Err(self.fail(Error::codec(format!("undecodable stream: {}", e))))
                        }
                    }
                }
            }
        }

        Ok(decoded)
    }

    fn fail(&mut self, err: Error) -> Error {
        self.buffer.clear();
        self.needed = 0;
        err
    }
}

/// Outcome of walking the headers of the frame at the start of a buffer.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// The first frame occupies this many bytes.
    Complete(usize),
    /// The frame needs at least this many bytes in total.
    Incomplete(usize),
    Reserved,
}

/// How a marker is followed in the stream.
enum Step {
    /// Fixed-size body of this many bytes.
    Skip(usize),
    /// This many nested values follow.
    Items(u64),
    /// A big-endian length of `width` bytes, `extra` bytes, then the payload.
    Payload { width: usize, extra: usize },
    /// A big-endian count of `width` bytes, then `per` values per count.
    Count { width: usize, per: u64 },
    Reserved,
}

fn step(marker: u8) -> Step {
    match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Step::Skip(0),
        0x80..=0x8f => Step::Items(2 * u64::from(marker & 0x0f)),
        0x90..=0x9f => Step::Items(u64::from(marker & 0x0f)),
        0xa0..=0xbf => Step::Skip(usize::from(marker & 0x1f)),
        RESERVED_MARKER => Step::Reserved,
        0xc4 | 0xd9 => Step::Payload { width: 1, extra: 0 },
        0xc5 | 0xda => Step::Payload { width: 2, extra: 0 },
        0xc6 | 0xdb => Step::Payload { width: 4, extra: 0 },
        0xc7 => Step::Payload { width: 1, extra: 1 },
        0xc8 => Step::Payload { width: 2, extra: 1 },
        0xc9 => Step::Payload { width: 4, extra: 1 },
        0xcc | 0xd0 => Step::Skip(1),
        0xcd | 0xd1 => Step::Skip(2),
        0xca | 0xce | 0xd2 => Step::Skip(4),
        0xcb | 0xcf | 0xd3 => Step::Skip(8),
        0xd4 => Step::Skip(2),
        0xd5 => Step::Skip(3),
        0xd6 => Step::Skip(5),
        0xd7 => Step::Skip(9),
        0xd8 => Step::Skip(17),
        0xdc => Step::Count { width: 2, per: 1 },
        0xdd => Step::Count { width: 4, per: 1 },
        0xde => Step::Count { width: 2, per: 2 },
        0xdf => Step::Count { width: 4, per: 2 },
    }
}

fn read_len(buf: &[u8], at: usize, width: usize) -> Option<u64> {
    let bytes = buf.get(at..at.checked_add(width)?)?;
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn scan_frame(buf: &[u8]) -> Scan {
    let mut pos = 0usize;
    let mut pending: u64 = 1;

    while pending > 0 {
        let Some(&marker) = buf.get(pos) else {
            // Every outstanding value takes at least one byte
            let rest = usize::try_from(pending).unwrap_or(usize::MAX);
            return Scan::Incomplete(pos.saturating_add(rest));
        };
        pending -= 1;
        pos += 1;

        match step(marker) {
            Step::Skip(n) => pos = pos.saturating_add(n),
            Step::Items(n) => pending = pending.saturating_add(n),
            Step::Payload { width, extra } => {
                let Some(len) = read_len(buf, pos, width) else {
                    return Scan::Incomplete(pos + width);
                };
                let len = usize::try_from(len).unwrap_or(usize::MAX);
                pos = pos.saturating_add(width + extra).saturating_add(len);
            }
            Step::Count { width, per } => {
                let Some(count) = read_len(buf, pos, width) else {
                    return Scan::Incomplete(pos + width);
                };
                pos += width;
                pending = pending.saturating_add(count.saturating_mul(per));
            }
            Step::Reserved => return Scan::Reserved,
        }

        if pos > buf.len() {
            let rest = usize::try_from(pending).unwrap_or(usize::MAX);
            return Scan::Incomplete(pos.saturating_add(rest));
        }
    }

    Scan::Complete(pos)
}

fn classify(value: Wire) -> std::result::Result<Decoded, String> {
    let items = match value {
        Wire::Array(items) => items,
        other => return Err(format!("not an array: {}", other)),
    };
    let tag = items.first().and_then(Wire::as_u64);

    match (items.len(), tag) {
        (4, Some(ProtocolConfig::REQUEST_TYPE)) => {
            let [_, id, method, params] = into_array::<4>(items)?;
            let id = as_call_id(&id).ok_or_else(|| format!("request id {} is not a call id", id))?;
            let Some(method) = as_method(method) else {
                return Ok(Decoded::Malformed {
                    id,
                    reason: "method name is not a string".to_string(),
                });
            };
            let Some(params) = as_params(params) else {
                return Ok(Decoded::Malformed {
                    id,
                    reason: format!("params of {} are not an array", method),
                });
            };
            Ok(Decoded::Message(Message::Request { id, method, params }))
        }
        (4, Some(ProtocolConfig::RESPONSE_TYPE)) => {
            let [_, id, error, result] = into_array::<4>(items)?;
            let id = as_call_id(&id).ok_or_else(|| format!("response id {} is not a call id", id))?;
            Ok(Decoded::Message(Message::Response {
                id,
                error: to_json(error),
                result: to_json(result),
            }))
        }
        (3, Some(ProtocolConfig::NOTIFICATION_TYPE)) => {
            let [_, method, params] = into_array::<3>(items)?;
            let method = as_method(method).ok_or("notification method is not a string")?;
            let params = as_params(params).ok_or("notification params are not an array")?;
            Ok(Decoded::Message(Message::Notification { method, params }))
        }
        (len, tag) => Err(format!("array of length {} with tag {:?}", len, tag)),
    }
}

fn into_array<const N: usize>(items: Vec<Wire>) -> std::result::Result<[Wire; N], String> {
    items
        .try_into()
        .map_err(|items: Vec<Wire>| format!("expected {} elements, got {}", N, items.len()))
}

fn as_call_id(value: &Wire) -> Option<CallId> {
    value.as_u64().and_then(|n| CallId::try_from(n).ok())
}

fn as_method(value: Wire) -> Option<String> {
    match value {
        Wire::String(s) => s.into_str(),
        _ => None,
    }
}

fn as_params(value: Wire) -> Option<Vec<Value>> {
    match value {
        Wire::Array(items) => Some(items.into_iter().map(to_json).collect()),
        Wire::Nil => Some(Vec::new()),
        _ => None,
    }
}

/// Convert a JSON value into the MessagePack value model.
pub fn to_wire(value: &Value) -> Wire {
    match value {
        Value::Null => Wire::Nil,
        Value::Bool(b) => Wire::Boolean(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Wire::from(u)
            } else if let Some(i) = n.as_i64() {
                Wire::from(i)
            } else {
                n.as_f64().map(Wire::F64).unwrap_or(Wire::Nil)
            }
        }
        Value::String(s) => Wire::from(s.as_str()),
        Value::Array(items) => Wire::Array(items.iter().map(to_wire).collect()),
        Value::Object(map) => Wire::Map(
            map.iter()
                .map(|(k, v)| (Wire::from(k.as_str()), to_wire(v)))
                .collect(),
        ),
    }
}

/// Convert a MessagePack value into JSON.
///
/// Binary data becomes an array of byte values, non-string map keys are
/// stringified, non-finite floats become `null` and extension values become
/// `[type, [bytes...]]`.
pub fn to_json(value: Wire) -> Value {
    match value {
        Wire::Nil => Value::Null,
        Wire::Boolean(b) => Value::Bool(b),
        Wire::Integer(i) => {
            if let Some(u) = i.as_u64() {
                Value::from(u)
            } else if let Some(s) = i.as_i64() {
                Value::from(s)
            } else {
                Value::Null
            }
        }
        Wire::F32(f) => float(f64::from(f)),
        Wire::F64(f) => float(f),
        Wire::String(s) => Value::String(utf8_lossy(&s)),
        Wire::Binary(bytes) => bytes_to_json(&bytes),
        Wire::Array(items) => Value::Array(items.into_iter().map(to_json).collect()),
        Wire::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match k {
                    Wire::String(s) => utf8_lossy(&s),
                    other => other.to_string(),
                };
                map.insert(key, to_json(v));
            }
            Value::Object(map)
        }
        Wire::Ext(ty, data) => Value::Array(vec![Value::from(ty), bytes_to_json(&data)]),
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn utf8_lossy(s: &rmpv::Utf8String) -> String {
    match s.as_str() {
        Some(text) => text.to_owned(),
        None => String::from_utf8_lossy(s.as_bytes()).into_owned(),
    }
}

fn bytes_to_json(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}
