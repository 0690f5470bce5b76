//! The control channel: length-prefixed JSON frames between the controller
//! and this worker.
//!
//! Requests come in, responses and notifications go out. The framing is a
//! 4 byte little-endian length followed by one JSON document.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use serde_json::{json, Value};

use crate::WorkerError;

/// Hard cap on a single channel message.
const MESSAGE_MAX_SIZE: usize = 65_536;

/// A request from the controller.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u32,
    pub method: String,
    /// Routing ids (roomId, peerId, ...), assigned by the controller.
    pub internal: Value,
    /// Method payload.
    pub data: Value,
}

impl Request {
    pub fn parse(bytes: &[u8]) -> Result<Request, WorkerError> {
        let json: Value = serde_json::from_slice(bytes)
            .map_err(|e| WorkerError::protocol(format!("invalid JSON request: {}", e)))?;

        let id = json
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| WorkerError::protocol("Request has no numeric .id field"))?
            as u32;

        let method = json
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::protocol("Request has no string .method field"))?
            .to_string();

        let internal = json.get("internal").cloned().unwrap_or(Value::Null);
        let data = json.get("data").cloned().unwrap_or(Value::Null);

        Ok(Request {
            id,
            method,
            internal,
            data,
        })
    }

    /// A numeric id field, looked up in `internal` first, then in `data`.
    pub fn uint_field(&self, name: &str) -> Result<u32, WorkerError> {
        let value = self
            .internal
            .get(name)
            .or_else(|| self.data.get(name))
            .and_then(Value::as_u64);

        match value {
            Some(v) => Ok(v as u32),
            None => Err(WorkerError::protocol(format!(
                "Request has no numeric .{} field",
                name
            ))),
        }
    }

    pub fn str_field(&self, name: &str) -> Result<&str, WorkerError> {
        self.internal
            .get(name)
            .or_else(|| self.data.get(name))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WorkerError::protocol(format!("Request has no string .{} field", name))
            })
    }
}

/// The worker's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u32,
    pub accepted: bool,
    pub data: Option<Value>,
    pub reason: Option<String>,
}

impl Response {
    pub fn accept(id: u32, data: Option<Value>) -> Response {
        Response {
            id,
            accepted: true,
            data,
            reason: None,
        }
    }

    pub fn reject(id: u32, reason: impl Into<String>) -> Response {
        Response {
            id,
            accepted: false,
            data: None,
            reason: Some(reason.into()),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut json = json!({ "id": self.id });

        if self.accepted {
            json["accepted"] = Value::Bool(true);
            if let Some(data) = &self.data {
                json["data"] = data.clone();
            }
        } else {
            json["rejected"] = Value::Bool(true);
            if let Some(reason) = &self.reason {
                json["reason"] = Value::String(reason.clone());
            }
        }

        json
    }
}

/// An event pushed to the controller, outside any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub target_id: u32,
    pub event: String,
    pub data: Value,
}

impl Notification {
    pub fn to_json(&self) -> Value {
        let mut json = json!({
            "targetId": self.target_id,
            "event": self.event,
        });

        if !self.data.is_null() {
            json["data"] = self.data.clone();
        }

        json
    }
}

/// Collects notifications for the embedder to frame and write out.
#[derive(Debug, Default)]
pub struct Notifier {
    queue: VecDeque<Notification>,
}

impl Notifier {
    pub fn new() -> Notifier {
        Notifier::default()
    }

    pub fn emit(&mut self, target_id: u32, event: &str) {
        self.emit_with_data(target_id, event, Value::Null);
    }

    pub fn emit_with_data(&mut self, target_id: u32, event: &str, data: Value) {
        trace!("emit [targetId:{}, event:{}]", target_id, event);

        self.queue.push_back(Notification {
            target_id,
            event: event.to_string(),
            data,
        });
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.queue.pop_front()
    }
}

/// Writes one length-prefixed frame.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = (payload.len() as u32).to_le_bytes();
    writer.write_all(&len)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one length-prefixed frame. `Ok(None)` is a clean end of stream.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];

    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MESSAGE_MAX_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("channel frame too large: {}", len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    Ok(Some(payload))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_request_and_fields() {
        let raw = serde_json::to_vec(&json!({
            "id": 7,
            "method": "room.createPeer",
            "internal": { "roomId": 1, "peerId": 2 },
            "data": { "peerName": "alice" }
        }))
        .unwrap();

        let request = Request::parse(&raw).unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.method, "room.createPeer");
        assert_eq!(request.uint_field("roomId").unwrap(), 1);
        assert_eq!(request.uint_field("peerId").unwrap(), 2);
        assert_eq!(request.str_field("peerName").unwrap(), "alice");
        assert!(request.uint_field("transportId").is_err());
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(Request::parse(b"{}").is_err());
        assert!(Request::parse(b"not json").is_err());
        assert!(Request::parse(br#"{"id": 1}"#).is_err());
    }

    #[test]
    fn response_json_shapes() {
        let accept = Response::accept(3, Some(json!({"x": 1}))).to_json();
        assert_eq!(accept["accepted"], true);
        assert_eq!(accept["data"]["x"], 1);

        let reject = Response::reject(4, "nope").to_json();
        assert_eq!(reject["rejected"], true);
        assert_eq!(reject["reason"], "nope");
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();

        let mut reader = &buf[..];
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"");
        assert!(read_frame(&mut reader).unwrap().is_none());
    }
}
