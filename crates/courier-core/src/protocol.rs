//! Shared protocol types and stream framing.
//!
//! Messages are structured JSON values distinguished by a reserved key:
//!
//! ```text
//! Command:  { "--courier-command": <u64>, "name": <string>, "args": [..] }
//! Response: { "--courier-response": <u64>, "error": <bool>, "value": <any> }
//! ```
//!
//! Stream endpoints carry one message per frame: a 4-byte big-endian length
//! prefix followed by the UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::ProtocolConfig;
use crate::{CourierError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Outbound request awaiting exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "--courier-command")]
    pub command_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Reply correlated to a command by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "--courier-response")]
    pub response_id: u64,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Response {
    /// Create a success response carrying an already dehydrated value.
    pub fn success(response_id: u64, value: serde_json::Value) -> Self {
        Self {
            response_id,
            error: false,
            value,
        }
    }

    /// Create an error response for `err`.
    pub fn failure(response_id: u64, err: &CourierError) -> Self {
        Self {
            response_id,
            error: true,
            value: err.to_wire_value(),
        }
    }
}

/// Any message understood by the protocol.
///
/// Responses are tried first, so a payload carrying both discriminants is
/// treated as a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Response(Response),
    Command(Command),
}

impl Message {
    /// Classify an inbound payload. Returns `None` for anything that is not
    /// a well-formed command or response.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        if !payload.is_object() {
            return None;
        }
        Message::deserialize(payload).ok()
    }

    /// Encode as a structured payload.
    pub fn into_payload(self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(3);
        match self {
            Message::Command(command) => {
                map.insert(ProtocolConfig::COMMAND_KEY.to_string(), command.command_id.into());
                map.insert("name".to_string(), command.name.into());
                map.insert("args".to_string(), command.args);
            }
            Message::Response(response) => {
                map.insert(ProtocolConfig::RESPONSE_KEY.to_string(), response.response_id.into());
                map.insert("error".to_string(), response.error.into());
                map.insert("value".to_string(), response.value);
            }
        }
        serde_json::Value::Object(map)
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

/// Read one frame.
///
/// Returns `None` when the stream ends cleanly between frames. A stream that
/// ends inside a header or payload is an error, as is a header announcing
/// more than [`ProtocolConfig::MAX_FRAME_SIZE`] bytes.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(truncated(format!(
                "stream ended after {} of 4 header bytes",
                filled
            )));
        }
        filled += read;
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(CourierError::FrameTooLarge {
            size,
            max: ProtocolConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(truncated(format!(
            "stream ended inside a {} byte payload",
            size
        ))),
        Err(e) => Err(e.into()),
    }
}

fn truncated(message: String) -> CourierError {
    CourierError::Io {
        message: format!("Truncated frame: {}", message),
        source: None,
    }
}

/// Write one frame and flush it.
///
/// Header and payload go out in a single write, so a failed write never
/// leaves a header without its payload behind in the writer's buffer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(CourierError::FrameTooLarge {
            size: payload.len(),
            max: ProtocolConfig::MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_payload_shape() {
        let payload = Message::from(Command {
            command_id: 3,
            name: "go".into(),
            args: json!([1, {"--courier-handle": 0}]),
        })
        .into_payload();

        assert_eq!(
            payload,
            json!({"--courier-command": 3, "name": "go", "args": [1, {"--courier-handle": 0}]})
        );
    }

    #[test]
    fn test_payload_keys_match_protocol_config() {
        let command = serde_json::to_value(Command {
            command_id: 0,
            name: String::new(),
            args: json!([]),
        })
        .unwrap();
        assert!(command.get(ProtocolConfig::COMMAND_KEY).is_some());

        let response = serde_json::to_value(Response::success(0, json!(null))).unwrap();
        assert!(response.get(ProtocolConfig::RESPONSE_KEY).is_some());
    }

    #[test]
    fn test_classifies_responses_and_commands() {
        let response = Message::from_payload(&json!({"--courier-response": 1, "error": false, "value": 123}));
        assert_eq!(response, Some(Message::Response(Response::success(1, json!(123)))));

        let command = Message::from_payload(&json!({"--courier-command": 9, "name": "inc", "args": [1]}));
        assert_eq!(
            command,
            Some(Message::Command(Command {
                command_id: 9,
                name: "inc".into(),
                args: json!([1]),
            }))
        );
    }

    #[test]
    fn test_response_takes_precedence() {
        let message = Message::from_payload(&json!({
            "--courier-response": 4,
            "--courier-command": 5,
            "name": "x",
        }));
        assert!(matches!(message, Some(Message::Response(r)) if r.response_id == 4));
    }

    #[test]
    fn test_noise_is_not_classified() {
        assert!(Message::from_payload(&json!("hello")).is_none());
        assert!(Message::from_payload(&json!(null)).is_none());
        assert!(Message::from_payload(&json!({"unrelated": true})).is_none());
        assert!(Message::from_payload(&json!({"--courier-command": "seven", "name": "x"})).is_none());
        assert!(Message::from_payload(&json!({"--courier-response": -1})).is_none());
    }

    #[test]
    fn test_failure_response_carries_message() {
        let response = Response::failure(2, &CourierError::other("💥"));
        assert!(response.error);
        assert_eq!(response.value, json!("💥"));
    }

    async fn frames_of(bytes: Vec<u8>) -> (Vec<Vec<u8>>, Result<()>) {
        let mut cursor = std::io::Cursor::new(bytes);
        let mut frames = Vec::new();
        loop {
            match read_frame(&mut cursor).await {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return (frames, Ok(())),
                Err(e) => return (frames, Err(e)),
            }
        }
    }

    #[tokio::test]
    async fn test_messages_share_a_stream() {
        let mut stream = Vec::new();
        for message in [
            Message::from(Command {
                command_id: 0,
                name: "handshake".into(),
                args: json!([]),
            }),
            Message::from(Response::success(0, json!({"name": "<none>", "methods": []}))),
        ] {
            let bytes = serde_json::to_vec(&message.into_payload()).unwrap();
            write_frame(&mut stream, &bytes).await.unwrap();
        }
        // An empty frame is legal and carries no bytes.
        write_frame(&mut stream, b"").await.unwrap();

        let (frames, end) = frames_of(stream).await;
        assert!(end.is_ok());
        assert_eq!(frames.len(), 3);

        let first: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert!(matches!(Message::from_payload(&first), Some(Message::Command(c)) if c.name == "handshake"));
        let second: serde_json::Value = serde_json::from_slice(&frames[1]).unwrap();
        assert!(matches!(Message::from_payload(&second), Some(Message::Response(r)) if r.response_id == 0));
        assert!(frames[2].is_empty());
    }

    #[tokio::test]
    async fn test_payload_cut_short_is_an_error() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"{\"complete\":true}").await.unwrap();
        stream.extend_from_slice(&10u32.to_be_bytes());
        stream.extend_from_slice(b"{\"cut");

        let (frames, end) = frames_of(stream).await;
        assert_eq!(frames, vec![b"{\"complete\":true}".to_vec()]);
        match end {
            Err(CourierError::Io { message, .. }) => assert!(message.contains("10 byte payload")),
            other => panic!("Expected truncated frame error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_header_cut_short_is_an_error() {
        let (frames, end) = frames_of(vec![0, 0]).await;
        assert!(frames.is_empty());
        assert!(matches!(end, Err(CourierError::Io { ref message, .. }) if message.contains("2 of 4")));
    }

    #[tokio::test]
    async fn test_oversized_frames_are_rejected_both_ways() {
        let announced = (ProtocolConfig::MAX_FRAME_SIZE + 1) as u32;
        let (_, end) = frames_of(announced.to_be_bytes().to_vec()).await;
        assert!(matches!(end, Err(CourierError::FrameTooLarge { size, .. }) if size == announced as usize));

        let mut stream = Vec::new();
        let payload = vec![b' '; ProtocolConfig::MAX_FRAME_SIZE + 1];
        let result = write_frame(&mut stream, &payload).await;
        assert!(matches!(result, Err(CourierError::FrameTooLarge { .. })));
        assert!(stream.is_empty());
    }
}
