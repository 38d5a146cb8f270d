//! Wire types for the remote HTTP + SSE interface.
//!
//! Shared by `linger-server` (which produces them) and `linger-client`
//! (which consumes them). Output blobs travel as base64 strings.

use crate::error::{LingerError, LingerResult};
use crate::session::SpawnMode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// `POST /session/{sid}/pty`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatePtyRequest {
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SpawnMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePtyResponse {
    #[serde(rename = "ptyID")]
    pub pty_id: String,
    pub pid: u32,
    pub log_file_path: PathBuf,
}

/// `POST .../input`. Text is delivered as UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// `GET .../snapshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Base64 escape-sequence blob.
    pub data: String,
    pub cols: u16,
    pub rows: u16,
}

/// Query of `GET .../stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl From<&LingerError> for ErrorResponse {
    fn from(e: &LingerError) -> Self {
        Self {
            error: e.to_string(),
            code: e.code().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Live sessions hosted by the server.
    pub sessions: usize,
}

#[derive(Serialize, Deserialize)]
struct BlobPayload {
    data: String,
}

#[derive(Serialize, Deserialize)]
struct ExitPayload {
    code: i32,
}

/// One event on a session's SSE stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Replay sent once at the start of a stream.
    Snapshot(Vec<u8>),
    /// A live output chunk.
    Data(Vec<u8>),
    /// The process is gone; always the last event.
    Exit(i32),
}

impl StreamEvent {
    /// SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Snapshot(_) => "snapshot",
            StreamEvent::Data(_) => "data",
            StreamEvent::Exit(_) => "exit",
        }
    }

    /// SSE `data:` field (single-line JSON).
    pub fn payload(&self) -> String {
        let value = match self {
            StreamEvent::Snapshot(bytes) | StreamEvent::Data(bytes) => {
                serde_json::to_string(&BlobPayload {
                    data: encode_blob(bytes),
                })
            }
            StreamEvent::Exit(code) => serde_json::to_string(&ExitPayload { code: *code }),
        };
        value.unwrap_or_default()
    }

    /// Decode an SSE event. Unknown event names yield `Ok(None)`.
    pub fn parse(event: &str, data: &str) -> LingerResult<Option<Self>> {
        let parsed = match event {
            "snapshot" | "data" => {
                let payload: BlobPayload = serde_json::from_str(data)
                    .map_err(|e| LingerError::Transport(format!("bad {event} event: {e}")))?;
                let bytes = decode_blob(&payload.data)?;
                if event == "snapshot" {
                    StreamEvent::Snapshot(bytes)
                } else {
                    StreamEvent::Data(bytes)
                }
            }
            "exit" => {
                let payload: ExitPayload = serde_json::from_str(data)
                    .map_err(|e| LingerError::Transport(format!("bad exit event: {e}")))?;
                StreamEvent::Exit(payload.code)
            }
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

pub fn encode_blob(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_blob(s: &str) -> LingerResult<Vec<u8>> {
    STANDARD
        .decode(s.trim())
        .map_err(|e| LingerError::InvalidRequest(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_response_uses_pty_id() {
        let resp = CreatePtyResponse {
            pty_id: "ab12".into(),
            pid: 7,
            log_file_path: PathBuf::from("/s/logs/a.ab12.log"),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["ptyID"], "ab12");
        assert_eq!(json["logFilePath"], "/s/logs/a.ab12.log");
    }

    #[test]
    fn create_request_optional_fields() {
        let req: CreatePtyRequest = serde_json::from_str(r#"{"cmd":["sh"],"mode":"pipes"}"#).unwrap();
        assert_eq!(req.cmd, vec!["sh"]);
        assert_eq!(req.mode, Some(SpawnMode::Pipes));
        assert!(req.cwd.is_none() && req.cols.is_none());
    }

    #[test]
    fn stream_events_survive_the_wire() {
        let data = StreamEvent::Data(b"\x1b[31mhi\r\n".to_vec());
        assert_eq!(data.name(), "data");
        assert_eq!(
            StreamEvent::parse(data.name(), &data.payload()).unwrap(),
            Some(data)
        );

        let exit = StreamEvent::Exit(130);
        assert_eq!(exit.payload(), r#"{"code":130}"#);
        assert_eq!(
            StreamEvent::parse("exit", &exit.payload()).unwrap(),
            Some(StreamEvent::Exit(130))
        );
    }

    #[test]
    fn unknown_and_malformed_events() {
        assert_eq!(StreamEvent::parse("ping", "{}").unwrap(), None);
        assert!(StreamEvent::parse("data", "not json").is_err());
        assert!(StreamEvent::parse("data", r#"{"data":"%%%"}"#).is_err());
    }

    #[test]
    fn error_response_carries_code() {
        let resp = ErrorResponse::from(&LingerError::NotFound("x".into()));
        assert_eq!(resp.code, "not_found");
        assert_eq!(resp.error, "session not found: x");
    }
}
