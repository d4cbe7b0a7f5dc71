use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}
fn default_cols() -> u16 {
    DEFAULT_COLS
}
fn default_rows() -> u16 {
    DEFAULT_ROWS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    /// Caller-chosen session id. Generated when absent.
    pub id: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    pub args: Vec<String>,
    /// Working directory; `$HOME` when absent.
    pub cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    pub env: HashMap<String, String>,
    pub name: Option<String>,
    pub client_id: Option<String>,
    /// Free-form client metadata, e.g. `{"location": "editor", "managed": true}`.
    pub metadata: Option<serde_json::Value>,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            id: None,
            shell: default_shell(),
            args: Vec::new(),
            cwd: None,
            cols: default_cols(),
            rows: default_rows(),
            env: HashMap::new(),
            name: None,
            client_id: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub name: Option<String>,
    pub index: Option<usize>,
    /// Merged into the existing object; `null` values remove keys.
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Signal number, e.g. 10 for SIGUSR1.
    pub signum: i32,
    /// Only signal this session. Every live session otherwise.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureQuery {
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub viewport: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub index: usize,
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: f64,
    pub alive: bool,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "state_sync")]
    StateSync { terminals: Vec<SessionInfo> },

    #[serde(rename = "pty_created")]
    PtyCreated {
        terminal: SessionInfo,
        creator_client_id: Option<String>,
    },

    #[serde(rename = "pty_updated")]
    PtyUpdated {
        terminal: SessionInfo,
        changes: HashMap<String, serde_json::Value>,
    },

    #[serde(rename = "pty_exited")]
    PtyExited {
        pty_id: String,
        exit_code: Option<i32>,
    },

    #[serde(rename = "pty_deleted")]
    PtyDeleted { pty_id: String },

    /// Sent on a terminal socket once the process output is exhausted.
    #[serde(rename = "exit")]
    Exit { exit_code: Option<i32> },

    #[serde(rename = "error")]
    Error { error: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "get_state")]
    GetState,

    #[serde(rename = "create_pty")]
    CreatePty(CreateSessionRequest),

    #[serde(rename = "rename_pty")]
    RenamePty { pty_id: String, name: String },

    #[serde(rename = "reorder_pty")]
    ReorderPty { pty_id: String, index: usize },

    #[serde(rename = "delete_pty")]
    DeletePty { pty_id: String },
}

/// Terminal socket control frame. Anything else on a text frame is raw input.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalControl {
    Resize { cols: u16, rows: u16 },
    Input { data: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_fills_defaults() {
        let request: CreateSessionRequest =
            serde_json::from_str(r#"{"shell": "/bin/sh", "args": ["-l"]}"#).unwrap();
        assert_eq!(request.shell, "/bin/sh");
        assert_eq!(request.args, vec!["-l".to_string()]);
        assert_eq!((request.cols, request.rows), (80, 24));
        assert!(request.id.is_none());
        assert!(request.env.is_empty());
    }

    #[test]
    fn client_messages_parse_by_type() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "create_pty", "shell": "/bin/sh", "cols": 100}"#)
                .unwrap();
        match msg {
            ClientMessage::CreatePty(request) => {
                assert_eq!(request.shell, "/bin/sh");
                assert_eq!(request.cols, 100);
                assert_eq!(request.rows, 24);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "reorder_pty", "pty_id": "a", "index": 2}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ReorderPty { index: 2, .. }));
    }

    #[test]
    fn events_are_tagged() {
        let json = serde_json::to_value(ServerEvent::PtyExited {
            pty_id: "abc".into(),
            exit_code: Some(3),
        })
        .unwrap();
        assert_eq!(json["type"], "pty_exited");
        assert_eq!(json["exit_code"], 3);
    }

    #[test]
    fn terminal_control_frames() {
        let ctrl: TerminalControl =
            serde_json::from_str(r#"{"type": "resize", "cols": 120, "rows": 40}"#).unwrap();
        assert!(matches!(ctrl, TerminalControl::Resize { cols: 120, rows: 40 }));
        assert!(serde_json::from_str::<TerminalControl>(r#"{"type": "bogus"}"#).is_err());
    }
}
