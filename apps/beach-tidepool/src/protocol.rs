//! Terminal WebSocket wire format. Frames are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A frame received from a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Input(String),
    /// Raw values; bounds are enforced by the resize coordinator.
    Resize { cols: i64, rows: i64 },
    Ping,
    /// A well-formed frame of a type we do not handle.
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame must be an object with a string `type`")]
    MissingType,
    #[error("invalid {kind} frame: {reason}")]
    Invalid { kind: &'static str, reason: &'static str },
}

pub fn parse_inbound(text: &str) -> Result<Inbound, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;
    match kind {
        "input" => value
            .get("data")
            .and_then(Value::as_str)
            .map(|data| Inbound::Input(data.to_owned()))
            .ok_or(FrameError::Invalid {
                kind: "input",
                reason: "`data` must be a string",
            }),
        "resize" => {
            let dimension = |name: &str| value.get(name).and_then(Value::as_i64);
            match (dimension("cols"), dimension("rows")) {
                (Some(cols), Some(rows)) => Ok(Inbound::Resize { cols, rows }),
                _ => Err(FrameError::Invalid {
                    kind: "resize",
                    reason: "`cols` and `rows` must be integers",
                }),
            }
        }
        "ping" => Ok(Inbound::Ping),
        other => Ok(Inbound::Unknown(other.to_owned())),
    }
}

/// A frame sent to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        shell: String,
        cwd: String,
    },
    Scrollback {
        data: String,
    },
    Data {
        data: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"error","message":"encode failed"}"#))
    }
}

/// Why the server closed a terminal socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    EndOfSession,
    /// The viewer could not keep up with output and was dropped.
    Lagging,
    AuthRequired,
    Disabled,
    SessionNotFound,
    SessionIdRequired,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::EndOfSession => 1000,
            CloseReason::Lagging => 1013,
            CloseReason::AuthRequired => 4002,
            CloseReason::Disabled => 4003,
            CloseReason::SessionNotFound => 4004,
            CloseReason::SessionIdRequired => 4005,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::EndOfSession => "Session ended",
            CloseReason::Lagging => "Connection fell behind",
            CloseReason::AuthRequired => "Authentication required",
            CloseReason::Disabled => "Terminal access is disabled",
            CloseReason::SessionNotFound => "Session not found",
            CloseReason::SessionIdRequired => "Session ID required",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn parses_known_frames() {
        assert_eq!(
            parse_inbound(r#"{"type":"input","data":"ls\r"}"#).unwrap(),
            Inbound::Input("ls\r".into())
        );
        assert_eq!(
            parse_inbound(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap(),
            Inbound::Resize { cols: 120, rows: 40 }
        );
        assert_eq!(parse_inbound(r#"{"type":"ping"}"#).unwrap(), Inbound::Ping);
    }

    #[test_timeout::timeout]
    fn out_of_range_resize_still_parses() {
        assert_eq!(
            parse_inbound(r#"{"type":"resize","cols":0,"rows":-3}"#).unwrap(),
            Inbound::Resize { cols: 0, rows: -3 }
        );
    }

    #[test_timeout::timeout]
    fn unknown_types_are_not_errors() {
        assert_eq!(
            parse_inbound(r#"{"type":"telemetry","x":1}"#).unwrap(),
            Inbound::Unknown("telemetry".into())
        );
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_rejected() {
        assert!(matches!(parse_inbound("not json"), Err(FrameError::Json(_))));
        assert!(matches!(parse_inbound(r#"[1,2]"#), Err(FrameError::MissingType)));
        assert!(matches!(parse_inbound(r#"{"data":"x"}"#), Err(FrameError::MissingType)));
        assert!(matches!(
            parse_inbound(r#"{"type":"input","data":42}"#),
            Err(FrameError::Invalid { kind: "input", .. })
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":"resize","cols":"80","rows":24}"#),
            Err(FrameError::Invalid { kind: "resize", .. })
        ));
    }

    #[test_timeout::timeout]
    fn outbound_frames_use_camel_case_fields() {
        let connected = ServerFrame::Connected {
            session_id: "abc".into(),
            shell: "/bin/bash".into(),
            cwd: "/home/dev".into(),
        };
        assert_eq!(
            serde_json::to_value(&connected).unwrap(),
            json!({"type": "connected", "sessionId": "abc", "shell": "/bin/bash", "cwd": "/home/dev"})
        );
        assert_eq!(
            serde_json::to_value(ServerFrame::Exit { exit_code: 130 }).unwrap(),
            json!({"type": "exit", "exitCode": 130})
        );
        assert_eq!(ServerFrame::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test_timeout::timeout]
    fn close_codes_are_distinct() {
        let reasons = [
            CloseReason::EndOfSession,
            CloseReason::Lagging,
            CloseReason::AuthRequired,
            CloseReason::Disabled,
            CloseReason::SessionNotFound,
            CloseReason::SessionIdRequired,
        ];
        let mut codes: Vec<u16> = reasons.iter().map(|reason| reason.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
    }
}
