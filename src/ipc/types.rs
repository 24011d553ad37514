//! Reload protocol messages.
//!
//! One request line, one reply line, newline-delimited JSON.

use serde::{Deserialize, Serialize};

/// Plain-text request older editors send instead of JSON.
pub const LEGACY_RELOAD: &str = "RELOAD";

/// Request sent from a writer to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ReloadRequest {
    /// Reload the configuration. `token` is the file's modification time in
    /// nanoseconds as the writer saw it; 0 means unknown.
    Reload {
        #[serde(default)]
        token: u64,
    },
}

impl ReloadRequest {
    pub fn reload(token: u64) -> Self {
        ReloadRequest::Reload { token }
    }

    pub fn token(&self) -> u64 {
        match self {
            ReloadRequest::Reload { token } => *token,
        }
    }

    /// Parse one request line, accepting the legacy plain-text form.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let line = line.trim();
        if line == LEGACY_RELOAD {
            return Ok(ReloadRequest::Reload { token: 0 });
        }
        serde_json::from_str(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// A completed reload covers the request.
    Ack,
    /// The daemon is shutting down and will not reload.
    Busy,
    /// The request was malformed or the reload failed.
    Error,
}

/// Reply from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReply {
    pub ok: bool,
    pub status: ReplyStatus,
    /// Token of the reload that answered the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReloadReply {
    pub fn ack(token: u64) -> Self {
        Self {
            ok: true,
            status: ReplyStatus::Ack,
            token: Some(token),
            error: None,
        }
    }

    pub fn busy() -> Self {
        Self {
            ok: false,
            status: ReplyStatus::Busy,
            token: None,
            error: Some("daemon is shutting down".to_string()),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: ReplyStatus::Error,
            token: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&ReloadRequest::reload(42)).unwrap();
        assert_eq!(json, r#"{"cmd":"reload","token":42}"#);
    }

    #[test]
    fn test_request_token_defaults_to_zero() {
        let req = ReloadRequest::parse(r#"{"cmd":"reload"}"#).unwrap();
        assert_eq!(req.token(), 0);
    }

    #[test]
    fn test_legacy_request() {
        assert_eq!(
            ReloadRequest::parse("RELOAD\n").unwrap(),
            ReloadRequest::Reload { token: 0 }
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(ReloadRequest::parse(r#"{"cmd":"stop"}"#).is_err());
        assert!(ReloadRequest::parse("reload").is_err());
    }

    #[test]
    fn test_reply_wire_format() {
        let json = serde_json::to_string(&ReloadReply::ack(7)).unwrap();
        assert_eq!(json, r#"{"ok":true,"status":"ack","token":7}"#);

        let json = serde_json::to_string(&ReloadReply::error("bad")).unwrap();
        assert_eq!(json, r#"{"ok":false,"status":"error","error":"bad"}"#);

        let json = serde_json::to_string(&ReloadReply::busy()).unwrap();
        let parsed: ReloadReply = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, ReplyStatus::Busy);
        assert!(!parsed.ok);
    }
}
