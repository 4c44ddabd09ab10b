//! Session and shell-target types.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    /// Zero dimensions are raised to 1; remote PTYs reject them.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Remote shell endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Whatever the caller supplied to authenticate with. Tried in field order.
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    /// Inline private key, PEM or OpenSSH format
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub key_file: Option<PathBuf>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.private_key.is_none() && self.key_file.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |present: bool| if present { "<redacted>" } else { "-" };
        f.debug_struct("Credentials")
            .field("password", &redact(self.password.is_some()))
            .field("private_key", &redact(self.private_key.is_some()))
            .field("passphrase", &redact(self.passphrase.is_some()))
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// Everything needed to open one interactive session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: SshTarget,
    pub credentials: Credentials,
    pub size: TermSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Opening => write!(f, "opening"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientClosed,
    RemoteClosed,
    IdleTimeout,
    Terminated,
    ChannelUnavailable,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::RemoteClosed => "remote_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Terminated => "terminated",
            CloseReason::ChannelUnavailable => "channel_unavailable",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one bridge run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub reason: CloseReason,
    pub was_active: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Serializable snapshot of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub node_id: String,
    pub target: SshTarget,
    pub state: SessionState,
    pub size: TermSize,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
    pub count: usize,
}

impl From<Vec<SessionInfo>> for SessionListResponse {
    fn from(sessions: Vec<SessionInfo>) -> Self {
        Self {
            count: sessions.len(),
            sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_size_clamps_zero() {
        assert_eq!(TermSize::new(0, 0), TermSize { rows: 1, cols: 1 });
        assert_eq!(TermSize::default(), TermSize { rows: 24, cols: 80 });
    }

    #[test]
    fn test_target_display() {
        let target = SshTarget {
            host: "10.0.0.5".into(),
            port: 2222,
            user: "alice".into(),
        };
        assert_eq!(target.to_string(), "alice@10.0.0.5:2222");
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials {
            password: Some("hunter2".into()),
            private_key: Some("-----BEGIN".into()),
            ..Default::default()
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("BEGIN"));
    }

    #[test]
    fn test_credentials_empty() {
        assert!(Credentials::default().is_empty());
        assert!(!Credentials::password("x").is_empty());
    }

    #[test]
    fn test_state_and_reason_wire_names() {
        assert_eq!(serde_json::to_string(&SessionState::Active).unwrap(), "\"active\"");
        assert_eq!(
            serde_json::to_string(&CloseReason::IdleTimeout).unwrap(),
            "\"idle_timeout\""
        );
        assert_eq!(CloseReason::ChannelUnavailable.to_string(), "channel_unavailable");
    }
}
