// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error and warning types shared by adapters and the connection manager.

use serde::Serialize;
use thiserror::Error;

use crate::ingest::FieldError;
use crate::state::Transport;

/// Why a connection attempt or an established link ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The attempt did not complete within the connect timeout.
    #[error("timed out")]
    Timeout,
    /// The device or the platform refused the connection.
    #[error("refused: {0}")]
    Refused(String),
    /// The link dropped.
    #[error("lost: {0}")]
    Lost(String),
}

/// Errors returned by adapters and the connection manager.
///
/// Values are `Clone` so that a failure can be carried inside
/// [`ConnectionState::Failed`](crate::state::ConnectionState::Failed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectError),

    #[error("write error: {0}")]
    Write(String),

    #[error("not connected")]
    NotConnected,

    /// A session is already active; it must be disconnected first.
    #[error("link is busy ({0}), disconnect first")]
    Busy(String),

    #[error("no adapter registered for {0}")]
    UnsupportedTransport(Transport),

    /// The manager's event loop is no longer running.
    #[error("connection manager closed")]
    Closed,
}

impl LinkError {
    pub fn refused(reason: impl Into<String>) -> Self {
        LinkError::Connection(ConnectError::Refused(reason.into()))
    }

    pub fn lost(reason: impl Into<String>) -> Self {
        LinkError::Connection(ConnectError::Lost(reason.into()))
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => LinkError::PermissionDenied(e.to_string()),
            std::io::ErrorKind::NotFound => LinkError::AdapterUnavailable(e.to_string()),
            std::io::ErrorKind::TimedOut => LinkError::Connection(ConnectError::Timeout),
            _ => LinkError::refused(e.to_string()),
        }
    }
}

/// Recoverable problems in the data stream. They never end a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkWarning {
    /// The accumulator exceeded its ceiling and was discarded.
    FrameTooLarge { discarded: usize, limit: usize },
    /// A record did not look like telemetry.
    UnparsedRecord { record: String },
    /// One field of an otherwise accepted record failed to parse.
    InvalidField(FieldError),
}

impl std::fmt::Display for LinkWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkWarning::FrameTooLarge { discarded, limit } => write!(
                f,
                "frame too large: discarded {} bytes (limit {})",
                discarded, limit
            ),
            LinkWarning::UnparsedRecord { record } => write!(f, "unparsed record: {}", record),
            LinkWarning::InvalidField(e) => write!(f, "invalid field: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            LinkError::from(denied),
            LinkError::PermissionDenied(_)
        ));

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(
            LinkError::from(timeout),
            LinkError::Connection(ConnectError::Timeout)
        );

        let other = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        assert!(matches!(
            LinkError::from(other),
            LinkError::Connection(ConnectError::Refused(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(LinkError::NotConnected.to_string(), "not connected");
        assert_eq!(
            LinkError::Connection(ConnectError::Timeout).to_string(),
            "connection error: timed out"
        );
        let w = LinkWarning::FrameTooLarge {
            discarded: 70000,
            limit: 65536,
        };
        assert_eq!(
            w.to_string(),
            "frame too large: discarded 70000 bytes (limit 65536)"
        );
    }
}
