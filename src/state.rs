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

//! Connection state and the shared status snapshot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::LinkError;
use crate::transport::DeviceHandle;

/// Physical transport used by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ble,
    Serial,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Ble => "BLE",
            Transport::Serial => "Serial",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ble" | "bluetooth" => Ok(Transport::Ble),
            "serial" | "usb" | "uart" => Ok(Transport::Serial),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// State of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(LinkError),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting...",
            ConnectionState::Failed(_) => "Failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a session currently owns an adapter.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "Failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Snapshot of the link, readable without going through the event loop.
#[derive(Debug)]
pub struct LinkStatus {
    state: RwLock<ConnectionState>,
    device: RwLock<Option<DeviceHandle>>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            device: RwLock::new(None),
        }
    }
}

impl LinkStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub(crate) fn set_device(&self, device: Option<DeviceHandle>) {
        *self.device.write() = device;
    }

    pub fn get_state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn get_device(&self) -> Option<DeviceHandle> {
        self.device.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_parse() {
        assert_eq!("ble".parse::<Transport>(), Ok(Transport::Ble));
        assert_eq!("Serial".parse::<Transport>(), Ok(Transport::Serial));
        assert_eq!("usb".parse::<Transport>(), Ok(Transport::Serial));
        assert!("wifi".parse::<Transport>().is_err());
    }

    #[test]
    fn test_active_states() {
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Failed(LinkError::NotConnected).is_active());
        assert!(ConnectionState::Connected.is_connected());
    }

    #[test]
    fn test_status_snapshot() {
        let status = LinkStatus::new();
        assert_eq!(status.get_state(), ConnectionState::Disconnected);
        status.set_state(ConnectionState::Connecting);
        assert_eq!(status.get_state(), ConnectionState::Connecting);
        assert!(status.get_device().is_none());
    }
}
