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

//! Default BLE UUIDs and GATT sizing constants.

use uuid::Uuid;

/// Nordic UART Service, the usual BLE serial profile on ESP32/nRF boards.
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// NUS RX characteristic (host writes here).
/// Properties: Write, Write Without Response
pub const NUS_RX_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// NUS TX characteristic (device notifies here).
/// Properties: Notify
pub const NUS_TX_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// BLE configuration constants.
pub mod config {
    use std::time::Duration;

    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// How long a scan listens for advertisements.
    pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

    /// Poll interval while waiting for GATT services to resolve.
    pub const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Upper bound on GATT service resolution after the link is up.
    pub const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound on a BlueZ disconnect call.
    pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Calculate the write payload size for a given MTU.
    pub fn effective_payload_size(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            NUS_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(NUS_TX_UUID.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn test_effective_payload() {
        assert_eq!(config::effective_payload_size(23), 20);
        assert_eq!(config::effective_payload_size(512), 509);
        assert_eq!(config::effective_payload_size(2), 1);
    }
}
