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

//! Per-session connection options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ingest::{DelimiterMode, DEFAULT_MAX_FRAME};

/// Default bounded interval for a connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Automatic reconnection after an unexpected link loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Options supplied with `connect`.
///
/// Serial framing fields are ignored by the BLE adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Enter `Reconnecting` instead of `Disconnected` when the link drops.
    pub reconnect: bool,
    pub delimiter_mode: DelimiterMode,
    pub reconnect_policy: ReconnectPolicy,
    pub connect_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
            reconnect: false,
            delimiter_mode: DelimiterMode::Text,
            reconnect_policy: ReconnectPolicy::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            max_frame_size: DEFAULT_MAX_FRAME,
        }
    }
}

impl ConnectOptions {
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_delimiter_mode(mut self, mode: DelimiterMode) -> Self {
        self.delimiter_mode = mode;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(200), Duration::from_millis(8_000));
    }

    #[test]
    fn test_options_from_partial_toml() {
        let options: ConnectOptions =
            toml::from_str("baud_rate = 9600\nparity = \"even\"\nreconnect = true\n").unwrap();
        assert_eq!(options.baud_rate, 9600);
        assert_eq!(options.parity, Parity::Even);
        assert!(options.reconnect);
        assert_eq!(options.data_bits, 8);
        assert_eq!(options.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }
}
