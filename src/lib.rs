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

//! Device connectivity and telemetry ingestion for BLE and serial boards.
//!
//! A [`ConnectionManager`] drives one link at a time through an [`Adapter`],
//! reassembles the byte stream into records, parses them into
//! [`TelemetrySample`]s and hands everything to registered [`Subscriber`]s.

pub mod config;
pub mod error;
pub mod ingest;
pub mod manager;
pub mod state;
pub mod transport;

pub use error::{ConnectError, LinkError, LinkWarning};
pub use ingest::{DelimiterMode, FrameReassembler, Record, TelemetryParser, TelemetrySample};
pub use manager::{ConnectionManager, LinkEvent, Subscriber, Subscription};
pub use state::{ConnectionState, Transport};
pub use transport::{Adapter, ConnectOptions, DeviceHandle, ReconnectPolicy};
