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

//! Transport adapters.
//!
//! Both the BLE and the serial adapter implement [`Adapter`]; the connection
//! manager only looks at the transport to pick which adapter to drive.

mod ble;
mod ble_constants;
pub mod mock;
mod options;
mod serial;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::manager::Inbound;
use crate::state::Transport;

pub use ble::{chunk_payload, BleAdapter, BleConfig};
pub use ble_constants::{NUS_RX_UUID, NUS_SERVICE_UUID, NUS_TX_UUID};
pub use options::{ConnectOptions, FlowControl, Parity, ReconnectPolicy, DEFAULT_CONNECT_TIMEOUT};
pub use serial::SerialAdapter;

/// Identifies a device on a transport.
///
/// The live link (GATT characteristics, port streams) stays inside the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub transport: Transport,
    /// BLE address or serial port path.
    pub id: String,
    pub name: Option<String>,
    pub details: Option<String>,
}

impl DeviceHandle {
    pub fn new(transport: Transport, id: impl Into<String>) -> Self {
        Self {
            transport,
            id: id.into(),
            name: None,
            details: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Human readable label.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.id),
            None => self.id.clone(),
        }
    }
}

/// Events pushed by an adapter while a link is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Bytes received from the device.
    Chunk(Vec<u8>),
    /// The link ended without the caller asking for it.
    Lost(String),
}

/// Where an adapter delivers events for one session.
///
/// Every event is tagged with the session it was created for, so the manager
/// can drop anything that belongs to an earlier session.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EventSink {
    pub(crate) fn new(session: u64, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Deliver received bytes. Returns `false` once nobody is listening.
    pub fn chunk(&self, data: Vec<u8>) -> bool {
        self.emit(AdapterEvent::Chunk(data))
    }

    /// Report an unexpected link loss.
    pub fn lost(&self, reason: impl Into<String>) -> bool {
        self.emit(AdapterEvent::Lost(reason.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, event: AdapterEvent) -> bool {
        self.tx
            .send(Inbound::Adapter {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Contract shared by all transports.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Transport this adapter drives.
    fn transport(&self) -> Transport;

    /// List devices that can be connected to.
    async fn scan(&self) -> Result<Vec<DeviceHandle>, LinkError>;

    /// Open the link and start delivering events to `sink`.
    async fn connect(
        &self,
        device: &DeviceHandle,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<(), LinkError>;

    /// Write bytes to the device.
    async fn send(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Close the link. Idempotent, never fails.
    async fn disconnect(&self);
}
