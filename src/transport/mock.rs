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

//! In-memory adapter for tests and demos without hardware.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::info;

use super::{Adapter, ConnectOptions, DeviceHandle, EventSink};
use crate::error::LinkError;
use crate::state::Transport;

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceHandle>,
    scan_error: Option<LinkError>,
    connect_results: VecDeque<Result<(), LinkError>>,
    connect_gate: Option<oneshot::Receiver<()>>,
    connect_times: Vec<Instant>,
    sink: Option<EventSink>,
    connected_to: Option<DeviceHandle>,
    sent: Vec<Vec<u8>>,
    send_error: Option<LinkError>,
    disconnects: usize,
}

/// Scriptable adapter that records every call.
pub struct MockAdapter {
    transport: Transport,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Devices returned by `scan`.
    pub fn set_devices(&self, devices: Vec<DeviceHandle>) {
        self.state.lock().devices = devices;
    }

    pub fn fail_scan(&self, error: LinkError) {
        self.state.lock().scan_error = Some(error);
    }

    /// Queue the outcome of the next `connect`. Unscripted attempts succeed.
    pub fn push_connect_result(&self, result: Result<(), LinkError>) {
        self.state.lock().connect_results.push_back(result);
    }

    /// Hold the next `connect` until the returned sender fires or is dropped.
    pub fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().connect_gate = Some(rx);
        tx
    }

    /// Make every `send` fail with `error`.
    pub fn fail_sends(&self, error: LinkError) {
        self.state.lock().send_error = Some(error);
    }

    /// Deliver bytes as if the device sent them.
    pub fn emit_chunk(&self, data: &[u8]) -> bool {
        match &self.state.lock().sink {
            Some(sink) => sink.chunk(data.to_vec()),
            None => false,
        }
    }

    /// Drop the link as if the device went out of range.
    pub fn drop_link(&self, reason: &str) -> bool {
        let sink = {
            let mut state = self.state.lock();
            state.connected_to = None;
            state.sink.take()
        };
        match sink {
            Some(sink) => sink.lost(reason),
            None => false,
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_times.len()
    }

    /// When each `connect` call started.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn send_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected_to.is_some()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn transport(&self) -> Transport {
        self.transport
    }

    async fn scan(&self) -> Result<Vec<DeviceHandle>, LinkError> {
        let state = self.state.lock();
        match &state.scan_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.devices.clone()),
        }
    }

    async fn connect(
        &self,
        device: &DeviceHandle,
        _options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<(), LinkError> {
        let gate = {
            let mut state = self.state.lock();
            state.connect_times.push(Instant::now());
            state.connect_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let mut state = self.state.lock();
        let result = state.connect_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            info!("[MOCK] Connected to {}", device.label());
            state.sink = Some(sink);
            state.connected_to = Some(device.clone());
        }
        result
    }

    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if let Some(e) = &state.send_error {
            return Err(e.clone());
        }
        if state.connected_to.is_none() {
            return Err(LinkError::Write("mock link is not connected".to_string()));
        }
        state.sent.push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.sink = None;
        state.connected_to = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Inbound;
    use crate::transport::AdapterEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mock_delivers_through_sink() {
        let mock = MockAdapter::new(Transport::Serial);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let device = DeviceHandle::new(Transport::Serial, "/dev/ttyMOCK0");

        mock.connect(&device, &ConnectOptions::default(), EventSink::new(7, tx))
            .await
            .unwrap();
        assert!(mock.is_connected());
        assert!(mock.emit_chunk(b"hum=40\n"));

        match rx.recv().await {
            Some(Inbound::Adapter { session, event }) => {
                assert_eq!(session, 7);
                assert_eq!(event, AdapterEvent::Chunk(b"hum=40\n".to_vec()));
            }
            _ => panic!("expected adapter event"),
        }

        mock.send(b"ping").await.unwrap();
        assert_eq!(mock.sent(), vec![b"ping".to_vec()]);

        mock.disconnect().await;
        assert!(!mock.emit_chunk(b"late"));
        assert!(mock.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let mock = MockAdapter::new(Transport::Ble);
        let (tx, _rx) = mpsc::unbounded_channel();
        mock.push_connect_result(Err(LinkError::PermissionDenied("bluetoothd".into())));

        let device = DeviceHandle::new(Transport::Ble, "AA:BB:CC:DD:EE:FF");
        let result = mock
            .connect(&device, &ConnectOptions::default(), EventSink::new(1, tx))
            .await;
        assert!(matches!(result, Err(LinkError::PermissionDenied(_))));
        assert!(!mock.is_connected());
        assert_eq!(mock.connect_count(), 1);
    }
}
