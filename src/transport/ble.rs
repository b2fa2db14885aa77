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

//! BLE GATT central adapter (BlueZ via bluer).

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Session};
use futures::{pin_mut, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{config, NUS_RX_UUID, NUS_SERVICE_UUID, NUS_TX_UUID};
use super::{Adapter, ConnectOptions, DeviceHandle, EventSink};
use crate::error::{ConnectError, LinkError};
use crate::state::Transport;

/// BLE settings: which GATT service to talk to and how to scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub service_uuid: Uuid,
    /// Characteristic the device notifies telemetry on.
    pub notify_uuid: Uuid,
    /// Characteristic the host writes to.
    pub write_uuid: Uuid,
    pub scan_duration_ms: u64,
    /// Only list devices whose name contains this (case-insensitive).
    pub name_filter: Option<String>,
    pub mtu: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: NUS_SERVICE_UUID,
            notify_uuid: NUS_TX_UUID,
            write_uuid: NUS_RX_UUID,
            scan_duration_ms: config::DEFAULT_SCAN_DURATION.as_millis() as u64,
            name_filter: None,
            mtu: config::DEFAULT_MTU,
        }
    }
}

/// The connected peripheral. Owned by the adapter only.
struct ActiveLink {
    device: Device,
    write_char: Characteristic,
    notify_task: JoinHandle<()>,
}

/// Holds a peripheral between `Device::connect` and the link being recorded.
///
/// If the attempt fails or is dropped part-way, `disconnect` finds the device
/// here and tears the OS-level link down.
struct PendingSlot<T> {
    slot: parking_lot::Mutex<Option<T>>,
}

impl<T> PendingSlot<T> {
    fn new() -> Self {
        Self {
            slot: parking_lot::Mutex::new(None),
        }
    }

    fn arm(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }
}

/// Adapter for BLE peripherals exposing a notify/write characteristic pair.
pub struct BleAdapter {
    config: BleConfig,
    session: OnceCell<Session>,
    link: Mutex<Option<ActiveLink>>,
    pending: PendingSlot<Device>,
}

impl BleAdapter {
    /// Create a new BLE adapter. BlueZ is not contacted until first use.
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            session: OnceCell::new(),
            link: Mutex::new(None),
            pending: PendingSlot::new(),
        }
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Get the default Bluetooth adapter, powering it on if needed.
    async fn bt_adapter(&self) -> Result<bluer::Adapter, LinkError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                let session = Session::new().await.map_err(map_bluer_error)?;
                info!("BlueZ session created");
                Ok::<_, LinkError>(session)
            })
            .await?;

        let adapter = session.default_adapter().await.map_err(map_bluer_error)?;

        if !adapter.is_powered().await.map_err(map_bluer_error)? {
            info!("Powering on Bluetooth adapter {}...", adapter.name());
            adapter.set_powered(true).await.map_err(map_bluer_error)?;
        }

        Ok(adapter)
    }

    fn matches_filter(&self, name: Option<&str>) -> bool {
        match &self.config.name_filter {
            Some(filter) => name
                .map(|n| n.to_lowercase().contains(&filter.to_lowercase()))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Wait until GATT services are resolved and find our characteristics.
    async fn resolve_characteristics(
        &self,
        device: &Device,
    ) -> Result<(Characteristic, Characteristic), LinkError> {
        let resolved = tokio::time::timeout(config::SERVICES_RESOLVE_TIMEOUT, async {
            while !device
                .is_services_resolved()
                .await
                .map_err(map_bluer_error)?
            {
                tokio::time::sleep(config::SERVICES_POLL_INTERVAL).await;
            }
            Ok::<_, LinkError>(())
        })
        .await;
        match resolved {
            Ok(result) => result?,
            Err(_) => return Err(LinkError::Connection(ConnectError::Timeout)),
        }

        let mut notify_char = None;
        let mut write_char = None;

        for service in device.services().await.map_err(map_bluer_error)? {
            if service.uuid().await.map_err(map_bluer_error)? != self.config.service_uuid {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(map_bluer_error)? {
                let uuid = characteristic.uuid().await.map_err(map_bluer_error)?;
                if uuid == self.config.notify_uuid {
                    notify_char = Some(characteristic.clone());
                }
                if uuid == self.config.write_uuid {
                    write_char = Some(characteristic);
                }
            }
        }

        match (notify_char, write_char) {
            (Some(notify), Some(write)) => Ok((notify, write)),
            _ => Err(LinkError::refused(format!(
                "service {} with characteristics {} / {} not found",
                self.config.service_uuid, self.config.notify_uuid, self.config.write_uuid
            ))),
        }
    }
}

#[async_trait]
impl Adapter for BleAdapter {
    fn transport(&self) -> Transport {
        Transport::Ble
    }

    async fn scan(&self) -> Result<Vec<DeviceHandle>, LinkError> {
        let adapter = self.bt_adapter().await?;
        let duration = Duration::from_millis(self.config.scan_duration_ms);
        info!("Scanning for BLE devices for {:?}...", duration);

        let mut addresses: Vec<Address> = Vec::new();
        {
            let discover = adapter.discover_devices().await.map_err(map_bluer_error)?;
            pin_mut!(discover);
            let deadline = tokio::time::sleep(duration);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = discover.next() => match event {
                        Some(bluer::AdapterEvent::DeviceAdded(addr)) => {
                            if !addresses.contains(&addr) {
                                debug!("Discovered {}", addr);
                                addresses.push(addr);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            // Dropping the stream stops discovery.
        }

        let mut handles = Vec::new();
        for addr in addresses {
            let device = match adapter.device(addr) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Device {} vanished: {}", addr, e);
                    continue;
                }
            };
            let name = device.name().await.ok().flatten();
            if !self.matches_filter(name.as_deref()) {
                continue;
            }

            let rssi = device.rssi().await.ok().flatten();
            let advertises_service = device
                .uuids()
                .await
                .ok()
                .flatten()
                .map(|uuids| uuids.contains(&self.config.service_uuid))
                .unwrap_or(false);

            let mut details = match rssi {
                Some(rssi) => format!("rssi {} dBm", rssi),
                None => "rssi n/a".to_string(),
            };
            if advertises_service {
                details.push_str(", telemetry service");
            }

            let mut handle = DeviceHandle::new(Transport::Ble, addr.to_string()).with_details(details);
            if let Some(name) = name {
                handle = handle.with_name(name);
            }
            handles.push(handle);
        }

        info!("Scan found {} device(s)", handles.len());
        Ok(handles)
    }

    async fn connect(
        &self,
        handle: &DeviceHandle,
        _options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<(), LinkError> {
        let address: Address = handle
            .id
            .parse()
            .map_err(|_| LinkError::refused(format!("invalid BLE address '{}'", handle.id)))?;

        // Drop whatever a cancelled attempt may have left behind.
        self.disconnect().await;

        let adapter = self.bt_adapter().await?;
        let device = adapter.device(address).map_err(map_bluer_error)?;

        self.pending.arm(device.clone());
        let subscribed = async {
            if !device.is_connected().await.map_err(map_bluer_error)? {
                info!("Connecting to {}...", address);
                device.connect().await.map_err(map_bluer_error)?;
            }
            let (notify_char, write_char) = self.resolve_characteristics(&device).await?;
            let notifications = notify_char.notify().await.map_err(map_bluer_error)?;
            let device_events = device.events().await.map_err(map_bluer_error)?;
            Ok::<_, LinkError>((write_char, notifications, device_events))
        }
        .await;

        let (write_char, notifications, device_events) = match subscribed {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(device) = self.pending.take() {
                    disconnect_device(&device).await;
                }
                return Err(e);
            }
        };

        let notify_task = tokio::spawn(async move {
            pin_mut!(notifications);
            pin_mut!(device_events);

            loop {
                tokio::select! {
                    data = notifications.next() => match data {
                        Some(data) => {
                            debug!("Notification: {} bytes", data.len());
                            if !sink.chunk(data) {
                                break;
                            }
                        }
                        None => {
                            sink.lost("notification stream ended");
                            break;
                        }
                    },
                    event = device_events.next() => match event {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                            warn!("BLE device {} dropped the link", address);
                            sink.lost("device disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => {
                            sink.lost("device event stream ended");
                            break;
                        }
                    },
                }
            }
            debug!("BLE notification loop exited");
        });

        *self.link.lock().await = Some(ActiveLink {
            device,
            write_char,
            notify_task,
        });
        self.pending.take();

        info!("Connected to {} and subscribed to notifications", address);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| LinkError::Write("BLE link is not connected".to_string()))?;

        for packet in chunk_payload(data, self.config.mtu) {
            link.write_char
                .write(&packet)
                .await
                .map_err(|e| LinkError::Write(e.to_string()))?;
        }
        debug!("Wrote {} bytes", data.len());
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(device) = self.pending.take() {
            debug!("Releasing half-open link to {}", device.address());
            disconnect_device(&device).await;
        }

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.notify_task.abort();
            disconnect_device(&link.device).await;
            info!("Disconnected from {}", link.device.address());
        }
    }
}

async fn disconnect_device(device: &Device) {
    bounded_disconnect(device.address(), device.disconnect()).await;
}

/// Await a disconnect call for at most `DISCONNECT_TIMEOUT`. Returns whether it completed.
async fn bounded_disconnect(
    address: Address,
    disconnect: impl Future<Output = bluer::Result<()>>,
) -> bool {
    match tokio::time::timeout(config::DISCONNECT_TIMEOUT, disconnect).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("BLE disconnect of {} failed: {}", address, e);
            true
        }
        Err(_) => {
            warn!("BLE disconnect of {} timed out", address);
            false
        }
    }
}

/// Split a payload into ATT-sized writes.
pub fn chunk_payload(data: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let size = config::effective_payload_size(mtu);
    data.chunks(size).map(|c| c.to_vec()).collect()
}

fn map_bluer_error(e: bluer::Error) -> LinkError {
    match e.kind {
        ErrorKind::NotAuthorized
        | ErrorKind::NotPermitted
        | ErrorKind::AuthenticationCanceled
        | ErrorKind::AuthenticationFailed
        | ErrorKind::AuthenticationRejected => LinkError::PermissionDenied(e.to_string()),
        ErrorKind::NotReady
        | ErrorKind::NotAvailable
        | ErrorKind::NotSupported
        | ErrorKind::NotFound
        | ErrorKind::DoesNotExist
        | ErrorKind::Internal(_) => LinkError::AdapterUnavailable(e.to_string()),
        ErrorKind::AuthenticationTimeout => LinkError::Connection(ConnectError::Timeout),
        _ => LinkError::refused(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_payload_single() {
        let packets = chunk_payload(b"temp?\n", 23);
        assert_eq!(packets, vec![b"temp?\n".to_vec()]);
    }

    #[test]
    fn test_chunk_payload_multi() {
        let data = vec![b'A'; 50];
        let packets = chunk_payload(&data, 23);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 20);
        assert_eq!(packets[2].len(), 10);
        assert_eq!(packets.concat(), data);
    }

    #[test]
    fn test_chunk_payload_empty() {
        assert!(chunk_payload(&[], 23).is_empty());
    }

    #[test]
    fn test_name_filter() {
        let adapter = BleAdapter::new(BleConfig {
            name_filter: Some("esp".to_string()),
            ..Default::default()
        });
        assert!(adapter.matches_filter(Some("ESP32-Weather")));
        assert!(!adapter.matches_filter(Some("Headphones")));
        assert!(!adapter.matches_filter(None));

        let open = BleAdapter::new(BleConfig::default());
        assert!(open.matches_filter(None));
    }

    #[test]
    fn test_pending_slot() {
        let pending = PendingSlot::new();
        assert_eq!(pending.take(), None::<String>);

        pending.arm("AA:BB:CC:DD:EE:01".to_string());
        pending.arm("AA:BB:CC:DD:EE:02".to_string());
        assert_eq!(pending.take().as_deref(), Some("AA:BB:CC:DD:EE:02"));
        assert_eq!(pending.take(), None);
    }

    #[tokio::test]
    async fn test_send_without_link_is_write_error() {
        let adapter = BleAdapter::new(BleConfig::default());
        let result = adapter.send(b"x").await;
        assert!(matches!(result, Err(LinkError::Write(_))));
        // Disconnect without a link is a no-op.
        adapter.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_bounded() {
        let address = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        let start = tokio::time::Instant::now();
        assert!(!bounded_disconnect(address, std::future::pending()).await);
        assert!(start.elapsed() >= config::DISCONNECT_TIMEOUT);

        assert!(bounded_disconnect(address, async { Ok(()) }).await);
    }
}
