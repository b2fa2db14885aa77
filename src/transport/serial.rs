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

//! Serial port adapter.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::{
    DataBits, SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream, StopBits,
};
use tracing::{debug, error, info};

use super::{Adapter, ConnectOptions, DeviceHandle, EventSink, FlowControl, Parity};
use crate::error::LinkError;
use crate::state::Transport;

const READ_BUFFER_SIZE: usize = 1024;

struct ActivePort {
    path: String,
    writer: WriteHalf<SerialStream>,
    reader_task: JoinHandle<()>,
}

/// Adapter for USB-serial / UART attached boards.
#[derive(Default)]
pub struct SerialAdapter {
    port: Mutex<Option<ActivePort>>,
}

impl SerialAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// List serial ports present on the system.
    pub fn list_ports() -> Result<Vec<DeviceHandle>, LinkError> {
        let ports = tokio_serial::available_ports().map_err(map_serial_error)?;
        Ok(ports.into_iter().map(port_handle).collect())
    }

    /// Select a port by path.
    ///
    /// Ports missing from enumeration (pty pairs, symlinks) are accepted when
    /// the path exists.
    pub fn request_port(path: &str) -> Result<DeviceHandle, LinkError> {
        let listed = Self::list_ports().unwrap_or_else(|e| {
            debug!("Port enumeration failed: {}", e);
            Vec::new()
        });
        if let Some(handle) = listed.into_iter().find(|h| h.id == path) {
            return Ok(handle);
        }

        std::fs::metadata(Path::new(path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                LinkError::PermissionDenied(format!("{}: {}", path, e))
            }
            _ => LinkError::AdapterUnavailable(format!("serial port {} not found", path)),
        })?;

        Ok(DeviceHandle::new(Transport::Serial, path))
    }
}

#[async_trait]
impl Adapter for SerialAdapter {
    fn transport(&self) -> Transport {
        Transport::Serial
    }

    async fn scan(&self) -> Result<Vec<DeviceHandle>, LinkError> {
        Self::list_ports()
    }

    async fn connect(
        &self,
        handle: &DeviceHandle,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<(), LinkError> {
        self.disconnect().await;

        let builder = tokio_serial::new(&handle.id, options.baud_rate)
            .data_bits(data_bits(options.data_bits)?)
            .stop_bits(stop_bits(options.stop_bits)?)
            .parity(match options.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            })
            .flow_control(match options.flow_control {
                FlowControl::None => tokio_serial::FlowControl::None,
                FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
            });

        let stream = builder.open_native_async().map_err(map_serial_error)?;
        info!(
            "Opened serial port {} at {} baud",
            handle.id, options.baud_rate
        );

        let (mut reader, writer) = tokio::io::split(stream);
        let path = handle.id.clone();

        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        info!("Serial stream ended");
                        sink.lost("serial stream ended");
                        break;
                    }
                    Ok(n) => {
                        debug!("Serial read: {} bytes", n);
                        if !sink.chunk(buf[..n].to_vec()) {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Serial read error: {}", e);
                        sink.lost(format!("serial read error: {}", e));
                        break;
                    }
                }
            }
        });

        *self.port.lock().await = Some(ActivePort {
            path,
            writer,
            reader_task,
        });
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.port.lock().await;
        let port = guard
            .as_mut()
            .ok_or_else(|| LinkError::Write("serial port is not open".to_string()))?;

        port.writer
            .write_all(data)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        port.writer
            .flush()
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        debug!("Wrote {} bytes to {}", data.len(), port.path);
        Ok(())
    }

    async fn disconnect(&self) {
        let port = self.port.lock().await.take();
        if let Some(port) = port {
            port.reader_task.abort();
            // The read half lives in the task; wait for it to drop so the port is released.
            let _ = port.reader_task.await;
            drop(port.writer);
            info!("Closed serial port {}", port.path);
        }
    }
}

fn port_handle(info: SerialPortInfo) -> DeviceHandle {
    let handle = DeviceHandle::new(Transport::Serial, info.port_name);
    match info.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut details = format!("USB {:04x}:{:04x}", usb.vid, usb.pid);
            if let Some(manufacturer) = &usb.manufacturer {
                details.push(' ');
                details.push_str(manufacturer);
            }
            let handle = handle.with_details(details);
            match usb.product {
                Some(product) => handle.with_name(product),
                None => handle,
            }
        }
        SerialPortType::BluetoothPort => handle.with_details("Bluetooth"),
        SerialPortType::PciPort => handle.with_details("PCI"),
        SerialPortType::Unknown => handle,
    }
}

fn data_bits(bits: u8) -> Result<DataBits, LinkError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(LinkError::refused(format!("invalid data bits: {}", other))),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits, LinkError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(LinkError::refused(format!("invalid stop bits: {}", other))),
    }
}

fn map_serial_error(e: tokio_serial::Error) -> LinkError {
    match e.kind {
        tokio_serial::ErrorKind::NoDevice => LinkError::AdapterUnavailable(e.description),
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            LinkError::PermissionDenied(e.description)
        }
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            LinkError::AdapterUnavailable(e.description)
        }
        _ => LinkError::refused(e.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_settings() {
        assert!(matches!(data_bits(8), Ok(DataBits::Eight)));
        assert!(matches!(data_bits(7), Ok(DataBits::Seven)));
        assert!(data_bits(9).is_err());
        assert!(matches!(stop_bits(2), Ok(StopBits::Two)));
        assert!(stop_bits(0).is_err());
    }

    #[test]
    fn test_request_missing_port() {
        let result = SerialAdapter::request_port("/dev/definitely-not-a-port-42");
        assert!(matches!(result, Err(LinkError::AdapterUnavailable(_))));
    }

    #[test]
    fn test_error_mapping() {
        let denied = tokio_serial::Error::new(
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "denied",
        );
        assert!(matches!(
            map_serial_error(denied),
            LinkError::PermissionDenied(_)
        ));

        let missing = tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            map_serial_error(missing),
            LinkError::AdapterUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_framing() {
        let adapter = SerialAdapter::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let options = ConnectOptions {
            data_bits: 4,
            ..Default::default()
        };
        let handle = DeviceHandle::new(Transport::Serial, "/dev/null");
        let result = adapter
            .connect(&handle, &options, EventSink::new(1, tx))
            .await;
        assert!(matches!(result, Err(LinkError::Connection(_))));
        assert!(matches!(adapter.send(b"x").await, Err(LinkError::Write(_))));
    }
}
