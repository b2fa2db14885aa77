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

//! DeviceLink command line host.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devicelink::config::Config;
use devicelink::transport::{BleAdapter, BleConfig, SerialAdapter};
use devicelink::{
    Adapter, ConnectOptions, ConnectionManager, ConnectionState, DelimiterMode, DeviceHandle,
    LinkEvent, Subscriber, Transport,
};

/// DeviceLink - talk to BLE and serial sensor boards.
#[derive(Parser, Debug)]
#[command(name = "devicelink")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Transport: ble or serial. Defaults to the configured one.
    #[arg(short, long, global = true)]
    transport: Option<Transport>,

    /// Configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices (BLE) or ports (serial).
    Scan,
    /// Connect and print telemetry as JSON lines. Lines typed on stdin are sent to the device.
    Monitor {
        /// BLE address or serial port path.
        #[arg(short, long)]
        device: Option<String>,
        /// Serial baud rate.
        #[arg(short, long)]
        baud: Option<u32>,
        /// Reconnect automatically when the link drops.
        #[arg(short, long)]
        reconnect: bool,
        /// Length-prefixed binary frames instead of text lines.
        #[arg(long)]
        binary: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let directive = if args.verbose {
        "devicelink=debug"
    } else {
        "devicelink=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    info!("Starting DeviceLink v{}...", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    let transport = args.transport.unwrap_or(config.link.transport);
    let manager = ConnectionManager::new(adapters(&config.ble));

    let result = match args.command {
        Command::Scan => scan(&manager, transport).await,
        Command::Monitor {
            device,
            baud,
            reconnect,
            binary,
        } => {
            let mut options = config.link.options.clone();
            if let Some(baud) = baud {
                options = options.with_baud_rate(baud);
            }
            if reconnect {
                options = options.with_reconnect(true);
            }
            if binary {
                options = options.with_delimiter_mode(DelimiterMode::Binary);
            }
            let device = device
                .or_else(|| config.link.device.clone())
                .context("no device given, pass --device or set link.device in the config")?;
            monitor(&manager, transport, &device, options).await
        }
    };

    manager.shutdown().await;
    info!("DeviceLink stopped");
    result
}

fn adapters(ble: &BleConfig) -> Vec<Arc<dyn Adapter>> {
    let ble: Arc<dyn Adapter> = Arc::new(BleAdapter::new(ble.clone()));
    let serial: Arc<dyn Adapter> = Arc::new(SerialAdapter::new());
    vec![ble, serial]
}

async fn scan(manager: &ConnectionManager, transport: Transport) -> Result<()> {
    let devices = manager.scan(transport).await?;
    if devices.is_empty() {
        println!("No {} devices found", transport);
    }
    for device in devices {
        match &device.details {
            Some(details) => println!("{}\t{}", device.label(), details),
            None => println!("{}", device.label()),
        }
    }
    Ok(())
}

async fn monitor(
    manager: &ConnectionManager,
    transport: Transport,
    device: &str,
    options: ConnectOptions,
) -> Result<()> {
    let handle = match transport {
        Transport::Serial => SerialAdapter::request_port(device)?,
        Transport::Ble => DeviceHandle::new(Transport::Ble, device),
    };
    let line_mode = options.delimiter_mode == DelimiterMode::Text;

    let (tx, mut events) = mpsc::unbounded_channel();
    let subscription = manager.subscribe(Subscriber::channel(tx));
    manager.connect(transport, handle, options).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut failure = None;

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                LinkEvent::Telemetry(sample) => println!("{}", serde_json::to_string(&sample)?),
                LinkEvent::Status { state, .. } => match state {
                    ConnectionState::Failed(reason) => failure = Some(reason),
                    ConnectionState::Disconnected => break,
                    other => info!("{}", other),
                },
                LinkEvent::Record(record) => debug!("Record: {}", record.display_text()),
                LinkEvent::Warning(warning) => debug!("Warning: {}", warning),
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let mut data = line.into_bytes();
                    if line_mode {
                        data.push(b'\n');
                    }
                    if let Err(e) = manager.send(data).await {
                        warn!("Send failed: {}", e);
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.unsubscribe(subscription);
    manager.disconnect().await?;

    match failure {
        Some(reason) => bail!("connection failed: {}", reason),
        None => Ok(()),
    }
}
