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

//! Connection manager.
//!
//! A single event loop owns the connection state. Caller requests, adapter
//! events and the results of connection attempts all arrive on one queue and
//! are handled in order, so subscribers never see transitions out of order.
//! Connection attempts run as separate tasks; cancelling one aborts the task
//! and bumps the session id so that anything it still delivers is ignored.

mod subscriber;

pub use subscriber::{
    LinkEvent, RecordCallback, StatusCallback, Subscriber, Subscription, TelemetryCallback,
    WarningCallback,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, LinkError, LinkWarning};
use crate::ingest::{
    encode_frame, DelimiterMode, FrameReassembler, ParseOutcome, Reassembled, Record,
    TelemetryParser,
};
use crate::state::{ConnectionState, LinkStatus, Transport};
use crate::transport::{Adapter, AdapterEvent, ConnectOptions, DeviceHandle, EventSink};
use subscriber::SubscriberList;

/// Everything the event loop reacts to.
pub(crate) enum Inbound {
    Connect {
        transport: Transport,
        device: DeviceHandle,
        options: ConnectOptions,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Subscribe {
        id: u64,
        subscriber: Subscriber,
    },
    Unsubscribe {
        id: u64,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
    /// Pushed by adapters through an [`EventSink`].
    Adapter {
        session: u64,
        event: AdapterEvent,
    },
    /// A connection attempt task completed.
    AttemptFinished {
        session: u64,
        result: Result<(), LinkError>,
    },
}

struct Shared {
    tx: mpsc::UnboundedSender<Inbound>,
    status: Arc<LinkStatus>,
    adapters: HashMap<Transport, Arc<dyn Adapter>>,
    next_subscription: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.tx.send(Inbound::Shutdown { reply: None });
    }
}

/// Handle to the connection manager.
///
/// Cheap to clone. The event loop stops when [`shutdown`](Self::shutdown) is
/// called or the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Start a manager over the given adapters, at most one per transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(adapters: impl IntoIterator<Item = Arc<dyn Adapter>>) -> Self {
        let adapters: HashMap<Transport, Arc<dyn Adapter>> = adapters
            .into_iter()
            .map(|adapter| (adapter.transport(), adapter))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let status = LinkStatus::new();

        let event_loop = EventLoop {
            adapters: adapters.clone(),
            tx: tx.clone(),
            status: status.clone(),
            state: ConnectionState::Disconnected,
            session: 0,
            active: None,
            subscribers: SubscriberList::default(),
            parser: TelemetryParser::new(),
        };
        tokio::spawn(event_loop.run(rx));

        Self {
            shared: Arc::new(Shared {
                tx,
                status,
                adapters,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.status.get_state()
    }

    /// Device of the current session, if any.
    pub fn active_device(&self) -> Option<DeviceHandle> {
        self.shared.status.get_device()
    }

    /// Transports with a registered adapter.
    pub fn transports(&self) -> Vec<Transport> {
        self.shared.adapters.keys().copied().collect()
    }

    pub async fn scan(&self, transport: Transport) -> Result<Vec<DeviceHandle>, LinkError> {
        let adapter = self.adapter(transport)?;
        info!("Scanning for {} devices...", transport);
        let devices = adapter.scan().await?;
        info!("Found {} {} device(s)", devices.len(), transport);
        Ok(devices)
    }

    /// Start a session.
    ///
    /// Returns once the request is accepted. The outcome of the attempt is
    /// reported to status subscribers.
    pub async fn connect(
        &self,
        transport: Transport,
        device: DeviceHandle,
        options: ConnectOptions,
    ) -> Result<(), LinkError> {
        self.request(|reply| Inbound::Connect {
            transport,
            device,
            options,
            reply,
        })
        .await?
    }

    /// End the current session, cancelling any attempt in flight.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.request(|reply| Inbound::Disconnect { reply }).await
    }

    /// Write bytes to the connected device.
    ///
    /// In binary mode the payload is wrapped in a length-prefixed frame.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), LinkError> {
        let data = data.into();
        self.request(|reply| Inbound::Send { data, reply }).await?
    }

    /// Register callbacks. Takes effect before any request issued afterwards.
    pub fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        if self
            .shared
            .tx
            .send(Inbound::Subscribe { id, subscriber })
            .is_err()
        {
            warn!("Subscription {} registered after shutdown", id);
        }
        Subscription::new(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let _ = self.shared.tx.send(Inbound::Unsubscribe {
            id: subscription.id(),
        });
    }

    pub async fn subscriber_count(&self) -> Result<usize, LinkError> {
        self.request(|reply| Inbound::SubscriberCount { reply }).await
    }

    /// Disconnect and stop the event loop.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .shared
            .tx
            .send(Inbound::Shutdown { reply: Some(reply) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    fn adapter(&self, transport: Transport) -> Result<Arc<dyn Adapter>, LinkError> {
        self.shared
            .adapters
            .get(&transport)
            .cloned()
            .ok_or(LinkError::UnsupportedTransport(transport))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Inbound,
    ) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .tx
            .send(build(reply))
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)
    }
}

/// The adapter, device and stream state of the current session.
struct ActiveSession {
    adapter: Arc<dyn Adapter>,
    device: DeviceHandle,
    options: ConnectOptions,
    reassembler: FrameReassembler,
    attempt: Option<JoinHandle<()>>,
    /// Consecutive failed reconnect attempts.
    failures: u32,
    /// Link loss reported before the attempt that opened it had finished.
    early_loss: Option<String>,
}

struct EventLoop {
    adapters: HashMap<Transport, Arc<dyn Adapter>>,
    tx: mpsc::UnboundedSender<Inbound>,
    status: Arc<LinkStatus>,
    state: ConnectionState,
    /// Bumped on every attempt and every teardown.
    session: u64,
    active: Option<ActiveSession>,
    subscribers: SubscriberList,
    parser: TelemetryParser,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        debug!("Connection manager started");

        while let Some(msg) = rx.recv().await {
            match msg {
                Inbound::Connect {
                    transport,
                    device,
                    options,
                    reply,
                } => {
                    let result = self.start_session(transport, device, options);
                    let _ = reply.send(result);
                }
                Inbound::Disconnect { reply } => {
                    self.end_session().await;
                    let _ = reply.send(());
                }
                Inbound::Send { data, reply } => {
                    let result = self.send(data).await;
                    let _ = reply.send(result);
                }
                Inbound::Subscribe { id, subscriber } => {
                    self.subscribers.add(id, subscriber);
                    debug!("Subscriber {} added", id);
                }
                Inbound::Unsubscribe { id } => {
                    if self.subscribers.remove(id) {
                        debug!("Subscriber {} removed", id);
                    }
                }
                Inbound::SubscriberCount { reply } => {
                    let _ = reply.send(self.subscribers.len());
                }
                Inbound::Adapter { session, event } => {
                    self.on_adapter_event(session, event).await;
                }
                Inbound::AttemptFinished { session, result } => {
                    self.on_attempt_finished(session, result).await;
                }
                Inbound::Shutdown { reply } => {
                    self.end_session().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }

        info!("Connection manager stopped");
    }

    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next.clone());
        info!("Link state: {} -> {}", previous, next);
        self.status.set_state(next.clone());
        self.subscribers.notify_status(&next, &previous);
    }

    fn start_session(
        &mut self,
        transport: Transport,
        device: DeviceHandle,
        options: ConnectOptions,
    ) -> Result<(), LinkError> {
        if self.state.is_active() {
            return Err(LinkError::Busy(self.state.to_string()));
        }
        let adapter = self
            .adapters
            .get(&transport)
            .cloned()
            .ok_or(LinkError::UnsupportedTransport(transport))?;
        if device.transport != transport {
            return Err(LinkError::refused(format!(
                "{} is a {} device",
                device.label(),
                device.transport
            )));
        }

        info!("Connecting to {} over {}", device.label(), transport);
        let reassembler =
            FrameReassembler::with_limit(options.delimiter_mode, options.max_frame_size);
        self.status.set_device(Some(device.clone()));
        self.active = Some(ActiveSession {
            adapter,
            device,
            options,
            reassembler,
            attempt: None,
            failures: 0,
            early_loss: None,
        });
        self.transition(ConnectionState::Connecting);
        self.start_attempt(Duration::ZERO);
        Ok(())
    }

    /// Spawn a connection attempt for a new session id, after `delay`.
    fn start_attempt(&mut self, delay: Duration) {
        self.session += 1;
        let session = self.session;
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let adapter = active.adapter.clone();
        let device = active.device.clone();
        let options = active.options.clone();
        let sink = EventSink::new(session, self.tx.clone());
        let tx = self.tx.clone();

        active.early_loss = None;
        active.attempt = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!("Attempt {} connecting to {}", session, device.label());
            let result = match tokio::time::timeout(
                options.connect_timeout(),
                adapter.connect(&device, &options, sink),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LinkError::Connection(ConnectError::Timeout)),
            };
            let _ = tx.send(Inbound::AttemptFinished { session, result });
        }));
    }

    async fn on_attempt_finished(&mut self, session: u64, result: Result<(), LinkError>) {
        if session != self.session {
            debug!("Discarding result of stale attempt {}", session);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.attempt = None;

        match result {
            Ok(()) => {
                active.reassembler.reset();
                active.failures = 0;
                let early_loss = active.early_loss.take();
                info!("Connected to {}", active.device.label());
                self.transition(ConnectionState::Connected);
                if let Some(reason) = early_loss {
                    self.on_link_lost(reason).await;
                }
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", active.device.label(), e);
                let adapter = active.adapter.clone();
                adapter.disconnect().await;
                if self.state == ConnectionState::Reconnecting {
                    self.retry_or_fail(e);
                } else {
                    self.fail(e);
                }
            }
        }
    }

    async fn on_adapter_event(&mut self, session: u64, event: AdapterEvent) {
        if session != self.session {
            debug!("Discarding event from stale session {}", session);
            return;
        }

        match event {
            AdapterEvent::Chunk(data) => {
                if self.state.is_connected() {
                    self.ingest(&data);
                } else {
                    debug!("Discarding {} bytes received while {}", data.len(), self.state);
                }
            }
            AdapterEvent::Lost(reason) => {
                if self.state.is_connected() {
                    self.on_link_lost(reason).await;
                } else if let Some(active) = self.active.as_mut() {
                    active.early_loss = Some(reason);
                }
            }
        }
    }

    async fn on_link_lost(&mut self, reason: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        warn!("Link to {} lost: {}", active.device.label(), reason);
        active.reassembler.reset();
        let adapter = active.adapter.clone();
        let reconnect =
            active.options.reconnect && active.options.reconnect_policy.max_attempts > 0;
        let first_delay = active.options.reconnect_policy.delay_for(0);
        adapter.disconnect().await;

        if reconnect {
            if let Some(active) = self.active.as_mut() {
                active.failures = 0;
            }
            self.transition(ConnectionState::Reconnecting);
            info!("Reconnecting in {:?}", first_delay);
            self.start_attempt(first_delay);
        } else {
            self.session += 1;
            self.active = None;
            self.status.set_device(None);
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn retry_or_fail(&mut self, error: LinkError) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.failures += 1;
        let policy = &active.options.reconnect_policy;
        if active.failures >= policy.max_attempts {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                active.device.label(),
                active.failures
            );
            self.fail(error);
        } else {
            let delay = policy.delay_for(active.failures);
            info!(
                "Reconnect attempt {} of {} in {:?}",
                active.failures + 1,
                policy.max_attempts,
                delay
            );
            self.start_attempt(delay);
        }
    }

    fn fail(&mut self, error: LinkError) {
        self.session += 1;
        if let Some(active) = self.active.take() {
            if let Some(attempt) = active.attempt {
                attempt.abort();
            }
        }
        self.status.set_device(None);
        self.transition(ConnectionState::Failed(error));
        self.transition(ConnectionState::Disconnected);
    }

    async fn end_session(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.session += 1;
        if let Some(attempt) = active.attempt {
            attempt.abort();
        }
        active.adapter.disconnect().await;
        self.status.set_device(None);
        info!("Disconnected from {}", active.device.label());
        self.transition(ConnectionState::Disconnected);
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<(), LinkError> {
        if !self.state.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let Some(active) = self.active.as_ref() else {
            return Err(LinkError::NotConnected);
        };
        let payload = match active.options.delimiter_mode {
            DelimiterMode::Text => data,
            DelimiterMode::Binary => encode_frame(&data)?,
        };
        let adapter = active.adapter.clone();
        debug!("Sending {} bytes", payload.len());
        adapter.send(&payload).await
    }

    fn ingest(&mut self, data: &[u8]) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let limit = active.reassembler.max_frame();
        let outputs = active.reassembler.push(data);

        for output in outputs {
            match output {
                Reassembled::TooLarge { discarded } => {
                    let warning = LinkWarning::FrameTooLarge { discarded, limit };
                    warn!("{}", warning);
                    self.subscribers.notify_warning(&warning);
                }
                Reassembled::Record(record) => self.dispatch_record(record),
            }
        }
    }

    fn dispatch_record(&mut self, record: Record) {
        if record.is_empty() {
            return;
        }
        self.subscribers.notify_record(&record);

        match self.parser.parse(&record) {
            ParseOutcome::Sample(sample) => {
                for failure in &sample.failures {
                    warn!("Invalid field: {}", failure);
                    self.subscribers
                        .notify_warning(&LinkWarning::InvalidField(failure.clone()));
                }
                debug!("Telemetry: {:?}", sample.fields);
                self.subscribers.notify_telemetry(&sample);
            }
            ParseOutcome::Unparsed { record, failures } => {
                for failure in failures {
                    warn!("Invalid field: {}", failure);
                    self.subscribers
                        .notify_warning(&LinkWarning::InvalidField(failure));
                }
                debug!("Unparsed record: {}", record);
                self.subscribers
                    .notify_warning(&LinkWarning::UnparsedRecord { record });
            }
        }
    }
}
