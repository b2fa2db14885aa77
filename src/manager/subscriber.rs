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

//! Subscriber callbacks and their registry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::LinkWarning;
use crate::ingest::{Record, TelemetrySample};
use crate::state::ConnectionState;

pub type TelemetryCallback = Box<dyn Fn(&TelemetrySample) + Send>;
pub type StatusCallback = Box<dyn Fn(&ConnectionState, &ConnectionState) + Send>;
pub type RecordCallback = Box<dyn Fn(&Record) + Send>;
pub type WarningCallback = Box<dyn Fn(&LinkWarning) + Send>;

/// Everything the engine reports, as a single value.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Telemetry(TelemetrySample),
    Status {
        state: ConnectionState,
        previous: ConnectionState,
    },
    Record(Record),
    Warning(LinkWarning),
}

/// A set of callbacks registered with the connection manager.
///
/// Callbacks run on the manager's event loop, one event at a time. Calls back
/// into the manager from a callback are queued behind the current event.
#[derive(Default)]
pub struct Subscriber {
    telemetry: Option<TelemetryCallback>,
    status: Option<StatusCallback>,
    record: Option<RecordCallback>,
    warning: Option<WarningCallback>,
}

impl Subscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_telemetry(mut self, f: impl Fn(&TelemetrySample) + Send + 'static) -> Self {
        self.telemetry = Some(Box::new(f));
        self
    }

    /// Called with `(state, previous_state)` on every transition.
    pub fn on_status(
        mut self,
        f: impl Fn(&ConnectionState, &ConnectionState) + Send + 'static,
    ) -> Self {
        self.status = Some(Box::new(f));
        self
    }

    /// Raw log: every record, parsed or not.
    pub fn on_record(mut self, f: impl Fn(&Record) + Send + 'static) -> Self {
        self.record = Some(Box::new(f));
        self
    }

    pub fn on_warning(mut self, f: impl Fn(&LinkWarning) + Send + 'static) -> Self {
        self.warning = Some(Box::new(f));
        self
    }

    /// Forward every event into a channel.
    pub fn channel(tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let telemetry_tx = tx.clone();
        let status_tx = tx.clone();
        let record_tx = tx.clone();
        Self::new()
            .on_telemetry(move |s| {
                let _ = telemetry_tx.send(LinkEvent::Telemetry(s.clone()));
            })
            .on_status(move |state, previous| {
                let _ = status_tx.send(LinkEvent::Status {
                    state: state.clone(),
                    previous: previous.clone(),
                });
            })
            .on_record(move |r| {
                let _ = record_tx.send(LinkEvent::Record(r.clone()));
            })
            .on_warning(move |w| {
                let _ = tx.send(LinkEvent::Warning(w.clone()));
            })
    }
}

/// Token returned by `subscribe`. Pass it to `unsubscribe` to cancel.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
}

impl Subscription {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Subscribers in insertion order.
#[derive(Default)]
pub(crate) struct SubscriberList {
    entries: Vec<(u64, Subscriber)>,
}

impl SubscriberList {
    pub fn add(&mut self, id: u64, subscriber: Subscriber) {
        self.entries.push((id, subscriber));
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn notify_status(&self, state: &ConnectionState, previous: &ConnectionState) {
        for (id, sub) in &self.entries {
            if let Some(f) = &sub.status {
                guarded(*id, "status", || f(state, previous));
            }
        }
    }

    pub fn notify_telemetry(&self, sample: &TelemetrySample) {
        for (id, sub) in &self.entries {
            if let Some(f) = &sub.telemetry {
                guarded(*id, "telemetry", || f(sample));
            }
        }
    }

    pub fn notify_record(&self, record: &Record) {
        for (id, sub) in &self.entries {
            if let Some(f) = &sub.record {
                guarded(*id, "record", || f(record));
            }
        }
    }

    pub fn notify_warning(&self, warning: &LinkWarning) {
        for (id, sub) in &self.entries {
            if let Some(f) = &sub.warning {
                guarded(*id, "warning", || f(warning));
            }
        }
    }
}

/// Run a callback, containing any panic to that callback.
fn guarded(id: u64, kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Subscriber {} panicked in {} callback", id, kind);
    } else {
        debug!("Subscriber {} handled {} event", id, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SubscriberList::default();

        for id in 0..3 {
            let log = log.clone();
            list.add(
                id,
                Subscriber::new().on_status(move |_, _| log.lock().push(id)),
            );
        }

        list.notify_status(&ConnectionState::Connecting, &ConnectionState::Disconnected);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_remove() {
        let mut list = SubscriberList::default();
        list.add(1, Subscriber::new());
        list.add(2, Subscriber::new());
        assert!(list.remove(1));
        assert!(!list.remove(1));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_contained() {
        let hits = Arc::new(Mutex::new(0));
        let mut list = SubscriberList::default();
        list.add(
            1,
            Subscriber::new().on_warning(|_| panic!("subscriber bug")),
        );
        let counter = hits.clone();
        list.add(
            2,
            Subscriber::new().on_warning(move |_| *counter.lock() += 1),
        );

        list.notify_warning(&LinkWarning::UnparsedRecord {
            record: "boot".to_string(),
        });
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_channel_subscriber() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut list = SubscriberList::default();
        list.add(1, Subscriber::channel(tx));

        let record = Record::new(b"hum=40".to_vec());
        list.notify_record(&record);
        list.notify_status(&ConnectionState::Connected, &ConnectionState::Connecting);

        assert_eq!(rx.try_recv().unwrap(), LinkEvent::Record(record));
        assert_eq!(
            rx.try_recv().unwrap(),
            LinkEvent::Status {
                state: ConnectionState::Connected,
                previous: ConnectionState::Connecting,
            }
        );
    }
}
