//! Best-effort fan-out of live values and connection transitions.
//!
//! Subscribers are either bounded channels or inline callbacks. Publishing
//! never waits: a full channel loses the event, a closed one is flagged and
//! removed on a later registry pass.

use chrono::Utc;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::events::{
    ConnectionStatus, EventFilter, PlcEvent, Quality, SignalDataPoint, SignalValue,
};
use crate::modbus::protocol::{ModbusRequest, RequestPayload, ResponseData};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

type Callback = Arc<dyn Fn(&PlcEvent) + Send + Sync>;

enum Sink {
    Channel(mpsc::Sender<PlcEvent>),
    Callback(Callback),
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    sink: Sink,
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<Vec<Subscriber>>,
    needs_prune: AtomicBool,
    dropped: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    fn prune_if_needed(&self) {
        if !self.needs_prune.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| match &s.sink {
            Sink::Channel(tx) => !tx.is_closed(),
            Sink::Callback(_) => true,
        });
        let pruned = before - subscribers.len();
        if pruned > 0 {
            debug!("🧹 Pruned {} closed subscriber(s)", pruned);
        }
    }
}

/// Receiving end of a channel subscription.
///
/// Dropping it detaches the subscriber; the registry notices on a later
/// publish.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<PlcEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<PlcEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PlcEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    device_name: Arc<str>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(device_name: &str, buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            device_name: Arc::from(device_name),
            buffer: buffer.max(1),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Registers a channel subscriber holding up to `buffer` undelivered events.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.registry.prune_if_needed();
        let (tx, receiver) = mpsc::channel(self.buffer);
        let id = SubscriptionId::new();
        self.registry.lock().push(Subscriber {
            id,
            filter,
            sink: Sink::Channel(tx),
        });
        info!("📡 Subscriber {} attached to '{}'", id, self.device_name);
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Registers a callback invoked inline on the publishing task. The
    /// callback must not block.
    pub fn subscribe_fn<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&PlcEvent) + Send + Sync + 'static,
    {
        self.registry.prune_if_needed();
        let id = SubscriptionId::new();
        self.registry.lock().push(Subscriber {
            id,
            filter,
            sink: Sink::Callback(Arc::new(callback)),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.prune_if_needed();
        self.registry.lock().len()
    }

    /// Events lost to full subscriber queues since creation.
    pub fn dropped_events(&self) -> u64 {
        self.registry.dropped.load(Ordering::Relaxed)
    }

    pub fn publish(&self, event: PlcEvent) {
        self.registry.prune_if_needed();
        let kind = event.kind();
        let mut callbacks: Vec<Callback> = Vec::new();

        {
            let subscribers = self.registry.lock();
            for subscriber in subscribers.iter().filter(|s| s.filter.matches(kind)) {
                match &subscriber.sink {
                    Sink::Channel(tx) => match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.registry.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("Subscriber {} is full, dropping {:?} event", subscriber.id, kind);
                        }
                        Err(TrySendError::Closed(_)) => {
                            self.registry.needs_prune.store(true, Ordering::Release);
                        }
                    },
                    Sink::Callback(callback) => callbacks.push(Arc::clone(callback)),
                }
            }
        }

        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn publish_status(&self, connected: bool) {
        self.publish(PlcEvent::ConnectionStatus(ConnectionStatus {
            timestamp: Utc::now(),
            device_name: self.device_name.to_string(),
            connected,
        }));
    }

    /// One `data` event per value, at consecutive addresses from the
    /// request's start address.
    pub fn publish_read(&self, request: &ModbusRequest, data: &ResponseData) {
        let values: Vec<SignalValue> = match data {
            ResponseData::Registers(values) => values.iter().map(|v| SignalValue::Number(*v)).collect(),
            ResponseData::Bits(values) => values.iter().map(|v| SignalValue::Bool(*v)).collect(),
            ResponseData::WriteAck { .. } => return,
        };

        for point in self.points(request, values) {
            self.publish(PlcEvent::Data(point));
        }
    }

    /// One `write` event per written value.
    pub fn publish_write(&self, request: &ModbusRequest) {
        let values: Vec<SignalValue> = match &request.payload {
            RequestPayload::Register(value) => vec![SignalValue::Number(*value)],
            RequestPayload::Coil(on) => vec![SignalValue::Bool(*on)],
            RequestPayload::Registers(values) => values.iter().map(|v| SignalValue::Number(*v)).collect(),
            RequestPayload::Coils(values) => values.iter().map(|v| SignalValue::Bool(*v)).collect(),
            RequestPayload::Quantity(_) => return,
        };

        for point in self.points(request, values) {
            self.publish(PlcEvent::Write(point));
        }
    }

    fn points(&self, request: &ModbusRequest, values: Vec<SignalValue>) -> Vec<SignalDataPoint> {
        let table = request.function.table();
        let timestamp = Utc::now();
        values
            .into_iter()
            .enumerate()
            .map(|(offset, value)| {
                let address = request.address.wrapping_add(offset as u16);
                SignalDataPoint {
                    timestamp,
                    address,
                    value,
                    quality: Quality::Good,
                    device_name: self.device_name.to_string(),
                    signal_name: Some(table.signal_name(address)),
                }
            })
            .collect()
    }
}
