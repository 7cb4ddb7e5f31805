pub mod broadcaster;
pub mod events;

pub use broadcaster::{Broadcaster, Subscription, SubscriptionId, DEFAULT_EVENT_BUFFER};
pub use events::{ConnectionStatus, EventFilter, EventKind, PlcEvent, Quality, SignalDataPoint, SignalValue};
