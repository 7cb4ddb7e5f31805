use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Number(u16),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Bool(on) => write!(f, "{}", on),
            SignalValue::Number(value) => write!(f, "{}", value),
        }
    }
}

impl From<u16> for SignalValue {
    fn from(value: u16) -> Self {
        SignalValue::Number(value)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Quality::Good => "good",
            Quality::Bad => "bad",
            Quality::Uncertain => "uncertain",
        };
        f.write_str(label)
    }
}

/// One value read from or written to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDataPoint {
    pub timestamp: DateTime<Utc>,
    pub address: u16,
    pub value: SignalValue,
    pub quality: Quality,
    pub device_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub timestamp: DateTime<Utc>,
    pub device_name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlcEvent {
    ConnectionStatus(ConnectionStatus),
    Data(SignalDataPoint),
    Write(SignalDataPoint),
}

impl PlcEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlcEvent::ConnectionStatus(status) if status.connected => EventKind::Connected,
            PlcEvent::ConnectionStatus(_) => EventKind::Disconnected,
            PlcEvent::Data(_) => EventKind::Data,
            PlcEvent::Write(_) => EventKind::Write,
        }
    }

    pub fn data_point(&self) -> Option<&SignalDataPoint> {
        match self {
            PlcEvent::Data(point) | PlcEvent::Write(point) => Some(point),
            PlcEvent::ConnectionStatus(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Data,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(Vec<EventKind>),
}

impl EventFilter {
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        EventFilter::Only(kinds.into_iter().collect())
    }

    /// Connection transitions only.
    pub fn status() -> Self {
        Self::only([EventKind::Connected, EventKind::Disconnected])
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(kinds) => kinds.contains(&kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = PlcEvent::Data(SignalDataPoint {
            timestamp: Utc::now(),
            address: 100,
            value: SignalValue::Number(42),
            quality: Quality::Good,
            device_name: "press-1".to_string(),
            signal_name: Some("HR100".to_string()),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["value"], 42);
        assert_eq!(json["quality"], "good");
        assert_eq!(json["signal_name"], "HR100");
    }

    #[test]
    fn test_status_kind_follows_flag() {
        let status = |connected| {
            PlcEvent::ConnectionStatus(ConnectionStatus {
                timestamp: Utc::now(),
                device_name: "x".to_string(),
                connected,
            })
        };
        assert_eq!(status(true).kind(), EventKind::Connected);
        assert_eq!(status(false).kind(), EventKind::Disconnected);
        assert!(EventFilter::status().matches(EventKind::Disconnected));
        assert!(!EventFilter::status().matches(EventKind::Data));
    }
}
