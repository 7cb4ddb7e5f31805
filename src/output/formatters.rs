use chrono::Utc;

use crate::services::events::{PlcEvent, SignalDataPoint};

/// Renders broadcast events as text for a `DataSender`.
pub trait DataFormatter: Send + Sync {
    fn format_event(&self, event: &PlcEvent) -> String;
    fn format_header(&self) -> String;

    fn format_batch(&self, events: &[PlcEvent]) -> String {
        events
            .iter()
            .map(|event| self.format_event(event))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct ConsoleFormatter;

impl ConsoleFormatter {
    fn format_point(icon: &str, verb: &str, point: &SignalDataPoint) -> String {
        format!(
            "{} [{}] {} {} {} = {} ({})",
            icon,
            point.timestamp.format("%H:%M:%S%.3f"),
            point.device_name,
            verb,
            point.signal_name.as_deref().unwrap_or("-"),
            point.value,
            point.quality
        )
    }
}

impl DataFormatter for ConsoleFormatter {
    fn format_event(&self, event: &PlcEvent) -> String {
        match event {
            PlcEvent::ConnectionStatus(status) => format!(
                "{} [{}] {} {}",
                if status.connected { "🟢" } else { "🔴" },
                status.timestamp.format("%H:%M:%S%.3f"),
                status.device_name,
                if status.connected { "connected" } else { "disconnected" }
            ),
            PlcEvent::Data(point) => Self::format_point("📊", "read", point),
            PlcEvent::Write(point) => Self::format_point("📝", "wrote", point),
        }
    }

    fn format_header(&self) -> String {
        format!("🚀 PLC Link - {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// One JSON document per event, tagged by `type`.
pub struct JsonFormatter;

impl DataFormatter for JsonFormatter {
    fn format_event(&self, event: &PlcEvent) -> String {
        serde_json::to_string(event).unwrap_or_default()
    }

    fn format_batch(&self, events: &[PlcEvent]) -> String {
        serde_json::to_string_pretty(events).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new()
    }
}

pub struct CsvFormatter;

impl DataFormatter for CsvFormatter {
    fn format_event(&self, event: &PlcEvent) -> String {
        match event {
            PlcEvent::ConnectionStatus(status) => format!(
                "{},{},{},,,{},",
                status.timestamp.to_rfc3339(),
                status.device_name,
                if status.connected { "connected" } else { "disconnected" },
                status.connected
            ),
            PlcEvent::Data(point) | PlcEvent::Write(point) => format!(
                "{},{},{},{},{},{},{}",
                point.timestamp.to_rfc3339(),
                point.device_name,
                if matches!(event, PlcEvent::Data(_)) { "data" } else { "write" },
                point.signal_name.as_deref().unwrap_or(""),
                point.address,
                point.value,
                point.quality
            ),
        }
    }

    fn format_header(&self) -> String {
        "Timestamp,Device,Type,Signal,Address,Value,Quality".to_string()
    }
}
