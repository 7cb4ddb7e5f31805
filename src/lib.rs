//! MODBUS/TCP client core for talking to a single PLC.
//!
//! One pipelined TCP connection per endpoint, transaction-id correlation of
//! responses, bounded connect retries with unbounded runtime reconnects, an
//! optional keepalive probe, and a subscription feed of every value read or
//! written plus connection transitions.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::EndpointConfig;
pub use modbus::{ConnectionState, ModbusClientTrait, PlcClient};
pub use output::{ConsoleFormatter, CsvFormatter, DataFormatter, DataSender, JsonFormatter};
pub use services::{EventFilter, EventKind, PlcEvent, SignalDataPoint, Subscription};
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
