pub mod client;
pub mod codec;
pub mod connection;
pub mod protocol;
pub mod transaction;

pub use client::{ModbusClientTrait, PlcClient};
pub use codec::{FrameBuffer, MbapHeader};
pub use connection::{ConnectionManager, ConnectionState};
pub use protocol::{FunctionCode, ModbusRequest, ModbusResponse, RegisterTable, ResponseData};
pub use transaction::{PendingHandle, TransactionTable};
