use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::error::ModbusError;

pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_WRITE_COILS: u16 = 1968;

/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleCoils => 0x0F,
            FunctionCode::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Which data table the function addresses.
    pub fn table(self) -> RegisterTable {
        match self {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => RegisterTable::Coil,
            FunctionCode::ReadDiscreteInputs => RegisterTable::DiscreteInput,
            FunctionCode::ReadInputRegisters => RegisterTable::InputRegister,
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => RegisterTable::HoldingRegister,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTable {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterTable {
    /// Prefix used when naming a signal, e.g. `HR100`.
    pub fn signal_prefix(self) -> &'static str {
        match self {
            RegisterTable::Coil => "C",
            RegisterTable::DiscreteInput => "DI",
            RegisterTable::InputRegister => "IR",
            RegisterTable::HoldingRegister => "HR",
        }
    }

    pub fn signal_name(self, address: u16) -> String {
        format!("{}{}", self.signal_prefix(), address)
    }
}

/// Function-specific request fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Quantity(u16),
    Register(u16),
    Coil(bool),
    Registers(Vec<u16>),
    Coils(Vec<bool>),
}

/// Descriptor of a request kept alongside its pending entry; the decoder
/// needs it to know how many values to unpack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub unit_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub payload: RequestPayload,
}

impl ModbusRequest {
    pub fn read(function: FunctionCode, unit_id: u8, address: u16, quantity: u16) -> Self {
        Self {
            unit_id,
            function,
            address,
            payload: RequestPayload::Quantity(quantity),
        }
    }

    pub fn write_single_register(unit_id: u8, address: u16, value: u16) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteSingleRegister,
            address,
            payload: RequestPayload::Register(value),
        }
    }

    pub fn write_single_coil(unit_id: u8, address: u16, value: bool) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteSingleCoil,
            address,
            payload: RequestPayload::Coil(value),
        }
    }

    pub fn write_multiple_registers(unit_id: u8, address: u16, values: Vec<u16>) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteMultipleRegisters,
            address,
            payload: RequestPayload::Registers(values),
        }
    }

    pub fn write_multiple_coils(unit_id: u8, address: u16, values: Vec<bool>) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteMultipleCoils,
            address,
            payload: RequestPayload::Coils(values),
        }
    }

    /// Number of registers or bits the request touches.
    pub fn quantity(&self) -> u16 {
        match &self.payload {
            RequestPayload::Quantity(q) => *q,
            RequestPayload::Register(_) | RequestPayload::Coil(_) => 1,
            RequestPayload::Registers(values) => values.len() as u16,
            RequestPayload::Coils(values) => values.len() as u16,
        }
    }

    /// Checks address and quantity against the MODBUS application limits.
    pub fn validate(&self) -> Result<(), ModbusError> {
        let (limit, len) = match (&self.function, &self.payload) {
            (FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters, RequestPayload::Quantity(q)) => {
                (MAX_READ_REGISTERS, *q as usize)
            }
            (FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs, RequestPayload::Quantity(q)) => {
                (MAX_READ_BITS, *q as usize)
            }
            (FunctionCode::WriteSingleRegister, RequestPayload::Register(_))
            | (FunctionCode::WriteSingleCoil, RequestPayload::Coil(_)) => (1, 1),
            (FunctionCode::WriteMultipleRegisters, RequestPayload::Registers(values)) => {
                (MAX_WRITE_REGISTERS, values.len())
            }
            (FunctionCode::WriteMultipleCoils, RequestPayload::Coils(values)) => {
                (MAX_WRITE_COILS, values.len())
            }
            (function, payload) => {
                return Err(ModbusError::Validation(format!(
                    "payload {:?} does not fit function {}",
                    payload, function
                )))
            }
        };

        if len == 0 || len > limit as usize {
            return Err(ModbusError::Validation(format!(
                "quantity {} out of range 1-{} for {}",
                len, limit, self.function
            )));
        }

        if self.address as usize + len > 0x1_0000 {
            return Err(ModbusError::Validation(format!(
                "address range {}+{} exceeds 65535",
                self.address, len
            )));
        }

        Ok(())
    }
}

/// Typed values carried by a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    /// Echo of a write: the address plus the written value (single writes)
    /// or the written quantity (multiple writes).
    WriteAck { address: u16, value: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Exception(u8),
    Data(ResponseData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Raw function code as received, exception flag included.
    pub function_code: u8,
    pub body: ResponseBody,
}

impl ModbusResponse {
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Turns an exception response into `ProtocolException`.
    pub fn into_result(self) -> Result<ResponseData, ModbusError> {
        match self.body {
            ResponseBody::Data(data) => Ok(data),
            ResponseBody::Exception(code) => Err(ModbusError::ProtocolException {
                function: self.function_code & !EXCEPTION_FLAG,
                code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_codes_roundtrip_through_u8() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            assert_eq!(FunctionCode::from_code(code).map(|f| f.code()), Some(code));
        }
        assert_eq!(FunctionCode::from_code(0x2B), None);
    }

    #[test]
    fn test_register_read_limits() {
        let ok = ModbusRequest::read(FunctionCode::ReadHoldingRegisters, 1, 0, 125);
        assert!(ok.validate().is_ok());

        let zero = ModbusRequest::read(FunctionCode::ReadHoldingRegisters, 1, 0, 0);
        assert!(matches!(zero.validate(), Err(ModbusError::Validation(_))));

        let too_many = ModbusRequest::read(FunctionCode::ReadInputRegisters, 1, 0, 126);
        assert!(matches!(too_many.validate(), Err(ModbusError::Validation(_))));
    }

    #[test]
    fn test_coil_read_limits() {
        assert!(ModbusRequest::read(FunctionCode::ReadCoils, 1, 0, 2000).validate().is_ok());
        assert!(ModbusRequest::read(FunctionCode::ReadCoils, 1, 0, 2001).validate().is_err());
    }

    #[test]
    fn test_address_overflow_rejected() {
        let req = ModbusRequest::read(FunctionCode::ReadHoldingRegisters, 1, 65535, 2);
        assert!(req.validate().is_err());
        let edge = ModbusRequest::read(FunctionCode::ReadHoldingRegisters, 1, 65535, 1);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_mismatched_payload_rejected() {
        let req = ModbusRequest {
            unit_id: 1,
            function: FunctionCode::WriteSingleRegister,
            address: 0,
            payload: RequestPayload::Coils(vec![true]),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_exception_response_into_result() {
        let response = ModbusResponse {
            transaction_id: 7,
            unit_id: 1,
            function_code: 0x83,
            body: ResponseBody::Exception(2),
        };
        assert!(response.is_exception());
        assert_eq!(
            response.into_result(),
            Err(ModbusError::ProtocolException { function: 0x03, code: 2 })
        );
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(RegisterTable::HoldingRegister.signal_name(100), "HR100");
        assert_eq!(FunctionCode::ReadCoils.table().signal_name(3), "C3");
    }
}
