use thiserror::Error;

/// Every failure the client can surface.
///
/// The enum is `Clone` because a single disconnect fails every pending
/// request with the same cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    #[error("Invalid endpoint configuration: {0}")]
    ConfigValidation(String),

    #[error("Connection attempt timed out after {0} ms")]
    ConnectionTimeout(u64),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Failed to connect after {attempts} attempts: {last}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        last: Box<ModbusError>,
    },

    #[error("Not connected to PLC")]
    NotConnected,

    #[error("Request timeout (transaction {transaction_id})")]
    RequestTimeout { transaction_id: u16 },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("MODBUS exception {code} ({}) for function 0x{function:02X}", exception_label(.code))]
    ProtocolException { function: u8, code: u8 },

    #[error("Malformed frame: {0}")]
    FrameParse(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("No free transaction id")]
    TransactionIdExhausted,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ModbusError {
    /// Exception code carried by a device exception response, if any.
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ModbusError::ProtocolException { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ModbusError::RequestTimeout { .. } | ModbusError::ConnectionTimeout(_)
        )
    }
}

fn exception_label(code: &u8) -> &'static str {
    exception_name(*code)
}

/// Human-readable name of a MODBUS exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed To Respond",
        _ => "Unknown Exception",
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::Serialization(format!("TOML error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::Serialization(format!("TOML error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ModbusError::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ModbusError::ConnectionLost,
            _ => ModbusError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display_names_code() {
        let err = ModbusError::ProtocolException { function: 0x03, code: 2 };
        assert_eq!(err.exception_code(), Some(2));
        assert!(err.to_string().contains("Illegal Data Address"));
        assert!(err.to_string().contains("0x03"));
    }

    #[test]
    fn test_refused_io_error_maps_to_refused() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(ModbusError::from(io), ModbusError::ConnectionRefused(_)));
    }
}
