use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Sun2000Error {
    /// Socket-level failure: refused, unreachable, reset.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Exception reported by the device itself.
    #[error("Modbus exception: {0}")]
    ModbusException(ModbusExceptionCode),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Cannot decode {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("Store error: {0}")]
    Store(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Sun2000Error {
    pub fn exception_code(&self) -> Option<ModbusExceptionCode> {
        match self {
            Sun2000Error::ModbusException(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_device_busy(&self) -> bool {
        self.exception_code() == Some(ModbusExceptionCode::SlaveDeviceBusy)
    }

    pub fn is_host_unreachable(&self) -> bool {
        matches!(self, Sun2000Error::Io(e) if e.kind() == ErrorKind::HostUnreachable)
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Sun2000Error::Io(e) if e.kind() == ErrorKind::ConnectionRefused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    Unknown(u8),
}

impl fmt::Display for ModbusExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:02X}h)", self.description(), self.code())
    }
}

impl ModbusExceptionCode {
    pub const fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ModbusExceptionCode::IllegalFunction,
            0x02 => ModbusExceptionCode::IllegalDataAddress,
            0x03 => ModbusExceptionCode::IllegalDataValue,
            0x04 => ModbusExceptionCode::SlaveDeviceFailure,
            0x05 => ModbusExceptionCode::Acknowledge,
            0x06 => ModbusExceptionCode::SlaveDeviceBusy,
            0x08 => ModbusExceptionCode::MemoryParityError,
            0x0A => ModbusExceptionCode::GatewayPathUnavailable,
            0x0B => ModbusExceptionCode::GatewayTargetDeviceFailedToRespond,
            other => ModbusExceptionCode::Unknown(other),
        }
    }

    /// Wording of the exception as logged by the inverter tools.
    pub const fn description(&self) -> &'static str {
        match self {
            ModbusExceptionCode::IllegalFunction => "Illegal function",
            ModbusExceptionCode::IllegalDataAddress => "Illegal data address",
            ModbusExceptionCode::IllegalDataValue => "Illegal data value",
            ModbusExceptionCode::SlaveDeviceFailure => "Slave device failure",
            ModbusExceptionCode::Acknowledge => "Acknowledge",
            ModbusExceptionCode::SlaveDeviceBusy => "Slave device busy",
            ModbusExceptionCode::MemoryParityError => "Memory parity error",
            ModbusExceptionCode::GatewayPathUnavailable => "Gateway path unavailable",
            ModbusExceptionCode::GatewayTargetDeviceFailedToRespond => {
                "Gateway target device failed to respond"
            }
            ModbusExceptionCode::Unknown(_) => "Unknown exception",
        }
    }

    pub const fn code(&self) -> u8 {
        match self {
            ModbusExceptionCode::IllegalFunction => 0x01,
            ModbusExceptionCode::IllegalDataAddress => 0x02,
            ModbusExceptionCode::IllegalDataValue => 0x03,
            ModbusExceptionCode::SlaveDeviceFailure => 0x04,
            ModbusExceptionCode::Acknowledge => 0x05,
            ModbusExceptionCode::SlaveDeviceBusy => 0x06,
            ModbusExceptionCode::MemoryParityError => 0x08,
            ModbusExceptionCode::GatewayPathUnavailable => 0x0A,
            ModbusExceptionCode::GatewayTargetDeviceFailedToRespond => 0x0B,
            ModbusExceptionCode::Unknown(code) => *code,
        }
    }
}

pub type Result<T> = std::result::Result<T, Sun2000Error>;
