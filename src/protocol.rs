/// Modbus protocol definitions and request decoding
///
/// This module holds the function and exception code tables and turns the
/// protocol data unit of an incoming frame into a typed [`Request`]. All
/// shape validation happens here so the dispatcher only ever sees
/// well-formed requests.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data_pool::Region;
use crate::error::{ServerError, ServerResult};
use crate::{MAX_COILS_PER_REQUEST, MAX_REGISTERS_PER_REQUEST};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Coil value encoding for write single coil
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes served by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ServerResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ServerError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Region the function operates on
    pub fn region(self) -> Region {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => Region::Coil,
            ModbusFunction::ReadDiscreteInputs => Region::DiscreteInput,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => Region::HoldingRegister,
            ModbusFunction::ReadInputRegisters => Region::InputRegister,
        }
    }

    /// Largest quantity accepted in one request
    pub fn max_quantity(self) -> u16 {
        match self.region() {
            Region::Coil | Region::DiscreteInput => MAX_COILS_PER_REQUEST,
            Region::HoldingRegister | Region::InputRegister => MAX_REGISTERS_PER_REQUEST,
        }
    }

    /// Whether requests carry a fixed 4-byte payload after the function code
    pub fn has_fixed_length(self) -> bool {
        !matches!(self,
            ModbusFunction::WriteMultipleCoils |
            ModbusFunction::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Exception codes emitted by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// A decoded request
///
/// One variant per served function code, so the dispatcher's `match` is
/// exhaustive. Multi-register payloads stay as raw big-endian bytes because
/// that is how register memory stores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, quantity: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, quantity: u16, values: Vec<u8> },
}

impl Request {
    /// Decode the payload that follows the function code
    ///
    /// Errors carry the exception they should be answered with:
    /// unknown function codes give `InvalidFunction`, a range past the
    /// 16-bit address space gives `InvalidAddress`, and every payload shape
    /// or quantity problem gives `InvalidData`.
    pub fn parse(function_code: u8, payload: &[u8]) -> ServerResult<Self> {
        let function = ModbusFunction::from_u8(function_code)?;

        if payload.len() < 4 {
            return Err(ServerError::invalid_data(format!(
                "{} payload too short: {} bytes",
                function,
                payload.len()
            )));
        }
        let address = u16::from_be_bytes([payload[0], payload[1]]);
        let word = u16::from_be_bytes([payload[2], payload[3]]);

        if function.has_fixed_length() && payload.len() != 4 {
            return Err(ServerError::invalid_data(format!(
                "{} payload must be 4 bytes, got {}",
                function,
                payload.len()
            )));
        }

        let request = match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                check_quantity(function, address, word)?;
                match function {
                    ModbusFunction::ReadCoils => Request::ReadCoils { address, quantity: word },
                    ModbusFunction::ReadDiscreteInputs => Request::ReadDiscreteInputs { address, quantity: word },
                    ModbusFunction::ReadHoldingRegisters => Request::ReadHoldingRegisters { address, quantity: word },
                    _ => Request::ReadInputRegisters { address, quantity: word },
                }
            }
            ModbusFunction::WriteSingleCoil => {
                let value = match word {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ServerError::invalid_data(format!(
                            "Invalid coil value 0x{:04X}",
                            other
                        )))
                    }
                };
                Request::WriteSingleCoil { address, value }
            }
            ModbusFunction::WriteSingleRegister => Request::WriteSingleRegister { address, value: word },
            ModbusFunction::WriteMultipleCoils => {
                check_quantity(function, address, word)?;
                let data = multi_write_data(function, payload, (word as usize + 7) / 8)?;
                Request::WriteMultipleCoils {
                    address,
                    quantity: word,
                    values: data_utils::unpack_bits(data, word as usize),
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                check_quantity(function, address, word)?;
                let data = multi_write_data(function, payload, word as usize * 2)?;
                Request::WriteMultipleRegisters {
                    address,
                    quantity: word,
                    values: data.to_vec(),
                }
            }
        };

        Ok(request)
    }

    /// Function code of this request
    pub fn function(&self) -> ModbusFunction {
        match self {
            Request::ReadCoils { .. } => ModbusFunction::ReadCoils,
            Request::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
        }
    }

    /// Starting address of this request
    pub fn address(&self) -> ModbusAddress {
        match self {
            Request::ReadCoils { address, .. }
            | Request::ReadDiscreteInputs { address, .. }
            | Request::ReadHoldingRegisters { address, .. }
            | Request::ReadInputRegisters { address, .. }
            | Request::WriteSingleCoil { address, .. }
            | Request::WriteSingleRegister { address, .. }
            | Request::WriteMultipleCoils { address, .. }
            | Request::WriteMultipleRegisters { address, .. } => *address,
        }
    }
}

fn check_quantity(function: ModbusFunction, address: u16, quantity: u16) -> ServerResult<()> {
    let end = address as usize + quantity as usize;
    if end > crate::DATA_POOL_LENGTH {
        return Err(ServerError::invalid_address(
            address as usize,
            quantity as usize,
            crate::DATA_POOL_LENGTH,
        ));
    }
    if quantity == 0 || quantity > function.max_quantity() {
        return Err(ServerError::invalid_data(format!(
            "Invalid quantity {} for {} (must be 1-{})",
            quantity,
            function,
            function.max_quantity()
        )));
    }
    Ok(())
}

fn multi_write_data(function: ModbusFunction, payload: &[u8], expected: usize) -> ServerResult<&[u8]> {
    let byte_count = payload.get(4).copied().ok_or_else(|| {
        ServerError::invalid_data(format!("{} missing byte count", function))
    })? as usize;
    let data = &payload[5..];
    if byte_count != expected || data.len() != byte_count {
        return Err(ServerError::invalid_data(format!(
            "{} byte count {} does not match quantity ({} expected, {} present)",
            function,
            byte_count,
            expected,
            data.len()
        )));
    }
    Ok(data)
}

/// Bit and word packing helpers
pub mod data_utils {
    /// Pack boolean values into bytes, least significant bit first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values, least significant bit first
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).map_or(false, |byte| byte & (1 << (i % 8)) != 0))
            .collect()
    }

    /// Convert bytes to register values (big-endian), ignoring a trailing odd byte
    pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        registers.iter().flat_map(|r| r.to_be_bytes()).collect()
    }
}
