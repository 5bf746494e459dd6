//! Modbus PDU for input register reads
//!
//! Fixed-size stack buffer shared by the TCP and RTU framings. Only FC04
//! (Read Input Registers) is built; responses are validated against the
//! request that produced them.

use tracing::trace;

use crate::constants::{EXCEPTION_FLAG, FC_READ_INPUT_REGISTERS, MAX_PDU_SIZE, MAX_READ_REGISTERS};
use crate::error::{ModbusError, ModbusResult};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        let [hi, lo] = value.to_be_bytes();
        self.push(hi)?;
        self.push(lo)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Parse an FC04 response carrying exactly `quantity` registers.
    ///
    /// Exception responses become [`ModbusError::Exception`]; a byte count that
    /// does not match the request is rejected rather than partially decoded,
    /// because a short payload would shift every later value in the group.
    pub fn parse_input_registers(&self, quantity: u16) -> ModbusResult<Vec<u16>> {
        let data = self.as_slice();
        let fc = self
            .function_code()
            .ok_or_else(|| ModbusError::protocol("Empty response PDU"))?;

        if self.is_exception() {
            let code = self
                .exception_code()
                .ok_or_else(|| ModbusError::protocol("Truncated exception response"))?;
            return Err(ModbusError::exception(fc, code));
        }

        if fc != FC_READ_INPUT_REGISTERS {
            return Err(ModbusError::protocol(format!(
                "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
                FC_READ_INPUT_REGISTERS, fc
            )));
        }

        if data.len() < 2 {
            return Err(ModbusError::protocol("Response PDU missing byte count"));
        }

        let byte_count = data[1] as usize;
        let expected = quantity as usize * 2;
        if byte_count != expected || data.len() != 2 + byte_count {
            return Err(ModbusError::invalid_data(format!(
                "Byte count mismatch: expected {} bytes, header says {}, payload has {}",
                expected,
                byte_count,
                data.len() - 2
            )));
        }

        let registers: Vec<u16> = data[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        trace!("FC04 response: {} registers", registers.len());
        Ok(registers)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }

    /// Build a Read Input Registers (FC04) request
    pub fn build_read_input_request(start_address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register quantity {} (must be 1-{})",
                quantity, MAX_READ_REGISTERS
            )));
        }
        if u32::from(start_address) + u32::from(quantity) > 0x1_0000 {
            return Err(ModbusError::invalid_data(format!(
                "Register range {}+{} exceeds address space",
                start_address, quantity
            )));
        }
        Ok(PduBuilder::new()
            .function_code(FC_READ_INPUT_REGISTERS)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }
}
