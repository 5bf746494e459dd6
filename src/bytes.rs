//! # Word Order Handling
//!
//! The SDM630 transmits every measurement as an IEEE-754 float split across
//! two 16-bit input registers. Bytes inside each register are always
//! big-endian; only the order of the two words differs between firmware
//! register blocks.
//!
//! For the float `0x43668000` (230.5):
//! - `AB`: registers `[0x4366, 0x8000]` (high word first)
//! - `BA`: registers `[0x8000, 0x4366]` (low word first)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModbusError;

/// Order of the two 16-bit words that make up one 32-bit value.
///
/// # Example
///
/// ```rust
/// use sdm630_poller::WordOrder;
///
/// let order: WordOrder = "BA".parse().unwrap();
/// assert_eq!(order, WordOrder::BA);
/// assert!(order.has_word_swap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WordOrder {
    /// High word first (big-endian word pair)
    #[default]
    AB,
    /// Low word first
    BA,
}

impl WordOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AB => "AB",
            Self::BA => "BA",
        }
    }

    #[inline]
    pub fn has_word_swap(&self) -> bool {
        matches!(self, Self::BA)
    }
}

impl FromStr for WordOrder {
    type Err = ModbusError;

    /// Unknown tags are an error, never a silent default: a wrong tag means
    /// the register catalog itself is wrong.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AB" => Ok(Self::AB),
            "BA" => Ok(Self::BA),
            other => Err(ModbusError::decode(format!(
                "Unknown word order '{other}' (expected AB or BA)"
            ))),
        }
    }
}

impl TryFrom<String> for WordOrder {
    type Error = ModbusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WordOrder> for String {
    fn from(order: WordOrder) -> Self {
        order.as_str().to_string()
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Register / Byte Conversions
// ============================================================================

/// Convert 2 registers, in the order the transport returned them, to the 4
/// big-endian bytes of the value.
///
/// ```rust
/// use sdm630_poller::{regs_to_bytes_4, WordOrder};
///
/// assert_eq!(regs_to_bytes_4(0x1234, 0x5678, WordOrder::AB), [0x12, 0x34, 0x56, 0x78]);
/// assert_eq!(regs_to_bytes_4(0x1234, 0x5678, WordOrder::BA), [0x56, 0x78, 0x12, 0x34]);
/// ```
#[inline]
pub fn regs_to_bytes_4(reg1: u16, reg2: u16, order: WordOrder) -> [u8; 4] {
    let (high, low) = match order {
        WordOrder::AB => (reg1, reg2),
        WordOrder::BA => (reg2, reg1),
    };
    let [h0, h1] = high.to_be_bytes();
    let [l0, l1] = low.to_be_bytes();
    [h0, h1, l0, l1]
}

/// Convert 2 registers to f32.
#[inline]
pub fn regs_to_f32(reg1: u16, reg2: u16, order: WordOrder) -> f32 {
    f32::from_be_bytes(regs_to_bytes_4(reg1, reg2, order))
}

/// Split an f32 into the 2 registers a meter with `order` would send.
#[inline]
pub fn f32_to_regs(value: f32, order: WordOrder) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    let high = u16::from_be_bytes([bytes[0], bytes[1]]);
    let low = u16::from_be_bytes([bytes[2], bytes[3]]);
    match order {
        WordOrder::AB => [high, low],
        WordOrder::BA => [low, high],
    }
}
