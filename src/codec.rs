//! # Register Decoder
//!
//! Turns raw FC04 register pairs into rounded measurements.
//!
//! ## Contract
//!
//! - `AB`: `reg1` is the high word; `BA`: the words are swapped first.
//! - The 4 bytes are read as one big-endian IEEE-754 single.
//! - A NaN pattern (any exponent-all-ones, non-zero mantissa) becomes
//!   [`Reading::Unavailable`]; NaN never reaches a snapshot.
//! - Rounding is **half away from zero** at `precision` decimal places,
//!   applied to the exact `f64` widening of the float. Only values whose
//!   binary form sits exactly on a half step (0.125, 2.5, ...) are affected
//!   by the choice of rounding mode.
//!
//! ```rust
//! use sdm630_poller::{decode_f32, Reading, WordOrder};
//!
//! assert_eq!(decode_f32(0x4366, 0x8000, WordOrder::AB, 2), Reading::Value(230.5));
//! assert_eq!(decode_f32(0x7FC0, 0x0000, WordOrder::AB, 2), Reading::Unavailable);
//! ```

use crate::bytes::{regs_to_f32, WordOrder};
use crate::catalog::RegisterDescriptor;
use crate::snapshot::Reading;

/// Precision above which rounding is skipped; f64 cannot represent more
/// significant digits of an f32 anyway.
const MAX_ROUNDING_PRECISION: u8 = 15;

/// Decode one register pair.
pub fn decode_f32(reg1: u16, reg2: u16, order: WordOrder, precision: u8) -> Reading {
    let value = regs_to_f32(reg1, reg2, order);
    if value.is_nan() {
        return Reading::Unavailable;
    }
    Reading::Value(round_to_precision(f64::from(value), precision))
}

/// Round half away from zero to `precision` decimal places.
pub fn round_to_precision(value: f64, precision: u8) -> f64 {
    if !value.is_finite() || precision >= MAX_ROUNDING_PRECISION {
        return value;
    }
    let factor = 10f64.powi(i32::from(precision));
    (value * factor).round() / factor
}

/// Decode the registers of one batch against its descriptors, in order.
///
/// Descriptor `i` uses registers `2i` and `2i + 1`. If fewer registers than
/// expected are supplied, decoding stops at the last complete pair and the
/// remaining descriptors are left out.
pub fn decode_group<'a>(
    registers: &[u16],
    descriptors: impl IntoIterator<Item = &'a RegisterDescriptor>,
) -> Vec<(&'a str, Reading)> {
    registers
        .chunks_exact(2)
        .zip(descriptors)
        .map(|(pair, descriptor)| {
            (
                descriptor.key.as_str(),
                decode_f32(pair[0], pair[1], descriptor.word_order, descriptor.precision),
            )
        })
        .collect()
}
