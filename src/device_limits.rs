//! # Device Limits Configuration
//!
//! Bus pacing and batch limits for one meter.
//!
//! ## Why the defaults are small
//!
//! - **Max registers per read**: FC04 allows 125, but SDM630 RS485 gateways
//!   are known to drop long frames; 4 registers (two floats) per request is
//!   the deployed default.
//! - **Inter-request delay**: the meter needs quiet time on a half-duplex bus
//!   before answering the next request.
//! - **Error backoff**: after a failed read the bus is left alone briefly
//!   before reconnecting.

use std::time::Duration;

use crate::constants::{MAX_READ_REGISTERS, REGISTERS_PER_FLOAT};
use crate::error::{ModbusError, ModbusResult};

/// Default maximum registers per read operation.
pub const DEFAULT_MAX_READ_REGISTERS: u16 = 4;

/// Default delay after every batch read, in milliseconds.
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 100;

/// Default pause after a failed batch read, in milliseconds.
pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 500;

/// Device-specific batching and pacing limits.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use sdm630_poller::DeviceLimits;
///
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(8)
///     .with_inter_request_delay_ms(50);
///
/// assert_eq!(limits.max_read_registers, 8);
/// assert_eq!(limits.inter_request_delay, Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum registers per FC04 request (2..=125).
    pub max_read_registers: u16,
    /// Sleep after every batch, successful or not.
    pub inter_request_delay: Duration,
    /// Sleep after a failed batch, before the reconnect attempt.
    pub error_backoff: Duration,
}

impl DeviceLimits {
    /// Create new device limits with the SDM630 defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum read registers.
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count;
        self
    }

    /// Set inter-request delay in milliseconds.
    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay = Duration::from_millis(delay_ms);
        self
    }

    /// Set error backoff in milliseconds.
    pub fn with_error_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.error_backoff = Duration::from_millis(backoff_ms);
        self
    }

    /// Check if a read request is within limits.
    pub fn is_read_within_limits(&self, register_count: u16) -> bool {
        register_count <= self.max_read_registers
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if !(REGISTERS_PER_FLOAT..=MAX_READ_REGISTERS).contains(&self.max_read_registers) {
            return Err(ModbusError::configuration(format!(
                "max_read_registers must be {}-{}, got {}",
                REGISTERS_PER_FLOAT, MAX_READ_REGISTERS, self.max_read_registers
            )));
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            inter_request_delay: Duration::from_millis(DEFAULT_INTER_REQUEST_DELAY_MS),
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
