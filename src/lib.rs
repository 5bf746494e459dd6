//! # SDM630 Poller - Batched Modbus Polling for Eastron Power Meters
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **Version:** 0.3.0
//! **License:** MIT
//!
//! Polls Eastron SDM630 three-phase meters over Modbus RTU (RS485) or Modbus
//! TCP and publishes their measurements as periodically refreshed snapshots.
//!
//! ## Features
//!
//! - **Batched reads**: adjacent registers coalesce into bounded FC04 requests
//! - **Fault isolation**: one failed batch never blanks unrelated values
//! - **Shared buses**: meters on one RS485 line share one link, serialized per cycle
//! - **Word order aware**: AB/BA float decoding with per-register precision
//! - **Three built-in catalogs**: `basic`, `basic_plus` and `full` (79 quantities)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sdm630_poller::{
//!     ConnectionParams, ConnectionPool, MeterLink, ModbusResult, PollEngine, PollSettings,
//!     RegisterSet, RegisterTier,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let params = ConnectionParams::tcp("192.168.1.50", 502);
//!     let pool = ConnectionPool::new();
//!     let link = pool
//!         .attach(&params.key(), || MeterLink::open(&params, Duration::from_secs(5)))
//!         .await?;
//!
//!     let engine = PollEngine::new(link, 1, RegisterSet::tier(RegisterTier::Basic), PollSettings::default())?;
//!     let snapshot = engine.poll_once().await?;
//!
//!     for (key, reading) in snapshot.iter() {
//!         println!("{key}: {:?}", reading.value());
//!     }
//!
//!     pool.detach(&params.key()).await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Stack-allocated PDU for FC04 requests and responses
pub mod pdu;

/// TCP and RTU transports behind the `ModbusTransport` trait
pub mod transport;

/// Connection parameters, sharing keys and the concrete meter link
pub mod connection;

/// Reference-counted pool of shared links
pub mod pool;

// ============================================================================
// Meter modules
// ============================================================================

/// SDM630 register catalog and tiers
pub mod catalog;

/// Word order handling for 32-bit register pairs
pub mod bytes;

/// Float decoding and rounding
pub mod codec;

/// Address batching into contiguous read groups
pub mod batcher;

/// Batch size and bus pacing limits
pub mod device_limits;

/// Published measurement snapshots
pub mod snapshot;

/// Poll cycle engine and periodic driver
pub mod engine;

// ============================================================================
// Application modules
// ============================================================================

/// YAML configuration
pub mod config;

/// Tracing subscriber setup
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use sdm630_poller::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Engine API ===
pub use engine::{run_poller, PollEngine, PollSettings, DEFAULT_REFRESH_INTERVAL_SECS};
pub use snapshot::{Reading, Snapshot};

// === Catalog and decoding ===
pub use batcher::{build_groups, AddressGroup};
pub use crate::bytes::{f32_to_regs, regs_to_bytes_4, regs_to_f32, WordOrder};
pub use catalog::{DeviceClass, RegisterDescriptor, RegisterSet, RegisterTier, StateClass};
pub use codec::{decode_f32, decode_group, round_to_precision};
pub use device_limits::DeviceLimits;

// === Links ===
pub use connection::{ConnectionKey, ConnectionParams, MeterLink, Parity, SerialParams, TcpParams};
pub use pool::{ConnectionPool, SharedConnection};
pub use transport::{ModbusTransport, TcpTransport};

#[cfg(feature = "rtu")]
pub use transport::RtuTransport;

// === Application ===
pub use config::{AppConfig, MeterConfig};
pub use logging::init_logging;

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_REGISTERS};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = connection::DEFAULT_TIMEOUT_SECS * 1000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = connection::DEFAULT_TCP_PORT;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("SDM630 Poller v{} - batched Modbus polling for Eastron meters", VERSION)
}
