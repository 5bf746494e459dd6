//! Connection parameters and the concrete meter link
//!
//! Meters are reached either over an RS485 serial line or through a Modbus
//! TCP gateway. Several meters on the same bus share one link; the
//! [`ConnectionKey`] decides which meters are "on the same bus".

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::transport::{ModbusTransport, TcpTransport};

#[cfg(feature = "rtu")]
use crate::transport::RtuTransport;

/// Default Modbus TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Baud rates the SDM630 can be configured for
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [2400, 4800, 9600, 19200, 38400];

/// Default request and connect timeout, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_stop_bits() -> u8 {
    1
}

fn default_byte_size() -> u8 {
    8
}

/// Serial parity, written as the single letter used in meter menus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

impl Parity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Even => "E",
            Self::Odd => "O",
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "rtu")]
impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Modbus TCP gateway address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpParams {
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

/// RS485 line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_byte_size")]
    pub byte_size: u8,
}

impl SerialParams {
    /// 9600 8N1 on `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            byte_size: default_byte_size(),
        }
    }

    #[cfg(feature = "rtu")]
    pub(crate) fn serial_data_bits(&self) -> tokio_serial::DataBits {
        match self.byte_size {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    #[cfg(feature = "rtu")]
    pub(crate) fn serial_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// How to reach a meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionParams {
    Tcp(TcpParams),
    Serial(SerialParams),
}

impl ConnectionParams {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp(TcpParams {
            host: host.into(),
            port,
        })
    }

    pub fn serial(params: SerialParams) -> Self {
        Self::Serial(params)
    }

    /// Check ranges the meter and the Modbus framing can actually use.
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            Self::Tcp(tcp) => {
                if tcp.host.trim().is_empty() {
                    return Err(ModbusError::configuration("TCP host must not be empty"));
                }
                if tcp.port == 0 {
                    return Err(ModbusError::configuration("TCP port must be 1-65535"));
                }
            }
            Self::Serial(serial) => {
                if serial.port.trim().is_empty() {
                    return Err(ModbusError::configuration("Serial port must not be empty"));
                }
                if !SUPPORTED_BAUD_RATES.contains(&serial.baud_rate) {
                    return Err(ModbusError::configuration(format!(
                        "Unsupported baud rate {} (expected one of {:?})",
                        serial.baud_rate, SUPPORTED_BAUD_RATES
                    )));
                }
                if !matches!(serial.stop_bits, 1 | 2) {
                    return Err(ModbusError::configuration(format!(
                        "Stop bits must be 1 or 2, got {}",
                        serial.stop_bits
                    )));
                }
                if !matches!(serial.byte_size, 7 | 8) {
                    return Err(ModbusError::configuration(format!(
                        "Byte size must be 7 or 8, got {}",
                        serial.byte_size
                    )));
                }
            }
        }
        Ok(())
    }

    /// Identity of the physical link; equal keys share one connection.
    pub fn key(&self) -> ConnectionKey {
        match self {
            Self::Tcp(tcp) => ConnectionKey(format!("tcp_{}_{}", tcp.host, tcp.port)),
            Self::Serial(s) => ConnectionKey(format!(
                "serial_{}_{}_{}_{}_{}",
                s.port, s.baud_rate, s.parity, s.stop_bits, s.byte_size
            )),
        }
    }
}

/// Connection-sharing key, e.g. `tcp_192.168.1.50_502` or
/// `serial_/dev/ttyUSB0_9600_N_1_8`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Meter link
// ============================================================================

/// Concrete transport chosen from [`ConnectionParams`] at runtime.
pub enum MeterLink {
    Tcp(TcpTransport),
    #[cfg(feature = "rtu")]
    Rtu(RtuTransport),
}

impl MeterLink {
    /// Build a disconnected link; the first poll cycle connects it.
    ///
    /// Serial parameters require the `rtu` feature.
    pub fn open(params: &ConnectionParams, timeout: Duration) -> ModbusResult<Self> {
        params.validate()?;
        match params {
            ConnectionParams::Tcp(tcp) => Ok(Self::Tcp(TcpTransport::new(tcp.host.clone(), tcp.port, timeout))),
            #[cfg(feature = "rtu")]
            ConnectionParams::Serial(serial) => Ok(Self::Rtu(RtuTransport::new(serial.clone(), timeout))),
            #[cfg(not(feature = "rtu"))]
            ConnectionParams::Serial(serial) => Err(ModbusError::configuration(format!(
                "Serial port {} requires the 'rtu' feature",
                serial.port
            ))),
        }
    }
}

impl ModbusTransport for MeterLink {
    async fn connect(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.connect().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.connect().await,
        }
    }

    async fn read_input_registers(&mut self, unit_id: u8, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        match self {
            Self::Tcp(t) => t.read_input_registers(unit_id, start, count).await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.read_input_registers(unit_id, start, count).await,
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.close().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.close().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Tcp(t) => t.is_connected(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.is_connected(),
        }
    }
}
