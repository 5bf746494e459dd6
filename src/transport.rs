//! Transport layer for the read-only SDM630 client
//!
//! The poll engine talks to a meter only through [`ModbusTransport`]. Two
//! implementations ship with the crate:
//!
//! - [`TcpTransport`]: Modbus TCP (MBAP framing) for Ethernet gateways
//! - [`RtuTransport`]: Modbus RTU over RS485 (requires the `rtu` feature)
//!
//! Frame encoding and decoding live in free functions so they can be tested
//! without a socket or a serial port.
//!
//! ## Link state
//!
//! Any failure that leaves the byte stream in an unknown position (I/O error,
//! EOF, timeout, malformed frame, a read future dropped mid-exchange) drops
//! the underlying stream. The transport
//! then reports `is_connected() == false` and the next cycle reconnects.
//! Exception responses and payload mismatches are complete frames and keep
//! the link.

use std::future::Future;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::constants::{EXCEPTION_FLAG, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, RTU_OVERHEAD};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder};

#[cfg(feature = "rtu")]
use crate::connection::SerialParams;

/// MBAP protocol identifier for Modbus
const MODBUS_PROTOCOL_ID: u16 = 0;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Minimal async Modbus client surface used by the poll engine.
///
/// One request is in flight at a time; callers serialize access through
/// `&mut self`.
pub trait ModbusTransport: Send {
    /// Establish the link. Calling it on a connected transport is a no-op.
    fn connect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read `count` input registers (FC04) starting at `start`.
    fn read_input_registers(
        &mut self,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Tear down the link. Safe to call when already closed or never connected.
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// Frame helpers
// ============================================================================

/// CRC-16/MODBUS of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// MBAP header + unit id + PDU.
pub fn encode_tcp_request(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(MODBUS_PROTOCOL_ID);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());
    frame
}

/// Validate a complete MBAP response frame and extract its PDU.
pub fn decode_tcp_response(frame: &[u8], transaction_id: u16, unit_id: u8) -> ModbusResult<ModbusPdu> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(ModbusError::protocol(format!(
            "TCP frame too short: {} bytes",
            frame.len()
        )));
    }

    let received_tid = u16::from_be_bytes([frame[0], frame[1]]);
    if received_tid != transaction_id {
        return Err(ModbusError::protocol(format!(
            "Transaction ID mismatch: sent {transaction_id}, got {received_tid}"
        )));
    }

    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ModbusError::protocol(format!(
            "Invalid protocol ID: {protocol_id}"
        )));
    }

    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if frame.len() != MBAP_HEADER_LEN + length {
        return Err(ModbusError::protocol(format!(
            "MBAP length {} does not match frame of {} bytes",
            length,
            frame.len()
        )));
    }

    if frame[MBAP_HEADER_LEN] != unit_id {
        return Err(ModbusError::protocol(format!(
            "Unit ID mismatch: expected {}, got {}",
            unit_id, frame[MBAP_HEADER_LEN]
        )));
    }

    ModbusPdu::from_slice(&frame[MBAP_HEADER_LEN + 1..])
}

/// Unit id + PDU + CRC (little-endian).
pub fn encode_rtu_request(unit_id: u8, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(pdu.len() + RTU_OVERHEAD);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Total RTU response length announced by the first three bytes
/// (unit id, function code, byte count or exception code).
pub fn rtu_response_len(head: &[u8]) -> ModbusResult<usize> {
    if head.len() < 3 {
        return Err(ModbusError::protocol("RTU response header incomplete"));
    }
    if head[1] & EXCEPTION_FLAG != 0 {
        // unit + fc + code + crc
        Ok(5)
    } else {
        Ok(RTU_OVERHEAD + 2 + head[2] as usize)
    }
}

/// Validate a complete RTU response frame and extract its PDU.
pub fn decode_rtu_response(frame: &[u8], unit_id: u8) -> ModbusResult<ModbusPdu> {
    if frame.len() < 5 {
        return Err(ModbusError::protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }

    let body_len = frame.len() - 2;
    let received_crc = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated_crc = crc16(&frame[..body_len]);
    if received_crc != calculated_crc {
        return Err(ModbusError::protocol(format!(
            "CRC mismatch: expected 0x{calculated_crc:04X}, got 0x{received_crc:04X}"
        )));
    }

    if frame[0] != unit_id {
        return Err(ModbusError::protocol(format!(
            "Unit ID mismatch: expected {}, got {}",
            unit_id, frame[0]
        )));
    }

    ModbusPdu::from_slice(&frame[1..body_len])
}

fn timeout_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

/// Map raw I/O failures to `ConnectionLost`; the stream is unusable afterwards.
fn io_to_lost(err: ModbusError) -> ModbusError {
    match err {
        ModbusError::Io(io) => ModbusError::connection_lost(io.to_string()),
        other => other,
    }
}

// ============================================================================
// TCP transport
// ============================================================================

/// Modbus TCP transport for one gateway address.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    transaction_id: u16,
}

impl TcpTransport {
    /// Create a disconnected transport; nothing is opened until [`connect`](ModbusTransport::connect).
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            stream: None,
            transaction_id: 0,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    async fn transact(&mut self, unit_id: u8, pdu: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        let transaction_id = self.next_transaction_id();
        let request = encode_tcp_request(transaction_id, unit_id, pdu);
        let limit = self.timeout;

        // Held outside `self` until the reply is validated, so a cancelled
        // exchange leaves the transport disconnected.
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| ModbusError::connection_lost("TCP transport not connected"))?;

        trace!("TCP TX: {:02X?}", &request[..]);
        let exchange = async {
            stream.write_all(&request).await?;

            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if !(2..=MAX_MBAP_LENGTH).contains(&length) {
                return Err(ModbusError::protocol(format!(
                    "Invalid MBAP length field: {length}"
                )));
            }

            let mut frame = vec![0u8; MBAP_HEADER_LEN + length];
            frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
            stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
            Ok::<_, ModbusError>(frame)
        };

        let frame = match timeout(limit, exchange).await {
            Ok(result) => result.map_err(io_to_lost)?,
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("FC04 request to {}:{}", self.host, self.port),
                    timeout_ms(limit),
                ))
            }
        };
        trace!("TCP RX: {:02X?}", frame);

        let response = decode_tcp_response(&frame, transaction_id, unit_id)?;
        self.stream = Some(stream);
        Ok(response)
    }
}

impl ModbusTransport for TcpTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        debug!("TCP connecting: {}:{}", self.host, self.port);
        match timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                self.stream = Some(stream);
                info!("TCP connected: {}:{}", self.host, self.port);
                Ok(())
            }
            Ok(Err(e)) => Err(ModbusError::connection(format!(
                "Failed to connect to {}:{}: {}",
                self.host, self.port, e
            ))),
            Err(_) => Err(ModbusError::timeout(
                format!("connect to {}:{}", self.host, self.port),
                timeout_ms(self.timeout),
            )),
        }
    }

    async fn read_input_registers(&mut self, unit_id: u8, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let pdu = PduBuilder::build_read_input_request(start, count)?;

        if self.stream.is_none() {
            return Err(ModbusError::connection_lost("TCP transport not connected"));
        }

        let response = match self.transact(unit_id, &pdu).await {
            Ok(response) => response,
            Err(e) => {
                debug!("TCP link to {}:{} dropped: {}", self.host, self.port, e);
                return Err(e);
            }
        };

        response.parse_input_registers(count)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone; the stream is dropped either way.
            let _ = stream.shutdown().await;
            info!("TCP closed: {}:{}", self.host, self.port);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

// ============================================================================
// RTU transport
// ============================================================================

/// Modbus RTU transport on one serial port.
#[cfg(feature = "rtu")]
pub struct RtuTransport {
    settings: SerialParams,
    timeout: Duration,
    stream: Option<tokio_serial::SerialStream>,
}

#[cfg(feature = "rtu")]
impl RtuTransport {
    pub fn new(settings: SerialParams, timeout: Duration) -> Self {
        Self {
            settings,
            timeout,
            stream: None,
        }
    }

    pub fn settings(&self) -> &SerialParams {
        &self.settings
    }

    async fn transact(&mut self, unit_id: u8, pdu: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        let request = encode_rtu_request(unit_id, pdu);
        let limit = self.timeout;

        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| ModbusError::connection_lost("Serial port not open"))?;

        trace!("RTU TX: {:02X?}", &request[..]);
        let exchange = async {
            stream.write_all(&request).await?;

            let mut head = [0u8; 3];
            stream.read_exact(&mut head).await?;
            let total = rtu_response_len(&head)?;

            let mut frame = vec![0u8; total];
            frame[..3].copy_from_slice(&head);
            stream.read_exact(&mut frame[3..]).await?;
            Ok::<_, ModbusError>(frame)
        };

        let frame = match timeout(limit, exchange).await {
            Ok(result) => result.map_err(io_to_lost)?,
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("FC04 request on {}", self.settings.port),
                    timeout_ms(limit),
                ))
            }
        };
        trace!("RTU RX: {:02X?}", frame);

        let response = decode_rtu_response(&frame, unit_id)?;
        self.stream = Some(stream);
        Ok(response)
    }
}

#[cfg(feature = "rtu")]
impl ModbusTransport for RtuTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        use tokio_serial::SerialPortBuilderExt;

        if self.stream.is_some() {
            return Ok(());
        }

        let settings = &self.settings;
        debug!("RTU: {} @{}baud", settings.port, settings.baud_rate);
        let builder = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(settings.serial_data_bits())
            .parity(settings.parity.into())
            .stop_bits(settings.serial_stop_bits())
            .timeout(self.timeout);

        match builder.open_native_async() {
            Ok(stream) => {
                info!("RTU opened: {}", settings.port);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => Err(ModbusError::connection(format!(
                "Failed to open serial port {}: {}",
                settings.port, e
            ))),
        }
    }

    async fn read_input_registers(&mut self, unit_id: u8, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let pdu = PduBuilder::build_read_input_request(start, count)?;

        if self.stream.is_none() {
            return Err(ModbusError::connection_lost("Serial port not open"));
        }

        let response = match self.transact(unit_id, &pdu).await {
            Ok(response) => response,
            Err(e) => {
                debug!("RTU port {} dropped: {}", self.settings.port, e);
                return Err(e);
            }
        };

        response.parse_input_registers(count)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.stream.take().is_some() {
            info!("RTU closed: {}", self.settings.port);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_values() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn test_encode_tcp_request() {
        let pdu = PduBuilder::build_read_input_request(0x0000, 4).unwrap();
        let frame = encode_tcp_request(0x0102, 7, &pdu);
        assert_eq!(
            &frame[..],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07, 0x04, 0x00, 0x00, 0x00, 0x04]
        );
    }

    #[test]
    fn test_decode_tcp_response() {
        let frame = [0x00, 0x09, 0x00, 0x00, 0x00, 0x07, 0x01, 0x04, 0x04, 0x43, 0x66, 0x80, 0x00];
        let pdu = decode_tcp_response(&frame, 9, 1).unwrap();
        assert_eq!(pdu.parse_input_registers(2).unwrap(), vec![0x4366, 0x8000]);
    }

    #[test]
    fn test_decode_tcp_validation_errors() {
        let frame = [0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x01, 0x84, 0x02];
        assert!(decode_tcp_response(&frame, 9, 1).is_ok());
        // wrong transaction id
        assert!(matches!(decode_tcp_response(&frame, 10, 1), Err(ModbusError::Protocol { .. })));
        // wrong unit id
        assert!(decode_tcp_response(&frame, 9, 2).is_err());

        let mut bad_protocol = frame;
        bad_protocol[3] = 0x01;
        assert!(decode_tcp_response(&bad_protocol, 9, 1).is_err());

        let mut bad_length = frame;
        bad_length[5] = 0x05;
        assert!(decode_tcp_response(&bad_length, 9, 1).is_err());

        assert!(decode_tcp_response(&frame[..6], 9, 1).is_err());
    }

    #[test]
    fn test_transaction_id_wraps() {
        let mut transport = TcpTransport::new("127.0.0.1", 502, Duration::from_secs(1));
        transport.transaction_id = u16::MAX;
        assert_eq!(transport.next_transaction_id(), 0);
        assert_eq!(transport.next_transaction_id(), 1);
    }

    #[test]
    fn test_encode_rtu_request() {
        let pdu = PduBuilder::build_read_input_request(0x0000, 2).unwrap();
        let frame = encode_rtu_request(1, &pdu);
        assert_eq!(&frame[..6], &[0x01, 0x04, 0x00, 0x00, 0x00, 0x02]);
        let crc = crc16(&frame[..6]);
        assert_eq!(&frame[6..], &crc.to_le_bytes());
    }

    #[test]
    fn test_rtu_response_len() {
        assert_eq!(rtu_response_len(&[0x01, 0x04, 0x08]).unwrap(), 13);
        assert_eq!(rtu_response_len(&[0x01, 0x84, 0x02]).unwrap(), 5);
        assert!(rtu_response_len(&[0x01, 0x04]).is_err());
    }

    fn rtu_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    #[test]
    fn test_decode_rtu_response() {
        let frame = rtu_frame(&[0x05, 0x04, 0x04, 0x42, 0x48, 0x00, 0x00]);
        let pdu = decode_rtu_response(&frame, 5).unwrap();
        assert_eq!(pdu.parse_input_registers(2).unwrap(), vec![0x4248, 0x0000]);
        assert!(decode_rtu_response(&frame, 6).is_err());
    }

    #[test]
    fn test_decode_rtu_exception() {
        let frame = rtu_frame(&[0x01, 0x84, 0x02]);
        let pdu = decode_rtu_response(&frame, 1).unwrap();
        assert!(matches!(
            pdu.parse_input_registers(2),
            Err(ModbusError::Exception { code: 0x02, .. })
        ));
    }

    #[test]
    fn test_decode_rtu_bad_crc() {
        let mut frame = rtu_frame(&[0x01, 0x04, 0x02, 0x00, 0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode_rtu_response(&frame, 1), Err(ModbusError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_read_without_connect_is_connection_lost() {
        let mut transport = TcpTransport::new("127.0.0.1", 502, Duration::from_secs(1));
        assert!(!transport.is_connected());
        let err = transport.read_input_registers(1, 0, 2).await.unwrap_err();
        assert!(err.is_connection_lost());
        // closing a never-opened transport is fine
        transport.close().await.unwrap();
    }
}
