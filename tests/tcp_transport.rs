//! TcpTransport against a scripted Modbus TCP server on localhost.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use sdm630_poller::{ModbusError, ModbusTransport, TcpTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

enum Reply {
    /// Register value = its address
    Registers,
    Exception(u8),
    WrongTransactionId,
    /// Registers, after a pause
    Delayed(Duration),
    Silent,
    Hangup,
}

struct Request {
    transaction_id: u16,
    unit_id: u8,
    start: u16,
    quantity: u16,
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut frame = [0u8; 12];
    socket.read_exact(&mut frame).await.ok()?;
    assert_eq!(&frame[2..6], &[0x00, 0x00, 0x00, 0x06], "MBAP protocol id and length");
    assert_eq!(frame[7], 0x04, "only FC04 is expected");
    Some(Request {
        transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
        unit_id: frame[6],
        start: u16::from_be_bytes([frame[8], frame[9]]),
        quantity: u16::from_be_bytes([frame[10], frame[11]]),
    })
}

fn registers_pdu(request: &Request) -> Vec<u8> {
    let mut pdu = vec![0x04, (request.quantity * 2) as u8];
    for address in request.start..request.start + request.quantity {
        pdu.extend_from_slice(&address.to_be_bytes());
    }
    pdu
}

async fn write_response(socket: &mut TcpStream, transaction_id: u16, unit_id: u8, pdu: &[u8]) {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    // the client may have given up on this reply already
    socket.write_all(&frame).await.ok();
}

/// Serve `replies` in order, one per request, across reconnects. Returns the
/// transaction ids seen.
async fn serve(listener: TcpListener, mut replies: VecDeque<Reply>) -> Vec<u16> {
    let mut seen = Vec::new();
    while !replies.is_empty() {
        let (mut socket, _) = listener.accept().await.unwrap();
        while let Some(request) = read_request(&mut socket).await {
            seen.push(request.transaction_id);
            match replies.pop_front() {
                Some(Reply::Registers) => {
                    let pdu = registers_pdu(&request);
                    write_response(&mut socket, request.transaction_id, request.unit_id, &pdu).await;
                }
                Some(Reply::Delayed(pause)) => {
                    tokio::time::sleep(pause).await;
                    let pdu = registers_pdu(&request);
                    write_response(&mut socket, request.transaction_id, request.unit_id, &pdu).await;
                }
                Some(Reply::Exception(code)) => {
                    write_response(&mut socket, request.transaction_id, request.unit_id, &[0x84, code]).await;
                }
                Some(Reply::WrongTransactionId) => {
                    let pdu = [0x04, 0x02, 0x00, 0x00];
                    write_response(&mut socket, request.transaction_id.wrapping_add(7), request.unit_id, &pdu)
                        .await;
                }
                Some(Reply::Silent) => {}
                Some(Reply::Hangup) | None => break,
            }
        }
    }
    seen
}

async fn start_server(replies: Vec<Reply>) -> (SocketAddr, JoinHandle<Vec<u16>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(serve(listener, replies.into()));
    (addr, handle)
}

fn transport_for(addr: SocketAddr, timeout: Duration) -> TcpTransport {
    TcpTransport::new(addr.ip().to_string(), addr.port(), timeout)
}

#[tokio::test]
async fn reads_input_registers() {
    let (addr, server) = start_server(vec![Reply::Registers, Reply::Registers]).await;
    let mut transport = transport_for(addr, Duration::from_secs(2));

    assert_ok!(transport.connect().await);
    assert_ok!(transport.connect().await, "connect is idempotent");
    assert!(transport.is_connected());

    let registers = transport.read_input_registers(1, 0x0034, 4).await.unwrap();
    assert_eq!(registers, vec![0x34, 0x35, 0x36, 0x37]);
    let registers = transport.read_input_registers(1, 342, 2).await.unwrap();
    assert_eq!(registers, vec![342, 343]);

    transport.close().await.unwrap();
    assert!(!transport.is_connected());
    assert_eq!(server.await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn exception_keeps_the_link() {
    let (addr, server) = start_server(vec![Reply::Exception(0x02), Reply::Registers]).await;
    let mut transport = transport_for(addr, Duration::from_secs(2));
    transport.connect().await.unwrap();

    match transport.read_input_registers(1, 9000, 2).await {
        Err(ModbusError::Exception { function, code, .. }) => {
            assert_eq!(function, 0x04);
            assert_eq!(code, 0x02);
        }
        other => panic!("expected exception, got {other:?}"),
    }
    assert!(transport.is_connected());
    assert_ok!(transport.read_input_registers(1, 0, 2).await);

    transport.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn eof_is_connection_lost_and_reconnect_works() {
    let (addr, server) = start_server(vec![Reply::Hangup, Reply::Registers]).await;
    let mut transport = transport_for(addr, Duration::from_secs(2));
    transport.connect().await.unwrap();

    let err = transport.read_input_registers(1, 0, 2).await.unwrap_err();
    assert!(matches!(err, ModbusError::ConnectionLost { .. }), "{err:?}");
    assert!(!transport.is_connected());

    transport.connect().await.unwrap();
    assert_eq!(transport.read_input_registers(1, 70, 2).await.unwrap(), vec![70, 71]);

    transport.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn silent_server_times_out() {
    let (addr, server) = start_server(vec![Reply::Silent]).await;
    let mut transport = transport_for(addr, Duration::from_millis(200));
    transport.connect().await.unwrap();

    let err = transport.read_input_registers(1, 0, 2).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { timeout_ms: 200, .. }), "{err:?}");
    // a late reply would desynchronise the stream, so the link is dropped
    assert!(!transport.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn mismatched_transaction_id_is_rejected() {
    let (addr, server) = start_server(vec![Reply::WrongTransactionId]).await;
    let mut transport = transport_for(addr, Duration::from_secs(2));
    transport.connect().await.unwrap();

    let err = transport.read_input_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Protocol { .. }), "{err:?}");
    assert!(!transport.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn refused_connect_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut transport = transport_for(addr, Duration::from_secs(2));
    assert_err!(transport.connect().await);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn cancelled_read_leaves_transport_disconnected() {
    let (addr, server) = start_server(vec![
        Reply::Delayed(Duration::from_millis(300)),
        Reply::Registers,
    ])
    .await;
    let mut transport = transport_for(addr, Duration::from_secs(2));
    transport.connect().await.unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        transport.read_input_registers(1, 0, 4),
    )
    .await;
    assert!(cancelled.is_err(), "read should still be waiting for the late reply");
    assert!(!transport.is_connected());

    // The late reply went to the abandoned stream, not to this request.
    transport.connect().await.unwrap();
    assert_eq!(transport.read_input_registers(1, 4, 4).await.unwrap(), vec![4, 5, 6, 7]);

    transport.close().await.unwrap();
    assert_eq!(server.await.unwrap(), vec![1, 2]);
}
