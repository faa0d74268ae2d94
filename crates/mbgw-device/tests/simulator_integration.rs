//! Integration tests for the device simulator over real TCP sockets.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use mbgw_core::{encode_request, parse_reply, RegisterRequest, Reply};
use mbgw_device::infrastructure::{DeviceSimulator, SimulatorConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

async fn start(exit_on_disconnect: bool) -> (std::net::SocketAddr, Arc<AtomicBool>, JoinHandle<()>) {
    let config = SimulatorConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        exit_on_disconnect,
        ..SimulatorConfig::default()
    };
    let simulator = DeviceSimulator::bind(config).await.unwrap();
    let addr = simulator.local_addr().unwrap();
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let handle = tokio::spawn(async move {
        simulator.run(flag).await.unwrap();
    });
    (addr, running, handle)
}

async fn exchange(stream: &mut TcpStream, txid: u16, request: &RegisterRequest) -> Vec<u8> {
    stream
        .write_all(&encode_request(1, txid, request).unwrap())
        .await
        .unwrap();
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let len = usize::from(u16::from_be_bytes([header[4], header[5]])) - 1;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    let mut adu = header.to_vec();
    adu.extend(body);
    adu
}

#[tokio::test]
async fn test_write_is_visible_to_a_second_connection() {
    // Arrange
    let (addr, running, _handle) = start(false).await;
    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    // Act
    exchange(
        &mut first,
        1,
        &RegisterRequest::write_multiple_registers(3, vec![300, 400]),
    )
    .await;
    let reply = exchange(&mut second, 1, &RegisterRequest::read_holding_registers(2, 3)).await;

    // Assert: one register bank is shared by all connections.
    assert_eq!(parse_reply(&reply), Ok(Reply::Registers(vec![2, 300, 400])));
    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_exit_on_disconnect_stops_the_simulator() {
    let (addr, _running, handle) = start(true).await;
    let stream = TcpStream::connect(addr).await.unwrap();

    drop(stream);

    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("simulator must stop after the peer disconnects")
        .unwrap();
}
