//! WebSocket transport: upgrade, data frames and control frames over loopback.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use common::{wait_until, within, Greeting, Number, LOCALHOST};
use network_engine::protocol::handshake::client_handshake;
use network_engine::protocol::websocket::{encode_frame, Opcode};
use network_engine::{
    Client, DisconnectReason, EntityType, NetworkConfig, Registry, Server, Transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

fn echo_registry() -> Arc<Registry> {
    Registry::builder()
        .message::<Greeting>()
        .message::<Number>()
        .handler(EntityType::AllConnections, |conn, msg: Greeting| {
            conn.send(&Greeting {
                text: msg.text.to_uppercase(),
            })
        })
        .build()
        .unwrap()
}

async fn start_server() -> (Server, u16) {
    let server = Server::websocket(LOCALHOST, 0, echo_registry());
    let addr = within(server.start()).await.expect("server start");
    (server, addr.port())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_round_trip_over_websocket() {
    let (server, port) = start_server().await;

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    let registry = Registry::builder()
        .message::<Greeting>()
        .message::<Number>()
        .handler(EntityType::AllClients, move |_, msg: Greeting| {
            sink.lock().unwrap().push(msg.text);
            Ok(())
        })
        .build()
        .unwrap();

    let client = Client::new(Transport::WebSocket, LOCALHOST, port, registry);
    within(client.connect()).await.expect("connect");
    assert!(wait_until(WAIT, || server.connection_count() == 1).await);

    client.send(&Greeting { text: "first".into() }).unwrap();
    client.send(&Greeting { text: "second".into() }).unwrap();

    assert!(wait_until(WAIT, || replies.lock().unwrap().len() == 2).await);
    assert_eq!(
        *replies.lock().unwrap(),
        vec!["FIRST".to_string(), "SECOND".to_string()]
    );

    client.disconnect();
    assert!(wait_until(WAIT, || server.connection_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_upgrade_gets_400_and_no_connection() {
    let (server, port) = start_server().await;
    let added = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&added);
    server.on_connection_added(move |_| *sink.lock().unwrap() += 1);

    let mut raw = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    within(raw.read_to_end(&mut response)).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 400"));
    assert_eq!(*added.lock().unwrap(), 0);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_is_answered_with_pong() {
    let (server, port) = start_server().await;

    let mut raw = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    let leftover = within(client_handshake(&mut raw, "localhost", "/"))
        .await
        .expect("handshake");
    assert!(leftover.is_empty());
    assert!(wait_until(WAIT, || server.connection_count() == 1).await);

    let mut frame = BytesMut::new();
    encode_frame(Opcode::Ping, b"hi", Some([1, 2, 3, 4]), &mut frame);
    raw.write_all(&frame).await.unwrap();

    let mut pong = [0u8; 4];
    within(raw.read_exact(&mut pong)).await.unwrap();
    assert_eq!(pong, [0x8A, 2, b'h', b'i']);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_frame_is_echoed_then_connection_lost() {
    let (server, port) = start_server().await;
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    server.on_disconnecting(move |_, reason| sink.lock().unwrap().push(reason));

    let mut raw = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    within(client_handshake(&mut raw, "localhost", "/"))
        .await
        .expect("handshake");
    assert!(wait_until(WAIT, || server.connection_count() == 1).await);

    let mut frame = BytesMut::new();
    encode_frame(Opcode::Close, &[], Some([9, 9, 9, 9]), &mut frame);
    raw.write_all(&frame).await.unwrap();

    let mut echoed = Vec::new();
    within(raw.read_to_end(&mut echoed)).await.unwrap();
    assert_eq!(echoed.first(), Some(&0x88));

    assert!(wait_until(WAIT, || server.connection_count() == 0).await);
    assert_eq!(
        *reasons.lock().unwrap(),
        vec![DisconnectReason::ConnectionLost]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_upgrades_respect_connection_limit() {
    let config = NetworkConfig::default_with_overrides(|c| c.server.max_connections = 2);
    let server = Server::new(Transport::WebSocket, LOCALHOST, 0, config, echo_registry());
    let port = within(server.start()).await.unwrap().port();
    let added = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&added);
    server.on_connection_added(move |_| *sink.lock().unwrap() += 1);

    let upgrades: Vec<_> = (0..12)
        .map(|_| {
            tokio::spawn(async move {
                let mut raw = TcpStream::connect((LOCALHOST, port)).await.unwrap();
                let upgraded = client_handshake(&mut raw, "localhost", "/").await;
                (raw, upgraded.is_ok())
            })
        })
        .collect();
    let mut sockets = Vec::new();
    for upgrade in upgrades {
        sockets.push(within(upgrade).await.unwrap());
    }

    assert!(wait_until(WAIT, || server.connection_count() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 2);
    assert_eq!(*added.lock().unwrap(), 2);
}
