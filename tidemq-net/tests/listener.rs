use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use tidemq_codec::{Connect, ConnectAckReason, Packet};
use tidemq_net::{Builder, HttpServer, ListenerType, MqttStream};

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn tcp_accept_and_connect() {
    let listener = Builder::new().name("t-test").laddr(local()).bind().unwrap().tcp().unwrap();
    assert_eq!(listener.typ, ListenerType::TCP);
    let addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let acceptor = listener.accept().await.unwrap();
        let mut s = acceptor.tcp().unwrap();
        let connect = s.recv_connect(Duration::from_secs(2)).await.unwrap();
        s.send_connect_ack(ConnectAckReason::ConnectionAccepted, false).await.unwrap();
        connect.client_id.to_string()
    });

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut client = MqttStream::new(socket, addr, std::sync::Arc::new(Builder::new()));
    client.send_connect(Connect::default().client_id("net-1")).await.unwrap();
    let reply = futures::StreamExt::next(&mut client.io).await.unwrap().unwrap().0;
    assert!(matches!(
        reply,
        Packet::ConnectAck(ack) if ack.return_code == ConnectAckReason::ConnectionAccepted && !ack.session_present
    ));
    assert_eq!(server.await.unwrap(), "net-1");
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let listener = Builder::new().laddr(local()).bind().unwrap();
    let addr = listener.local_addr();
    let server = tokio::spawn(async move {
        let mut s = listener.accept().await.unwrap().tcp().unwrap();
        s.recv_connect(Duration::from_secs(2)).await.is_err()
    });
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut client = MqttStream::new(socket, addr, std::sync::Arc::new(Builder::new()));
    client.send(Packet::PingRequest).await.unwrap();
    assert!(server.await.unwrap());
}

#[tokio::test]
async fn tls_without_material_fails() {
    let res = Builder::new().name("ts-test").laddr(local()).bind().unwrap().tls();
    assert!(res.is_err());
    let res = Builder::new()
        .laddr(local())
        .tls_cert(Some("/nonexistent/server.crt"))
        .tls_key(Some("/nonexistent/server.key"))
        .bind()
        .unwrap()
        .tls();
    assert!(res.is_err());
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let first = Builder::new().name("first").laddr(local()).bind().unwrap();
    let res = Builder::new().name("second").laddr(first.local_addr()).bind();
    assert!(res.is_err());
}

async fn http_get(addr: SocketAddr, method: &str) -> String {
    let mut s = TcpStream::connect(addr).await.unwrap();
    let req = format!("{} / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", method);
    s.write_all(req.as_bytes()).await.unwrap();
    let mut out = String::new();
    s.read_to_string(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn health_endpoint() {
    let listener = Builder::new().name("health").laddr(local()).bind().unwrap();
    let server = HttpServer::health(listener);
    let addr = server.local_addr();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(async move {
        let _ = rx.await;
    }));

    let resp = http_get(addr, "GET").await;
    assert!(resp.starts_with("HTTP/1.1 200"), "{}", resp);
    assert!(resp.ends_with("OK"));
    let resp = http_get(addr, "POST").await;
    assert!(resp.starts_with("HTTP/1.1 405"), "{}", resp);

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn stats_endpoint() {
    let listener = Builder::new().name("stats").laddr(local()).bind().unwrap();
    let server = HttpServer::stats(listener, || serde_json::json!({"clients_connected": 3}));
    let addr = server.local_addr();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(async move {
        let _ = rx.await;
    }));

    let resp = http_get(addr, "GET").await;
    assert!(resp.starts_with("HTTP/1.1 200"), "{}", resp);
    assert!(resp.contains("application/json"));
    assert!(resp.ends_with(r#"{"clients_connected":3}"#), "{}", resp);

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}
