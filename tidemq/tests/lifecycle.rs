mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;

use tidemq::codec::{Connect, ConnectAckReason, Packet, QoS};
use tidemq::net::{Builder, MqttStream};
use tidemq::{InlineClient, MqttServer, ServerContext, State};

use common::*;

async fn tcp_client(addr: SocketAddr) -> MqttStream<TcpStream> {
    let socket = TcpStream::connect(addr).await.unwrap();
    MqttStream::new(socket, addr, Arc::new(Builder::new()))
}

async fn recv(client: &mut MqttStream<TcpStream>) -> Option<Packet> {
    match tokio::time::timeout(Duration::from_secs(5), client.io.next()).await.unwrap() {
        Some(Ok((p, _))) => Some(p),
        Some(Err(e)) => panic!("decode error, {:?}", e),
        None => None,
    }
}

#[tokio::test]
async fn drain_refuses_new_connections_and_finishes_qos2() {
    init_log();
    let scx = ServerContext::builder().build();
    allow_all(&scx).await;
    let server = MqttServer::new(scx.clone())
        .listener(Builder::new().name("t1").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().tcp().unwrap())
        .build();
    let addr = server.local_addr("t1").unwrap();
    server.start();
    assert_eq!(scx.lifecycle.state(), State::Running);

    let mut sub = tcp_client(addr).await;
    sub.send_connect(Connect { clean_session: true, ..Connect::default().client_id("sub") }).await.unwrap();
    assert!(matches!(recv(&mut sub).await, Some(Packet::ConnectAck(_))));
    sub.send(Packet::Subscribe { packet_id: pid(1), id: None, topic_filters: vec![("q/#".into(), QoS::ExactlyOnce)] })
        .await
        .unwrap();
    assert!(matches!(recv(&mut sub).await, Some(Packet::SubscribeAck { .. })));

    let inline = InlineClient::new(&scx, "inline");
    assert_eq!(inline.publish("q/1", "exactly once", false, QoS::ExactlyOnce).await.unwrap(), 1);
    let p = match recv(&mut sub).await {
        Some(Packet::Publish(p)) => p,
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    assert_eq!(p.qos, QoS::ExactlyOnce);
    let packet_id = p.packet_id.unwrap();

    let stopping = {
        let server = server.clone();
        tokio::spawn(async move { server.shutdown().await })
    };
    assert!(eventually(|| async { TcpStream::connect(addr).await.is_err() }).await);
    assert_eq!(scx.lifecycle.state(), State::Draining);
    assert!(!stopping.is_finished());

    sub.send_publish_received(packet_id).await.unwrap();
    assert_eq!(recv(&mut sub).await, Some(Packet::PublishRelease { packet_id }));
    sub.send_publish_complete(packet_id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), stopping).await.unwrap().unwrap().unwrap();
    assert_eq!(scx.lifecycle.state(), State::Stopped);
    assert_eq!(recv(&mut sub).await, None);
    assert!(scx.sessions.is_empty());
}

#[tokio::test]
async fn connect_during_drain_gets_service_unavailable() {
    let scx = ServerContext::builder().build();
    allow_all(&scx).await;
    let mut early = attach(&scx);
    scx.lifecycle.transition(State::Running);
    scx.lifecycle.transition(State::Draining);

    early.send_connect(Connect::default().client_id("late")).await.unwrap();
    match next(&mut early).await {
        Some(Packet::ConnectAck(ack)) => assert_eq!(ack.return_code, ConnectAckReason::ServiceUnavailable),
        other => panic!("expected CONNACK, got {:?}", other),
    }
    assert_eq!(next(&mut early).await, None);
}

#[tokio::test]
async fn drain_gives_up_after_the_timeout() {
    let settings = tidemq::conf::Settings::from_toml(
        "[mqtt]\ndrain_timeout = \"200ms\"\n",
        tidemq::conf::Options::default(),
    )
    .unwrap();
    let scx = ServerContext::new(settings);
    allow_all(&scx).await;
    let (mut sub, _) = connect(&scx, "stuck", true).await;
    subscribe(&mut sub, 1, &[("s", QoS::AtLeastOnce)]).await;
    let inline = InlineClient::new(&scx, "inline");
    inline.publish("s", "never acked", false, QoS::AtLeastOnce).await.unwrap();
    expect_publish(&mut sub).await;

    tokio::time::timeout(Duration::from_secs(3), scx.drain()).await.unwrap();
    assert_eq!(next(&mut sub).await, None);
}

#[tokio::test]
async fn bind_conflict_is_an_error() {
    let first = Builder::new().name("a").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap();
    let taken = first.local_addr();
    assert!(Builder::new().name("b").laddr(taken).reuseaddr(Some(false)).bind().is_err());
}

async fn http_get(addr: SocketAddr, method: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request = format!("{} / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", method);
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_string(&mut response)).await.unwrap().unwrap();
    response
}

#[tokio::test]
async fn stats_and_health_endpoints_answer() {
    let scx = ServerContext::builder().build();
    allow_all(&scx).await;
    let endpoint = |name: &str| Builder::new().name(name).laddr(([127, 0, 0, 1], 0).into()).bind().unwrap();
    let server = MqttServer::new(scx.clone()).stats(endpoint("stats")).health(endpoint("health")).build();
    server.start();

    let stats = http_get(server.local_addr("stats").unwrap(), "GET").await;
    assert!(stats.starts_with("HTTP/1.1 200"));
    assert!(stats.contains("\"messages_dropped\":0"));

    let health = server.local_addr("health").unwrap();
    assert!(http_get(health, "GET").await.starts_with("HTTP/1.1 200"));
    assert!(http_get(health, "POST").await.starts_with("HTTP/1.1 405"));

    server.shutdown().await.unwrap();
    assert_eq!(scx.lifecycle.state(), State::Stopped);
}
