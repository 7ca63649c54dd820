#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::DuplexStream;

use tidemq::auth::AllowHook;
use tidemq::codec::{
    Connect, ConnectAckReason, Packet, Protocol, Publish, QoS, SubscribeReturnCode, SubscriptionId, MQTT_LEVEL_5,
};
use tidemq::conf::{Options, Settings};
use tidemq::hook::{GateHook, Type};
use tidemq::net::{Builder, MqttStream};
use tidemq::{v3, ServerContext};

pub type Client = MqttStream<DuplexStream>;

pub fn init_log() {
    let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
}

/// A broker whose settings come from `toml`, e.g. an `[mqtt]` table.
pub fn broker_with(toml: &str) -> ServerContext {
    ServerContext::new(Settings::from_toml(toml, Options::default()).unwrap())
}

pub async fn gates(scx: &ServerContext, hook: Arc<dyn GateHook>) {
    let register = scx.hooks.register();
    register.add_gate(&Type::GATE_ALL, 0, hook).await.unwrap();
    register.start().await;
}

pub async fn allow_all(scx: &ServerContext) {
    gates(scx, Arc::new(AllowHook)).await;
}

/// A client end whose server end is served by the broker.
pub fn attach(scx: &ServerContext) -> Client {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let addr: SocketAddr = "127.0.0.1:41883".parse().unwrap();
    let cfg = Arc::new(Builder::new().name("test"));
    let server = MqttStream::new(server, addr, cfg.clone());
    let scx = scx.clone();
    tokio::spawn(async move {
        let _ = v3::process(scx, server).await;
    });
    MqttStream::new(client, addr, cfg)
}

pub async fn next(client: &mut Client) -> Option<Packet> {
    match tokio::time::timeout(Duration::from_secs(5), client.io.next()).await.expect("no packet within 5s") {
        Some(Ok((packet, _))) => Some(packet),
        Some(Err(e)) => panic!("decode error, {:?}", e),
        None => None,
    }
}

/// Nothing arrives within `ms`.
pub async fn silent(client: &mut Client, ms: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(ms), client.io.next()).await.is_err()
}

pub async fn connect_with(scx: &ServerContext, connect: Connect) -> (Client, bool) {
    let mut client = attach(scx);
    client.send_connect(connect).await.unwrap();
    match next(&mut client).await {
        Some(Packet::ConnectAck(ack)) => {
            assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted);
            (client, ack.session_present)
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

pub async fn connect(scx: &ServerContext, client_id: &str, clean_session: bool) -> (Client, bool) {
    connect_with(scx, Connect { clean_session, ..Connect::default().client_id(client_id) }).await
}

/// Connects with protocol level 5, the client end then speaks MQTT 5.
pub async fn connect_v5(scx: &ServerContext, client_id: &str, clean_session: bool) -> (Client, bool) {
    connect_with(scx, Connect { protocol: Protocol(MQTT_LEVEL_5), clean_session, ..Connect::default().client_id(client_id) })
        .await
}

pub fn pid(id: u16) -> NonZeroU16 {
    NonZeroU16::new(id).unwrap()
}

pub fn sid(id: u32) -> SubscriptionId {
    SubscriptionId::new(id).unwrap()
}

pub async fn subscribe(client: &mut Client, packet_id: u16, filters: &[(&str, QoS)]) -> Vec<SubscribeReturnCode> {
    subscribe_with_id(client, packet_id, None, filters).await
}

pub async fn subscribe_with_id(
    client: &mut Client,
    packet_id: u16,
    id: Option<u32>,
    filters: &[(&str, QoS)],
) -> Vec<SubscribeReturnCode> {
    let topic_filters = filters.iter().map(|(f, q)| ((*f).into(), *q)).collect();
    let id = id.and_then(SubscriptionId::new);
    client.send(Packet::Subscribe { packet_id: pid(packet_id), id, topic_filters }).await.unwrap();
    match next(client).await {
        Some(Packet::SubscribeAck { packet_id: got, status }) => {
            assert_eq!(got.get(), packet_id);
            status
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

/// Publishes and completes the acknowledgement exchange of its QoS.
pub async fn publish(client: &mut Client, topic: &str, payload: &str, qos: QoS, retain: bool, packet_id: u16) {
    let id = if qos == QoS::AtMostOnce { None } else { Some(pid(packet_id)) };
    client.send_publish(Publish::new(topic.to_owned(), payload.to_owned(), qos, retain).packet_id(id)).await.unwrap();
    match qos {
        QoS::AtMostOnce => {}
        QoS::AtLeastOnce => assert_eq!(next(client).await, Some(Packet::PublishAck { packet_id: pid(packet_id) })),
        QoS::ExactlyOnce => {
            assert_eq!(next(client).await, Some(Packet::PublishReceived { packet_id: pid(packet_id) }));
            client.send_publish_release(pid(packet_id)).await.unwrap();
            assert_eq!(next(client).await, Some(Packet::PublishComplete { packet_id: pid(packet_id) }));
        }
    }
}

pub async fn expect_publish(client: &mut Client) -> Publish {
    match next(client).await {
        Some(Packet::Publish(p)) => p,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn tmp_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("tidemq-it-{}-{}", name, uuid::Uuid::new_v4().simple()))
}
