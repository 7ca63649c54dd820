mod common;

use std::sync::Arc;
use std::time::Duration;

use tidemq::codec::{Packet, Publish, QoS};
use tidemq::storage::{KvStore, MemStore, SledStore, StorageHook};
use tidemq::types::{ClientId, TopicFilter};
use tidemq::{InlineClient, ServerContext};

use common::*;

async fn broker(store: Arc<dyn KvStore>) -> ServerContext {
    let scx = ServerContext::builder().store(store.clone()).build();
    allow_all(&scx).await;
    StorageHook::new(store).register(&scx.hooks.register()).await.unwrap();
    scx.load().await.unwrap();
    scx
}

/// Leaves a persistent session with one subscription and one unacked delivery,
/// plus a retained message, then drains.
async fn populate(scx: &ServerContext) -> u16 {
    let (mut sub, _) = connect(scx, "keeper", false).await;
    subscribe(&mut sub, 1, &[("home/#", QoS::AtLeastOnce)]).await;
    let inline = InlineClient::new(scx, "inline");
    inline.publish("home/door", "open", true, QoS::AtLeastOnce).await.unwrap();
    let p = expect_publish(&mut sub).await;
    drop(sub);
    assert!(eventually(|| async { scx.sessions.get("keeper").map(|e| !e.info.connected()).unwrap_or(false) }).await);
    scx.drain().await;
    p.packet_id.unwrap().get()
}

#[tokio::test]
async fn memory_store_round_trip() {
    let store = Arc::new(MemStore::new());
    let before = broker(store.clone()).await;
    let packet_id = populate(&before).await;
    drop(before);

    let after = broker(store.clone()).await;
    assert_eq!(after.router.routes(), 1);
    assert_eq!(after.router.matches(&"home/window".into()).unwrap(), vec![(ClientId::from("keeper"), QoS::AtLeastOnce)]);
    let retained = after.retain.matches(&"home/#".into()).unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].1.publish.payload, "open");

    let (mut sub, present) = connect(&after, "keeper", false).await;
    assert!(present);
    let again = expect_publish(&mut sub).await;
    assert!(again.dup);
    assert_eq!(again.packet_id.unwrap().get(), packet_id);
    sub.send_publish_ack(again.packet_id.unwrap()).await.unwrap();
}

#[tokio::test]
async fn offline_backlog_survives_restart() {
    let store = Arc::new(MemStore::new());
    let before = broker(store.clone()).await;
    let (mut sub, _) = connect(&before, "keeper", false).await;
    subscribe(&mut sub, 1, &[("q/#", QoS::AtLeastOnce)]).await;
    sub.send_disconnect().await.unwrap();
    assert_eq!(next(&mut sub).await, None);
    assert!(eventually(|| async { before.sessions.get("keeper").map(|e| !e.info.connected()).unwrap_or(false) }).await);

    let inline = InlineClient::new(&before, "inline");
    assert_eq!(inline.publish("q/1", "m1", false, QoS::AtLeastOnce).await.unwrap(), 1);
    assert_eq!(inline.publish("q/2", "m2", false, QoS::AtLeastOnce).await.unwrap(), 1);
    assert_eq!(inline.publish("q/3", "volatile", false, QoS::AtMostOnce).await.unwrap(), 1);
    before.drain().await;
    drop(before);
    assert_eq!(store.scan_prefix(b"QUE:").unwrap().len(), 2);

    let after = broker(store.clone()).await;
    let (mut sub, present) = connect(&after, "keeper", false).await;
    assert!(present);
    for payload in ["m1", "m2"] {
        let p = expect_publish(&mut sub).await;
        assert_eq!(p.payload, payload);
        assert!(!p.dup);
        sub.send_publish_ack(p.packet_id.unwrap()).await.unwrap();
    }
    assert!(silent(&mut sub, 200).await);
    assert!(store.scan_prefix(b"QUE:").unwrap().is_empty());
    assert!(store.scan_prefix(b"INF:").unwrap().is_empty());
}

#[tokio::test]
async fn pending_release_survives_restart() {
    let store = Arc::new(MemStore::new());
    let before = broker(store.clone()).await;
    let (mut watcher, _) = connect(&before, "watcher", false).await;
    subscribe(&mut watcher, 1, &[("once/#", QoS::AtMostOnce)]).await;

    let (mut publisher, _) = connect(&before, "sender", false).await;
    let p = Publish::new("once/1", "x", QoS::ExactlyOnce, false).packet_id(Some(pid(5)));
    publisher.send_publish(p.clone()).await.unwrap();
    assert_eq!(next(&mut publisher).await, Some(Packet::PublishReceived { packet_id: pid(5) }));
    assert_eq!(expect_publish(&mut watcher).await.payload, "x");
    drop(publisher);
    drop(watcher);
    assert!(eventually(|| async { before.sessions.get("sender").map(|e| !e.info.connected()).unwrap_or(false) }).await);
    before.drain().await;
    drop(before);

    let after = broker(store.clone()).await;
    let (mut watcher, _) = connect(&after, "watcher", false).await;
    let (mut publisher, present) = connect(&after, "sender", false).await;
    assert!(present);
    publisher.send_publish(Publish { dup: true, ..p }).await.unwrap();
    assert_eq!(next(&mut publisher).await, Some(Packet::PublishReceived { packet_id: pid(5) }));
    publisher.send_publish_release(pid(5)).await.unwrap();
    assert_eq!(next(&mut publisher).await, Some(Packet::PublishComplete { packet_id: pid(5) }));
    assert!(silent(&mut watcher, 200).await);
    assert!(store.scan_prefix(b"REL:").unwrap().is_empty());
}

#[tokio::test]
async fn subscription_identifier_survives_restart() {
    let store = Arc::new(MemStore::new());
    let before = broker(store.clone()).await;
    let (mut sub, _) = connect_v5(&before, "keeper", false).await;
    subscribe_with_id(&mut sub, 1, Some(77), &[("ids/#", QoS::AtLeastOnce)]).await;
    sub.send_disconnect().await.unwrap();
    assert_eq!(next(&mut sub).await, None);
    assert!(eventually(|| async { before.sessions.get("keeper").map(|e| !e.info.connected()).unwrap_or(false) }).await);
    before.drain().await;
    drop(before);

    let after = broker(store.clone()).await;
    let (mut sub, present) = connect_v5(&after, "keeper", false).await;
    assert!(present);
    let inline = InlineClient::new(&after, "inline");
    assert_eq!(inline.publish("ids/1", "x", false, QoS::AtLeastOnce).await.unwrap(), 1);
    let p = expect_publish(&mut sub).await;
    assert_eq!(p.subscription_ids, vec![sid(77)]);
    sub.send_publish_ack(p.packet_id.unwrap()).await.unwrap();
}

#[tokio::test]
async fn sled_store_round_trip() {
    let dir = tmp_dir("round-trip");
    {
        let store = Arc::new(SledStore::open_path(&dir).unwrap());
        let before = broker(store.clone()).await;
        populate(&before).await;
        before.stop().await.unwrap();
    }

    let mut reopened = None;
    for _ in 0..100 {
        match SledStore::open_path(&dir) {
            Ok(s) => {
                reopened = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let after = broker(Arc::new(reopened.expect("store reopens"))).await;
    assert_eq!(after.retain.count(), 1);
    assert_eq!(
        after.router.list(),
        vec![(TopicFilter::from("home/#"), ClientId::from("keeper"), QoS::AtLeastOnce)]
    );
    after.stop().await.unwrap();
    drop(after);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn clean_sessions_are_not_persisted() {
    let store = Arc::new(MemStore::new());
    let scx = broker(store.clone()).await;
    let (mut sub, _) = connect(&scx, "transient", true).await;
    subscribe(&mut sub, 1, &[("x/#", QoS::AtMostOnce)]).await;
    sub.send_disconnect().await.unwrap();
    assert_eq!(next(&mut sub).await, None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn closed_store_fails_retained_publish_without_ack() {
    let store = Arc::new(MemStore::new());
    let scx = broker(store.clone()).await;
    let (mut publisher, _) = connect(&scx, "pub", true).await;
    store.close().unwrap();

    publisher
        .send_publish(
            Publish::new("r/1", "lost?", QoS::AtLeastOnce, true).packet_id(Some(pid(9))),
        )
        .await
        .unwrap();
    assert_eq!(next(&mut publisher).await, None);
    assert_eq!(scx.retain.count(), 0);

    let inline = InlineClient::new(&scx, "inline");
    assert!(inline.publish("r/2", "x", true, QoS::AtMostOnce).await.is_err());
    assert!(inline.publish("plain", "x", false, QoS::AtMostOnce).await.is_ok());
}
