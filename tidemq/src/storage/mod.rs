//! Persistence of sessions and retained messages.
//!
//! The broker talks to an ordered byte-key store through [`KvStore`]. Values
//! are `bincode` records under these keys:
//!
//! | key                         | value                |
//! |-----------------------------|----------------------|
//! | `SES:<client_id>`           | [`SessionRecord`]    |
//! | `SUB:<client_id>:<filter>`  | [`SubscriptionRecord`] |
//! | `RET:<topic>`               | [`Retain`]           |
//! | `INF:<client_id>:<pid>`     | [`InflightRecord`]   |
//! | `REL:<client_id>:<pid>`     | [`InInflightRecord`] |
//! | `QUE:<client_id>:<seq>`     | [`QueuedRecord`]     |
//!
//! Client ids may contain `:`, so prefix scans filter on the client id stored
//! inside the record.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{QoS, SubscriptionId};
use crate::inflight::OutInflightMessage;
use crate::queue::{QueueSeq, QueuedMessage};
use crate::types::{ClientId, OfflineState, PacketId, Retain, Subscribe, TopicFilter, UserName};
use crate::utils::{timestamp_millis, TimestampMillis};
use crate::Result;

mod hook;
mod mem;
mod sled;

pub use self::hook::StorageHook;
pub use self::mem::MemStore;
pub use self::sled::SledStore;

pub const SESSION_PREFIX: &str = "SES:";
pub const SUBSCRIPTION_PREFIX: &str = "SUB:";
pub const RETAIN_PREFIX: &str = "RET:";
pub const INFLIGHT_PREFIX: &str = "INF:";
pub const IN_INFLIGHT_PREFIX: &str = "REL:";
pub const QUEUE_PREFIX: &str = "QUE:";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error, {0}")]
    Sled(#[from] ::sled::Error),
    #[error("codec error, {0}")]
    Codec(#[from] bincode::Error),
    #[error("store is closed")]
    Closed,
}

/// Ordered byte-key store. A successful `set` or `delete` is durable.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn flush(&self) -> Result<()>;

    /// Reclaims space held by obsolete versions once at least
    /// `discard_ratio` of it is garbage. Returns the bytes reclaimed.
    fn gc(&self, discard_ratio: f64) -> Result<usize>;

    fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub created_at: TimestampMillis,
    /// `None` while a connection is attached.
    pub disconnected_at: Option<TimestampMillis>,
}

impl SessionRecord {
    /// Time left before the session expires, `None` once it has.
    #[inline]
    pub fn remaining(&self, expiry: Duration, now: TimestampMillis) -> Option<Duration> {
        let since = now - self.disconnected_at.unwrap_or(now);
        let left = expiry.as_millis() as TimestampMillis - since.max(0);
        if left > 0 {
            Some(Duration::from_millis(left as u64))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub client_id: ClientId,
    pub topic_filter: TopicFilter,
    pub qos: QoS,
    pub id: Option<SubscriptionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InflightRecord {
    pub client_id: ClientId,
    pub message: OutInflightMessage,
}

/// Inbound QoS 2 packet id awaiting PUBREL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InInflightRecord {
    pub client_id: ClientId,
    pub packet_id: PacketId,
}

/// A backlog entry of an offline or saturated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRecord {
    pub client_id: ClientId,
    pub message: QueuedMessage,
}

/// A persistent session read back from the store.
#[derive(Debug)]
pub struct StoredSession {
    pub record: SessionRecord,
    pub state: OfflineState,
}

#[inline]
pub fn session_key(client_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, client_id)
}

#[inline]
pub fn subscription_key(client_id: &str, topic_filter: &str) -> String {
    format!("{}{}:{}", SUBSCRIPTION_PREFIX, client_id, topic_filter)
}

#[inline]
pub fn retain_key(topic: &str) -> String {
    format!("{}{}", RETAIN_PREFIX, topic)
}

#[inline]
pub fn inflight_key(client_id: &str, packet_id: PacketId) -> String {
    format!("{}{}:{}", INFLIGHT_PREFIX, client_id, packet_id)
}

#[inline]
pub fn in_inflight_key(client_id: &str, packet_id: PacketId) -> String {
    format!("{}{}:{}", IN_INFLIGHT_PREFIX, client_id, packet_id)
}

/// Zero padded so that key order is backlog order.
#[inline]
pub fn queue_key(client_id: &str, seq: QueueSeq) -> String {
    format!("{}{}:{:020}", QUEUE_PREFIX, client_id, seq)
}

#[inline]
pub fn put<V: Serialize>(store: &dyn KvStore, key: &str, val: &V) -> Result<()> {
    let data = bincode::serialize(val).map_err(StorageError::from)?;
    store.set(key.as_bytes(), &data)
}

#[inline]
pub fn fetch<V: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<V>> {
    match store.get(key.as_bytes())? {
        Some(data) => Ok(Some(bincode::deserialize(&data).map_err(StorageError::from)?)),
        None => Ok(None),
    }
}

/// Decodes every record under `prefix`. Undecodable records are logged and
/// skipped.
pub fn scan<V: DeserializeOwned>(store: &dyn KvStore, prefix: &str) -> Result<Vec<(String, V)>> {
    let mut out = Vec::new();
    for (k, v) in store.scan_prefix(prefix.as_bytes())? {
        let key = String::from_utf8_lossy(&k).into_owned();
        match bincode::deserialize::<V>(&v) {
            Ok(v) => out.push((key, v)),
            Err(e) => log::warn!("skip undecodable record {}, {:?}", key, e),
        }
    }
    Ok(out)
}

/// A record owned by one session, stored under `PREFIX<client_id>:`.
trait ClientRecord: DeserializeOwned {
    const PREFIX: &'static str;

    fn client_id(&self) -> &str;
}

macro_rules! client_record {
    ($record:ty, $prefix:expr) => {
        impl ClientRecord for $record {
            const PREFIX: &'static str = $prefix;

            #[inline]
            fn client_id(&self) -> &str {
                &self.client_id
            }
        }
    };
}

client_record!(SubscriptionRecord, SUBSCRIPTION_PREFIX);
client_record!(InflightRecord, INFLIGHT_PREFIX);
client_record!(InInflightRecord, IN_INFLIGHT_PREFIX);
client_record!(QueuedRecord, QUEUE_PREFIX);

/// Records of `client_id`, without those of other clients whose id merely
/// starts the same way.
fn client_records<V: ClientRecord>(store: &dyn KvStore, client_id: &str) -> Result<Vec<(String, V)>> {
    Ok(scan::<V>(store, &format!("{}{}:", V::PREFIX, client_id))?
        .into_iter()
        .filter(|(_, r)| r.client_id() == client_id)
        .collect())
}

fn client_keys<V: ClientRecord>(store: &dyn KvStore, client_id: &str) -> Result<Vec<String>> {
    Ok(client_records::<V>(store, client_id)?.into_iter().map(|(k, _)| k).collect())
}

/// Removes everything stored for a session.
pub fn delete_session(store: &dyn KvStore, client_id: &str) -> Result<()> {
    let mut keys = client_keys::<SubscriptionRecord>(store, client_id)?;
    keys.extend(client_keys::<InflightRecord>(store, client_id)?);
    keys.extend(client_keys::<InInflightRecord>(store, client_id)?);
    keys.extend(client_keys::<QueuedRecord>(store, client_id)?);
    for k in keys {
        store.delete(k.as_bytes())?;
    }
    store.delete(session_key(client_id).as_bytes())?;
    Ok(())
}

/// Reads all persistent sessions. Sessions that expired while the broker was
/// down are deleted instead.
pub fn load_sessions(store: &dyn KvStore, expiry: Duration) -> Result<Vec<(StoredSession, Duration)>> {
    let now = timestamp_millis();
    let mut out = Vec::new();
    for (_, record) in scan::<SessionRecord>(store, SESSION_PREFIX)? {
        let Some(remaining) = record.remaining(expiry, now) else {
            log::info!("{} persistent session expired while offline", record.client_id);
            delete_session(store, &record.client_id)?;
            continue;
        };
        let client_id: &str = &record.client_id;

        let subscriptions = client_records::<SubscriptionRecord>(store, client_id)?
            .into_iter()
            .map(|(_, r)| Subscribe { topic_filter: r.topic_filter, qos: r.qos, id: r.id })
            .collect();

        let mut inflight = client_records::<InflightRecord>(store, client_id)?
            .into_iter()
            .map(|(_, r)| r.message)
            .collect::<Vec<_>>();
        inflight.sort_by_key(|m| m.update_time);

        let in_inflight =
            client_records::<InInflightRecord>(store, client_id)?.into_iter().map(|(_, r)| r.packet_id).collect();

        let mut queued = client_records::<QueuedRecord>(store, client_id)?
            .into_iter()
            .map(|(_, r)| r.message)
            .collect::<Vec<_>>();
        queued.sort_by_key(|m| m.seq);

        let state = OfflineState { created_at: record.created_at, subscriptions, inflight, in_inflight, queued };
        out.push((StoredSession { record, state }, remaining));
    }
    Ok(out)
}

/// Reads all retained records.
pub fn load_retains(store: &dyn KvStore) -> Result<Vec<Retain>> {
    Ok(scan::<Retain>(store, RETAIN_PREFIX)?.into_iter().map(|(_, r)| r).collect())
}

/// Runs `gc` on the store every `interval` until the returned handle is aborted.
pub fn spawn_gc(store: Arc<dyn KvStore>, interval: Duration, discard_ratio: f64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.gc(discard_ratio) {
                Ok(reclaimed) => log::debug!("store gc reclaimed {} bytes", reclaimed),
                Err(e) => log::warn!("store gc failed, {:?}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Publish;
    use crate::inflight::MomentStatus;
    use crate::types::Origin;
    use std::num::NonZeroU16;

    fn session(cid: &str, disconnected_at: Option<TimestampMillis>) -> SessionRecord {
        SessionRecord { client_id: cid.into(), username: None, created_at: 1, disconnected_at }
    }

    #[test]
    fn remaining_expiry() {
        let expiry = Duration::from_secs(10);
        assert_eq!(session("a", None).remaining(expiry, 5_000), Some(expiry));
        assert_eq!(session("a", Some(1_000)).remaining(expiry, 5_000), Some(Duration::from_secs(6)));
        assert_eq!(session("a", Some(1_000)).remaining(expiry, 11_000), None);
    }

    #[test]
    fn prefix_collisions_are_filtered() {
        let store = MemStore::new();
        put(&store, &session_key("a"), &session("a", None)).unwrap();
        put(&store, &session_key("a:b"), &session("a:b", None)).unwrap();
        let sub = |cid: &str, tf: &str| SubscriptionRecord {
            client_id: cid.into(),
            topic_filter: tf.into(),
            qos: QoS::AtLeastOnce,
            id: SubscriptionId::new(7),
        };
        put(&store, &subscription_key("a", "x/y"), &sub("a", "x/y")).unwrap();
        put(&store, &subscription_key("a:b", "z"), &sub("a:b", "z")).unwrap();

        let p = Publish::new("x/y", "1", QoS::AtLeastOnce, false).packet_id(NonZeroU16::new(3));
        let m = OutInflightMessage::new(MomentStatus::UnAck, Origin::client("o".into()), p);
        put(&store, &inflight_key("a", 3), &InflightRecord { client_id: "a".into(), message: m }).unwrap();

        let loaded = load_sessions(&store, Duration::from_secs(60)).unwrap();
        assert_eq!(loaded.len(), 2);
        let (a, _) = loaded.iter().find(|(s, _)| s.record.client_id == "a").unwrap();
        assert_eq!(
            a.state.subscriptions,
            vec![Subscribe { topic_filter: TopicFilter::from("x/y"), qos: QoS::AtLeastOnce, id: SubscriptionId::new(7) }]
        );
        assert_eq!(a.state.inflight.len(), 1);

        delete_session(&store, "a").unwrap();
        assert!(fetch::<SessionRecord>(&store, &session_key("a")).unwrap().is_none());
        assert!(fetch::<SubscriptionRecord>(&store, &subscription_key("a:b", "z")).unwrap().is_some());
        assert_eq!(load_sessions(&store, Duration::from_secs(60)).unwrap().len(), 1);
    }

    #[test]
    fn backlog_loads_in_sequence_order() {
        let store = MemStore::new();
        put(&store, &session_key("a"), &session("a", None)).unwrap();
        let queued = |seq: QueueSeq, payload: &'static str| QueuedRecord {
            client_id: "a".into(),
            message: QueuedMessage {
                seq,
                from: Origin::client("o".into()),
                publish: Publish::new("q/1", payload, QoS::AtLeastOnce, false),
            },
        };
        put(&store, &queue_key("a", 10), &queued(10, "second")).unwrap();
        put(&store, &queue_key("a", 9), &queued(9, "first")).unwrap();
        put(&store, &in_inflight_key("a", 5), &InInflightRecord { client_id: "a".into(), packet_id: 5 }).unwrap();

        let loaded = load_sessions(&store, Duration::from_secs(60)).unwrap();
        let state = &loaded[0].0.state;
        let payloads = state.queued.iter().map(|m| m.publish.payload.clone()).collect::<Vec<_>>();
        assert_eq!(payloads, vec!["first", "second"]);
        assert_eq!(state.in_inflight, vec![5]);

        delete_session(&store, "a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn expired_sessions_are_purged_on_load() {
        let store = MemStore::new();
        put(&store, &session_key("old"), &session("old", Some(1))).unwrap();
        assert!(load_sessions(&store, Duration::from_secs(1)).unwrap().is_empty());
        assert!(store.scan_prefix(b"SES:").unwrap().is_empty());
    }
}
