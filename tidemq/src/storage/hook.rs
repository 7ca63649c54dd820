use std::sync::Arc;

use async_trait::async_trait;

use crate::hook::{ObserveHook, Parameter, Register, Type};
use crate::types::SessionInfo;
use crate::utils::timestamp_millis;
use crate::Result;

use crate::codec::QoS;

use super::{
    delete_session, fetch, in_inflight_key, inflight_key, put, queue_key, session_key, subscription_key,
    InInflightRecord, InflightRecord, KvStore, QueuedRecord, SessionRecord, SubscriptionRecord,
};

/// Keeps the store in step with persistent sessions: their record,
/// subscriptions, unacknowledged deliveries in both directions and the QoS 1/2
/// part of their backlog. Clean sessions are ignored.
pub struct StorageHook {
    store: Arc<dyn KvStore>,
}

impl StorageHook {
    #[inline]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub const TYPES: [Type; 12] = [
        Type::SessionCreated,
        Type::SessionTerminated,
        Type::SessionSubscribed,
        Type::SessionUnsubscribed,
        Type::ClientConnected,
        Type::ClientDisconnected,
        Type::InflightPushed,
        Type::InflightRemoved,
        Type::InInflightPushed,
        Type::InInflightRemoved,
        Type::MessageQueued,
        Type::MessageDequeued,
    ];

    /// Registers on every point it handles and starts the registration.
    pub async fn register(self, register: &Register) -> Result<()> {
        register.add_observe(&Self::TYPES, 0, Arc::new(self)).await?;
        register.start().await;
        Ok(())
    }

    fn save_session(&self, s: &SessionInfo, disconnected: bool) -> Result<()> {
        let key = session_key(s.client_id());
        let created_at = fetch::<SessionRecord>(self.store.as_ref(), &key)?
            .map(|r| r.created_at)
            .unwrap_or(s.created_at);
        let record = SessionRecord {
            client_id: s.client_id().clone(),
            username: s.id.username.clone(),
            created_at,
            disconnected_at: if disconnected { Some(timestamp_millis()) } else { None },
        };
        put(self.store.as_ref(), &key, &record)
    }
}

#[async_trait]
impl ObserveHook for StorageHook {
    async fn notify(&self, param: &Parameter<'_>) -> Result<()> {
        let store = self.store.as_ref();
        match param {
            Parameter::SessionCreated(s) if s.is_persistent() => {
                delete_session(store, s.client_id())?;
                self.save_session(s, false)?;
            }
            Parameter::ClientConnected(s) if s.is_persistent() => {
                self.save_session(s, false)?;
            }
            Parameter::ClientDisconnected(s, _) if s.is_persistent() => {
                self.save_session(s, true)?;
            }
            Parameter::SessionTerminated(s, _) if s.is_persistent() => {
                delete_session(store, s.client_id())?;
            }
            Parameter::SessionSubscribed(s, sub) if s.is_persistent() => {
                let record = SubscriptionRecord {
                    client_id: s.client_id().clone(),
                    topic_filter: sub.topic_filter.clone(),
                    qos: sub.qos,
                    id: sub.id,
                };
                put(store, &subscription_key(s.client_id(), &sub.topic_filter), &record)?;
            }
            Parameter::SessionUnsubscribed(s, topic_filter) if s.is_persistent() => {
                store.delete(subscription_key(s.client_id(), topic_filter).as_bytes())?;
            }
            Parameter::InflightPushed(s, m) if s.is_persistent() => {
                if let Some(pid) = m.packet_id() {
                    let record = InflightRecord { client_id: s.client_id().clone(), message: (*m).clone() };
                    put(store, &inflight_key(s.client_id(), pid), &record)?;
                }
            }
            Parameter::InflightRemoved(s, pid) if s.is_persistent() => {
                store.delete(inflight_key(s.client_id(), *pid).as_bytes())?;
            }
            Parameter::InInflightPushed(s, pid) if s.is_persistent() => {
                let record = InInflightRecord { client_id: s.client_id().clone(), packet_id: *pid };
                put(store, &in_inflight_key(s.client_id(), *pid), &record)?;
            }
            Parameter::InInflightRemoved(s, pid) if s.is_persistent() => {
                store.delete(in_inflight_key(s.client_id(), *pid).as_bytes())?;
            }
            Parameter::MessageQueued(s, m) if s.is_persistent() && m.publish.qos != QoS::AtMostOnce => {
                let record = QueuedRecord { client_id: s.client_id().clone(), message: (*m).clone() };
                put(store, &queue_key(s.client_id(), m.seq), &record)?;
            }
            Parameter::MessageDequeued(s, seq) if s.is_persistent() => {
                store.delete(queue_key(s.client_id(), *seq).as_bytes())?;
            }
            _ => {}
        }
        Ok(())
    }
}
