//! The in-process client.
//!
//! It sits in the session registry like any connection, so the delivery
//! pipeline treats it the same way, but it publishes through direct calls and
//! receives through callbacks. Every matching registration gets its own copy.
//! It is trusted: the ACL gates are not consulted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::RwLock;

use crate::codec::{Publish, QoS};
use crate::context::ServerContext;
use crate::net::MqttError;
use crate::topic::Topic;
use crate::types::{ClientId, Id, Message, MessageReceiver, Origin, SessionEntry, SessionInfo, TopicFilter};
use crate::utils::timestamp_millis;
use crate::Result;

pub type Callback = Arc<dyn Fn(&Publish) + Send + Sync>;

struct Registration {
    id: u64,
    topic: Topic,
    topic_filter: TopicFilter,
    qos: QoS,
    callback: Callback,
}

type Registrations = Arc<RwLock<Vec<Registration>>>;

#[derive(Clone)]
pub struct InlineClient {
    scx: ServerContext,
    info: Arc<SessionInfo>,
    registrations: Registrations,
    seq: Arc<AtomicU64>,
}

impl InlineClient {
    /// Registers the client under `client_id` and starts its mailbox task.
    pub fn new<C: Into<ClientId>>(scx: &ServerContext, client_id: C) -> Self {
        let client_id = client_id.into();
        let info = Arc::new(SessionInfo::new(Id::from_client_id(client_id.clone()), true, timestamp_millis()));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let registrations: Registrations = Arc::new(RwLock::new(Vec::new()));
        if let Some(prev) = scx.sessions.insert(client_id.clone(), SessionEntry { tx: tx.clone(), info: info.clone() }) {
            log::warn!("inline client {} replaces session {}", client_id, prev.info.id);
            let _ = prev.tx.send(Message::Close);
        }
        tokio::spawn(mailbox(scx.clone(), info.clone(), tx, rx, registrations.clone()));
        Self { scx: scx.clone(), info, registrations, seq: Arc::new(AtomicU64::new(1)) }
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        self.info.client_id()
    }

    /// Publishes through the delivery pipeline. Returns how many sessions the
    /// message was handed to.
    pub async fn publish<T, P>(&self, topic: T, payload: P, retain: bool, qos: QoS) -> Result<usize>
    where
        ByteString: From<T>,
        Bytes: From<P>,
    {
        let publish = Publish::new(topic, payload, qos, retain);
        Topic::name(&publish.topic).map_err(|e| MqttError::InvalidTopic(format!("{}, {}", publish.topic, e)))?;
        self.scx.publish(Origin::inline(self.client_id().clone()), publish).await
    }

    /// Calls `callback` for every message matching `topic_filter`, starting
    /// with the retained ones. Returns a registration id.
    pub fn subscribe<F>(&self, topic_filter: &str, qos: QoS, callback: F) -> Result<u64>
    where
        F: Fn(&Publish) + Send + Sync + 'static,
    {
        let topic = Topic::filter(topic_filter).map_err(|e| MqttError::InvalidTopic(format!("{}, {}", topic_filter, e)))?;
        let qos = qos.less_value(self.scx.settings.mqtt.max_qos_allowed);
        let callback: Callback = Arc::new(callback);
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        let topic_filter = TopicFilter::from(topic_filter);
        {
            let mut regs = self.registrations.write();
            regs.push(Registration {
                id,
                topic,
                topic_filter: topic_filter.clone(),
                qos,
                callback: callback.clone(),
            });
            self.scx.router.add(&topic_filter, self.client_id().clone(), max_qos(&regs, &topic_filter))?;
        }

        for (_, retain) in self.scx.retain.matches(&topic_filter)? {
            let mut p = retain.publish;
            p.retain = true;
            p.qos = p.qos.less_value(qos);
            callback(&p);
        }
        log::debug!("inline client {} subscribed to {}", self.client_id(), topic_filter);
        Ok(id)
    }

    /// Removes the registrations of `topic_filter` made at `qos`. Returns how
    /// many were removed.
    pub fn unsubscribe(&self, topic_filter: &str, qos: QoS) -> usize {
        let mut regs = self.registrations.write();
        let before = regs.len();
        regs.retain(|r| !(r.topic_filter == topic_filter && r.qos == qos));
        self.reroute(&regs, topic_filter);
        before - regs.len()
    }

    /// Removes one registration by the id `subscribe` returned.
    pub fn unsubscribe_id(&self, id: u64) -> bool {
        let mut regs = self.registrations.write();
        let Some(pos) = regs.iter().position(|r| r.id == id) else {
            return false;
        };
        let r = regs.remove(pos);
        self.reroute(&regs, &r.topic_filter);
        true
    }

    fn reroute(&self, regs: &[Registration], topic_filter: &str) {
        if regs.iter().any(|r| r.topic_filter == topic_filter) {
            if let Err(e) = self.scx.router.add(topic_filter, self.client_id().clone(), max_qos(regs, topic_filter)) {
                log::warn!("inline client {} reroute failed, {:?}", self.client_id(), e);
            }
        } else {
            self.scx.router.remove(topic_filter, self.client_id());
        }
    }

    /// Leaves the registry; the mailbox task ends.
    pub fn close(&self) {
        if let Some(entry) = self.scx.sessions.get(self.client_id()) {
            let _ = entry.tx.send(Message::Close);
        }
    }
}

fn max_qos(regs: &[Registration], topic_filter: &str) -> QoS {
    regs.iter().filter(|r| r.topic_filter == topic_filter).map(|r| r.qos).max().unwrap_or(QoS::AtMostOnce)
}

async fn mailbox(
    scx: ServerContext,
    info: Arc<SessionInfo>,
    tx: crate::types::MessageSender,
    mut rx: MessageReceiver,
    registrations: Registrations,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Forward(from, publish) => {
                let targets = registrations
                    .read()
                    .iter()
                    .filter(|r| r.topic.matches_str(&publish.topic))
                    .map(|r| (r.qos, r.callback.clone()))
                    .collect::<Vec<_>>();
                for (qos, callback) in targets {
                    let mut p = publish.clone();
                    p.qos = p.qos.less_value(qos);
                    callback(&p);
                    scx.stats.sent(p.payload.len());
                    scx.hooks.message_delivered(&info, &from, &p).await;
                }
            }
            Message::Kick(reply, _) => {
                let _ = reply.send(None);
                break;
            }
            Message::Close => break,
        }
    }

    let filters = registrations.read().iter().map(|r| r.topic_filter.clone()).collect::<Vec<_>>();
    scx.router.remove_all(info.client_id(), filters.iter());
    scx.sessions.remove_if(info.client_id(), |_, e| e.same_channel(&tx));
    log::debug!("inline client {} closed", info.client_id());
}

impl std::fmt::Debug for InlineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InlineClient {{ client_id: {}, registrations: {} }}", self.client_id(), self.registrations.read().len())
    }
}
