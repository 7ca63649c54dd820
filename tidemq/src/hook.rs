//! Hook chain.
//!
//! Hooks attach to [`Type`] points. Each point belongs to one of three kinds:
//!
//! * gate points ask [`GateHook`]s for a [`Verdict`]; the first hook that does
//!   not [`Verdict::Pass`] decides, a failing hook counts as a deny and a
//!   chain without an answer denies;
//! * the intercept point hands a publish through every [`InterceptHook`], any
//!   of which may rewrite or veto it;
//! * observe points inform every [`ObserveHook`]; failures are logged and
//!   skipped.
//!
//! Within a point hooks run by ascending `order`, then registration order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::codec::Publish;
use crate::inflight::OutInflightMessage;
use crate::queue::{QueueSeq, QueuedMessage};
use crate::types::{ClientId, ConnectInfo, Origin, PacketId, Reason, SessionInfo, Subscribe, TopicFilter};
use crate::Result;

pub type Order = u32;
type Seq = u64;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Type {
    ClientAuthenticate,
    ClientSubscribeCheckAcl,
    MessagePublishCheckAcl,

    MessagePublish,

    SessionCreated,
    SessionTerminated,
    SessionSubscribed,
    SessionUnsubscribed,
    ClientConnected,
    ClientDisconnected,
    MessagePublished,
    MessageDelivered,
    MessageAcked,
    MessageDropped,
    InflightPushed,
    InflightRemoved,
    InInflightPushed,
    InInflightRemoved,
    MessageQueued,
    MessageDequeued,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Kind {
    Gate,
    Intercept,
    Observe,
}

impl Type {
    #[inline]
    pub fn kind(&self) -> Kind {
        match self {
            Type::ClientAuthenticate | Type::ClientSubscribeCheckAcl | Type::MessagePublishCheckAcl => Kind::Gate,
            Type::MessagePublish => Kind::Intercept,
            _ => Kind::Observe,
        }
    }

    pub const OBSERVE_ALL: [Type; 16] = [
        Type::SessionCreated,
        Type::SessionTerminated,
        Type::SessionSubscribed,
        Type::SessionUnsubscribed,
        Type::ClientConnected,
        Type::ClientDisconnected,
        Type::MessagePublished,
        Type::MessageDelivered,
        Type::MessageAcked,
        Type::MessageDropped,
        Type::InflightPushed,
        Type::InflightRemoved,
        Type::InInflightPushed,
        Type::InInflightRemoved,
        Type::MessageQueued,
        Type::MessageDequeued,
    ];

    pub const GATE_ALL: [Type; 3] =
        [Type::ClientAuthenticate, Type::ClientSubscribeCheckAcl, Type::MessagePublishCheckAcl];
}

#[derive(Debug, Clone)]
pub enum Parameter<'a> {
    ClientAuthenticate(&'a ConnectInfo),
    ClientSubscribeCheckAcl(&'a SessionInfo, &'a Subscribe),
    MessagePublishCheckAcl(&'a SessionInfo, &'a Publish),

    SessionCreated(&'a SessionInfo),
    SessionTerminated(&'a SessionInfo, &'a Reason),
    SessionSubscribed(&'a SessionInfo, &'a Subscribe),
    SessionUnsubscribed(&'a SessionInfo, &'a TopicFilter),
    ClientConnected(&'a SessionInfo),
    ClientDisconnected(&'a SessionInfo, &'a Reason),
    MessagePublished(&'a Origin, &'a Publish),
    MessageDelivered(&'a SessionInfo, &'a Origin, &'a Publish),
    MessageAcked(&'a SessionInfo, &'a Origin, &'a Publish),
    /// Recipient, if the message got as far as one.
    MessageDropped(Option<&'a ClientId>, &'a Origin, &'a Publish, &'a Reason),
    InflightPushed(&'a SessionInfo, &'a OutInflightMessage),
    InflightRemoved(&'a SessionInfo, PacketId),
    /// Inbound QoS 2 packet id answered with PUBREC.
    InInflightPushed(&'a SessionInfo, PacketId),
    InInflightRemoved(&'a SessionInfo, PacketId),
    MessageQueued(&'a SessionInfo, &'a QueuedMessage),
    /// Left the backlog, delivered or dropped.
    MessageDequeued(&'a SessionInfo, QueueSeq),
}

impl Parameter<'_> {
    pub fn get_type(&self) -> Type {
        match self {
            Parameter::ClientAuthenticate(_) => Type::ClientAuthenticate,
            Parameter::ClientSubscribeCheckAcl(_, _) => Type::ClientSubscribeCheckAcl,
            Parameter::MessagePublishCheckAcl(_, _) => Type::MessagePublishCheckAcl,

            Parameter::SessionCreated(_) => Type::SessionCreated,
            Parameter::SessionTerminated(_, _) => Type::SessionTerminated,
            Parameter::SessionSubscribed(_, _) => Type::SessionSubscribed,
            Parameter::SessionUnsubscribed(_, _) => Type::SessionUnsubscribed,
            Parameter::ClientConnected(_) => Type::ClientConnected,
            Parameter::ClientDisconnected(_, _) => Type::ClientDisconnected,
            Parameter::MessagePublished(_, _) => Type::MessagePublished,
            Parameter::MessageDelivered(_, _, _) => Type::MessageDelivered,
            Parameter::MessageAcked(_, _, _) => Type::MessageAcked,
            Parameter::MessageDropped(_, _, _, _) => Type::MessageDropped,
            Parameter::InflightPushed(_, _) => Type::InflightPushed,
            Parameter::InflightRemoved(_, _) => Type::InflightRemoved,
            Parameter::InInflightPushed(_, _) => Type::InInflightPushed,
            Parameter::InInflightRemoved(_, _) => Type::InInflightRemoved,
            Parameter::MessageQueued(_, _) => Type::MessageQueued,
            Parameter::MessageDequeued(_, _) => Type::MessageDequeued,
        }
    }
}

/// Answer of a gate hook.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Connection authorization only, answered with `BadUserNameOrPassword`.
    BadCredentials,
    /// No opinion, ask the next hook.
    Pass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercepted {
    Continue(Publish),
    Veto,
}

#[async_trait]
pub trait GateHook: Sync + Send {
    async fn check(&self, param: &Parameter<'_>) -> Result<Verdict>;
}

#[async_trait]
pub trait InterceptHook: Sync + Send {
    async fn intercept(&self, from: &Origin, publish: Publish) -> Result<Intercepted>;
}

#[async_trait]
pub trait ObserveHook: Sync + Send {
    async fn notify(&self, param: &Parameter<'_>) -> Result<()>;
}

#[derive(Clone)]
enum Handler {
    Gate(Arc<dyn GateHook>),
    Intercept(Arc<dyn InterceptHook>),
    Observe(Arc<dyn ObserveHook>),
}

impl Handler {
    fn kind(&self) -> Kind {
        match self {
            Handler::Gate(_) => Kind::Gate,
            Handler::Intercept(_) => Kind::Intercept,
            Handler::Observe(_) => Kind::Observe,
        }
    }
}

struct HookEntry {
    handler: Handler,
    enabled: bool,
}

type Entries = Arc<RwLock<BTreeMap<(Order, Seq), HookEntry>>>;

#[derive(Clone, Default)]
pub struct HookManager {
    handlers: Arc<DashMap<Type, Entries>>,
    seq: Arc<AtomicU64>,
}

impl HookManager {
    #[inline]
    pub fn new() -> HookManager {
        Self::default()
    }

    #[inline]
    pub fn register(&self) -> Register {
        Register { manager: self.clone(), keys: Mutex::new(Vec::new()) }
    }

    async fn add(&self, typ: Type, order: Order, handler: Handler) -> Result<(Order, Seq)> {
        if typ.kind() != handler.kind() {
            return Err(anyhow!("{:?} hook cannot be attached to {:?}", handler.kind(), typ));
        }
        let key = (order, self.seq.fetch_add(1, Ordering::SeqCst));
        let entries = self.handlers.entry(typ).or_default().value().clone();
        entries.write().await.insert(key, HookEntry { handler, enabled: false });
        Ok(key)
    }

    #[inline]
    async fn enabled(&self, t: Type) -> Vec<Handler> {
        let entries = { self.handlers.get(&t).map(|h| h.value().clone()) };
        match entries {
            Some(entries) => entries.read().await.values().filter(|e| e.enabled).map(|e| e.handler.clone()).collect(),
            None => Vec::new(),
        }
    }

    async fn gate(&self, p: Parameter<'_>) -> Verdict {
        let t = p.get_type();
        for handler in self.enabled(t).await {
            if let Handler::Gate(h) = handler {
                match h.check(&p).await {
                    Ok(Verdict::Pass) => continue,
                    Ok(v) => return v,
                    Err(e) => {
                        log::warn!("{:?} gate hook failed, treated as deny, {:?}", t, e);
                        return Verdict::Deny;
                    }
                }
            }
        }
        Verdict::Deny
    }

    async fn notify(&self, p: Parameter<'_>) {
        let t = p.get_type();
        for handler in self.enabled(t).await {
            if let Handler::Observe(h) = handler {
                if let Err(e) = h.notify(&p).await {
                    log::warn!("{:?} observe hook failed, {:?}", t, e);
                }
            }
        }
    }

    ///authenticate
    #[inline]
    pub async fn client_authenticate(&self, connect_info: &ConnectInfo) -> Verdict {
        let v = self.gate(Parameter::ClientAuthenticate(connect_info)).await;
        log::debug!("{} authenticate: {:?}", connect_info.id, v);
        v
    }

    ///subscribe check acl
    #[inline]
    pub async fn client_subscribe_check_acl(&self, s: &SessionInfo, subscribe: &Subscribe) -> bool {
        self.gate(Parameter::ClientSubscribeCheckAcl(s, subscribe)).await == Verdict::Allow
    }

    ///publish check acl
    #[inline]
    pub async fn message_publish_check_acl(&self, s: &SessionInfo, publish: &Publish) -> bool {
        self.gate(Parameter::MessagePublishCheckAcl(s, publish)).await == Verdict::Allow
    }

    /// Runs the interceptors. `None` means the message was vetoed.
    pub async fn message_publish(&self, from: &Origin, publish: Publish) -> Option<Publish> {
        let mut publish = publish;
        for handler in self.enabled(Type::MessagePublish).await {
            if let Handler::Intercept(h) = handler {
                match h.intercept(from, publish).await {
                    Ok(Intercepted::Continue(p)) => publish = p,
                    Ok(Intercepted::Veto) => return None,
                    Err(e) => {
                        log::warn!("{} interceptor failed, message vetoed, {:?}", from, e);
                        return None;
                    }
                }
            }
        }
        Some(publish)
    }

    #[inline]
    pub async fn session_created(&self, s: &SessionInfo) {
        self.notify(Parameter::SessionCreated(s)).await
    }

    #[inline]
    pub async fn session_terminated(&self, s: &SessionInfo, r: &Reason) {
        self.notify(Parameter::SessionTerminated(s, r)).await
    }

    #[inline]
    pub async fn session_subscribed(&self, s: &SessionInfo, subscribe: &Subscribe) {
        self.notify(Parameter::SessionSubscribed(s, subscribe)).await
    }

    #[inline]
    pub async fn session_unsubscribed(&self, s: &SessionInfo, topic_filter: &TopicFilter) {
        self.notify(Parameter::SessionUnsubscribed(s, topic_filter)).await
    }

    #[inline]
    pub async fn client_connected(&self, s: &SessionInfo) {
        self.notify(Parameter::ClientConnected(s)).await
    }

    #[inline]
    pub async fn client_disconnected(&self, s: &SessionInfo, r: &Reason) {
        self.notify(Parameter::ClientDisconnected(s, r)).await
    }

    #[inline]
    pub async fn message_published(&self, from: &Origin, publish: &Publish) {
        self.notify(Parameter::MessagePublished(from, publish)).await
    }

    #[inline]
    pub async fn message_delivered(&self, s: &SessionInfo, from: &Origin, publish: &Publish) {
        self.notify(Parameter::MessageDelivered(s, from, publish)).await
    }

    #[inline]
    pub async fn message_acked(&self, s: &SessionInfo, from: &Origin, publish: &Publish) {
        self.notify(Parameter::MessageAcked(s, from, publish)).await
    }

    #[inline]
    pub async fn message_dropped(&self, to: Option<&ClientId>, from: &Origin, publish: &Publish, r: &Reason) {
        self.notify(Parameter::MessageDropped(to, from, publish, r)).await
    }

    #[inline]
    pub async fn inflight_pushed(&self, s: &SessionInfo, m: &OutInflightMessage) {
        self.notify(Parameter::InflightPushed(s, m)).await
    }

    #[inline]
    pub async fn inflight_removed(&self, s: &SessionInfo, packet_id: PacketId) {
        self.notify(Parameter::InflightRemoved(s, packet_id)).await
    }

    #[inline]
    pub async fn in_inflight_pushed(&self, s: &SessionInfo, packet_id: PacketId) {
        self.notify(Parameter::InInflightPushed(s, packet_id)).await
    }

    #[inline]
    pub async fn in_inflight_removed(&self, s: &SessionInfo, packet_id: PacketId) {
        self.notify(Parameter::InInflightRemoved(s, packet_id)).await
    }

    #[inline]
    pub async fn message_queued(&self, s: &SessionInfo, m: &QueuedMessage) {
        self.notify(Parameter::MessageQueued(s, m)).await
    }

    #[inline]
    pub async fn message_dequeued(&self, s: &SessionInfo, seq: QueueSeq) {
        self.notify(Parameter::MessageDequeued(s, seq)).await
    }
}

/// The hooks one party registered. Entries start disabled; `start()` turns
/// them on.
pub struct Register {
    manager: HookManager,
    keys: Mutex<Vec<(Type, (Order, Seq))>>,
}

impl Register {
    async fn add(&self, types: &[Type], order: Order, handler: Handler) -> Result<()> {
        for typ in types {
            let key = self.manager.add(*typ, order, handler.clone()).await?;
            self.keys.lock().push((*typ, key));
        }
        Ok(())
    }

    #[inline]
    pub async fn add_gate(&self, types: &[Type], order: Order, hook: Arc<dyn GateHook>) -> Result<()> {
        self.add(types, order, Handler::Gate(hook)).await
    }

    #[inline]
    pub async fn add_intercept(&self, order: Order, hook: Arc<dyn InterceptHook>) -> Result<()> {
        self.add(&[Type::MessagePublish], order, Handler::Intercept(hook)).await
    }

    #[inline]
    pub async fn add_observe(&self, types: &[Type], order: Order, hook: Arc<dyn ObserveHook>) -> Result<()> {
        self.add(types, order, Handler::Observe(hook)).await
    }

    #[inline]
    pub async fn start(&self) {
        self.adjust_status(true).await;
    }

    #[inline]
    pub async fn stop(&self) {
        self.adjust_status(false).await;
    }

    async fn adjust_status(&self, b: bool) {
        let keys = self.keys.lock().clone();
        for (typ, key) in keys {
            let entries = { self.manager.handlers.get(&typ).map(|h| h.value().clone()) };
            if let Some(entries) = entries {
                if let Some(entry) = entries.write().await.get_mut(&key) {
                    entry.enabled = b;
                }
            }
        }
    }
}
