use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::error::SendError;
use tokio::time::{sleep, Instant};

use crate::codec::Publish;
use crate::conf::Settings;
use crate::hook::HookManager;
use crate::lifecycle::{Lifecycle, State};
use crate::retain::RetainTable;
use crate::router::Router;
use crate::session;
use crate::stats::Stats;
use crate::storage::{self, KvStore};
use crate::types::{ClientId, Message, Origin, Reason, Retain, SessionEntry};
use crate::Result;

pub type Sessions = DashMap<ClientId, SessionEntry, ahash::RandomState>;

/// One broker instance. Everything a connection, the inline client or a
/// listener needs is reached through it; several can coexist in a process.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub router: Router,
    pub retain: RetainTable,
    pub hooks: HookManager,
    /// Registry of session mailboxes, online, offline and inline.
    pub sessions: Sessions,
    pub stats: Stats,
    pub store: Option<Arc<dyn KvStore>>,
    pub lifecycle: Lifecycle,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext {{ state: {}, sessions: {} }}", self.lifecycle.state(), self.sessions.len())
    }
}

pub struct ServerContextBuilder {
    settings: Settings,
    hooks: HookManager,
    store: Option<Arc<dyn KvStore>>,
}

impl ServerContextBuilder {
    #[inline]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    #[inline]
    pub fn hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = hooks;
        self
    }

    #[inline]
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> ServerContext {
        ServerContext {
            inner: Arc::new(ServerContextInner {
                settings: self.settings,
                router: Router::new(),
                retain: RetainTable::new(self.store.clone()),
                hooks: self.hooks,
                sessions: DashMap::default(),
                stats: Stats::new(),
                store: self.store,
                lifecycle: Lifecycle::new(),
            }),
        }
    }
}

impl ServerContext {
    #[inline]
    pub fn builder() -> ServerContextBuilder {
        ServerContextBuilder { settings: Settings::default(), hooks: HookManager::new(), store: None }
    }

    #[inline]
    pub fn new(settings: Settings) -> Self {
        Self::builder().settings(settings).build()
    }

    /// Loads retained records and persistent sessions from the store. Restored
    /// sessions start offline and expire unless their client comes back.
    pub async fn load(&self) -> Result<()> {
        let retains = self.retain.load()?;
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let sessions = storage::load_sessions(store.as_ref(), self.settings.mqtt.session_expiry)?;
        let count = sessions.len();
        for (stored, remaining) in sessions {
            session::restore(self, stored, remaining).await;
        }
        log::info!("loaded {} retained messages and {} persistent sessions", retains, count);
        Ok(())
    }

    /// The delivery pipeline. Returns how many sessions the message was
    /// handed to.
    ///
    /// Interceptors may rewrite or veto the message. The retained record is
    /// written before fan-out and its failure fails the call. Each matched
    /// session gets one copy at the lower of the publish QoS and its granted QoS.
    pub async fn publish(&self, from: Origin, publish: Publish) -> Result<usize> {
        self.stats.received(publish.payload.len());
        let original = publish.clone();
        let Some(mut publish) = self.hooks.message_publish(&from, publish).await else {
            log::debug!("{} message vetoed, topic: {}", from, original.topic);
            self.stats.dropped();
            self.hooks.message_dropped(None, &from, &original, &Reason::Vetoed).await;
            return Ok(0);
        };
        publish.dup = false;
        publish.packet_id = None;

        if publish.retain {
            let retain = if publish.payload.is_empty() {
                None
            } else {
                Some(Retain::new(from.clone(), publish.clone()))
            };
            self.retain.set(&publish.topic, retain)?;
        }

        self.hooks.message_published(&from, &publish).await;

        let mut delivered = 0;
        for (client_id, qos) in self.router.matches(&publish.topic)? {
            let mut p = publish.clone();
            p.retain = false;
            p.qos = publish.qos.less_value(qos);
            if self.forward(&client_id, from.clone(), p).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Hands a message to the mailbox of `client_id`. A mailbox closed by a
    /// session that is being replaced is looked up once more.
    pub(crate) async fn forward(&self, client_id: &ClientId, from: Origin, publish: Publish) -> bool {
        let mut msg = Message::Forward(from, publish);
        for _ in 0..2 {
            let tx = match self.sessions.get(client_id) {
                Some(entry) => entry.tx.clone(),
                None => break,
            };
            match tx.send(msg) {
                Ok(()) => return true,
                Err(SendError(m)) => {
                    msg = m;
                    tokio::task::yield_now().await;
                }
            }
        }
        if let Message::Forward(from, publish) = msg {
            self.stats.dropped();
            self.hooks.message_dropped(Some(client_id), &from, &publish, &Reason::ConnectionClosed).await;
        }
        false
    }

    /// Enters Draining: listeners stop accepting, connected sessions get up to
    /// `drain_timeout` to finish their QoS exchanges, then every session task
    /// is told to close.
    pub async fn drain(&self) {
        if self.lifecycle.state() >= State::Stopped {
            return;
        }
        self.lifecycle.transition(State::Draining);
        let deadline = Instant::now() + self.settings.mqtt.drain_timeout;
        loop {
            let pending: usize =
                self.sessions.iter().filter(|e| e.info.connected()).map(|e| e.info.inflights()).sum();
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("drain timeout, {} exchanges still in flight", pending);
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        let entries = self.sessions.iter().map(|e| e.tx.clone()).collect::<Vec<_>>();
        for tx in entries {
            let _ = tx.send(Message::Close);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.sessions.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        log::info!("drained, {} sessions left in the registry", self.sessions.len());
    }

    /// Flushes and closes the store, then enters Stopped.
    pub async fn stop(&self) -> Result<()> {
        if let Some(store) = self.store.as_ref() {
            store.flush()?;
            store.close()?;
        }
        self.lifecycle.transition(State::Stopped);
        Ok(())
    }

    #[inline]
    pub fn stats_json(&self) -> serde_json::Value {
        self.stats.to_json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowHook;
    use crate::codec::QoS;
    use crate::hook::{InterceptHook, Intercepted, Type};
    use crate::storage::MemStore;
    use crate::types::{Id, SessionInfo};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn attach(scx: &ServerContext, client_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = Arc::new(SessionInfo::new(Id::from_client_id(client_id.into()), true, 0));
        scx.sessions.insert(client_id.into(), SessionEntry { tx, info });
        rx
    }

    fn forwarded(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Publish> {
        let mut out = Vec::new();
        while let Ok(Message::Forward(_, p)) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn fan_out_downgrades_qos() {
        let scx = ServerContext::builder().build();
        let mut a = attach(&scx, "a");
        let mut b = attach(&scx, "b");
        scx.router.add("t/+", "a".into(), QoS::AtMostOnce).unwrap();
        scx.router.add("t/#", "b".into(), QoS::ExactlyOnce).unwrap();

        let p = Publish::new("t/1", "x", QoS::AtLeastOnce, false);
        assert_eq!(scx.publish(Origin::client("p".into()), p).await.unwrap(), 2);
        assert_eq!(forwarded(&mut a)[0].qos, QoS::AtMostOnce);
        assert_eq!(forwarded(&mut b)[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn retained_flag_cleared_on_live_delivery() {
        let scx = ServerContext::builder().build();
        let mut a = attach(&scx, "a");
        scx.router.add("r", "a".into(), QoS::AtLeastOnce).unwrap();
        let p = Publish::new("r", "1", QoS::AtLeastOnce, true);
        scx.publish(Origin::client("p".into()), p).await.unwrap();
        assert!(!forwarded(&mut a)[0].retain);
        assert_eq!(scx.retain.count(), 1);

        scx.publish(Origin::client("p".into()), Publish::new("r", "", QoS::AtMostOnce, true)).await.unwrap();
        assert_eq!(scx.retain.count(), 0);
    }

    struct Veto;

    #[async_trait]
    impl InterceptHook for Veto {
        async fn intercept(&self, _from: &Origin, publish: Publish) -> Result<Intercepted> {
            if publish.topic.starts_with("secret/") {
                Ok(Intercepted::Veto)
            } else {
                Ok(Intercepted::Continue(publish))
            }
        }
    }

    #[tokio::test]
    async fn veto_skips_retain_and_delivery() {
        let scx = ServerContext::builder().build();
        let register = scx.hooks.register();
        register.add_intercept(0, Arc::new(Veto)).await.unwrap();
        register.add_gate(&[Type::ClientAuthenticate], 0, Arc::new(AllowHook)).await.unwrap();
        register.start().await;

        let mut a = attach(&scx, "a");
        scx.router.add("#", "a".into(), QoS::AtLeastOnce).unwrap();
        let n = scx
            .publish(Origin::client("p".into()), Publish::new("secret/x", "1", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(scx.retain.count(), 0);
        assert!(forwarded(&mut a).is_empty());
        assert_eq!(scx.stats_json()["messages_dropped"], 1);
    }

    #[tokio::test]
    async fn failed_retain_write_fails_the_publish() {
        let store = Arc::new(MemStore::new());
        let scx = ServerContext::builder().store(store.clone()).build();
        let mut a = attach(&scx, "a");
        scx.router.add("r", "a".into(), QoS::AtLeastOnce).unwrap();
        store.close().unwrap();
        let res = scx.publish(Origin::client("p".into()), Publish::new("r", "1", QoS::AtLeastOnce, true)).await;
        assert!(res.is_err());
        assert!(forwarded(&mut a).is_empty());
    }

    #[tokio::test]
    async fn closed_mailbox_counts_as_dropped() {
        let scx = ServerContext::builder().build();
        drop(attach(&scx, "gone"));
        scx.router.add("t", "gone".into(), QoS::AtMostOnce).unwrap();
        let n = scx.publish(Origin::client("p".into()), Publish::new("t", "1", QoS::AtMostOnce, false)).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(scx.stats_json()["messages_dropped"], 1);
    }
}
