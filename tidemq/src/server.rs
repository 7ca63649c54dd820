//! Listener management.
//!
//! ```rust,no_run
//! use tidemq::context::ServerContext;
//! use tidemq::net::Builder;
//! use tidemq::server::MqttServer;
//!
//! #[tokio::main]
//! async fn main() -> tidemq::Result<()> {
//!     let scx = ServerContext::builder().build();
//!     scx.load().await?;
//!     let server = MqttServer::new(scx)
//!         .listener(Builder::new().name("t1").laddr(([0, 0, 0, 0], 1883).into()).bind()?.tcp()?)
//!         .build();
//!     server.start();
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await
//! }
//! ```

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::conf::Kind;
use crate::context::ServerContext;
use crate::lifecycle::State;
use crate::net::{Acceptor, HttpServer, Listener, ListenerType};
use crate::storage;
use crate::utils::Counter;
use crate::{v3, Result};

pub struct MqttServerBuilder {
    scx: ServerContext,
    listeners: Vec<(Listener, usize)>,
    https: Vec<HttpServer>,
}

impl MqttServerBuilder {
    fn new(scx: ServerContext) -> Self {
        Self { scx, listeners: Vec::new(), https: Vec::new() }
    }

    /// Adds an MQTT listener without a connection limit.
    #[inline]
    pub fn listener(self, listen: Listener) -> Self {
        self.listener_limited(listen, 0)
    }

    /// Adds an MQTT listener that accepts at most `max_connections` concurrent
    /// connections, 0 meaning unlimited.
    pub fn listener_limited(mut self, listen: Listener, max_connections: usize) -> Self {
        self.listeners.push((listen, max_connections));
        self
    }

    /// Adds a statistics endpoint serving the broker snapshot.
    pub fn stats(mut self, listen: Listener) -> Self {
        let scx = self.scx.clone();
        self.https.push(HttpServer::stats(listen, move || scx.stats_json()));
        self
    }

    pub fn health(mut self, listen: Listener) -> Self {
        self.https.push(HttpServer::health(listen));
        self
    }

    /// Binds every enabled listener of the settings. The first failure is
    /// returned and nothing is left bound.
    pub fn configured(mut self) -> Result<Self> {
        let settings = self.scx.settings.clone();
        for l in settings.listeners.items.iter().filter(|l| l.enable) {
            let bound = l.builder().bind()?;
            self = match l.kind {
                Kind::Tcp => self.listener_limited(bound.tcp()?, l.max_connections),
                Kind::Tls => self.listener_limited(bound.tls()?, l.max_connections),
                Kind::Ws => self.listener_limited(bound.ws()?, l.max_connections),
                Kind::Wss => self.listener_limited(bound.wss()?, l.max_connections),
                Kind::Stats => self.stats(if l.tls_required() { bound.tls()? } else { bound }),
                Kind::Health => self.health(if l.tls_required() { bound.tls()? } else { bound }),
            };
        }
        Ok(self)
    }

    pub fn build(self) -> MqttServer {
        let mut addrs = self
            .listeners
            .iter()
            .map(|(l, _)| (l.cfg.name.clone(), l.local_addr()))
            .collect::<Vec<_>>();
        addrs.extend(self.https.iter().map(|h| (h.name().to_owned(), h.local_addr())));
        MqttServer {
            inner: Arc::new(MqttServerInner {
                scx: self.scx,
                addrs,
                listeners: Mutex::new(self.listeners),
                https: Mutex::new(self.https),
                tasks: Mutex::new(Vec::new()),
                gc: Mutex::new(None),
            }),
        }
    }
}

#[derive(Clone)]
pub struct MqttServer {
    inner: Arc<MqttServerInner>,
}

pub struct MqttServerInner {
    pub scx: ServerContext,
    addrs: Vec<(String, SocketAddr)>,
    listeners: Mutex<Vec<(Listener, usize)>>,
    https: Mutex<Vec<HttpServer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl Deref for MqttServer {
    type Target = MqttServerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl MqttServer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(scx: ServerContext) -> MqttServerBuilder {
        MqttServerBuilder::new(scx)
    }

    /// The bound address of every endpoint, by listener name.
    #[inline]
    pub fn local_addrs(&self) -> &[(String, SocketAddr)] {
        &self.addrs
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.addrs.iter().find(|(n, _)| n == name).map(|(_, a)| *a)
    }

    /// Starts accepting on every endpoint and the store reclamation task, then
    /// enters Running. Calling it again does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for (l, max_connections) in self.listeners.lock().drain(..) {
            tasks.push(tokio::spawn(listen(self.scx.clone(), l, max_connections)));
        }
        for http in self.https.lock().drain(..) {
            let shutdown = self.scx.lifecycle.draining();
            tasks.push(tokio::spawn(async move {
                let name = http.name().to_owned();
                if let Err(e) = http.serve(shutdown).await {
                    log::error!("{} http endpoint failed, {:?}", name, e);
                }
            }));
        }
        drop(tasks);

        if let Some(store) = self.scx.store.clone() {
            let cfg = &self.scx.settings.store;
            let mut gc = self.gc.lock();
            if gc.is_none() {
                *gc = Some(storage::spawn_gc(store, cfg.gc_interval, cfg.gc_discard_ratio));
            }
        }
        self.scx.lifecycle.transition(State::Running);
    }

    /// Stops accepting, lets in-flight exchanges finish within the drain
    /// timeout, closes every session and finally flushes and closes the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.scx.lifecycle.transition(State::Draining);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("listener task ended abnormally, {:?}", e);
            }
        }
        self.listeners.lock().clear();
        self.https.lock().clear();

        self.scx.drain().await;
        if let Some(gc) = self.gc.lock().take() {
            gc.abort();
        }
        self.scx.stop().await
    }
}

async fn listen(scx: ServerContext, l: Listener, max_connections: usize) {
    let name = l.cfg.name.clone();
    let active = Arc::new(Counter::new());
    let draining = scx.lifecycle.draining();
    tokio::pin!(draining);
    loop {
        let accepted = tokio::select! {
            _ = &mut draining => break,
            accepted = l.accept() => accepted,
        };
        match accepted {
            Ok(acceptor) => {
                if max_connections > 0 && active.count() >= max_connections as isize {
                    log::warn!("{} connection limit {} reached, dropping {}", name, max_connections, acceptor.remote_addr);
                    continue;
                }
                active.inc();
                let scx = scx.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    let _active = scopeguard::guard((), |_| active.dec());
                    serve(scx, acceptor).await;
                });
            }
            Err(e) => {
                log::info!("{} accept error, {:?}", name, e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
    log::info!("{} stopped accepting on {}", name, l.local_addr());
}

async fn serve(scx: ServerContext, acceptor: Acceptor<TcpStream>) {
    let typ = acceptor.typ;
    let remote_addr = acceptor.remote_addr;
    log::debug!("{} connection from {}", typ.as_str(), remote_addr);
    let res = match typ {
        ListenerType::TCP => match acceptor.tcp() {
            Ok(s) => v3::process(scx, s).await,
            Err(e) => Err(e),
        },
        ListenerType::TLS => match acceptor.tls().await {
            Ok(s) => v3::process(scx, s).await,
            Err(e) => Err(e),
        },
        ListenerType::WS => match acceptor.ws().await {
            Ok(s) => v3::process(scx, s).await,
            Err(e) => Err(e),
        },
        ListenerType::WSS => match acceptor.wss().await {
            Ok(s) => v3::process(scx, s).await,
            Err(e) => Err(e),
        },
    };
    if let Err(e) = res {
        log::info!("{}/{} connection ended, {:?}", typ.as_str(), remote_addr, e);
    }
}
