use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use tidemq_net::Builder;
use tidemq_utils::{deserialize_addr, deserialize_duration, Bytesize};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// What an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Tcp,
    Tls,
    Ws,
    Wss,
    Stats,
    Health,
}

impl Kind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Tcp => "tcp",
            Kind::Tls => "tls",
            Kind::Ws => "ws",
            Kind::Wss => "wss",
            Kind::Stats => "stats",
            Kind::Health => "health",
        }
    }

    /// Endpoints carrying MQTT intents, as opposed to informational HTTP ones.
    #[inline]
    pub fn is_mqtt(&self) -> bool {
        matches!(self, Kind::Tcp | Kind::Tls | Kind::Ws | Kind::Wss)
    }
}

/// `[listener.<kind>.<name>]` tables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Listeners {
    #[serde(rename = "tcp")]
    #[serde(default)]
    _tcps: HashMap<String, ListenerInner>,

    #[serde(rename = "tls")]
    #[serde(default)]
    _tlss: HashMap<String, ListenerInner>,

    #[serde(rename = "ws")]
    #[serde(default)]
    _wss: HashMap<String, ListenerInner>,

    #[serde(rename = "wss")]
    #[serde(default)]
    _wsss: HashMap<String, ListenerInner>,

    #[serde(rename = "stats")]
    #[serde(default)]
    _stats: HashMap<String, ListenerInner>,

    #[serde(rename = "health")]
    #[serde(default)]
    _healths: HashMap<String, ListenerInner>,

    /// Enabled listeners ordered by kind, then name.
    #[serde(default, skip)]
    pub items: Vec<Listener>,
}

impl Listeners {
    pub(crate) fn init(&mut self) {
        let tables = [
            (Kind::Tcp, &mut self._tcps),
            (Kind::Tls, &mut self._tlss),
            (Kind::Ws, &mut self._wss),
            (Kind::Wss, &mut self._wsss),
            (Kind::Stats, &mut self._stats),
            (Kind::Health, &mut self._healths),
        ];
        for (kind, table) in tables {
            for (name, mut inner) in table.drain() {
                if inner.enable {
                    inner.name = name;
                    inner.kind = kind;
                    self.items.push(Listener::new(inner));
                }
            }
        }
        self.items.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Listener> {
        self.items.iter().find(|l| l.name == name)
    }

    #[inline]
    pub fn of_kind(&self, kind: Kind) -> impl Iterator<Item = &Listener> {
        self.items.iter().filter(move |l| l.kind == kind)
    }

    /// t1 tcp :1883, ts1 tls :8883, ws1 wss :8884, stats :8080, health :8081.
    pub(crate) fn set_default(&mut self) {
        let defaults = [
            ("t1", Kind::Tcp, 1883),
            ("ts1", Kind::Tls, 8883),
            ("ws1", Kind::Wss, 8884),
            ("stats", Kind::Stats, 8080),
            ("health", Kind::Health, 8081),
        ];
        self.items = defaults
            .into_iter()
            .map(|(name, kind, port)| {
                Listener::new(ListenerInner {
                    name: name.into(),
                    kind,
                    addr: ([0, 0, 0, 0], port).into(),
                    ..Default::default()
                })
            })
            .collect();
    }

    /// Endpoints that terminate TLS and have no material of their own use the
    /// command line certificate and key.
    pub(crate) fn fill_tls(&mut self, cert: &str, key: &str) {
        for l in self.items.iter_mut() {
            if l.tls_required() {
                let inner = Arc::make_mut(&mut l.inner);
                if inner.cert.is_none() {
                    inner.cert = Some(cert.to_owned());
                }
                if inner.key.is_none() {
                    inner.key = Some(key.to_owned());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    #[inline]
    pub fn new(inner: ListenerInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    #[inline]
    pub fn tls_required(&self) -> bool {
        match self.kind {
            Kind::Tls | Kind::Wss => true,
            Kind::Stats | Kind::Health => self.tls,
            Kind::Tcp | Kind::Ws => false,
        }
    }

    /// Network builder for this endpoint.
    pub fn builder(&self) -> Builder {
        Builder::new()
            .name(format!("{}/{}", self.name, self.kind.as_str()))
            .laddr(self.addr)
            .backlog(self.backlog)
            .nodelay(self.nodelay)
            .reuseaddr(self.reuseaddr)
            .reuseport(self.reuseport)
            .max_packet_size(self.max_packet_size.as_u32())
            .handshake_timeout(self.handshake_timeout)
            .send_timeout(self.send_timeout)
            .tls_cert(self.cert.clone())
            .tls_key(self.key.clone())
    }
}

impl Deref for Listener {
    type Target = ListenerInner;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerInner {
    #[serde(skip, default)]
    pub name: String,
    #[serde(skip, default = "ListenerInner::kind_default")]
    pub kind: Kind,
    #[serde(default = "ListenerInner::enable_default")]
    pub enable: bool,
    #[serde(deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    #[serde(default = "ListenerInner::max_connections_default")]
    pub max_connections: usize,
    #[serde(default = "ListenerInner::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default = "ListenerInner::backlog_default")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
    #[serde(default = "ListenerInner::reuseaddr_default")]
    pub reuseaddr: Option<bool>,
    #[serde(default)]
    pub reuseport: Option<bool>,
    #[serde(default = "ListenerInner::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "ListenerInner::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    /// Only read by the informational endpoints; TLS and WSS always terminate TLS.
    #[serde(default = "ListenerInner::tls_default")]
    pub tls: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
}

impl Default for ListenerInner {
    fn default() -> Self {
        Self {
            name: "t1".into(),
            kind: ListenerInner::kind_default(),
            enable: ListenerInner::enable_default(),
            addr: ([0, 0, 0, 0], 1883).into(),
            max_connections: ListenerInner::max_connections_default(),
            max_packet_size: ListenerInner::max_packet_size_default(),
            backlog: ListenerInner::backlog_default(),
            nodelay: false,
            reuseaddr: ListenerInner::reuseaddr_default(),
            reuseport: None,
            handshake_timeout: ListenerInner::handshake_timeout_default(),
            send_timeout: ListenerInner::send_timeout_default(),
            tls: ListenerInner::tls_default(),
            cert: None,
            key: None,
        }
    }
}

impl ListenerInner {
    fn kind_default() -> Kind {
        Kind::Tcp
    }
    fn enable_default() -> bool {
        true
    }
    #[inline]
    fn max_connections_default() -> usize {
        1024000
    }
    #[inline]
    fn max_packet_size_default() -> Bytesize {
        Bytesize(1024 * 1024)
    }
    #[inline]
    fn reuseaddr_default() -> Option<bool> {
        Some(true)
    }
    #[inline]
    fn backlog_default() -> i32 {
        1024
    }
    #[inline]
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    #[inline]
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    #[inline]
    fn tls_default() -> bool {
        true
    }
}
