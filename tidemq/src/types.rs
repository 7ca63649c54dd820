use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{Connect, Publish, QoS, SubscriptionId};
use crate::inflight::OutInflightMessage;
use crate::queue::QueuedMessage;
use crate::utils::{timestamp_millis, TimestampMillis};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type Password = bytes::Bytes;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type PacketId = u16;
pub type IsPersistent = bool;

pub type MessageSender = mpsc::UnboundedSender<Message>;
pub type MessageReceiver = mpsc::UnboundedReceiver<Message>;

/// Identity of one connection: addresses, client id and user name.
#[derive(Clone)]
pub struct Id(Arc<_Id>);

impl Id {
    #[inline]
    pub fn new(
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        client_id: ClientId,
        username: Option<UserName>,
    ) -> Self {
        Self(Arc::new(_Id {
            id: ByteString::from(format!(
                "{}/{}/{}/{}",
                local_addr.map(|addr| addr.to_string()).unwrap_or_default(),
                remote_addr.map(|addr| addr.to_string()).unwrap_or_default(),
                client_id,
                username.as_ref().map(<UserName as AsRef<str>>::as_ref).unwrap_or_default()
            )),
            local_addr,
            remote_addr,
            client_id,
            username,
            create_time: timestamp_millis(),
        }))
    }

    #[inline]
    pub fn from_client_id(client_id: ClientId) -> Self {
        Self::new(None, None, client_id, None)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl Deref for Id {
    type Target = _Id;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Debug for Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.create_time)
    }
}

impl PartialEq for Id {
    #[inline]
    fn eq(&self, other: &Id) -> bool {
        self.id == other.id && self.create_time == other.create_time
    }
}

impl Eq for Id {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct _Id {
    id: ByteString,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub create_time: TimestampMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginType {
    /// A network connection
    Client,
    /// The in-process client
    Inline,
    /// A will message published on behalf of a vanished connection
    LastWill,
    /// Messages restored from the store or injected by an embedder
    Custom,
}

/// Who published a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub typ: OriginType,
    pub client_id: ClientId,
}

impl Origin {
    #[inline]
    pub fn client(client_id: ClientId) -> Self {
        Self { typ: OriginType::Client, client_id }
    }

    #[inline]
    pub fn inline(client_id: ClientId) -> Self {
        Self { typ: OriginType::Inline, client_id }
    }

    #[inline]
    pub fn last_will(client_id: ClientId) -> Self {
        Self { typ: OriginType::LastWill, client_id }
    }

    #[inline]
    pub fn custom(client_id: ClientId) -> Self {
        Self { typ: OriginType::Custom, client_id }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.typ, self.client_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub topic_filter: TopicFilter,
    pub qos: QoS,
    /// Echoed on matching deliveries to MQTT 5 clients.
    pub id: Option<SubscriptionId>,
}

impl Subscribe {
    #[inline]
    pub fn new(topic_filter: TopicFilter, qos: QoS) -> Self {
        Self { topic_filter, qos, id: None }
    }
}

/// Why a connection or session ended, or why a message was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    ClientDisconnect,
    ConnectionClosed,
    KeepaliveTimeout,
    Kicked,
    SessionExpired,
    ProtocolError(String),
    Draining,
    PublishRefused,
    MessageQueueFull,
    Vetoed,
    Error(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ClientDisconnect => f.write_str("client disconnect"),
            Reason::ConnectionClosed => f.write_str("connection closed"),
            Reason::KeepaliveTimeout => f.write_str("keepalive timeout"),
            Reason::Kicked => f.write_str("kicked"),
            Reason::SessionExpired => f.write_str("session expired"),
            Reason::ProtocolError(e) => write!(f, "protocol error, {}", e),
            Reason::Draining => f.write_str("draining"),
            Reason::PublishRefused => f.write_str("publish refused"),
            Reason::MessageQueueFull => f.write_str("message queue full"),
            Reason::Vetoed => f.write_str("vetoed"),
            Reason::Error(e) => f.write_str(e),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retain {
    pub from: Origin,
    pub publish: Publish,
    pub set_time: TimestampMillis,
}

impl Retain {
    #[inline]
    pub fn new(from: Origin, publish: Publish) -> Self {
        Self { from, publish, set_time: timestamp_millis() }
    }
}

/// Session state handed from a displaced session task to its successor.
#[derive(Debug, Default)]
pub struct OfflineState {
    pub created_at: TimestampMillis,
    pub subscriptions: Vec<Subscribe>,
    pub inflight: Vec<OutInflightMessage>,
    /// Inbound QoS 2 packet ids still waiting for PUBREL.
    pub in_inflight: Vec<PacketId>,
    pub queued: Vec<QueuedMessage>,
}

/// The mailbox protocol of a session task.
#[derive(Debug)]
pub enum Message {
    Forward(Origin, Publish),
    /// Displaced by a newer connection; the flag says whether the newcomer
    /// asked for a clean session.
    Kick(oneshot::Sender<Option<OfflineState>>, bool),
    /// Broker shutdown
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub id: Id,
    pub connect: Box<Connect>,
}

impl ConnectInfo {
    #[inline]
    pub fn new(id: Id, connect: Box<Connect>) -> Self {
        Self { id, connect }
    }

    #[inline]
    pub fn username(&self) -> Option<&UserName> {
        self.connect.username.as_ref()
    }

    #[inline]
    pub fn password(&self) -> Option<&Password> {
        self.connect.password.as_ref()
    }
}

/// Shared, read-mostly view of a session, readable from outside its task.
#[derive(Debug)]
pub struct SessionInfo {
    pub id: Id,
    pub clean_session: bool,
    pub created_at: TimestampMillis,
    connected: AtomicBool,
    inflights: AtomicUsize,
}

impl SessionInfo {
    #[inline]
    pub fn new(id: Id, clean_session: bool, created_at: TimestampMillis) -> Self {
        Self { id, clean_session, created_at, connected: AtomicBool::new(true), inflights: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.id.client_id
    }

    #[inline]
    pub fn is_persistent(&self) -> IsPersistent {
        !self.clean_session
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst)
    }

    /// Outbound QoS 1/2 deliveries awaiting acknowledgement.
    #[inline]
    pub fn inflights(&self) -> usize {
        self.inflights.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_inflights(&self, n: usize) {
        self.inflights.store(n, Ordering::SeqCst)
    }
}

/// A registry slot: the mailbox of a session task.
#[derive(Clone)]
pub struct SessionEntry {
    pub tx: MessageSender,
    pub info: Arc<SessionInfo>,
}

impl SessionEntry {
    #[inline]
    pub fn same_channel(&self, other: &MessageSender) -> bool {
        self.tx.same_channel(other)
    }
}
