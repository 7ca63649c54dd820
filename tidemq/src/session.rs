//! The per-client session task.
//!
//! A session owns its subscriptions, outbound inflight window, inbound QoS 2
//! ids and offline queue. Other tasks reach it only through its mailbox
//! ([`Message`]), so per-client state is never shared.

use std::future::Future;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::{sleep, sleep_until, Instant};

use crate::codec::{LastWill, Publish, QoS, SubscribeReturnCode, SubscriptionId};
use crate::context::ServerContext;
use crate::inflight::{InInflight, MomentStatus, OutInflight, OutInflightMessage};
use crate::net::{Ack, Intent, MqttError, MqttStream};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::storage::StoredSession;
use crate::topic::Topic;
use crate::types::{
    HashMap, Id, Message, MessageReceiver, MessageSender, OfflineState, Origin, Reason, SessionEntry,
    SessionInfo, Subscribe, TopicFilter, TopicName,
};
use crate::Result;

/// How the online phase of a session ended.
pub(crate) enum Exit {
    Disconnect(Reason),
    Kicked(oneshot::Sender<Option<OfflineState>>, bool),
    Close,
}

pub struct SessionState {
    pub scx: ServerContext,
    pub info: Arc<SessionInfo>,
    tx: MessageSender,
    rx: MessageReceiver,
    subscriptions: HashMap<TopicFilter, Subscribe>,
    out_inflight: OutInflight,
    in_inflight: InInflight,
    queue: MessageQueue,
    keep_alive: u16,
    last_will: Option<LastWill>,
}

impl SessionState {
    pub fn new(
        scx: ServerContext,
        info: Arc<SessionInfo>,
        tx: MessageSender,
        rx: MessageReceiver,
        keep_alive: u16,
        last_will: Option<LastWill>,
    ) -> Self {
        let mqtt = &scx.settings.mqtt;
        let out_inflight =
            OutInflight::new(mqtt.max_inflight.get() as usize, mqtt.retry_interval, mqtt.retry_max_interval);
        let queue = MessageQueue::new(mqtt.max_mqueue_len);
        Self {
            scx,
            info,
            tx,
            rx,
            subscriptions: HashMap::default(),
            out_inflight,
            in_inflight: InInflight::new(u16::MAX as usize),
            queue,
            keep_alive,
            last_will,
        }
    }

    /// Takes over the state of a previous session of the same client. Its
    /// router entries are still in place.
    pub async fn restore(&mut self, state: OfflineState) {
        self.subscriptions.extend(state.subscriptions.into_iter().map(|sub| (sub.topic_filter.clone(), sub)));
        self.out_inflight.restore(state.inflight);
        self.in_inflight.restore(state.in_inflight);
        self.sync_inflights();
        for m in self.queue.restore(state.queued) {
            self.dropped(m).await;
        }
    }

    #[inline]
    fn client_id(&self) -> &crate::types::ClientId {
        self.info.client_id()
    }

    #[inline]
    fn sync_inflights(&self) {
        self.info.set_inflights(self.out_inflight.len() + self.in_inflight.len());
    }

    /// Serves the connection until it ends, then either ends the session or
    /// keeps it offline.
    pub async fn run<Io>(mut self, mut sink: MqttStream<Io>)
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        self.scx.stats.connections.inc();
        let exit = match self.online(&mut sink).await {
            Ok(exit) => exit,
            Err(e) => {
                log::debug!("{} connection error, {:?}", self.info.id, e);
                let reason = match e.downcast_ref::<MqttError>() {
                    Some(MqttError::ReadTimeout) => Reason::KeepaliveTimeout,
                    Some(e) if e.is_protocol() => Reason::ProtocolError(e.to_string()),
                    Some(MqttError::InvalidTopic(t)) => Reason::ProtocolError(t.clone()),
                    _ => Reason::Error(e.to_string()),
                };
                Exit::Disconnect(reason)
            }
        };
        self.info.set_connected(false);
        self.scx.stats.connections.dec();
        if let Err(e) = sink.close().await {
            log::debug!("{} close error, {:?}", self.info.id, e);
        }

        let reason = match &exit {
            Exit::Disconnect(r) => r.clone(),
            Exit::Kicked(..) => Reason::Kicked,
            Exit::Close => Reason::Draining,
        };
        log::debug!("{} disconnected, reason: {}", self.info.id, reason);

        let handover = matches!(&exit, Exit::Kicked(_, clean) if !*clean && self.info.is_persistent());
        if reason != Reason::ClientDisconnect && !handover {
            self.publish_last_will().await;
        }
        self.scx.hooks.client_disconnected(&self.info, &reason).await;

        let expiry = self.scx.settings.mqtt.session_expiry;
        match exit {
            Exit::Kicked(reply, clean) => self.handover(reply, clean).await,
            Exit::Close => self.close().await,
            Exit::Disconnect(r) if self.info.clean_session => self.terminate(r).await,
            Exit::Disconnect(_) => self.offline(expiry).await,
        }
    }

    async fn online<Io>(&mut self, sink: &mut MqttStream<Io>) -> Result<Exit>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        self.resend_inflights(sink).await?;
        self.deliver_queued(sink).await?;

        let keep_alive = if self.keep_alive == 0 {
            None
        } else {
            Some(Duration::from_secs_f32(self.keep_alive as f32 * self.scx.settings.mqtt.keepalive_backoff))
        };
        let mut deadline = keep_alive.map(|d| Instant::now() + d);

        loop {
            let retry = self.out_inflight.get_timeout();
            tokio::select! {
                _ = sleep_until_opt(deadline) => {
                    log::debug!("{} keepalive timeout", self.info.id);
                    return Ok(Exit::Disconnect(Reason::KeepaliveTimeout));
                }
                _ = sleep_opt(retry) => {
                    self.retry(sink).await?;
                }
                msg = self.rx.recv() => match msg {
                    Some(Message::Forward(from, p)) => self.deliver(sink, from, p).await?,
                    Some(Message::Kick(reply, clean)) => return Ok(Exit::Kicked(reply, clean)),
                    Some(Message::Close) => return Ok(Exit::Close),
                    None => return Ok(Exit::Disconnect(Reason::ConnectionClosed)),
                },
                intent = sink.next() => match intent {
                    Some(Ok(intent)) => {
                        if let Some(d) = keep_alive {
                            deadline = Some(Instant::now() + d);
                        }
                        if let Some(exit) = self.handle(sink, intent).await? {
                            return Ok(exit);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(Exit::Disconnect(Reason::ConnectionClosed)),
                },
            }
        }
    }

    async fn handle<Io>(&mut self, sink: &mut MqttStream<Io>, intent: Intent) -> Result<Option<Exit>>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match intent {
            Intent::Publish(p) => self.process_publish(sink, p).await?,
            Intent::Ack(Ack::Publish(pid)) => {
                self.acked(pid, MomentStatus::UnAck).await;
                self.deliver_queued(sink).await?;
            }
            Intent::Ack(Ack::Complete(pid)) => {
                self.acked(pid, MomentStatus::UnComplete).await;
                self.deliver_queued(sink).await?;
            }
            Intent::Ack(Ack::Received(pid)) => {
                match self.out_inflight.get(pid.get()).map(|m| m.status) {
                    Some(MomentStatus::UnReceived) => {
                        self.out_inflight.update_status(pid.get(), MomentStatus::UnComplete);
                        if let Some(m) = self.out_inflight.get(pid.get()) {
                            self.scx.hooks.inflight_pushed(&self.info, m).await;
                        }
                    }
                    Some(MomentStatus::UnAck) => {
                        log::warn!("{} PUBREC for QoS 1 packet id {}, ignored", self.info.id, pid);
                        return Ok(None);
                    }
                    Some(MomentStatus::UnComplete) | None => {}
                }
                sink.send_publish_release(pid).await?;
            }
            Intent::Ack(Ack::Release(pid)) => {
                if self.in_inflight.remove(pid) {
                    self.sync_inflights();
                    self.scx.hooks.in_inflight_removed(&self.info, pid.get()).await;
                }
                sink.send_publish_complete(pid).await?;
            }
            Intent::Subscribe { packet_id, id, topic_filters } => {
                self.process_subscribe(sink, packet_id, id, topic_filters).await?
            }
            Intent::Unsubscribe { packet_id, topic_filters } => {
                let filters = u16::try_from(topic_filters.len()).unwrap_or(u16::MAX);
                for tf in topic_filters {
                    self.unsubscribe(&tf).await;
                }
                sink.send_unsubscribe_ack(packet_id, filters).await?;
            }
            Intent::Ping => sink.send_ping_response().await?,
            Intent::Disconnect => return Ok(Some(Exit::Disconnect(Reason::ClientDisconnect))),
            Intent::Connect(_) => return Err(MqttError::UnexpectedPacket("CONNECT").into()),
        }
        Ok(None)
    }

    /// Inbound PUBLISH. A publish refused by the ACL is dropped but still
    /// acknowledged; a failed publish closes the connection unacknowledged.
    async fn process_publish<Io>(&mut self, sink: &mut MqttStream<Io>, mut publish: Publish) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        // identifiers only flow from the broker to subscribers
        publish.subscription_ids.clear();
        Topic::name(&publish.topic).map_err(|e| MqttError::InvalidTopic(format!("{}, {}", publish.topic, e)))?;

        match publish.qos {
            QoS::AtMostOnce => self.publish_in(publish).await,
            QoS::AtLeastOnce => {
                let pid = publish.packet_id.ok_or(MqttError::InvalidProtocol)?;
                self.publish_in(publish).await?;
                sink.send_publish_ack(pid).await
            }
            QoS::ExactlyOnce => {
                let pid = publish.packet_id.ok_or(MqttError::InvalidProtocol)?;
                if self.in_inflight.add(pid)? {
                    self.sync_inflights();
                    self.scx.hooks.in_inflight_pushed(&self.info, pid.get()).await;
                    self.publish_in(publish).await?;
                } else {
                    log::debug!("{} duplicate QoS 2 publish, packet id {}", self.info.id, pid);
                }
                sink.send_publish_received(pid).await
            }
        }
    }

    async fn publish_in(&self, publish: Publish) -> Result<()> {
        let from = Origin::client(self.client_id().clone());
        if !self.scx.hooks.message_publish_check_acl(&self.info, &publish).await {
            log::debug!("{} publish to {} refused", self.info.id, publish.topic);
            self.scx.stats.dropped();
            self.scx.hooks.message_dropped(None, &from, &publish, &Reason::PublishRefused).await;
            return Ok(());
        }
        self.scx.publish(from, publish).await?;
        Ok(())
    }

    async fn process_subscribe<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        packet_id: NonZeroU16,
        id: Option<SubscriptionId>,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut codes = Vec::with_capacity(topic_filters.len());
        let mut granted = Vec::new();
        for (topic_filter, qos) in topic_filters {
            match self.subscribe(topic_filter.clone(), qos, id).await {
                Some(qos) => {
                    codes.push(SubscribeReturnCode::Success(qos));
                    granted.push((topic_filter, qos));
                }
                None => codes.push(SubscribeReturnCode::Failure),
            }
        }
        sink.send_subscribe_ack(packet_id, codes).await?;

        for (topic_filter, qos) in granted {
            let retains = self.scx.retain.matches(&topic_filter)?;
            for (_, retain) in retains {
                let mut p = retain.publish;
                p.retain = true;
                p.dup = false;
                p.packet_id = None;
                p.qos = p.qos.less_value(qos);
                self.deliver(sink, retain.from, p).await?;
            }
        }
        Ok(())
    }

    /// Adds a subscription. `None` when the filter is invalid or refused.
    pub(crate) async fn subscribe(
        &mut self,
        topic_filter: TopicFilter,
        qos: QoS,
        id: Option<SubscriptionId>,
    ) -> Option<QoS> {
        if let Err(e) = Topic::filter(&topic_filter) {
            log::debug!("{} invalid topic filter {}, {}", self.info.id, topic_filter, e);
            return None;
        }
        let qos = qos.less_value(self.scx.settings.mqtt.max_qos_allowed);
        let sub = Subscribe { topic_filter, qos, id };
        if !self.scx.hooks.client_subscribe_check_acl(&self.info, &sub).await {
            log::debug!("{} subscribe to {} refused", self.info.id, sub.topic_filter);
            return None;
        }
        if let Err(e) = self.scx.router.add(&sub.topic_filter, self.client_id().clone(), sub.qos) {
            log::warn!("{} subscribe failed, {:?}", self.info.id, e);
            return None;
        }
        let qos = sub.qos;
        self.scx.hooks.session_subscribed(&self.info, &sub).await;
        self.subscriptions.insert(sub.topic_filter.clone(), sub);
        Some(qos)
    }

    pub(crate) async fn unsubscribe(&mut self, topic_filter: &TopicFilter) {
        if self.subscriptions.remove(topic_filter).is_some() {
            self.scx.router.remove(topic_filter, self.client_id());
            self.scx.hooks.session_unsubscribed(&self.info, topic_filter).await;
        }
    }

    /// Delivers a message, or queues it behind earlier ones while the
    /// inflight window is full.
    async fn deliver<Io>(&mut self, sink: &mut MqttStream<Io>, from: Origin, publish: Publish) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.queue.is_empty() || !self.out_inflight.has_credit() {
            self.enqueue(from, publish).await;
            return Ok(());
        }
        self.deliver_now(sink, from, publish).await
    }

    async fn deliver_queued<Io>(&mut self, sink: &mut MqttStream<Io>) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        while self.out_inflight.has_credit() {
            let Some(m) = self.queue.pop() else {
                break;
            };
            let delivered = self.deliver_now(sink, m.from, m.publish).await;
            self.scx.hooks.message_dequeued(&self.info, m.seq).await;
            delivered?;
        }
        Ok(())
    }

    async fn deliver_now<Io>(&mut self, sink: &mut MqttStream<Io>, from: Origin, mut publish: Publish) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        publish.subscription_ids = self.subscription_ids(&publish.topic);
        let status = match publish.qos {
            QoS::AtMostOnce => {
                publish.packet_id = None;
                sink.send_publish(publish.clone()).await?;
                self.scx.stats.sent(publish.payload.len());
                self.scx.hooks.message_delivered(&self.info, &from, &publish).await;
                return Ok(());
            }
            QoS::AtLeastOnce => MomentStatus::UnAck,
            QoS::ExactlyOnce => MomentStatus::UnReceived,
        };

        publish.packet_id = Some(self.out_inflight.next_id()?);
        publish.dup = false;
        let m = OutInflightMessage::new(status, from.clone(), publish.clone());
        self.scx.hooks.inflight_pushed(&self.info, &m).await;
        self.out_inflight.push_back(m);
        self.sync_inflights();

        sink.send_publish(publish.clone()).await?;
        self.scx.stats.sent(publish.payload.len());
        self.scx.hooks.message_delivered(&self.info, &from, &publish).await;
        Ok(())
    }

    /// Identifiers of the subscriptions matching `topic`.
    fn subscription_ids(&self, topic: &TopicName) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter_map(|sub| {
                let id = sub.id?;
                Topic::filter(&sub.topic_filter).ok()?.matches_str(topic).then_some(id)
            })
            .collect()
    }

    /// PUBACK or PUBCOMP from the client. Only settles a delivery waiting
    /// for exactly that acknowledgement.
    async fn acked(&mut self, pid: NonZeroU16, expected: MomentStatus) {
        match self.out_inflight.get(pid.get()).map(|m| m.status) {
            Some(status) if status == expected => {
                if let Some(m) = self.out_inflight.remove(pid.get()) {
                    self.sync_inflights();
                    self.scx.hooks.inflight_removed(&self.info, pid.get()).await;
                    self.scx.hooks.message_acked(&self.info, &m.from, &m.publish).await;
                }
            }
            Some(status) => {
                log::warn!("{} packet id {} is {:?}, not {:?}, ack ignored", self.info.id, pid, status, expected);
            }
            None => log::debug!("{} ack for unknown packet id {}", self.info.id, pid),
        }
    }

    /// Resends everything a previous connection left unacknowledged, with the
    /// stored packet ids.
    async fn resend_inflights<Io>(&mut self, sink: &mut MqttStream<Io>) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let pending = self.out_inflight.drain();
        if !pending.is_empty() {
            log::debug!("{} resending {} inflight messages", self.info.id, pending.len());
        }
        for m in pending.iter() {
            self.out_inflight.push_back(m.clone());
        }
        self.sync_inflights();
        for m in pending {
            Self::resend(sink, &m).await?;
        }
        Ok(())
    }

    async fn retry<Io>(&mut self, sink: &mut MqttStream<Io>) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut resent = false;
        while let Some(m) = self.out_inflight.pop_front_timeout() {
            log::debug!("{} retry packet id {:?}, status {:?}", self.info.id, m.packet_id(), m.status);
            Self::resend(sink, &m).await?;
            self.out_inflight.push_back(m);
            resent = true;
        }
        if resent {
            self.out_inflight.backoff();
        }
        Ok(())
    }

    async fn resend<Io>(sink: &mut MqttStream<Io>, m: &OutInflightMessage) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match (m.status, m.publish.packet_id) {
            (MomentStatus::UnComplete, Some(pid)) => sink.send_publish_release(pid).await,
            _ => {
                let mut p = m.publish.clone();
                p.dup = true;
                sink.send_publish(p).await
            }
        }
    }

    async fn publish_last_will(&mut self) {
        let Some(lw) = self.last_will.take() else {
            return;
        };
        if self.scx.lifecycle.is_draining() {
            log::debug!("{} draining, last will not published", self.info.id);
            return;
        }
        let p = Publish::new(lw.topic, lw.message, lw.qos, lw.retain);
        if !self.scx.hooks.message_publish_check_acl(&self.info, &p).await {
            log::debug!("{} last will to {} refused", self.info.id, p.topic);
            return;
        }
        if let Err(e) = self.scx.publish(Origin::last_will(self.client_id().clone()), p).await {
            log::warn!("{} last will publish failed, {:?}", self.info.id, e);
        }
    }

    async fn enqueue(&mut self, from: Origin, publish: Publish) {
        let (queued, dropped) = self.queue.push(from, publish);
        match dropped {
            Some(m) if m.seq == queued.seq => {
                self.scx.stats.dropped();
                let to = Some(self.client_id());
                self.scx.hooks.message_dropped(to, &m.from, &m.publish, &Reason::MessageQueueFull).await;
            }
            dropped => {
                self.scx.hooks.message_queued(&self.info, &queued).await;
                if let Some(m) = dropped {
                    self.dropped(m).await;
                }
            }
        }
    }

    /// A backlog entry pushed out by a newer one.
    async fn dropped(&self, m: QueuedMessage) {
        log::debug!("{} message queue full, dropped {}", self.info.id, m.publish.topic);
        self.scx.stats.dropped();
        self.scx.hooks.message_dequeued(&self.info, m.seq).await;
        let to = Some(self.client_id());
        self.scx.hooks.message_dropped(to, &m.from, &m.publish, &Reason::MessageQueueFull).await;
    }

    /// A persistent session without a connection: queues what arrives until
    /// its client comes back or it expires.
    pub(crate) fn offline(mut self, expiry: Duration) -> impl Future<Output = ()> + Send {
        async move {
            log::debug!("{} offline, expires in {:?}", self.info.id, expiry);
            let expired = sleep(expiry);
            tokio::pin!(expired);
            loop {
                tokio::select! {
                    _ = &mut expired => {
                        log::info!("{} session expired", self.info.id);
                        self.terminate(Reason::SessionExpired).await;
                        return;
                    }
                    msg = self.rx.recv() => match msg {
                        Some(Message::Forward(from, p)) => self.enqueue(from, p).await,
                        Some(Message::Kick(reply, clean)) => {
                            self.handover(reply, clean).await;
                            return;
                        }
                        Some(Message::Close) | None => {
                            self.close().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Gives the session up to a newer connection of the same client. The
    /// state moves over unless either side asked for a clean session.
    async fn handover(mut self, reply: oneshot::Sender<Option<OfflineState>>, clean: bool) {
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            if let Message::Forward(from, p) = msg {
                self.enqueue(from, p).await;
            }
        }
        if clean || self.info.clean_session {
            self.terminate(Reason::Kicked).await;
            let _ = reply.send(None);
        } else {
            let state = OfflineState {
                created_at: self.info.created_at,
                subscriptions: self.subscriptions.drain().map(|(_, sub)| sub).collect(),
                inflight: self.out_inflight.drain(),
                in_inflight: self.in_inflight.drain(),
                queued: self.queue.drain(),
            };
            log::debug!("{} handing over session state", self.info.id);
            if reply.send(Some(state)).is_err() {
                log::warn!("{} successor went away during handover", self.info.id);
            }
        }
    }

    /// Broker shutdown. Persistent sessions stay in the store.
    async fn close(self) {
        if self.info.clean_session {
            self.terminate(Reason::Draining).await;
        } else {
            let client_id = self.client_id().clone();
            self.scx.sessions.remove_if(&client_id, |_, e| e.same_channel(&self.tx));
        }
    }

    async fn terminate(mut self, reason: Reason) {
        let client_id = self.client_id().clone();
        self.scx.router.remove_all(&client_id, self.subscriptions.keys());
        self.scx.sessions.remove_if(&client_id, |_, e| e.same_channel(&self.tx));
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            if let Message::Forward(..) = msg {
                self.scx.stats.dropped();
            }
        }
        self.scx.hooks.session_terminated(&self.info, &reason).await;
        log::debug!("{} session terminated, reason: {}", self.info.id, reason);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(d: Option<Duration>) {
    match d {
        Some(d) => sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Re-creates a persistent session read from the store. It starts offline
/// with the expiry time it had left.
pub(crate) async fn restore(scx: &ServerContext, stored: StoredSession, remaining: Duration) {
    let StoredSession { record, state } = stored;
    let id = Id::new(None, None, record.client_id.clone(), record.username.clone());
    let info = Arc::new(SessionInfo::new(id, false, record.created_at));
    info.set_connected(false);

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = SessionState::new(scx.clone(), info.clone(), tx.clone(), rx, 0, None);
    for sub in state.subscriptions.iter() {
        if let Err(e) = scx.router.add(&sub.topic_filter, record.client_id.clone(), sub.qos) {
            log::warn!("{} skip stored subscription {}, {:?}", info.id, sub.topic_filter, e);
        }
    }
    session.restore(state).await;
    scx.sessions.insert(record.client_id, SessionEntry { tx, info });
    tokio::spawn(session.offline(remaining));
}
