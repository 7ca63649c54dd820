use std::convert::TryFrom;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytestring::ByteString;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use tidemq_codec::{
    Codec, Connect, ConnectAck, ConnectAckReason, Packet, Publish, QoS, SubscribeReturnCode, SubscriptionId,
};

use crate::error::MqttError;
use crate::{Builder, Error, Result};

/// Acknowledgement steps of the QoS 1 and QoS 2 exchanges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ack {
    /// PUBACK
    Publish(NonZeroU16),
    /// PUBREC
    Received(NonZeroU16),
    /// PUBREL
    Release(NonZeroU16),
    /// PUBCOMP
    Complete(NonZeroU16),
}

impl Ack {
    #[inline]
    pub fn packet_id(&self) -> NonZeroU16 {
        match self {
            Ack::Publish(pid) | Ack::Received(pid) | Ack::Release(pid) | Ack::Complete(pid) => *pid,
        }
    }
}

/// What a client asks the broker to do. This is all the core sees of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Connect(Box<Connect>),
    Publish(Publish),
    Subscribe { packet_id: NonZeroU16, id: Option<SubscriptionId>, topic_filters: Vec<(ByteString, QoS)> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<ByteString> },
    Ack(Ack),
    Ping,
    Disconnect,
}

impl TryFrom<Packet> for Intent {
    type Error = MqttError;

    fn try_from(packet: Packet) -> std::result::Result<Self, Self::Error> {
        Ok(match packet {
            Packet::Connect(c) => Intent::Connect(c),
            Packet::Publish(p) => Intent::Publish(p),
            Packet::PublishAck { packet_id } => Intent::Ack(Ack::Publish(packet_id)),
            Packet::PublishReceived { packet_id } => Intent::Ack(Ack::Received(packet_id)),
            Packet::PublishRelease { packet_id } => Intent::Ack(Ack::Release(packet_id)),
            Packet::PublishComplete { packet_id } => Intent::Ack(Ack::Complete(packet_id)),
            Packet::Subscribe { packet_id, id, topic_filters } => Intent::Subscribe { packet_id, id, topic_filters },
            Packet::Unsubscribe { packet_id, topic_filters } => Intent::Unsubscribe { packet_id, topic_filters },
            Packet::PingRequest => Intent::Ping,
            Packet::Disconnect => Intent::Disconnect,
            p @ (Packet::ConnectAck(_)
            | Packet::SubscribeAck { .. }
            | Packet::UnsubscribeAck { .. }
            | Packet::PingResponse) => return Err(MqttError::UnexpectedPacket(p.packet_type())),
        })
    }
}

/// A framed MQTT connection. Reading yields [`Intent`]s, writing takes packets.
pub struct MqttStream<Io> {
    pub io: Framed<Io, Codec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> MqttStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        let codec = Codec::new(cfg.max_packet_size);
        MqttStream { io: Framed::new(io, codec), remote_addr, cfg }
    }

    #[inline]
    pub async fn send_disconnect(&mut self) -> Result<()> {
        self.send(Packet::Disconnect).await
    }

    #[inline]
    pub async fn send_publish(&mut self, publish: Publish) -> Result<()> {
        self.send(Packet::Publish(publish)).await
    }

    #[inline]
    pub async fn send_publish_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishAck { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_received(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishReceived { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_release(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishRelease { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_complete(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishComplete { packet_id }).await
    }

    #[inline]
    pub async fn send_subscribe_ack(
        &mut self,
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    ) -> Result<()> {
        self.send(Packet::SubscribeAck { packet_id, status }).await
    }

    #[inline]
    pub async fn send_unsubscribe_ack(&mut self, packet_id: NonZeroU16, filters: u16) -> Result<()> {
        self.send(Packet::UnsubscribeAck { packet_id, filters }).await
    }

    #[inline]
    pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
        self.send(Packet::Connect(Box::new(connect))).await
    }

    #[inline]
    pub async fn send_connect_ack(
        &mut self,
        return_code: ConnectAckReason,
        session_present: bool,
    ) -> Result<()> {
        self.send(Packet::ConnectAck(ConnectAck { session_present, return_code })).await
    }

    #[inline]
    pub async fn send_ping_request(&mut self) -> Result<()> {
        self.send(Packet::PingRequest).await
    }

    #[inline]
    pub async fn send_ping_response(&mut self) -> Result<()> {
        self.send(Packet::PingResponse).await
    }

    #[inline]
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        if self.cfg.send_timeout.is_zero() {
            self.io.send(packet).await.map_err(MqttError::Encode)?;
        } else {
            match tokio::time::timeout(self.cfg.send_timeout, self.io.send(packet)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(MqttError::Encode(e).into()),
                Err(_) => return Err(MqttError::WriteTimeout.into()),
            }
        }
        Ok(())
    }

    /// Queues a packet without flushing.
    #[inline]
    pub async fn feed(&mut self, packet: Packet) -> Result<()> {
        self.io.feed(packet).await.map_err(MqttError::Encode)?;
        Ok(())
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        if self.cfg.send_timeout.is_zero() {
            self.io.flush().await.map_err(MqttError::Encode)?;
        } else {
            match tokio::time::timeout(self.cfg.send_timeout, self.io.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(MqttError::Encode(e).into()),
                Err(_) => return Err(MqttError::FlushTimeout.into()),
            }
        }
        Ok(())
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        if self.cfg.send_timeout.is_zero() {
            self.io.close().await.map_err(MqttError::Encode)?;
        } else {
            match tokio::time::timeout(self.cfg.send_timeout, self.io.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(MqttError::Encode(e).into()),
                Err(_) => return Err(MqttError::CloseTimeout.into()),
            }
        }
        Ok(())
    }

    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Intent>> {
        match tokio::time::timeout(tm, self.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout.into()),
        }
    }

    /// Waits for the first packet, which must be CONNECT.
    #[inline]
    pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
        match self.recv(tm).await? {
            Some(Intent::Connect(connect)) => Ok(connect),
            _ => Err(MqttError::InvalidProtocol.into()),
        }
    }
}

impl<Io> futures::Stream for MqttStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Intent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok((packet, _))) => Some(Intent::try_from(packet).map_err(Error::from)),
            Some(Err(e)) => Some(Err(Error::from(MqttError::Decode(e)))),
            None => None,
        })
    }
}
