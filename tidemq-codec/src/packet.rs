use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{Protocol, Publish, QoS, SubscriptionId};

prim_enum! {
    /// CONNACK return code.
    #[derive(Deserialize, Serialize)]
    pub enum ConnectAckReason {
        ConnectionAccepted = 0,
        UnacceptableProtocolVersion = 1,
        IdentifierRejected = 2,
        ServiceUnavailable = 3,
        BadUserNameOrPassword = 4,
        NotAuthorized = 5,
    }
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        use ConnectAckReason::*;
        match self {
            ConnectionAccepted => "accepted",
            UnacceptableProtocolVersion => "refused, protocol level not supported",
            IdentifierRejected => "refused, client identifier not allowed",
            ServiceUnavailable => "refused, broker unavailable",
            BadUserNameOrPassword => "refused, bad username or password",
            NotAuthorized => "refused, not authorized",
        }
    }

    #[inline]
    pub fn is_accepted(self) -> bool {
        self == ConnectAckReason::ConnectionAccepted
    }

    /// The MQTT 5 reason code with the same meaning.
    pub fn v5_code(self) -> u8 {
        use ConnectAckReason::*;
        match self {
            ConnectionAccepted => 0x00,
            UnacceptableProtocolVersion => 0x84,
            IdentifierRejected => 0x85,
            BadUserNameOrPassword => 0x86,
            NotAuthorized => 0x87,
            ServiceUnavailable => 0x88,
        }
    }

    pub(crate) fn from_v5_code(code: u8) -> Result<Self, crate::error::DecodeError> {
        use ConnectAckReason::*;
        Ok(match code {
            0x00 => ConnectionAccepted,
            0x84 => UnacceptableProtocolVersion,
            0x85 => IdentifierRejected,
            0x86 => BadUserNameOrPassword,
            0x87 | 0x8a | 0x8c => NotAuthorized,
            0x80..=0xff => ServiceUnavailable,
            _ => return Err(crate::error::DecodeError::MalformedPacket),
        })
    }
}

/// The message published on the client's behalf when it goes away without
/// a DISCONNECT.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Connect {
    pub protocol: Protocol,
    /// Drop any stored state and do not keep it after the connection.
    pub clean_session: bool,
    /// Seconds, `0` turns keep alive off.
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    /// May be empty, the broker then assigns one.
    pub client_id: ByteString,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn client_id<T>(self, client_id: T) -> Self
    where
        ByteString: From<T>,
    {
        Connect { client_id: client_id.into(), ..self }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    pub session_present: bool,
}

/// One entry of SUBACK, in the order of the SUBSCRIBE filters.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

/// A control packet. MQTT 5 properties other than the subscription
/// identifier are not represented.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck { packet_id: NonZeroU16 },
    PublishReceived { packet_id: NonZeroU16 },
    PublishRelease { packet_id: NonZeroU16 },
    PublishComplete { packet_id: NonZeroU16 },
    Subscribe { packet_id: NonZeroU16, id: Option<SubscriptionId>, topic_filters: Vec<(ByteString, QoS)> },
    SubscribeAck { packet_id: NonZeroU16, status: Vec<SubscribeReturnCode> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<ByteString> },
    /// `filters` is the number of filters acknowledged, one MQTT 5 reason
    /// code each. Not on the wire before MQTT 5, where it decodes as `0`.
    UnsubscribeAck { packet_id: NonZeroU16, filters: u16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    #[inline]
    fn from(connect: Connect) -> Packet {
        Packet::Connect(Box::new(connect))
    }
}

impl From<Publish> for Packet {
    #[inline]
    fn from(publish: Publish) -> Packet {
        Packet::Publish(publish)
    }
}

impl Packet {
    /// The control packet name, for logs and errors.
    pub fn packet_type(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnectAck(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PublishAck { .. } => "PUBACK",
            Self::PublishReceived { .. } => "PUBREC",
            Self::PublishRelease { .. } => "PUBREL",
            Self::PublishComplete { .. } => "PUBCOMP",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::SubscribeAck { .. } => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::UnsubscribeAck { .. } => "UNSUBACK",
            Self::PingRequest => "PINGREQ",
            Self::PingResponse => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}
