use std::num::NonZeroU16;

use tidemq_codec::{DecodeError, EncodeError};

/// Failures of one connection or one broker operation.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("decode, {0}")]
    Decode(#[from] DecodeError),
    #[error("encode, {0}")]
    Encode(#[from] EncodeError),
    #[error("timed out reading a packet")]
    ReadTimeout,
    #[error("timed out writing a packet")]
    WriteTimeout,
    #[error("timed out flushing the connection")]
    FlushTimeout,
    #[error("timed out closing the connection")]
    CloseTimeout,
    /// The listener has no TLS material for a secure transport.
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("first packet was not CONNECT")]
    InvalidProtocol,
    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),
    #[error("client identifier rejected")]
    IdentifierRejected,
    #[error("not authorized")]
    NotAuthorized,
    #[error("bad username or password")]
    BadUsernameOrPassword,
    #[error("packet id {0} is already in flight")]
    PacketIdInUse(NonZeroU16),
    #[error("no free packet id")]
    PacketIdExhausted,
    #[error("persistence failed, {0}")]
    PersistenceFailed(String),
    #[error("broker is draining")]
    Draining,
    #[error("invalid topic, {0}")]
    InvalidTopic(String),
}

impl MqttError {
    /// A misbehaving peer rather than a broker side condition.
    pub fn is_protocol(&self) -> bool {
        use MqttError::*;
        matches!(self, Decode(_) | Encode(_) | InvalidProtocol | UnexpectedPacket(_) | PacketIdInUse(_))
    }
}
