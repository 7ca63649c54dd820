use std::io;

/// Why an inbound frame could not be turned into a [`Packet`](crate::Packet).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("protocol name is neither MQTT nor MQIsdp")]
    InvalidProtocol,
    #[error("frame is shorter than its fields require")]
    InvalidLength,
    #[error("malformed frame")]
    MalformedPacket,
    #[error("protocol level not supported, only 3, 4 and 5 are")]
    UnsupportedProtocolLevel,
    #[error("reserved bit of the CONNECT flags is set")]
    ConnectReservedFlagSet,
    #[error("reserved bits of the CONNACK flags are set")]
    ConnAckReservedFlagSet,
    #[error("packet type not supported")]
    UnsupportedPacketType,
    #[error("missing packet identifier")]
    PacketIdRequired,
    #[error("frame exceeds the maximum packet size")]
    MaxSizeExceeded,
    #[error("string is not valid utf-8")]
    Utf8Error,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why an outbound packet could not be written.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("field or frame too long to encode")]
    InvalidLength,
    #[error("packet fields are inconsistent")]
    MalformedPacket,
    #[error("missing packet identifier")]
    PacketIdRequired,
    #[error(transparent)]
    Io(#[from] io::Error),
}
