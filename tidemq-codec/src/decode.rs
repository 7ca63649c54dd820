use std::num::NonZeroU16;

use bytes::{Buf, Bytes};
use bytestring::ByteString;

use tidemq_utils::timestamp_millis;

use crate::error::DecodeError;
use crate::packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, SubscribeReturnCode};
use crate::properties;
use crate::types::{
    packet_type, ConnectAckFlags, ConnectFlags, Protocol, Publish, QoS, MQISDP, MQTT, MQTT_LEVEL_31,
    MQTT_LEVEL_311, MQTT_LEVEL_5, WILL_QOS_SHIFT,
};
use crate::utils::Decode;

/// Decodes the body of one frame. `first_byte` is the fixed header byte and
/// `body` everything after the remaining length. `v5` selects the MQTT 5
/// layout, CONNECT carries its own level.
pub(crate) fn decode_packet(mut body: Bytes, first_byte: u8, v5: bool) -> Result<Packet, DecodeError> {
    if (packet_type::PUBLISH_START..=packet_type::PUBLISH_END).contains(&first_byte) {
        return publish(body, first_byte & 0x0f, v5);
    }
    let src = &mut body;
    let packet = match first_byte {
        packet_type::CONNECT => connect(src)?,
        packet_type::CONNACK => connect_ack(src, v5)?,
        packet_type::PUBACK => Packet::PublishAck { packet_id: ack(src, v5)? },
        packet_type::PUBREC => Packet::PublishReceived { packet_id: ack(src, v5)? },
        packet_type::PUBREL => Packet::PublishRelease { packet_id: ack(src, v5)? },
        packet_type::PUBCOMP => Packet::PublishComplete { packet_id: ack(src, v5)? },
        packet_type::SUBSCRIBE => subscribe(src, v5)?,
        packet_type::SUBACK => subscribe_ack(src, v5)?,
        packet_type::UNSUBSCRIBE => unsubscribe(src, v5)?,
        packet_type::UNSUBACK => unsubscribe_ack(src, v5)?,
        packet_type::PINGREQ => Packet::PingRequest,
        packet_type::PINGRESP => Packet::PingResponse,
        packet_type::DISCONNECT => {
            if v5 {
                reason_and_properties(src)?;
            }
            Packet::Disconnect
        }
        _ => return Err(DecodeError::UnsupportedPacketType),
    };
    // the remaining packets have bodies of fixed shape
    ensure!(body.is_empty(), DecodeError::InvalidLength);
    Ok(packet)
}

fn optional<T: Decode>(present: bool, src: &mut Bytes) -> Result<Option<T>, DecodeError> {
    if present {
        T::decode(src).map(Some)
    } else {
        Ok(None)
    }
}

/// The optional reason code and property list that end MQTT 5 acks and
/// DISCONNECT.
fn reason_and_properties(src: &mut Bytes) -> Result<Option<u8>, DecodeError> {
    if !src.has_remaining() {
        return Ok(None);
    }
    let reason = src.get_u8();
    if src.has_remaining() {
        properties::decode(src)?;
    }
    Ok(Some(reason))
}

fn ack(src: &mut Bytes, v5: bool) -> Result<NonZeroU16, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    if v5 {
        reason_and_properties(src)?;
    }
    Ok(packet_id)
}

fn connect(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let name = Bytes::decode(src)?;
    ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
    let level = src.get_u8();
    let protocol = match &name[..] {
        MQTT if level == MQTT_LEVEL_311 || level == MQTT_LEVEL_5 => Protocol(level),
        MQISDP if level == MQTT_LEVEL_31 => Protocol(MQTT_LEVEL_31),
        MQTT | MQISDP => return Err(DecodeError::UnsupportedProtocolLevel),
        _ => return Err(DecodeError::InvalidProtocol),
    };
    let v5 = protocol.is_v5();

    let raw_flags = src.get_u8();
    ensure!(raw_flags & 0x01 == 0, DecodeError::ConnectReservedFlagSet);
    let flags = ConnectFlags::from_bits_truncate(raw_flags);
    let keep_alive = u16::decode(src)?;
    if v5 {
        properties::decode(src)?;
    }
    // an empty id is accepted here, the session layer decides whether it is allowed
    let client_id = ByteString::decode(src)?;

    let last_will = match flags.contains(ConnectFlags::WILL) {
        true => {
            if v5 {
                properties::decode(src)?;
            }
            Some(LastWill {
                topic: ByteString::decode(src)?,
                message: Bytes::decode(src)?,
                qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
                retain: flags.contains(ConnectFlags::WILL_RETAIN),
            })
        }
        false => None,
    };
    let username = optional::<ByteString>(flags.contains(ConnectFlags::USERNAME), src)?;
    let password = optional::<Bytes>(flags.contains(ConnectFlags::PASSWORD), src)?;

    Ok(Packet::Connect(Box::new(Connect {
        protocol,
        clean_session: flags.contains(ConnectFlags::CLEAN_START),
        keep_alive,
        last_will,
        client_id,
        username,
        password,
    })))
}

fn connect_ack(src: &mut Bytes, v5: bool) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let Some(flags) = ConnectAckFlags::from_bits(src.get_u8()) else {
        return Err(DecodeError::ConnAckReservedFlagSet);
    };
    let return_code = match v5 {
        true => {
            let code = ConnectAckReason::from_v5_code(src.get_u8())?;
            properties::decode(src)?;
            code
        }
        false => src.get_u8().try_into()?,
    };
    Ok(Packet::ConnectAck(ConnectAck { session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT), return_code }))
}

fn publish(mut src: Bytes, flags: u8, v5: bool) -> Result<Packet, DecodeError> {
    let topic = ByteString::decode(&mut src)?;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(NonZeroU16::decode(&mut src).map_err(|_| DecodeError::PacketIdRequired)?),
    };
    let subscription_ids = if v5 { properties::decode(&mut src)? } else { Vec::new() };
    Ok(Packet::Publish(Publish {
        dup: flags & 0x08 != 0,
        retain: flags & 0x01 != 0,
        qos,
        topic,
        packet_id,
        payload: src,
        subscription_ids,
        create_time: timestamp_millis(),
    }))
}

fn subscribe(src: &mut Bytes, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let id = match v5 {
        true => {
            let ids = properties::decode(src)?;
            ensure!(ids.len() <= 1, DecodeError::MalformedPacket);
            ids.first().copied()
        }
        false => None,
    };
    let mut topic_filters = Vec::new();
    while !src.is_empty() {
        let filter = ByteString::decode(src)?;
        ensure!(!src.is_empty(), DecodeError::InvalidLength);
        let options = src.get_u8();
        if v5 {
            // reserved bits, and retain handling 3
            ensure!(options & 0xc0 == 0 && options & 0x30 != 0x30, DecodeError::MalformedPacket);
        }
        topic_filters.push((filter, QoS::try_from(options & 0x03)?));
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
    Ok(Packet::Subscribe { packet_id, id, topic_filters })
}

fn subscribe_ack(src: &mut Bytes, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    if v5 {
        properties::decode(src)?;
    }
    let status = src
        .split_off(0)
        .iter()
        .map(|&code| match code {
            0x80..=0xff => Ok(SubscribeReturnCode::Failure),
            c => QoS::try_from(c).map(SubscribeReturnCode::Success),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Packet::SubscribeAck { packet_id, status })
}

fn unsubscribe(src: &mut Bytes, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    if v5 {
        properties::decode(src)?;
    }
    let mut topic_filters = Vec::new();
    while !src.is_empty() {
        topic_filters.push(ByteString::decode(src)?);
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
    Ok(Packet::Unsubscribe { packet_id, topic_filters })
}

fn unsubscribe_ack(src: &mut Bytes, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let mut filters = 0;
    if v5 {
        properties::decode(src)?;
        filters = u16::try_from(src.len()).map_err(|_| DecodeError::MalformedPacket)?;
        src.advance(src.len());
    }
    Ok(Packet::UnsubscribeAck { packet_id, filters })
}
