use std::num::NonZeroU16;

use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::packet::{Connect, LastWill, Packet, SubscribeReturnCode};
use crate::properties;
use crate::types::{packet_type, ConnectFlags, Publish, QoS, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Encode};

/// Length prefixed field size.
#[inline]
fn field(len: usize) -> usize {
    2 + len
}

/// Size of everything after the fixed header. `v5` adds the property lists
/// of the MQTT 5 layout, CONNECT follows its own level.
pub(crate) fn body_size(packet: &Packet, v5: bool) -> usize {
    // an empty property list is its length byte
    let props = usize::from(v5);
    match packet {
        Packet::Connect(connect) => {
            let v5 = usize::from(connect.protocol.is_v5());
            let will =
                connect.last_will.as_ref().map_or(0, |w| v5 + field(w.topic.len()) + field(w.message.len()));
            // protocol name, level, flags, keep alive, client id
            field(connect.protocol.name().len())
                + 4
                + v5
                + field(connect.client_id.len())
                + will
                + connect.username.as_ref().map_or(0, |u| field(u.len()))
                + connect.password.as_ref().map_or(0, |p| field(p.len()))
        }
        Packet::ConnectAck(_) => 2 + props,
        Packet::Publish(p) => {
            let packet_id = if p.qos == QoS::AtMostOnce { 0 } else { 2 };
            let props = if v5 { properties::size(&p.subscription_ids) } else { 0 };
            field(p.topic.len()) + packet_id + props + p.payload.len()
        }
        Packet::Subscribe { id, topic_filters, .. } => {
            let props = if v5 { properties::size(id.as_slice()) } else { 0 };
            2 + props + topic_filters.iter().map(|(f, _)| field(f.len()) + 1).sum::<usize>()
        }
        Packet::SubscribeAck { status, .. } => 2 + props + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            2 + props + topic_filters.iter().map(|f| field(f.len())).sum::<usize>()
        }
        Packet::UnsubscribeAck { filters, .. } => 2 + if v5 { props + usize::from(*filters) } else { 0 },
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
        _ => 2,
    }
}

/// Writes the fixed header followed by the body.
pub(crate) fn write_packet(packet: &Packet, dst: &mut BytesMut, v5: bool) -> Result<(), EncodeError> {
    let size = u32::try_from(body_size(packet, v5)).map_err(|_| EncodeError::InvalidLength)?;
    match packet {
        Packet::Publish(p) => {
            let flags = (u8::from(p.dup) << 3) | (u8::from(p.qos) << 1) | u8::from(p.retain);
            header(packet_type::PUBLISH_START | flags, size, dst)?;
            write_publish(p, dst, v5)
        }
        Packet::Connect(connect) => {
            header(packet_type::CONNECT, size, dst)?;
            write_connect(connect, dst)
        }
        Packet::ConnectAck(ack) => {
            header(packet_type::CONNACK, size, dst)?;
            dst.put_u8(u8::from(ack.session_present));
            if v5 {
                dst.put_u8(ack.return_code.v5_code());
                dst.put_u8(0);
            } else {
                dst.put_u8(ack.return_code.into());
            }
            Ok(())
        }
        Packet::PublishAck { packet_id } => ack(packet_type::PUBACK, *packet_id, dst),
        Packet::PublishReceived { packet_id } => ack(packet_type::PUBREC, *packet_id, dst),
        Packet::PublishRelease { packet_id } => ack(packet_type::PUBREL, *packet_id, dst),
        Packet::PublishComplete { packet_id } => ack(packet_type::PUBCOMP, *packet_id, dst),
        Packet::UnsubscribeAck { packet_id, filters } => {
            header(packet_type::UNSUBACK, size, dst)?;
            packet_id.encode(dst)?;
            if v5 {
                dst.put_u8(0);
                // success for each filter
                dst.put_bytes(0, usize::from(*filters));
            }
            Ok(())
        }
        Packet::Subscribe { packet_id, id, topic_filters } => {
            header(packet_type::SUBSCRIBE, size, dst)?;
            packet_id.encode(dst)?;
            if v5 {
                properties::encode(id.as_slice(), dst)?;
            }
            for (filter, qos) in topic_filters {
                filter.encode(dst)?;
                dst.put_u8(u8::from(*qos));
            }
            Ok(())
        }
        Packet::SubscribeAck { packet_id, status } => {
            header(packet_type::SUBACK, size, dst)?;
            packet_id.encode(dst)?;
            if v5 {
                dst.put_u8(0);
            }
            dst.extend(status.iter().map(|s| match s {
                SubscribeReturnCode::Success(qos) => u8::from(*qos),
                SubscribeReturnCode::Failure => 0x80,
            }));
            Ok(())
        }
        Packet::Unsubscribe { packet_id, topic_filters } => {
            header(packet_type::UNSUBSCRIBE, size, dst)?;
            packet_id.encode(dst)?;
            if v5 {
                dst.put_u8(0);
            }
            topic_filters.iter().try_for_each(|f| f.encode(dst))
        }
        Packet::PingRequest => header(packet_type::PINGREQ, 0, dst),
        Packet::PingResponse => header(packet_type::PINGRESP, 0, dst),
        Packet::Disconnect => header(packet_type::DISCONNECT, 0, dst),
    }
}

#[inline]
fn header(first_byte: u8, size: u32, dst: &mut BytesMut) -> Result<(), EncodeError> {
    dst.put_u8(first_byte);
    write_variable_length(size, dst)
}

/// Bare packet id, which MQTT 5 reads as reason code success with no
/// properties.
#[inline]
fn ack(first_byte: u8, packet_id: NonZeroU16, dst: &mut BytesMut) -> Result<(), EncodeError> {
    header(first_byte, 2, dst)?;
    packet_id.encode(dst)
}

fn write_publish(p: &Publish, dst: &mut BytesMut, v5: bool) -> Result<(), EncodeError> {
    p.topic.encode(dst)?;
    match (p.qos, p.packet_id) {
        (QoS::AtMostOnce, None) => {}
        (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
        (_, Some(packet_id)) => packet_id.encode(dst)?,
        (_, None) => return Err(EncodeError::PacketIdRequired),
    }
    if v5 {
        properties::encode(&p.subscription_ids, dst)?;
    }
    dst.put_slice(&p.payload);
    Ok(())
}

fn connect_flags(connect: &Connect) -> ConnectFlags {
    let mut flags = ConnectFlags::empty();
    flags.set(ConnectFlags::CLEAN_START, connect.clean_session);
    flags.set(ConnectFlags::USERNAME, connect.username.is_some());
    flags.set(ConnectFlags::PASSWORD, connect.password.is_some());
    if let Some(will) = &connect.last_will {
        flags |= ConnectFlags::WILL | ConnectFlags::from_bits_truncate(will.qos.value() << WILL_QOS_SHIFT);
        flags.set(ConnectFlags::WILL_RETAIN, will.retain);
    }
    flags
}

fn write_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let v5 = connect.protocol.is_v5();
    connect.protocol.name().as_bytes().encode(dst)?;
    dst.put_u8(connect.protocol.level());
    dst.put_u8(connect_flags(connect).bits());
    dst.put_u16(connect.keep_alive);
    if v5 {
        dst.put_u8(0);
    }
    connect.client_id.encode(dst)?;
    if let Some(LastWill { topic, message, .. }) = &connect.last_will {
        if v5 {
            dst.put_u8(0);
        }
        topic.encode(dst)?;
        message.encode(dst)?;
    }
    if let Some(username) = &connect.username {
        username.encode(dst)?;
    }
    if let Some(password) = &connect.password {
        password.encode(dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::{ConnectAck, ConnectAckReason};
    use crate::types::{Protocol, MQTT_LEVEL_31, MQTT_LEVEL_5};

    fn pid(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn written(p: &Packet) -> Vec<u8> {
        let mut v = BytesMut::new();
        write_packet(p, &mut v, false).unwrap();
        v.to_vec()
    }

    fn written5(p: &Packet) -> Vec<u8> {
        let mut v = BytesMut::new();
        write_packet(p, &mut v, true).unwrap();
        v.to_vec()
    }

    #[test]
    fn two_byte_remaining_length() {
        let p = Packet::Publish(Publish::new("t/1", vec![7u8; 200], QoS::AtLeastOnce, false).packet_id(Some(pid(1))));
        assert_eq!(body_size(&p, false), 207);
        let v = written(&p);
        assert_eq!(&v[..6], b"\x32\xcf\x01\x00\x03t");
        assert_eq!(v.len(), 3 + 207);
    }

    #[test]
    fn v31_connect_with_will_and_login() {
        let p = Packet::Connect(Box::new(Connect {
            protocol: Protocol(MQTT_LEVEL_31),
            clean_session: true,
            keep_alive: 15,
            client_id: ByteString::from_static("c"),
            last_will: Some(LastWill {
                qos: QoS::AtLeastOnce,
                retain: true,
                topic: ByteString::from_static("w"),
                message: Bytes::from_static(b"bye"),
            }),
            username: Some(ByteString::from_static("u")),
            password: Some(Bytes::from_static(b"p")),
        }));
        assert_eq!(
            written(&p),
            b"\x10\x1D\x00\x06MQIsdp\x03\xEE\x00\x0F\x00\x01c\x00\x01w\x00\x03bye\x00\x01u\x00\x01p"
        );
    }

    #[test]
    fn acks_and_pings() {
        let ack = Packet::ConnectAck(ConnectAck { session_present: false, return_code: ConnectAckReason::ServiceUnavailable });
        assert_eq!(written(&ack), b"\x20\x02\x00\x03");
        assert_eq!(written(&Packet::PublishRelease { packet_id: pid(0x0102) }), b"\x62\x02\x01\x02");
        assert_eq!(written(&Packet::UnsubscribeAck { packet_id: pid(9), filters: 2 }), b"\xb0\x02\x00\x09");
        assert_eq!(written(&Packet::PingResponse), b"\xd0\x00");
        assert_eq!(written(&Packet::Disconnect), b"\xe0\x00");
    }

    #[test]
    fn packet_id_must_follow_qos() {
        let mut v = BytesMut::new();
        let qos0 = Publish::new("t", "x", QoS::AtMostOnce, false).packet_id(Some(pid(1)));
        assert!(matches!(write_packet(&Packet::Publish(qos0), &mut v, false), Err(EncodeError::MalformedPacket)));
        let qos2 = Publish::new("t", "x", QoS::ExactlyOnce, false);
        assert!(matches!(write_packet(&Packet::Publish(qos2), &mut v, false), Err(EncodeError::PacketIdRequired)));
    }

    #[test]
    fn subscription_packets() {
        let sub = Packet::Subscribe {
            packet_id: pid(3),
            id: None,
            topic_filters: vec![(ByteString::from_static("a/+"), QoS::ExactlyOnce)],
        };
        assert_eq!(written(&sub), b"\x82\x08\x00\x03\x00\x03a/+\x02");

        let ack = Packet::SubscribeAck {
            packet_id: pid(3),
            status: vec![SubscribeReturnCode::Failure, SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        };
        assert_eq!(written(&ack), b"\x90\x04\x00\x03\x80\x01");

        let unsub = Packet::Unsubscribe { packet_id: pid(4), topic_filters: vec![ByteString::from_static("a/+")] };
        assert_eq!(written(&unsub), b"\xa2\x07\x00\x04\x00\x03a/+");
    }

    #[test]
    fn v5_layout() {
        let ack = Packet::ConnectAck(ConnectAck { session_present: true, return_code: ConnectAckReason::NotAuthorized });
        assert_eq!(written5(&ack), b"\x20\x03\x01\x87\x00");

        let mut p = Publish::new("t", "hi", QoS::AtLeastOnce, false).packet_id(Some(pid(2)));
        p.subscription_ids = vec![NonZeroU32::new(5).unwrap()];
        assert_eq!(written5(&Packet::Publish(p.clone())), b"\x32\x0A\x00\x01t\x00\x02\x02\x0B\x05hi");
        // identifiers are not written before MQTT 5
        assert_eq!(written(&Packet::Publish(p)), b"\x32\x07\x00\x01t\x00\x02hi");

        let sub = Packet::Subscribe {
            packet_id: pid(3),
            id: NonZeroU32::new(42),
            topic_filters: vec![(ByteString::from_static("a"), QoS::AtLeastOnce)],
        };
        assert_eq!(written5(&sub), b"\x82\x09\x00\x03\x02\x0B\x2A\x00\x01a\x01");

        let suback = Packet::SubscribeAck { packet_id: pid(3), status: vec![SubscribeReturnCode::Failure] };
        assert_eq!(written5(&suback), b"\x90\x04\x00\x03\x00\x80");
        assert_eq!(written5(&Packet::UnsubscribeAck { packet_id: pid(9), filters: 2 }), b"\xb0\x05\x00\x09\x00\x00\x00");
        assert_eq!(written5(&Packet::PublishAck { packet_id: pid(9) }), b"\x40\x02\x00\x09");
    }

    #[test]
    fn v5_connect_has_empty_property_lists() {
        let p = Packet::Connect(Box::new(Connect {
            protocol: Protocol(MQTT_LEVEL_5),
            clean_session: true,
            keep_alive: 10,
            client_id: ByteString::from_static("c"),
            last_will: Some(LastWill {
                qos: QoS::AtMostOnce,
                retain: false,
                topic: ByteString::from_static("w"),
                message: Bytes::from_static(b"x"),
            }),
            username: None,
            password: None,
        }));
        let v = written(&p);
        assert_eq!(v, b"\x10\x15\x00\x04MQTT\x05\x06\x00\x0A\x00\x00\x01c\x00\x00\x01w\x00\x01x");
        // CONNECT is laid out by its own level whatever the connection state
        assert_eq!(written5(&p), v);
    }
}
