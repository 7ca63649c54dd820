use std::fmt;
use std::num::{NonZeroU16, NonZeroU32};

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use tidemq_utils::{timestamp_millis, TimestampMillis};

pub(crate) const MQTT: &[u8] = b"MQTT";
pub(crate) const MQISDP: &[u8] = b"MQIsdp";
/// Protocol level sent by 3.1 clients, paired with the name `MQIsdp`.
pub const MQTT_LEVEL_31: u8 = 3;
/// Protocol level sent by 3.1.1 clients, paired with the name `MQTT`.
pub const MQTT_LEVEL_311: u8 = 4;
/// Protocol level sent by 5.0 clients.
pub const MQTT_LEVEL_5: u8 = 5;
pub(crate) const WILL_QOS_SHIFT: u8 = 3;

/// The protocol level from CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Protocol(pub u8);

impl Protocol {
    /// The protocol name that goes with the level on the wire.
    pub fn name(self) -> &'static str {
        if self.0 == MQTT_LEVEL_31 {
            "MQIsdp"
        } else {
            "MQTT"
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }

    /// Whether packets carry properties and reason codes.
    #[inline]
    pub fn is_v5(self) -> bool {
        self.0 == MQTT_LEVEL_5
    }
}

/// Subscription Identifier, MQTT 5 only.
pub type SubscriptionId = NonZeroU32;

impl Default for Protocol {
    fn default() -> Self {
        Self(MQTT_LEVEL_311)
    }
}

prim_enum! {
    /// Delivery guarantee of a message.
    #[derive(Serialize, Deserialize, PartialOrd, Ord, Hash)]
    pub enum QoS {
        /// Fire and forget.
        AtMostOnce = 0,
        /// Acknowledged with PUBACK, may arrive twice.
        AtLeastOnce = 1,
        /// Four step PUBLISH, PUBREC, PUBREL, PUBCOMP exchange.
        ExactlyOnce = 2,
    }
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        u8::from(*self)
    }

    /// The weaker of the two levels.
    #[inline]
    pub fn less_value(&self, other: QoS) -> QoS {
        (*self).min(other)
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

bitflags::bitflags! {
    /// Byte 8 of the CONNECT variable header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConnectFlags: u8 {
        const USERNAME    = 1 << 7;
        const PASSWORD    = 1 << 6;
        const WILL_RETAIN = 1 << 5;
        const WILL_QOS    = 0b11 << WILL_QOS_SHIFT;
        const WILL        = 1 << 2;
        const CLEAN_START = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 1;
    }
}

/// Fixed header first bytes, control packet type in the high nibble and the
/// required flags in the low one. PUBLISH carries its own flags.
pub(crate) mod packet_type {
    pub(crate) const CONNECT: u8 = 0x10;
    pub(crate) const CONNACK: u8 = 0x20;
    pub(crate) const PUBLISH_START: u8 = 0x30;
    pub(crate) const PUBLISH_END: u8 = 0x3f;
    pub(crate) const PUBACK: u8 = 0x40;
    pub(crate) const PUBREC: u8 = 0x50;
    pub(crate) const PUBREL: u8 = 0x62;
    pub(crate) const PUBCOMP: u8 = 0x70;
    pub(crate) const SUBSCRIBE: u8 = 0x82;
    pub(crate) const SUBACK: u8 = 0x90;
    pub(crate) const UNSUBSCRIBE: u8 = 0xa2;
    pub(crate) const UNSUBACK: u8 = 0xb0;
    pub(crate) const PINGREQ: u8 = 0xc0;
    pub(crate) const PINGRESP: u8 = 0xd0;
    pub(crate) const DISCONNECT: u8 = 0xe0;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct FixedHeader {
    pub(crate) first_byte: u8,
    pub(crate) remaining_length: u32,
}

/// An application message, as received or as forwarded.
#[derive(Serialize, Deserialize, Clone)]
pub struct Publish {
    /// Set on a resend of a QoS 1 or 2 message.
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: ByteString,
    /// `None` exactly when `qos` is 0.
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
    /// Identifiers of the subscriptions the message matched. Only written
    /// to MQTT 5 connections.
    pub subscription_ids: Vec<SubscriptionId>,
    /// When the broker first saw the message, not sent on the wire.
    pub create_time: TimestampMillis,
}

impl Publish {
    pub fn new<T, P>(topic: T, payload: P, qos: QoS, retain: bool) -> Self
    where
        ByteString: From<T>,
        Bytes: From<P>,
    {
        Publish {
            dup: false,
            retain,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            subscription_ids: Vec::new(),
            create_time: timestamp_millis(),
        }
    }

    #[inline]
    pub fn packet_id(self, packet_id: Option<NonZeroU16>) -> Self {
        Publish { packet_id, ..self }
    }
}

/// `create_time` is local bookkeeping and does not take part.
impl PartialEq for Publish {
    fn eq(&self, other: &Self) -> bool {
        (self.dup, self.retain, self.qos, self.packet_id) == (other.dup, other.retain, other.qos, other.packet_id)
            && self.topic == other.topic
            && self.payload == other.payload
            && self.subscription_ids == other.subscription_ids
    }
}

impl Eq for Publish {}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publish {{ topic: {:?}, qos: {}, packet_id: {:?}, dup: {}, retain: {}, payload: {} bytes }}",
            self.topic,
            self.qos,
            self.packet_id,
            self.dup,
            self.retain,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_order_and_bytes() {
        assert_eq!(QoS::ExactlyOnce.less_value(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.less_value(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(ConnectFlags::WILL_QOS.bits(), 0b0001_1000);
    }

    #[test]
    fn equality_ignores_create_time() {
        let mut a = Publish::new("t", "x", QoS::AtMostOnce, false);
        let b = a.clone();
        a.create_time += 1000;
        assert_eq!(a, b);
        assert!(!format!("{:?}", a).contains('x'));
    }
}
