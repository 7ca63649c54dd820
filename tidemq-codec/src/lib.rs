#![deny(unsafe_code)]

//! MQTT v3.1, v3.1.1 and v5 wire format.
//!
//! [`Codec`] plugs into `tokio_util::codec::Framed` and turns a byte stream into
//! [`Packet`] values and back. Inbound frames larger than the configured
//! maximum are refused before the body is buffered. Of the MQTT 5 properties
//! only the Subscription Identifier is kept.

#[macro_use]
mod utils;

pub mod error;
pub mod types;

mod codec;
mod decode;
mod encode;
mod packet;
mod properties;

pub use self::codec::Codec;
pub use self::error::{DecodeError, EncodeError};
pub use self::packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, SubscribeReturnCode};
pub use self::types::{Protocol, Publish, QoS, SubscriptionId, MQTT_LEVEL_31, MQTT_LEVEL_311, MQTT_LEVEL_5};
