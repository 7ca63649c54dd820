#![deny(unsafe_code)]

//! Network listeners for tidemq.
//!
//! A [`Builder`] describes one endpoint (name, address, TLS material, limits).
//! `bind()` produces a [`Listener`] that is then turned into a TCP, TLS,
//! WebSocket or secure WebSocket listener. Each accepted connection goes
//! through an [`Acceptor`] which finishes the transport handshake and yields a
//! [`MqttStream`] of [`Intent`]s. The broker core only ever sees intents and
//! outbound packets.
//!
//! [`HttpServer`] covers the informational endpoints, statistics and health.

mod builder;
mod error;
mod http;
mod stream;
mod ws;

pub use builder::{Acceptor, Builder, Listener, ListenerType};
pub use error::MqttError;
pub use http::HttpServer;
pub use stream::{Ack, Intent, MqttStream};
pub use ws::WsStream;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
