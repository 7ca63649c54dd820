#![deny(unsafe_code)]

//! An embeddable MQTT 3.1 / 3.1.1 broker.
//!
//! ```rust,no_run
//! use tidemq::auth::AllowHook;
//! use tidemq::context::ServerContext;
//! use tidemq::hook::Type;
//! use tidemq::inline::InlineClient;
//! use tidemq::net::Builder;
//! use tidemq::server::MqttServer;
//!
//! #[tokio::main]
//! async fn main() -> tidemq::Result<()> {
//!     let scx = ServerContext::builder().build();
//!     let register = scx.hooks.register();
//!     register.add_gate(&Type::GATE_ALL, 0, std::sync::Arc::new(AllowHook)).await?;
//!     register.start().await;
//!     scx.load().await?;
//!
//!     let server = MqttServer::new(scx.clone())
//!         .listener(Builder::new().name("t1").laddr(([0, 0, 0, 0], 1883).into()).bind()?.tcp()?)
//!         .listener(Builder::new().name("ws1").laddr(([0, 0, 0, 0], 8080).into()).bind()?.ws()?)
//!         .build();
//!     server.start();
//!
//!     let inline = InlineClient::new(&scx, "inline");
//!     inline.publish("direct/retained", "hello", true, tidemq::codec::QoS::AtMostOnce).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await
//! }
//! ```

pub mod auth;
pub mod context;
pub mod hook;
pub mod inflight;
pub mod inline;
pub mod lifecycle;
pub mod logger;
pub mod queue;
pub mod retain;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;
pub mod topic;
pub mod trie;
pub mod types;
pub mod v3;

pub use tidemq_codec as codec;
pub use tidemq_conf as conf;
pub use tidemq_net as net;
pub use tidemq_utils as utils;

pub use net::{Error, Result};

pub use context::ServerContext;
pub use inline::InlineClient;
pub use lifecycle::State;
pub use server::MqttServer;
