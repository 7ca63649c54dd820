#![deny(unsafe_code)]

//! Settings for tidemq.
//!
//! Sources, later ones overriding earlier ones: `/etc/tidemq/tidemq.toml`,
//! `./tidemq.toml`, the file given with `-f`, then environment variables
//! prefixed `TIDEMQ`, e.g. `TIDEMQ__MQTT__MAX_INFLIGHT=32`.

use std::fmt;
use std::num::NonZeroU16;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use tidemq_codec::QoS;
use tidemq_net::Result;
use tidemq_utils::{deserialize_duration, Bytesize};

use self::listener::Listeners;
use self::logging::Log;

pub use self::listener::{Kind, Listener, ListenerInner};
pub use self::options::Options;

pub mod listener;
pub mod logging;
pub mod options;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(rename = "listener")]
    #[serde(default)]
    pub listeners: Listeners,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub store: Store,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/tidemq/tidemq").required(false))
            .add_source(File::with_name("tidemq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TIDEMQ").prefix_separator("__").separator("__").try_parsing(true),
        );

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self::from_inner(inner, opts))
    }

    /// Settings from a TOML document, no file lookup and no environment.
    pub fn from_toml(text: &str, opts: Options) -> Result<Self> {
        let inner: Inner = Config::builder()
            .add_source(File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(Self::from_inner(inner, opts))
    }

    fn from_inner(mut inner: Inner, opts: Options) -> Self {
        inner.listeners.init();
        if inner.listeners.is_empty() {
            inner.listeners.set_default();
        }
        inner.listeners.fill_tls(&opts.cert, &opts.key);

        //Command line configuration overriding file configuration
        if inner.store.dir.is_empty() || opts.store_dir != Options::default().store_dir {
            inner.store.dir.clone_from(&opts.store_dir);
        }
        inner.store.ephemeral |= opts.ephemeral;

        inner.opts = opts;
        Self(Arc::new(inner))
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        for l in self.listeners.items.iter() {
            log::info!("listener {}/{} on {}", l.name, l.kind.as_str(), l.addr);
        }
        log::info!("mqtt config is: {:?}", self.mqtt);
        log::info!("store config is: {:?}", self.store);
    }
}

impl Default for Settings {
    fn default() -> Self {
        let inner = Inner {
            log: Log::default(),
            listeners: Listeners::default(),
            mqtt: Mqtt::default(),
            store: Store::default(),
            opts: Options::default(),
        };
        Self::from_inner(inner, Options::default())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

/// Broker wide MQTT tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    /// Outbound QoS 1/2 deliveries awaiting acknowledgement, per session.
    #[serde(default = "Mqtt::max_inflight_default")]
    pub max_inflight: NonZeroU16,
    /// Queued messages per session; the oldest is dropped when full.
    #[serde(default = "Mqtt::max_mqueue_len_default")]
    pub max_mqueue_len: usize,
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    #[serde(default = "Mqtt::retry_max_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_max_interval: Duration,
    /// Grace period for in-flight handshakes once draining starts.
    #[serde(default = "Mqtt::drain_timeout_default", deserialize_with = "deserialize_duration")]
    pub drain_timeout: Duration,
    #[serde(default = "Mqtt::session_expiry_default", deserialize_with = "deserialize_duration")]
    pub session_expiry: Duration,
    #[serde(default = "Mqtt::max_qos_allowed_default", deserialize_with = "Mqtt::deserialize_max_qos_allowed")]
    pub max_qos_allowed: QoS,
    /// A connection is closed after `keep_alive * keepalive_backoff` without traffic.
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    #[serde(default = "Mqtt::max_clientid_len_default")]
    pub max_clientid_len: usize,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            max_inflight: Self::max_inflight_default(),
            max_mqueue_len: Self::max_mqueue_len_default(),
            retry_interval: Self::retry_interval_default(),
            retry_max_interval: Self::retry_max_interval_default(),
            drain_timeout: Self::drain_timeout_default(),
            session_expiry: Self::session_expiry_default(),
            max_qos_allowed: Self::max_qos_allowed_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            max_clientid_len: Self::max_clientid_len_default(),
        }
    }
}

impl Mqtt {
    #[inline]
    fn max_inflight_default() -> NonZeroU16 {
        NonZeroU16::new(16).unwrap_or(NonZeroU16::MIN)
    }
    #[inline]
    fn max_mqueue_len_default() -> usize {
        1000
    }
    #[inline]
    fn retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    #[inline]
    fn retry_max_interval_default() -> Duration {
        Duration::from_secs(300)
    }
    #[inline]
    fn drain_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    #[inline]
    fn session_expiry_default() -> Duration {
        Duration::from_secs(7200)
    }
    #[inline]
    fn max_qos_allowed_default() -> QoS {
        QoS::ExactlyOnce
    }
    #[inline]
    fn keepalive_backoff_default() -> f32 {
        1.5
    }
    #[inline]
    fn max_clientid_len_default() -> usize {
        65535
    }

    #[inline]
    fn deserialize_max_qos_allowed<'de, D>(deserializer: D) -> std::result::Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        let qos = match u8::deserialize(deserializer)? {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(de::Error::custom("QoS configuration error, only values (0,1,2) are supported")),
        };
        Ok(qos)
    }
}

/// Persistent store.
#[derive(Debug, Clone, Deserialize)]
pub struct Store {
    /// Empty means the `--store-dir` option.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default = "Store::cache_capacity_default")]
    pub cache_capacity: Bytesize,
    #[serde(default = "Store::gc_interval_default", deserialize_with = "deserialize_duration")]
    pub gc_interval: Duration,
    /// Reclaim a segment once this share of it is obsolete.
    #[serde(default = "Store::gc_discard_ratio_default")]
    pub gc_discard_ratio: f64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            dir: String::new(),
            ephemeral: false,
            cache_capacity: Self::cache_capacity_default(),
            gc_interval: Self::gc_interval_default(),
            gc_discard_ratio: Self::gc_discard_ratio_default(),
        }
    }
}

impl Store {
    fn cache_capacity_default() -> Bytesize {
        Bytesize::from(100 * 1024 * 1024)
    }
    fn gc_interval_default() -> Duration {
        Duration::from_secs(300)
    }
    fn gc_discard_ratio_default() -> f64 {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listeners() {
        let s = Settings::default();
        let names: Vec<(&str, Kind, u16)> =
            s.listeners.items.iter().map(|l| (l.name.as_str(), l.kind, l.addr.port())).collect();
        assert_eq!(
            names,
            vec![
                ("t1", Kind::Tcp, 1883),
                ("ts1", Kind::Tls, 8883),
                ("ws1", Kind::Wss, 8884),
                ("stats", Kind::Stats, 8080),
                ("health", Kind::Health, 8081),
            ]
        );
        let ts1 = s.listeners.get("ts1").unwrap();
        assert_eq!(ts1.cert.as_deref(), Some("server.crt"));
        assert_eq!(ts1.key.as_deref(), Some("server.key"));
        assert!(s.listeners.get("t1").unwrap().cert.is_none());
        assert_eq!(s.store.dir, ".tidemq-store");
        assert_eq!(s.mqtt.max_inflight.get(), 16);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(20));
    }

    #[test]
    fn file_overrides() {
        let opts = Options { cert: "a.crt".into(), key: "a.key".into(), ephemeral: true, ..Default::default() };
        let s = Settings::from_toml(
            r#"
            [listener.tcp.external]
            addr = ":11883"
            max_packet_size = "512K"

            [listener.wss.web]
            addr = "127.0.0.1:18884"
            handshake_timeout = "5s"

            [listener.tcp.disabled]
            enable = false
            addr = ":11884"

            [mqtt]
            max_inflight = 4
            retry_interval = "1m30s"
            max_qos_allowed = 1

            [store]
            gc_interval = "10m"
            "#,
            opts,
        )
        .unwrap();

        assert_eq!(s.listeners.items.len(), 2);
        let ext = s.listeners.get("external").unwrap();
        assert_eq!(ext.addr.to_string(), "0.0.0.0:11883");
        assert_eq!(ext.max_packet_size.as_u32(), 512 * 1024);
        let web = s.listeners.get("web").unwrap();
        assert_eq!(web.kind, Kind::Wss);
        assert_eq!(web.handshake_timeout, Duration::from_secs(5));
        assert_eq!(web.cert.as_deref(), Some("a.crt"));
        assert_eq!(web.builder().name, "web/wss");
        assert_eq!(s.mqtt.max_inflight.get(), 4);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(90));
        assert_eq!(s.mqtt.max_qos_allowed, QoS::AtLeastOnce);
        assert_eq!(s.store.gc_interval, Duration::from_secs(600));
        assert!(s.store.ephemeral);
    }

    #[test]
    fn bad_qos_is_rejected() {
        assert!(Settings::from_toml("[mqtt]\nmax_qos_allowed = 3", Options::default()).is_err());
    }
}
