use std::path::Path;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// The `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            to: To::Console,
            level: Level::new(slog::Level::Info),
            dir: "/var/log/tidemq".into(),
            file: "tidemq.log".into(),
        }
    }
}

impl Log {
    /// `dir` joined with `file`, empty when no file is configured.
    pub fn filename(&self) -> String {
        match (self.dir.as_str(), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => Path::new(dir).join(file).to_string_lossy().into_owned(),
        }
    }
}

/// Where log records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        *self == To::File || *self == To::Both
    }

    #[inline]
    pub fn console(&self) -> bool {
        *self == To::Console || *self == To::Both
    }

    #[inline]
    pub fn off(&self) -> bool {
        *self == To::Off
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [("off", To::Off), ("file", To::File), ("console", To::Console), ("both", To::Both)]
            .into_iter()
            .find(|(name, _)| s.eq_ignore_ascii_case(name))
            .map(|(_, to)| to)
            .ok_or_else(|| format!("unknown log target '{}'", s))
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d)?.parse().map_err(de::Error::custom)
    }
}

/// A `slog` level read from its name, `info`, `debug` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn new(inner: slog::Level) -> Self {
        Level(inner)
    }

    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        slog::Level::from_str(&name)
            .map(Level)
            .map_err(|_| de::Error::custom(format!("unknown log level '{}'", name)))
    }
}
