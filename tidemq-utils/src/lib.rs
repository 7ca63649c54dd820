//! Small helpers shared across the tidemq crates: human readable sizes and
//! durations for the configuration, listen address parsing, a peak tracking
//! gauge and wall clock timestamps.
//!
//! ```
//! use tidemq_utils::{to_bytesize, to_duration, Bytesize};
//!
//! assert_eq!(Bytesize::from("1M").as_usize(), 1_048_576);
//! assert_eq!(to_bytesize("2K512B"), 2560);
//! assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::ops::Deref;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

mod counter;

pub use counter::Counter;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

const SIZE_UNITS: [(&str, usize); 4] = [("G", 1 << 30), ("M", 1 << 20), ("K", 1 << 10), ("B", 1)];

const DURATION_UNITS: [(&str, u64); 6] =
    [("w", 604_800_000), ("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)];

/// Sums `<number><unit>` fragments, `unit` looked up in `units`. A fragment
/// that does not parse contributes nothing.
fn sum_units<T>(text: &str, units: &[(&str, T)]) -> T
where
    T: Copy + Default + std::str::FromStr + std::ops::Mul<Output = T> + std::iter::Sum,
{
    let mut fragments = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);
        let unit_len = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        fragments.push((number, unit));
        rest = next;
    }
    fragments
        .into_iter()
        .map(|(number, unit)| {
            let factor = units.iter().find(|(u, _)| *u == unit).map(|(_, f)| *f);
            match (number.parse::<T>(), factor) {
                (Ok(n), Some(f)) => n * f,
                _ => T::default(),
            }
        })
        .sum()
}

/// A byte count written as `512K`, `1G` or `2G512K`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Largest units first, `2148532224` prints as `2G1M`.
    pub fn string(&self) -> String {
        let mut left = self.0;
        let mut out = String::new();
        for (unit, size) in SIZE_UNITS {
            if left >= size {
                out += &format!("{}{}", left / size, unit);
                left %= size;
            }
        }
        if out.is_empty() {
            out.push_str("0B");
        }
        out
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &usize {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.string())
    }
}

impl Serialize for Bytesize {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        Ok(Bytesize::from(text.as_str()))
    }
}

/// Parses `2G512K`, `100MB` and the like, case insensitive.
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase();
    let text = text.replace("GB", "G").replace("MB", "M").replace("KB", "K");
    sum_units(&text, &SIZE_UNITS)
}

/// Parses `1h30m`, `250ms` and the like. Units are `w d h m s ms`, a bare
/// number means seconds.
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase();
    match text.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => Duration::from_millis(sum_units(&text, &DURATION_UNITS)),
    }
}

pub fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(d)?;
    Ok(to_duration(&text))
}

/// Parses a listen address, `:1883` meaning every IPv4 interface.
pub fn to_addr(addr: &str) -> Result<SocketAddr, AddrParseError> {
    match addr.trim() {
        a if a.starts_with(':') => format!("0.0.0.0{}", a).parse(),
        a => a.parse(),
    }
}

pub fn deserialize_addr<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
    let text = String::deserialize(d)?;
    to_addr(&text).map_err(de::Error::custom)
}

fn since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

#[inline]
pub fn timestamp_secs() -> Timestamp {
    since_epoch().as_secs() as Timestamp
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    since_epoch().as_millis() as TimestampMillis
}

/// Local time as `%Y-%m-%d %H:%M:%S`, empty for non-positive input.
pub fn format_timestamp(t: Timestamp) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_opt(t, 0) {
        chrono::LocalResult::Single(t) if t.timestamp() > 0 => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => String::new(),
    }
}
