use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

/// One `/` separated segment of a topic name or topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    /// `$SYS` style first level
    Metadata(String),
    /// The empty segment of `a//b`, distinct from any literal
    Blank,
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    pub fn parse<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        Level::from_str(s.as_ref())
    }

    pub fn normal<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        if s.as_ref().contains(['+', '#']) {
            return Err(TopicError::InvalidLevel(format!("invalid normal level `{}` contains +|#", s.as_ref())));
        }
        if s.as_ref().is_empty() {
            return Ok(Level::Blank);
        }
        Ok(Level::Normal(String::from(s.as_ref())))
    }

    pub fn metadata<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        if s.as_ref().contains(['+', '#']) {
            return Err(TopicError::InvalidLevel(format!(
                "invalid metadata level `{}` contains +|#",
                s.as_ref()
            )));
        }
        if !s.as_ref().starts_with('$') {
            return Err(TopicError::InvalidLevel(format!(
                "invalid metadata level `{}` not starts with $",
                s.as_ref()
            )));
        }
        Ok(Level::Metadata(String::from(s.as_ref())))
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            Level::Blank => Some(""),
            _ => None,
        }
    }

    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(*self, Level::Normal(_))
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        match *self {
            Level::Normal(ref s) => !s.is_empty() && !s.contains(['+', '#']),
            Level::Metadata(ref s) => s.starts_with('$') && !s.contains(['+', '#']),
            _ => true,
        }
    }
}

/// A parsed topic name or topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    /// `#` only as the last level, `$` levels only in first position.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0
            .iter()
            .position(|level| !level.is_valid())
            .or_else(|| {
                self.0.iter().enumerate().position(|(pos, level)| match *level {
                    Level::MultiWildcard => pos != self.0.len() - 1,
                    Level::Metadata(_) => pos != 0,
                    _ => false,
                })
            })
            .is_none()
    }

    #[inline]
    pub fn has_wildcards(&self) -> bool {
        self.0.iter().any(|l| l.is_wildcard())
    }

    /// Parses a topic a client may publish to: no wildcards, not empty.
    pub fn name<S: AsRef<str>>(s: S) -> Result<Topic, TopicError> {
        let s = s.as_ref();
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic name".into()));
        }
        let t = Topic::from_str(s)?;
        if t.has_wildcards() {
            return Err(TopicError::InvalidTopic(format!("topic name `{}` contains wildcards", s)));
        }
        Ok(t)
    }

    /// Parses a topic filter a client may subscribe to.
    pub fn filter<S: AsRef<str>>(s: S) -> Result<Topic, TopicError> {
        let s = s.as_ref();
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic filter".into()));
        }
        Topic::from_str(s)
    }

    /// Whether this filter matches the topic name `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        match_levels(&self.0, topic.0.iter())
    }

    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        match_levels(&self.0, topic.as_ref().split('/'))
    }

    /// Whether every topic matched by `filter` is also matched by this filter.
    pub fn covers(&self, filter: &Topic) -> bool {
        let mut rhs = filter.0.iter();
        for (pos, lhs) in self.0.iter().enumerate() {
            match (lhs, rhs.next()) {
                (Level::MultiWildcard, Some(r)) => {
                    return !(pos == 0 && r.is_metadata());
                }
                (Level::MultiWildcard, None) => return true,
                (Level::SingleWildcard, Some(r)) => {
                    if matches!(r, Level::MultiWildcard) || (pos == 0 && r.is_metadata()) {
                        return false;
                    }
                }
                (l, Some(r)) if l == r => continue,
                _ => return false,
            }
        }
        rhs.next().is_none()
    }
}

fn match_levels<I, L>(filter: &[Level], topic: I) -> bool
where
    I: IntoIterator<Item = L>,
    L: MatchLevel,
{
    let mut lhs = filter.iter();
    for (pos, rhs) in topic.into_iter().enumerate() {
        match lhs.next() {
            Some(&Level::SingleWildcard) => {
                if !rhs.match_level(&Level::SingleWildcard, pos) {
                    return false;
                }
            }
            Some(&Level::MultiWildcard) => {
                return rhs.match_level(&Level::MultiWildcard, pos);
            }
            Some(level) if rhs.match_level(level, pos) => continue,
            _ => return false,
        }
    }

    // `sport/#` also matches `sport`
    matches!(lhs.next(), Some(&Level::MultiWildcard) | None)
}

impl From<&[Level]> for Topic {
    fn from(s: &[Level]) -> Self {
        Topic(s.to_vec())
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl From<Topic> for Vec<Level> {
    fn from(t: Topic) -> Self {
        t.0
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub(crate) trait MatchLevel {
    /// `pos` is the position of `self` in the topic name; wildcards in first
    /// position never match `$` levels.
    fn match_level(&self, level: &Level, pos: usize) -> bool;
}

impl MatchLevel for &Level {
    fn match_level(&self, level: &Level, pos: usize) -> bool {
        match *level {
            Level::Normal(ref lhs) => matches!(self, Level::Normal(rhs) if lhs == rhs),
            Level::Metadata(ref lhs) => matches!(self, Level::Metadata(rhs) if lhs == rhs),
            Level::Blank => matches!(self, Level::Blank),
            Level::SingleWildcard | Level::MultiWildcard => !(pos == 0 && self.is_metadata()),
        }
    }
}

impl MatchLevel for &str {
    fn match_level(&self, level: &Level, pos: usize) -> bool {
        match *level {
            Level::Normal(ref lhs) => lhs.as_str() == *self,
            Level::Metadata(ref lhs) => pos == 0 && lhs.as_str() == *self,
            Level::Blank => self.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => !(pos == 0 && is_metadata(self)),
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
                } else if is_metadata(s) {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        let levels = s
            .split('/')
            .enumerate()
            .map(|(pos, l)| match Level::from_str(l) {
                // `$` only marks metadata in first position
                Ok(Level::Metadata(m)) if pos > 0 => Ok(Level::Normal(m)),
                other => other,
            })
            .collect::<Result<Vec<_>, TopicError>>()?;
        let topic = Topic(levels);
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(TopicError::InvalidTopic(format!("invalid topic `{}`", s)))
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}
