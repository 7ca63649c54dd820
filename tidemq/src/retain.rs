//! Retained messages: the last retained publish of every topic name, kept in
//! a topic tree so a new subscription can find the records its filter
//! matches.

use std::hash::BuildHasher;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::net::MqttError;
use crate::storage::{self, retain_key, KvStore};
use crate::topic::{Level, Topic};
use crate::types::{HashMap, Retain, TopicFilter, TopicName};
use crate::utils::Counter;
use crate::Result;

pub type RetainTree<V> = Node<V>;

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Clone,
{
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        let mut node = self;
        for level in topic.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.value.replace(value)
    }

    #[inline]
    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        self._remove(topic.levels().as_ref())
    }

    #[inline]
    fn _remove(&mut self, path: &[Level]) -> Option<V> {
        if path.is_empty() {
            self.value.take()
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..]);
                if x.value.is_none() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                None
            }
        }
    }

    /// Values of every topic name matched by the filter `topic_filter`.
    #[inline]
    pub fn matches(&self, topic_filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        self._matches(topic_filter.levels(), Vec::new(), &mut out);
        out
    }

    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut Vec<(Topic, V)>) {
        let Some(first) = path.first() else {
            if let Some(v) = self.value.as_ref() {
                out.push((Topic::from(sub_path), v.clone()));
            }
            return;
        };

        match first {
            Level::MultiWildcard => {
                //# also matches the parent level
                if !sub_path.is_empty() {
                    if let Some(v) = self.value.as_ref() {
                        out.push((Topic::from(sub_path.clone()), v.clone()));
                    }
                }
                self._collect_all(sub_path, out);
            }
            Level::SingleWildcard => {
                for (k, n) in self.branches.iter() {
                    //Topic names starting with `$` are not matched by filters starting with a wildcard
                    if sub_path.is_empty() && k.is_metadata() {
                        continue;
                    }
                    let mut sub_path = sub_path.clone();
                    sub_path.push(k.clone());
                    n._matches(&path[1..], sub_path, out);
                }
            }
            level => {
                if let Some(n) = self.branches.get(level) {
                    sub_path.push(level.clone());
                    n._matches(&path[1..], sub_path, out);
                }
            }
        }
    }

    fn _collect_all(&self, sub_path: Vec<Level>, out: &mut Vec<(Topic, V)>) {
        for (k, n) in self.branches.iter() {
            if sub_path.is_empty() && k.is_metadata() {
                continue;
            }
            let mut sub_path = sub_path.clone();
            sub_path.push(k.clone());
            if let Some(v) = n.value.as_ref() {
                out.push((Topic::from(sub_path.clone()), v.clone()));
            }
            n._collect_all(sub_path, out);
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
    }
}

const WRITE_STRIPES: usize = 64;

/// In-memory retained table, written through to the store when one is set.
///
/// Writes to one topic are serialized by a striped lock; the tree lock is
/// only held to apply a change in memory, never across a store write.
pub struct RetainTable {
    tree: RwLock<RetainTree<Retain>>,
    count: Counter,
    store: Option<Arc<dyn KvStore>>,
    writes: [Mutex<()>; WRITE_STRIPES],
    hasher: ahash::RandomState,
}

impl RetainTable {
    #[inline]
    pub fn new(store: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            tree: RwLock::new(RetainTree::default()),
            count: Counter::new(),
            store,
            writes: std::array::from_fn(|_| Mutex::new(())),
            hasher: ahash::RandomState::new(),
        }
    }

    #[inline]
    fn write_lock(&self, topic: &str) -> &Mutex<()> {
        &self.writes[self.hasher.hash_one(topic) as usize % WRITE_STRIPES]
    }

    /// Replaces (`Some`) or deletes (`None`) the record of `topic`. The store
    /// write happens first; when it fails the table is left untouched.
    pub fn set(&self, topic: &TopicName, retain: Option<Retain>) -> Result<()> {
        let t = Topic::name(topic).map_err(|e| MqttError::InvalidTopic(e.to_string()))?;
        let _serial = self.write_lock(topic).lock();
        if let Some(store) = self.store.as_ref() {
            let key = retain_key(topic);
            let res = match retain.as_ref() {
                Some(r) => storage::put(store.as_ref(), &key, r),
                None => store.delete(key.as_bytes()).map(|_| ()),
            };
            res.map_err(|e| MqttError::PersistenceFailed(format!("retain {}, {}", topic, e)))?;
        }

        let mut tree = self.tree.write();
        match retain {
            Some(r) => {
                if tree.insert(&t, r).is_none() {
                    self.count.inc();
                }
            }
            None => {
                if tree.remove(&t).is_some() {
                    self.count.dec();
                }
            }
        }
        Ok(())
    }

    /// Records matching a subscription filter.
    pub fn matches(&self, topic_filter: &TopicFilter) -> Result<Vec<(TopicName, Retain)>> {
        let t = Topic::from_str(topic_filter).map_err(|e| MqttError::InvalidTopic(e.to_string()))?;
        Ok(self
            .tree
            .read()
            .matches(&t)
            .into_iter()
            .map(|(t, r)| (TopicName::from(t.to_string()), r))
            .collect())
    }

    /// Loads every record from the store into the table.
    pub fn load(&self) -> Result<usize> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        let retains = storage::load_retains(store.as_ref())?;
        let mut tree = self.tree.write();
        let mut n = 0;
        for r in retains {
            match Topic::name(&r.publish.topic) {
                Ok(t) => {
                    if tree.insert(&t, r).is_none() {
                        self.count.inc();
                    }
                    n += 1;
                }
                Err(e) => log::warn!("skip stored retain with bad topic, {}", e),
            }
        }
        Ok(n)
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.count.count()
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.count.max()
    }
}
