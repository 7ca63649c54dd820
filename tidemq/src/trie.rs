use std::fmt;
use std::hash::Hash;

use crate::topic::{Level, Topic};
use crate::types::HashMap;

pub type TopicTree<K, V> = Node<K, V>;

/// Segment keyed subscription tree. Each node carries the values of every
/// filter ending at it, keyed by subscriber.
pub struct Node<K, V> {
    values: HashMap<K, V>,
    branches: HashMap<Level, Node<K, V>>,
}

impl<K, V> Default for Node<K, V> {
    #[inline]
    fn default() -> Node<K, V> {
        Self { values: HashMap::default(), branches: HashMap::default() }
    }
}

impl<K, V> Node<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Returns the previous value of `key` under this filter.
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, key: K, value: V) -> Option<V> {
        let mut node = self;
        for level in topic_filter.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.values.insert(key, value)
    }

    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, key: &K) -> Option<V> {
        self._remove(topic_filter.levels().as_ref(), key)
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], key: &K) -> Option<V> {
        if path.is_empty() {
            self.values.remove(key)
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..], key);
                if x.values.is_empty() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                None
            }
        }
    }

    #[inline]
    pub fn get(&self, topic_filter: &Topic, key: &K) -> Option<&V> {
        let mut node = self;
        for level in topic_filter.levels() {
            node = node.branches.get(level)?;
        }
        node.values.get(key)
    }

    /// All `(filter, key, value)` registrations matching the topic name.
    #[inline]
    pub fn matches(&self, topic: &Topic) -> Vec<(Topic, K, V)> {
        let mut out = Vec::new();
        self._matches(topic.levels(), Vec::new(), &mut out);
        out
    }

    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut Vec<(Topic, K, V)>) {
        let add_to_out = |levels: Vec<Level>, values: &HashMap<K, V>, out: &mut Vec<(Topic, K, V)>| {
            if !values.is_empty() {
                let filter = Topic::from(levels);
                out.extend(values.iter().map(|(k, v)| (filter.clone(), k.clone(), v.clone())));
            }
        };

        if path.is_empty() {
            //Match parent #
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                let mut sub_path = sub_path.clone();
                sub_path.push(Level::MultiWildcard);
                add_to_out(sub_path, &n.values, out);
            }
            add_to_out(sub_path, &self.values, out);
        } else {
            //Topic names starting with `$` are not matched by filters starting with a wildcard
            if !(sub_path.is_empty() && path[0].is_metadata()) {
                //Multilayer matching
                if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(Level::MultiWildcard);
                    add_to_out(sub_path, &n.values, out);
                }

                //Single layer matching
                if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(Level::SingleWildcard);
                    n._matches(&path[1..], sub_path, out);
                }
            }

            //Precise matching
            if let Some(n) = self.branches.get(&path[0]) {
                sub_path.push(path[0].clone());
                n._matches(&path[1..], sub_path, out);
            }
        }
    }

    /// Number of registrations.
    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.values.len() + len
    }

    /// Number of distinct filters holding at least one registration.
    #[inline]
    pub fn filters_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.filters_size()).sum();
        len + usize::from(!self.values.is_empty())
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }

    /// Every `(filter, key, value)` in the tree.
    pub fn list(&self) -> Vec<(Topic, K, V)> {
        let mut out = Vec::new();
        self._list(Vec::new(), &mut out);
        out
    }

    fn _list(&self, path: Vec<Level>, out: &mut Vec<(Topic, K, V)>) {
        if !self.values.is_empty() {
            let filter = Topic::from(path.clone());
            out.extend(self.values.iter().map(|(k, v)| (filter.clone(), k.clone(), v.clone())));
        }
        for (l, n) in self.branches.iter() {
            let mut path = path.clone();
            path.push(l.clone());
            n._list(path, out);
        }
    }
}

impl<K, V> fmt::Debug for Node<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}
