use std::str::FromStr;

use parking_lot::RwLock;

use crate::codec::QoS;
use crate::net::MqttError;
use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::{ClientId, HashMap, TopicFilter, TopicName};
use crate::utils::Counter;
use crate::Result;

/// Subscription index: topic filter to the clients subscribed with it.
///
/// The whole tree sits behind one reader/writer lock; matching holds the read
/// side only for the walk.
pub struct Router {
    tree: RwLock<TopicTree<ClientId, QoS>>,
    routes: Counter,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    #[inline]
    pub fn new() -> Self {
        Self { tree: RwLock::new(TopicTree::default()), routes: Counter::new() }
    }

    /// Registers `client_id` under `topic_filter`, replacing the QoS of an
    /// earlier registration. Returns the replaced QoS.
    #[inline]
    pub fn add(&self, topic_filter: &str, client_id: ClientId, qos: QoS) -> Result<Option<QoS>> {
        let topic = Topic::filter(topic_filter).map_err(|e| MqttError::InvalidTopic(e.to_string()))?;
        let prev = self.tree.write().insert(&topic, client_id, qos);
        if prev.is_none() {
            self.routes.inc();
        }
        Ok(prev)
    }

    #[inline]
    pub fn remove(&self, topic_filter: &str, client_id: &ClientId) -> bool {
        let Ok(topic) = Topic::from_str(topic_filter) else {
            return false;
        };
        let removed = self.tree.write().remove(&topic, client_id).is_some();
        if removed {
            self.routes.dec();
        }
        removed
    }

    /// Removes every filter of `client_id` given in `topic_filters`.
    #[inline]
    pub fn remove_all<'a, I>(&self, client_id: &ClientId, topic_filters: I)
    where
        I: IntoIterator<Item = &'a TopicFilter>,
    {
        let mut tree = self.tree.write();
        for tf in topic_filters {
            if let Ok(topic) = Topic::from_str(tf) {
                if tree.remove(&topic, client_id).is_some() {
                    self.routes.dec();
                }
            }
        }
    }

    /// Subscribers of a published topic, one entry per client at the highest
    /// granted QoS among its matching filters, ordered by client id.
    pub fn matches(&self, topic: &TopicName) -> Result<Vec<(ClientId, QoS)>> {
        let topic = Topic::name(topic).map_err(|e| MqttError::InvalidTopic(e.to_string()))?;
        let matched = self.tree.read().matches(&topic);
        let mut subs: HashMap<ClientId, QoS> = HashMap::default();
        for (_, client_id, qos) in matched {
            subs.entry(client_id).and_modify(|q| *q = (*q).max(qos)).or_insert(qos);
        }
        let mut subs = subs.into_iter().collect::<Vec<_>>();
        subs.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(subs)
    }

    #[inline]
    pub fn get(&self, topic_filter: &str, client_id: &ClientId) -> Option<QoS> {
        let topic = Topic::from_str(topic_filter).ok()?;
        self.tree.read().get(&topic, client_id).copied()
    }

    /// Number of (client, filter) registrations.
    #[inline]
    pub fn routes(&self) -> usize {
        self.routes.count().max(0) as usize
    }

    #[inline]
    pub fn routes_max(&self) -> usize {
        self.routes.max().max(0) as usize
    }

    /// Number of distinct filters.
    #[inline]
    pub fn topics(&self) -> usize {
        self.tree.read().filters_size()
    }

    pub fn list(&self) -> Vec<(TopicFilter, ClientId, QoS)> {
        self.tree
            .read()
            .list()
            .into_iter()
            .map(|(t, c, q)| (TopicFilter::from(t.to_string()), c, q))
            .collect()
    }
}
