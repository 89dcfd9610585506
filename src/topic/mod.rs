//! Topic matching and subscription management
//!
//! Topic names and filters are validated in [`validation`]. The
//! [`SubscriptionStore`] keeps every live and persistent subscription in a
//! topic trie keyed by filter, with one entry per (client id, filter).

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name, TopicError};

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Owning client ID
    pub client_id: Arc<str>,
    /// Topic filter as subscribed
    pub filter: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
}

impl Subscription {
    pub fn new(client_id: impl Into<Arc<str>>, filter: impl Into<Arc<str>>, qos: QoS) -> Self {
        Self {
            client_id: client_id.into(),
            filter: filter.into(),
            qos,
        }
    }
}

/// Thread-safe subscription registry using a topic trie
///
/// Lookups take a read lock and clone the matching entries out, so a
/// match scan sees a consistent snapshot even while other clients
/// subscribe or unsubscribe.
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add or replace the subscription for (client id, filter).
    ///
    /// Returns the granted QoS. An empty filter is never stored.
    pub fn subscribe(&self, subscription: Subscription) -> QoS {
        let granted = subscription.qos;
        if subscription.filter.is_empty() {
            return granted;
        }

        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(&subscription.filter) {
            subs.retain(|s| s.client_id != subscription.client_id);
            subs.push(subscription);
        } else {
            let filter = subscription.filter.clone();
            trie.insert(&filter, vec![subscription]);
        }
        granted
    }

    /// Remove a subscription; returns whether one existed
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        if filter.is_empty() {
            return false;
        }

        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            let len_before = subs.len();
            subs.retain(|s| s.client_id.as_ref() != client_id);
            let removed = subs.len() != len_before;
            if subs.is_empty() {
                trie.remove(filter);
            }
            removed
        } else {
            false
        }
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.retain(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            !subs.is_empty()
        });
    }

    /// Find the subscribers of a topic, one entry per client.
    ///
    /// When several filters of the same client overlap, the entry with the
    /// highest granted QoS wins.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let mut by_client: AHashMap<Arc<str>, Subscription> = AHashMap::with_capacity(16);
        {
            let trie = self.trie.read();
            trie.matches(topic, |subs| {
                for sub in subs {
                    match by_client.get_mut(&sub.client_id) {
                        Some(existing) if existing.qos >= sub.qos => {}
                        Some(existing) => *existing = sub.clone(),
                        None => {
                            by_client.insert(sub.client_id.clone(), sub.clone());
                        }
                    }
                }
            });
        }
        by_client.into_values().collect()
    }

    /// All subscriptions held by a client
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Subscription> {
        let trie = self.trie.read();
        let mut result = Vec::new();
        trie.for_each(|subs| {
            result.extend(
                subs.iter()
                    .filter(|s| s.client_id.as_ref() == client_id)
                    .cloned(),
            );
        });
        result
    }

    /// Total number of stored subscriptions
    pub fn count(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each(|subs| count += subs.len());
        count
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
