//! Subscription Registry
//!
//! Two indexes over the live subscriptions of one connection:
//! topic → subscription for deduplication, id → subscription for teardown.
//! Every mutation goes through this type so the two never disagree.

use std::collections::HashMap;

/// Handle to a live subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Pattern exactly as requested
    pub topic: String,
    /// Client-assigned id, never reused
    pub id: u64,
    /// Transport-level subscription handle
    pub sid: u64,
}

/// Topic- and id-indexed subscription maps
#[derive(Debug)]
pub struct SubscriptionRegistry {
    by_topic: HashMap<String, Subscription>,
    by_id: HashMap<u64, Subscription>,
    next_id: u64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            by_topic: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_topic(&self, topic: &str) -> Option<&Subscription> {
        self.by_topic.get(topic)
    }

    pub fn by_id(&self, id: u64) -> Option<&Subscription> {
        self.by_id.get(&id)
    }

    pub fn contains_id(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Track a new transport subscription under a fresh id
    pub fn insert(&mut self, topic: &str, sid: u64) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;

        let sub = Subscription {
            topic: topic.to_string(),
            id,
            sid,
        };

        if let Some(replaced) = self.by_topic.insert(topic.to_string(), sub.clone()) {
            self.by_id.remove(&replaced.id);
        }
        self.by_id.insert(id, sub.clone());
        sub
    }

    /// Remove by id from both maps
    pub fn remove(&mut self, id: u64) -> Option<Subscription> {
        let sub = self.by_id.remove(&id)?;
        if self.by_topic.get(&sub.topic).map(|s| s.id) == Some(id) {
            self.by_topic.remove(&sub.topic);
        }
        Some(sub)
    }

    /// Remove everything, returning what was tracked
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.by_topic.clear();
        let mut subs: Vec<Subscription> = self.by_id.drain().map(|(_, s)| s).collect();
        subs.sort_by_key(|s| s.id);
        subs
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_indexes_both_ways() {
        let mut registry = SubscriptionRegistry::new();
        let sub = registry.insert("x.y", 10);

        assert_eq!(registry.by_topic("x.y"), Some(&sub));
        assert_eq!(registry.by_id(sub.id), Some(&sub));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.insert("x.y", 1);
        registry.remove(first.id);
        let second = registry.insert("x.y", 2);

        assert_ne!(first.id, second.id);
        assert!(second.id > first.id);
    }

    #[test]
    fn test_remove_clears_both_maps() {
        let mut registry = SubscriptionRegistry::new();
        let sub = registry.insert("x.y", 1);

        assert_eq!(registry.remove(sub.id), Some(sub.clone()));
        assert!(registry.by_topic("x.y").is_none());
        assert!(!registry.contains_id(sub.id));
        assert!(registry.is_empty());
        assert!(registry.remove(sub.id).is_none());
    }

    #[test]
    fn test_stale_remove_keeps_newer_topic_entry() {
        let mut registry = SubscriptionRegistry::new();
        let old = registry.insert("x.y", 1);
        let new = registry.insert("x.y", 2);

        // Replacing dropped the old id
        assert!(!registry.contains_id(old.id));
        assert!(registry.remove(old.id).is_none());
        assert_eq!(registry.by_topic("x.y"), Some(&new));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", 1);
        registry.insert("b", 2);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].topic, "a");
        assert!(registry.is_empty());
        assert!(registry.topics().is_empty());
    }
}
