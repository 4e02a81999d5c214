//! The topic routing table.
//!
//! Topics are opaque byte strings matched exactly. Alongside the forward map
//! (topic → subscriber set) the table keeps a reverse index (subscriber →
//! topics) so that tearing down a failed subscriber costs only its own
//! subscriptions, not a walk over every topic.
//!
//! A topic entry only exists while its subscriber set is non-empty; any
//! operation that empties a set removes the entry.

use std::collections::{HashMap, HashSet};

use mio::Token;

/// Topic → subscriber-set routing table with a reverse index.
#[derive(Debug, Default)]
pub struct TopicTable {
    topics: HashMap<String, HashSet<Token>>,
    by_conn: HashMap<Token, HashSet<String>>,
}

impl TopicTable {
    /// Creates an empty table.
    pub fn new() -> TopicTable {
        TopicTable::default()
    }

    /// Adds a subscriber to a topic. Returns false if it was already
    /// subscribed.
    pub fn subscribe(&mut self, topic: &str, id: Token) -> bool {
        let added = self
            .topics
            .entry(topic.to_owned())
            .or_default()
            .insert(id);
        if added {
            self.by_conn.entry(id).or_default().insert(topic.to_owned());
        }
        added
    }

    /// Removes a subscriber from one topic. Returns false if it was not
    /// subscribed.
    pub fn unsubscribe(&mut self, topic: &str, id: Token) -> bool {
        let Some(subs) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subs.remove(&id);
        if subs.is_empty() {
            self.topics.remove(topic);
        }
        if removed {
            if let Some(topics) = self.by_conn.get_mut(&id) {
                topics.remove(topic);
                if topics.is_empty() {
                    self.by_conn.remove(&id);
                }
            }
        }
        removed
    }

    /// Removes a connection from every topic it subscribed to.
    pub fn remove_conn(&mut self, id: Token) {
        let Some(topics) = self.by_conn.remove(&id) else {
            return;
        };
        for topic in topics {
            if let Some(subs) = self.topics.get_mut(&topic) {
                subs.remove(&id);
                if subs.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }
    }

    /// The current subscribers of a topic, if any.
    pub fn subscribers(&self, topic: &str) -> Option<&HashSet<Token>> {
        self.topics.get(topic)
    }

    /// Number of live topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of subscriptions held by one connection.
    pub fn subscription_count(&self, id: Token) -> usize {
        self.by_conn.get(&id).map_or(0, HashSet::len)
    }
}
