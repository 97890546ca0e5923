use crate::camera::camera_id_for_path;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
struct ClientSubscription {
    topics: BTreeSet<String>,
    filters: Map<String, Value>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    clients: HashMap<String, ClientSubscription>,
    topic_counts: BTreeMap<String, usize>,
}

impl RegistryInner {
    fn add_topic(&mut self, topic: &str) {
        *self.topic_counts.entry(topic.to_string()).or_insert(0) += 1;
    }

    fn drop_topic(&mut self, topic: &str) {
        if let Some(count) = self.topic_counts.get_mut(topic) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.topic_counts.remove(topic);
            }
        }
    }
}

/// Aggregates reported by `get_subscription_stats`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionStats {
    pub total_subscriptions: usize,
    pub active_clients: usize,
    pub topic_counts: BTreeMap<String, usize>,
}

/// Per-client topic sets with global counters.
///
/// Client state and aggregates sit behind one lock so they never disagree.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add topics for a client; given filters replace the client's previous ones.
    ///
    /// Returns the client's full topic list.
    pub fn subscribe(
        &self,
        client_id: &str,
        topics: &[String],
        filters: Option<Map<String, Value>>,
    ) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut client = inner.clients.remove(client_id).unwrap_or_default();

        let mut added = Vec::new();
        for topic in topics {
            if client.topics.insert(topic.clone()) {
                added.push(topic.clone());
            }
        }
        if let Some(filters) = filters {
            client.filters = filters;
        }
        let current: Vec<String> = client.topics.iter().cloned().collect();

        inner.clients.insert(client_id.to_string(), client);
        for topic in &added {
            inner.add_topic(topic);
        }

        debug!("Client {} subscribed to {:?}", client_id, added);
        current
    }

    /// Remove the given topics, or all of them when `topics` is `None`.
    ///
    /// Returns the topics the client still holds.
    pub fn unsubscribe(&self, client_id: &str, topics: Option<&[String]>) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut client = match inner.clients.remove(client_id) {
            Some(client) => client,
            None => return Vec::new(),
        };

        let removed: Vec<String> = match topics {
            Some(topics) => topics
                .iter()
                .filter(|topic| client.topics.remove(topic.as_str()))
                .cloned()
                .collect(),
            None => std::mem::take(&mut client.topics).into_iter().collect(),
        };
        for topic in &removed {
            inner.drop_topic(topic);
        }

        let remaining: Vec<String> = client.topics.iter().cloned().collect();
        if !remaining.is_empty() {
            inner.clients.insert(client_id.to_string(), client);
        }

        debug!("Client {} unsubscribed from {:?}", client_id, removed);
        remaining
    }

    /// Forget a disconnected client and decrement its topics
    pub fn remove_client(&self, client_id: &str) {
        self.unsubscribe(client_id, None);
    }

    pub fn client_topics(&self, client_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .clients
            .get(client_id)
            .map(|client| client.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SubscriptionStats {
        let inner = self.inner.lock();
        SubscriptionStats {
            total_subscriptions: inner.clients.values().map(|c| c.topics.len()).sum(),
            active_clients: inner.clients.len(),
            topic_counts: inner.topic_counts.clone(),
        }
    }

    /// Whether a notification on `topic` with `params` should reach the client
    pub fn wants(&self, client_id: &str, topic: &str, params: &Value) -> bool {
        let inner = self.inner.lock();
        let client = match inner.clients.get(client_id) {
            Some(client) if client.topics.contains(topic) => client,
            _ => return false,
        };

        client
            .filters
            .iter()
            .all(|(key, expected)| filter_matches(key, expected, params))
    }
}

fn filter_matches(key: &str, expected: &Value, params: &Value) -> bool {
    let actual = match params.get(key) {
        Some(actual) => actual,
        None => return false,
    };

    // Devices may be filtered by path as well as by camera id
    if key == "device" {
        if let (Some(expected), Some(actual)) = (expected.as_str(), actual.as_str()) {
            return camera_id_for_path(expected) == camera_id_for_path(actual);
        }
    }
    actual == expected
}
