use crate::types::{Key, MessageSubscription, SubscriptionState, WorkflowInstanceSubscription};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Subscriptions held on a message partition, indexed for the two lookups the
/// coordinator needs: by waiting element (duplicate guard, acks, closes) and
/// by (message name, correlation key) (matching on publish).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageSubscriptionRegistry {
    by_key: BTreeMap<Key, MessageSubscription>,
    /// (element instance key, message name) -> subscription key.
    by_element: BTreeMap<(Key, String), Key>,
    /// (message name, correlation key) -> subscription keys in open order.
    by_name_and_key: BTreeMap<(String, String), BTreeSet<Key>>,
}

impl MessageSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscription: MessageSubscription) {
        self.by_element.insert(
            (
                subscription.element_instance_key,
                subscription.message_name.clone(),
            ),
            subscription.key,
        );
        self.by_name_and_key
            .entry((
                subscription.message_name.clone(),
                subscription.correlation_key.clone(),
            ))
            .or_default()
            .insert(subscription.key);
        self.by_key.insert(subscription.key, subscription);
    }

    pub fn get(&self, key: Key) -> Option<&MessageSubscription> {
        self.by_key.get(&key)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut MessageSubscription> {
        self.by_key.get_mut(&key)
    }

    pub fn find_by_element(&self, element_instance_key: Key, message_name: &str) -> Option<Key> {
        self.by_element
            .get(&(element_instance_key, message_name.to_string()))
            .copied()
    }

    /// All subscriptions matching (message name, correlation key), oldest
    /// open first.
    pub fn matching(&self, message_name: &str, correlation_key: &str) -> Vec<Key> {
        self.by_name_and_key
            .get(&(message_name.to_string(), correlation_key.to_string()))
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, key: Key) -> Option<MessageSubscription> {
        let subscription = self.by_key.remove(&key)?;
        self.by_element.remove(&(
            subscription.element_instance_key,
            subscription.message_name.clone(),
        ));
        if let Some(keys) = self.by_name_and_key.get_mut(&(
            subscription.message_name.clone(),
            subscription.correlation_key.clone(),
        )) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_name_and_key.remove(&(
                    subscription.message_name.clone(),
                    subscription.correlation_key.clone(),
                ));
            }
        }
        Some(subscription)
    }

    /// Subscriptions stuck in `Correlating` since before `cutoff`, for the
    /// pending-command resender.
    pub fn correlating_since(&self, cutoff: i64) -> Vec<Key> {
        self.by_key
            .values()
            .filter(|s| s.state == SubscriptionState::Correlating && s.state_since <= cutoff)
            .map(|s| s.key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Subscriptions held on the process instance's partition, one per waiting
/// element instance and message name.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstanceSubscriptionRegistry {
    by_element: BTreeMap<(Key, String), WorkflowInstanceSubscription>,
}

impl WorkflowInstanceSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscription: WorkflowInstanceSubscription) {
        self.by_element.insert(
            (
                subscription.element_instance_key,
                subscription.message_name.clone(),
            ),
            subscription,
        );
    }

    pub fn get(
        &self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Option<&WorkflowInstanceSubscription> {
        self.by_element
            .get(&(element_instance_key, message_name.to_string()))
    }

    pub fn get_mut(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Option<&mut WorkflowInstanceSubscription> {
        self.by_element
            .get_mut(&(element_instance_key, message_name.to_string()))
    }

    pub fn remove(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Option<WorkflowInstanceSubscription> {
        self.by_element
            .remove(&(element_instance_key, message_name.to_string()))
    }

    /// Message names of every subscription held by one element instance.
    /// Boundary events share their activity's element instance, so closing
    /// an interrupted element has to cover all names.
    pub fn names_of_element(&self, element_instance_key: Key) -> Vec<String> {
        self.by_element
            .values()
            .filter(|s| s.element_instance_key == element_instance_key)
            .map(|s| s.message_name.clone())
            .collect()
    }

    /// Subscriptions whose open/close command has been outstanding since
    /// before `cutoff`.
    pub fn pending_since(&self, cutoff: i64) -> Vec<(Key, String)> {
        self.by_element
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    SubscriptionState::Opening | SubscriptionState::Closing
                ) && s.state_since <= cutoff
            })
            .map(|s| (s.element_instance_key, s.message_name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_element.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_element.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(key: Key, element: Key, name: &str) -> MessageSubscription {
        MessageSubscription {
            key,
            process_instance_key: 100,
            element_instance_key: element,
            bpmn_process_id: "process".to_string(),
            message_name: name.to_string(),
            correlation_key: "order-123".to_string(),
            interrupting: true,
            state: SubscriptionState::Opened,
            correlating_message_key: None,
            state_since: 0,
        }
    }

    #[test]
    fn matching_returns_subscriptions_in_open_order() {
        let mut registry = MessageSubscriptionRegistry::new();
        registry.insert(subscription(2, 21, "ping"));
        registry.insert(subscription(1, 11, "ping"));
        registry.insert(subscription(3, 31, "pong"));

        assert_eq!(registry.matching("ping", "order-123"), vec![1, 2]);
        assert_eq!(registry.matching("pong", "order-123"), vec![3]);
        assert!(registry.matching("ping", "order-456").is_empty());
    }

    #[test]
    fn element_index_survives_removal() {
        let mut registry = MessageSubscriptionRegistry::new();
        registry.insert(subscription(1, 11, "ping"));

        assert_eq!(registry.find_by_element(11, "ping"), Some(1));
        assert!(registry.remove(1).is_some());
        assert_eq!(registry.find_by_element(11, "ping"), None);
        assert!(registry.matching("ping", "order-123").is_empty());
        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn correlating_since_filters_by_state_and_age() {
        let mut registry = MessageSubscriptionRegistry::new();
        let mut stuck = subscription(1, 11, "ping");
        stuck.state = SubscriptionState::Correlating;
        stuck.state_since = 1_000;
        registry.insert(stuck);
        registry.insert(subscription(2, 21, "ping"));

        assert_eq!(registry.correlating_since(1_000), vec![1]);
        assert!(registry.correlating_since(999).is_empty());
    }
}
