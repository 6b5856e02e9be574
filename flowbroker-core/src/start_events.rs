use crate::types::{Key, MessageStartEventSubscription};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Start-event subscriptions held by one partition (every partition holds the
/// full set, replicated at deploy time), plus the single-active-instance
/// guard per (process id, correlation key).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StartEventSubscriptionRegistry {
    by_key: BTreeMap<Key, MessageStartEventSubscription>,
    by_message_name: BTreeMap<String, BTreeSet<Key>>,
    /// (process definition key, start event id) -> subscription key.
    by_definition_and_event: BTreeMap<(Key, String), Key>,
    /// process id -> subscription keys; used to supersede older versions.
    by_process_id: BTreeMap<String, BTreeSet<Key>>,
    /// (process id, correlation key) -> the one active instance.
    active_instances: BTreeMap<(String, String), Key>,
}

impl StartEventSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscription: MessageStartEventSubscription) {
        self.by_message_name
            .entry(subscription.message_name.clone())
            .or_default()
            .insert(subscription.key);
        self.by_definition_and_event.insert(
            (
                subscription.process_definition_key,
                subscription.start_event_id.clone(),
            ),
            subscription.key,
        );
        self.by_process_id
            .entry(subscription.bpmn_process_id.clone())
            .or_default()
            .insert(subscription.key);
        self.by_key.insert(subscription.key, subscription);
    }

    pub fn get(&self, key: Key) -> Option<&MessageStartEventSubscription> {
        self.by_key.get(&key)
    }

    pub fn remove(&mut self, key: Key) -> Option<MessageStartEventSubscription> {
        let subscription = self.by_key.remove(&key)?;
        if let Some(keys) = self.by_message_name.get_mut(&subscription.message_name) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_message_name.remove(&subscription.message_name);
            }
        }
        self.by_definition_and_event.remove(&(
            subscription.process_definition_key,
            subscription.start_event_id.clone(),
        ));
        if let Some(keys) = self.by_process_id.get_mut(&subscription.bpmn_process_id) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_process_id.remove(&subscription.bpmn_process_id);
            }
        }
        Some(subscription)
    }

    /// Open subscriptions listening on `message_name`, in open order.
    pub fn matching(&self, message_name: &str) -> Vec<Key> {
        self.by_message_name
            .get(message_name)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, process_definition_key: Key, start_event_id: &str) -> Option<Key> {
        self.by_definition_and_event
            .get(&(process_definition_key, start_event_id.to_string()))
            .copied()
    }

    /// Subscriptions of any version of the given process id.
    pub fn of_process(&self, bpmn_process_id: &str) -> Vec<Key> {
        self.by_process_id
            .get(bpmn_process_id)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn active_instance(&self, bpmn_process_id: &str, correlation_key: &str) -> Option<Key> {
        self.active_instances
            .get(&(bpmn_process_id.to_string(), correlation_key.to_string()))
            .copied()
    }

    pub fn lock_instance(
        &mut self,
        bpmn_process_id: &str,
        correlation_key: &str,
        process_instance_key: Key,
    ) {
        self.active_instances.insert(
            (bpmn_process_id.to_string(), correlation_key.to_string()),
            process_instance_key,
        );
    }

    pub fn release_instance(&mut self, bpmn_process_id: &str, correlation_key: &str) {
        self.active_instances
            .remove(&(bpmn_process_id.to_string(), correlation_key.to_string()));
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(key: Key, definition: Key, version: u32) -> MessageStartEventSubscription {
        MessageStartEventSubscription {
            key,
            process_definition_key: definition,
            bpmn_process_id: "order-process".to_string(),
            version,
            start_event_id: "start".to_string(),
            message_name: "order placed".to_string(),
        }
    }

    #[test]
    fn versions_of_a_process_are_found_together() {
        let mut registry = StartEventSubscriptionRegistry::new();
        registry.insert(subscription(1, 10, 1));
        registry.insert(subscription(2, 20, 2));

        assert_eq!(registry.of_process("order-process"), vec![1, 2]);
        assert_eq!(registry.matching("order placed"), vec![1, 2]);
        assert_eq!(registry.find(10, "start"), Some(1));

        registry.remove(1);
        assert_eq!(registry.of_process("order-process"), vec![2]);
        assert_eq!(registry.find(10, "start"), None);
    }

    #[test]
    fn instance_guard_is_per_process_and_correlation_key() {
        let mut registry = StartEventSubscriptionRegistry::new();
        registry.lock_instance("order-process", "order-123", 42);

        assert_eq!(registry.active_instance("order-process", "order-123"), Some(42));
        assert_eq!(registry.active_instance("order-process", "order-456"), None);
        assert_eq!(registry.active_instance("other", "order-123"), None);

        registry.release_instance("order-process", "order-123");
        assert_eq!(registry.active_instance("order-process", "order-123"), None);
    }
}
