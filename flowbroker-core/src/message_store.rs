use crate::types::{Key, Message, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-partition store of published, not-yet-expired messages.
///
/// Plain in-memory indices, mutated only from within the owning partition's
/// processing turn and rebuilt on recovery by replaying the log (or restored
/// from a snapshot). Besides the messages themselves it tracks, per message,
/// which process definitions the message has already been correlated to
/// (committed) and which correlation attempts are still in flight (pending).
/// A pending entry blocks TTL deletion and re-candidacy for that definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageStore {
    by_key: BTreeMap<Key, Message>,
    /// (name, correlation key) -> message keys in publish order.
    by_name_and_key: BTreeMap<(String, String), BTreeSet<Key>>,
    /// (name, correlation key, message id) -> message key; non-empty ids only.
    by_message_id: BTreeMap<(String, String, String), Key>,
    /// (deadline, message key), for the sweeper.
    deadlines: BTreeSet<(Timestamp, Key)>,
    committed: BTreeMap<Key, BTreeSet<String>>,
    pending: BTreeMap<Key, BTreeSet<String>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stored duplicate for the dedup check: same (name, correlation key,
    /// message id) with a deadline still in the future. Messages past their
    /// deadline no longer block a re-publish, even before their sweep.
    pub fn find_duplicate(
        &self,
        name: &str,
        correlation_key: &str,
        message_id: &str,
        now: Timestamp,
    ) -> Option<Key> {
        if message_id.is_empty() {
            return None;
        }
        let key = self.by_message_id.get(&(
            name.to_string(),
            correlation_key.to_string(),
            message_id.to_string(),
        ))?;
        let message = self.by_key.get(key)?;
        (message.deadline > now).then_some(*key)
    }

    pub fn insert(&mut self, message: Message) {
        let key = message.key;
        self.by_name_and_key
            .entry((message.name.clone(), message.correlation_key.clone()))
            .or_default()
            .insert(key);
        if !message.message_id.is_empty() {
            self.by_message_id.insert(
                (
                    message.name.clone(),
                    message.correlation_key.clone(),
                    message.message_id.clone(),
                ),
                key,
            );
        }
        self.deadlines.insert((message.deadline, key));
        self.by_key.insert(key, message);
    }

    pub fn get(&self, key: Key) -> Option<&Message> {
        self.by_key.get(&key)
    }

    /// Idempotent removal from every index.
    pub fn remove(&mut self, key: Key) -> Option<Message> {
        let message = self.by_key.remove(&key)?;
        if let Some(keys) = self
            .by_name_and_key
            .get_mut(&(message.name.clone(), message.correlation_key.clone()))
        {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_name_and_key
                    .remove(&(message.name.clone(), message.correlation_key.clone()));
            }
        }
        if !message.message_id.is_empty() {
            let id_key = (
                message.name.clone(),
                message.correlation_key.clone(),
                message.message_id.clone(),
            );
            // A newer message may have re-used the id after this one expired.
            if self.by_message_id.get(&id_key) == Some(&key) {
                self.by_message_id.remove(&id_key);
            }
        }
        self.deadlines.remove(&(message.deadline, key));
        self.committed.remove(&key);
        self.pending.remove(&key);
        Some(message)
    }

    /// Buffered messages for (name, correlation key), oldest first.
    pub fn candidates<'a>(
        &'a self,
        name: &str,
        correlation_key: &str,
    ) -> impl Iterator<Item = &'a Message> {
        self.by_name_and_key
            .get(&(name.to_string(), correlation_key.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|key| self.by_key.get(key))
    }

    /// Buffered messages with the given name across all correlation keys,
    /// oldest first. Start-event subscriptions match on name alone.
    pub fn candidates_by_name(&self, name: &str) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .by_name_and_key
            .iter()
            .filter(|((n, _), _)| n == name)
            .flat_map(|(_, set)| set.iter().copied())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Whether the message may still correlate to the given definition:
    /// neither committed nor in flight for it.
    pub fn is_eligible(&self, message_key: Key, bpmn_process_id: &str) -> bool {
        let committed = self
            .committed
            .get(&message_key)
            .is_some_and(|ids| ids.contains(bpmn_process_id));
        let pending = self
            .pending
            .get(&message_key)
            .is_some_and(|ids| ids.contains(bpmn_process_id));
        !committed && !pending
    }

    /// Oldest buffered message still eligible for the given definition.
    pub fn first_candidate(
        &self,
        name: &str,
        correlation_key: &str,
        bpmn_process_id: &str,
    ) -> Option<Key> {
        self.candidates(name, correlation_key)
            .find(|m| self.is_eligible(m.key, bpmn_process_id))
            .map(|m| m.key)
    }

    pub fn begin_correlation(&mut self, message_key: Key, bpmn_process_id: &str) {
        self.pending
            .entry(message_key)
            .or_default()
            .insert(bpmn_process_id.to_string());
    }

    /// Move an in-flight correlation to committed. Safe to call for a message
    /// that was deleted or closed out mid-handshake.
    pub fn commit_correlation(&mut self, message_key: Key, bpmn_process_id: &str) {
        if let Some(ids) = self.pending.get_mut(&message_key) {
            ids.remove(bpmn_process_id);
            if ids.is_empty() {
                self.pending.remove(&message_key);
            }
        }
        if self.by_key.contains_key(&message_key) {
            self.committed
                .entry(message_key)
                .or_default()
                .insert(bpmn_process_id.to_string());
        }
    }

    /// Drop an in-flight correlation; the message becomes a candidate again.
    pub fn abort_correlation(&mut self, message_key: Key, bpmn_process_id: &str) {
        if let Some(ids) = self.pending.get_mut(&message_key) {
            ids.remove(bpmn_process_id);
            if ids.is_empty() {
                self.pending.remove(&message_key);
            }
        }
    }

    pub fn has_pending(&self, message_key: Key) -> bool {
        self.pending.contains_key(&message_key)
    }

    /// Messages past their deadline with no correlation in flight, for the
    /// sweeper to turn into delete commands.
    pub fn expired(&self, now: Timestamp) -> Vec<Key> {
        self.deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .filter(|(_, key)| !self.has_pending(*key))
            .map(|(_, key)| *key)
            .collect()
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
    use crate::types::Variables;

    fn message(key: Key, name: &str, correlation_key: &str, message_id: &str) -> Message {
        Message {
            key,
            name: name.to_string(),
            correlation_key: correlation_key.to_string(),
            message_id: message_id.to_string(),
            variables: Variables::new(),
            time_to_live: 5_000,
            deadline: 5_000,
            published_at: 0,
        }
    }

    #[test]
    fn duplicate_lookup_matches_full_triple() {
        let mut store = MessageStore::new();
        store.insert(message(1, "order canceled", "order-123", "msg-1"));

        assert_eq!(
            store.find_duplicate("order canceled", "order-123", "msg-1", 0),
            Some(1)
        );
        assert_eq!(
            store.find_duplicate("order canceled", "order-123", "msg-2", 0),
            None
        );
        assert_eq!(
            store.find_duplicate("order canceled", "order-456", "msg-1", 0),
            None
        );
        assert_eq!(
            store.find_duplicate("order shipped", "order-123", "msg-1", 0),
            None
        );
    }

    #[test]
    fn anonymous_messages_never_collide() {
        let mut store = MessageStore::new();
        store.insert(message(1, "ping", "123", ""));
        assert_eq!(store.find_duplicate("ping", "123", "", 0), None);
        store.insert(message(2, "ping", "123", ""));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn expired_duplicate_does_not_block_republish() {
        let mut store = MessageStore::new();
        store.insert(message(1, "ping", "123", "msg-1"));
        assert_eq!(store.find_duplicate("ping", "123", "msg-1", 5_000), None);
    }

    #[test]
    fn candidates_come_oldest_first() {
        let mut store = MessageStore::new();
        store.insert(message(2, "ping", "123", ""));
        store.insert(message(1, "ping", "123", ""));
        store.insert(message(3, "ping", "456", ""));

        let keys: Vec<Key> = store.candidates("ping", "123").map(|m| m.key).collect();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(store.first_candidate("ping", "123", "process"), Some(1));
    }

    #[test]
    fn pending_and_committed_block_candidacy_per_definition() {
        let mut store = MessageStore::new();
        store.insert(message(1, "ping", "123", ""));

        store.begin_correlation(1, "order-process");
        assert_eq!(store.first_candidate("ping", "123", "order-process"), None);
        // A different definition still sees the message.
        assert_eq!(
            store.first_candidate("ping", "123", "other-process"),
            Some(1)
        );

        store.commit_correlation(1, "order-process");
        assert!(!store.has_pending(1));
        assert_eq!(store.first_candidate("ping", "123", "order-process"), None);

        store.begin_correlation(1, "other-process");
        store.abort_correlation(1, "other-process");
        assert_eq!(
            store.first_candidate("ping", "123", "other-process"),
            Some(1)
        );
    }

    #[test]
    fn expired_skips_in_flight_messages() {
        let mut store = MessageStore::new();
        store.insert(message(1, "ping", "123", ""));
        store.insert(message(2, "ping", "456", ""));
        store.begin_correlation(2, "order-process");

        assert_eq!(store.expired(5_000), vec![1]);
        store.abort_correlation(2, "order-process");
        assert_eq!(store.expired(5_000), vec![1, 2]);
        assert_eq!(store.expired(4_999), Vec::<Key>::new());
    }

    #[test]
    fn remove_is_idempotent_and_keeps_reused_ids() {
        let mut store = MessageStore::new();
        store.insert(message(1, "ping", "123", "msg-1"));
        // Same id re-published after the first expired.
        store.insert(message(2, "ping", "123", "msg-1"));

        assert!(store.remove(1).is_some());
        assert!(store.remove(1).is_none());
        // The id index still points at the newer message.
        assert_eq!(store.find_duplicate("ping", "123", "msg-1", 0), Some(2));
    }
}
