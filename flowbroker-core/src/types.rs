use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Partition-encoded entity key (13 bits partition id, 51 bits sequence).
pub type Key = u64;

/// Per-partition log position, assigned on append, strictly increasing.
pub type Position = u64;

/// Partition identifier. Partition ids start at [`START_PARTITION_ID`].
pub type PartitionId = u32;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// The id of the first partition in a cluster.
pub const START_PARTITION_ID: PartitionId = 1;

/// Number of low bits of a [`Key`] holding the per-partition sequence.
pub const SEQUENCE_BITS: u32 = 51;

/// Extract the owning partition from an entity key.
///
/// Any node can route a command that carries an entity key back to the
/// partition that generated the key, without a directory lookup.
pub fn partition_of_key(key: Key) -> PartitionId {
    (key >> SEQUENCE_BITS) as PartitionId
}

// ─── Key generator ────────────────────────────────────────────

/// Generates partition-unique entity keys.
///
/// The generator state is part of the partition snapshot; replay advances it
/// past every key observed in the log so recovered partitions never reissue
/// a key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyGenerator {
    partition_id: PartitionId,
    next_sequence: u64,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            next_sequence: 1,
        }
    }

    pub fn next_key(&mut self) -> Key {
        let key = ((self.partition_id as u64) << SEQUENCE_BITS) | self.next_sequence;
        self.next_sequence += 1;
        key
    }

    /// Advance past a replayed key so it is never generated again.
    pub fn note_key(&mut self, key: Key) {
        if partition_of_key(key) != self.partition_id {
            return;
        }
        let sequence = key & ((1 << SEQUENCE_BITS) - 1);
        if sequence >= self.next_sequence {
            self.next_sequence = sequence + 1;
        }
    }
}

// ─── Variables ────────────────────────────────────────────────

/// A message/instance variable document. Opaque to the broker except for
/// top-level merging on correlation.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Merge `source` into `target`, key-wise at the top level. Source wins.
pub fn merge_variables(target: &mut Variables, source: &Variables) {
    for (name, value) in source {
        target.insert(name.clone(), value.clone());
    }
}

// ─── Message ──────────────────────────────────────────────────

/// A published message buffered for correlation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub key: Key,
    pub name: String,
    pub correlation_key: String,
    /// Client-supplied idempotency token; empty = anonymous, never collides.
    pub message_id: String,
    pub variables: Variables,
    /// Requested time to live in milliseconds. May be zero or negative.
    pub time_to_live: i64,
    /// `published_at + max(time_to_live, 0)`. Eligible for deletion once
    /// `now >= deadline` and no correlation is in flight.
    pub deadline: Timestamp,
    pub published_at: Timestamp,
}

// ─── Subscriptions ────────────────────────────────────────────

/// Lifecycle of a subscription on either side of the handshake.
///
/// The message side uses `Opened → Correlating → (Opened | removal)`; the
/// instance side additionally passes through `Opening`/`Closing` while the
/// cross-partition ack is outstanding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionState {
    Opening,
    Opened,
    Correlating,
    Closing,
}

impl SubscriptionState {
    /// Whether a new correlation attempt may start from this state.
    pub fn can_correlate(&self) -> bool {
        matches!(self, SubscriptionState::Opened)
    }
}

/// A subscription as stored on the message's partition.
///
/// Keyed by (element instance, message name); at most one in-flight
/// correlation at a time (`correlating_message_key`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageSubscription {
    pub key: Key,
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    /// Process definition id. A message correlates at most once per
    /// definition, so the message partition must know it.
    pub bpmn_process_id: String,
    pub message_name: String,
    pub correlation_key: String,
    /// One-shot (true) vs re-armed after every correlation (false).
    pub interrupting: bool,
    pub state: SubscriptionState,
    pub correlating_message_key: Option<Key>,
    /// When the current state was entered; drives pending-command resend.
    pub state_since: Timestamp,
}

/// The same logical subscription as stored on the process instance's
/// partition, used to drive the correlate handshake to the element.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstanceSubscription {
    pub key: Key,
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub bpmn_process_id: String,
    pub message_name: String,
    pub correlation_key: String,
    pub interrupting: bool,
    pub state: SubscriptionState,
    pub state_since: Timestamp,
}

/// A start-event subscription, replicated to every partition at deploy time.
/// One open subscription per (process id, start event); a newer version
/// supersedes it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageStartEventSubscription {
    pub key: Key,
    pub process_definition_key: Key,
    pub bpmn_process_id: String,
    pub version: u32,
    pub start_event_id: String,
    pub message_name: String,
}
