//! Message correlation engine for a partitioned BPMN workflow broker.
//!
//! Published messages and message subscriptions are routed by correlation key
//! to one of N partitions, each a single-threaded processor over its own
//! durable record log. The correlation coordinator pairs the oldest eligible
//! buffered message with each waiting element and drives every pair through a
//! two-phase handshake (`CORRELATE → CORRELATED | REJECT`) between the
//! message-owning and instance-owning partitions — exactly-once per element,
//! deduplicated by client message id, expired by a periodic TTL sweeper.
//!
//! The process-instance execution state machine itself is external; it is
//! driven through the [`partition::ProcessEngine`] trait and the
//! subscription open/close entry points.

pub mod broker;
pub mod cluster;
mod correlation;
pub mod error;
pub mod events;
pub mod log;
pub mod message_store;
pub mod partition;
pub mod router;
pub mod start_events;
pub mod subscriptions;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::Broker;
pub use cluster::{Cluster, Config, PublishMessage, StartEventSpec};
pub use error::CommandError;
pub use events::{
    MessageRecord, MessageStartEventSubscriptionRecord, MessageSubscriptionRecord, Record,
    RecordType, RecordValue, RejectionReason, WorkflowInstanceSubscriptionRecord,
};
pub use log::{MemoryLog, PartitionLog};
pub use partition::{
    ElementTrigger, OpenSubscription, OutboundCommand, Partition, PartitionState, ProcessEngine,
    Turn,
};
pub use router::partition_for;
pub use types::{
    merge_variables, partition_of_key, Key, KeyGenerator, Message, MessageStartEventSubscription,
    MessageSubscription, PartitionId, Position, SubscriptionState, Timestamp, Variables,
    WorkflowInstanceSubscription, START_PARTITION_ID,
};
