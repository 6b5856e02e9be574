use crate::types::*;
use serde::{Deserialize, Serialize};

/// Why a command was refused. Rejections are ordinary protocol outcomes,
/// recorded on the log like any other record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectionReason {
    AlreadyExists,
    NotFound,
    InvalidState,
}

/// Kind of a record on the partition log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RecordType {
    Command,
    Event,
    Rejection {
        reason: RejectionReason,
        message: String,
    },
}

/// One entry of a partition's durable log: the applied command stream plus
/// every event it produced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub position: Position,
    pub partition_id: PartitionId,
    pub timestamp: Timestamp,
    pub record_type: RecordType,
    pub value: RecordValue,
}

/// The per-entity payload of a record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RecordValue {
    Message(MessageRecord),
    MessageSubscription(MessageSubscriptionRecord),
    WorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord),
    MessageStartEventSubscription(MessageStartEventSubscriptionRecord),
}

// ─── Message ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MessageRecord {
    /// Client command, routed by correlation key.
    Publish {
        name: String,
        correlation_key: String,
        message_id: String,
        variables: Variables,
        time_to_live: i64,
    },
    Published {
        message_key: Key,
        name: String,
        correlation_key: String,
        message_id: String,
        variables: Variables,
        time_to_live: i64,
        deadline: Timestamp,
    },
    /// Internal command written by the TTL sweeper; re-validated on apply.
    Delete {
        message_key: Key,
    },
    Deleted {
        message_key: Key,
        name: String,
        correlation_key: String,
    },
}

// ─── MessageSubscription (message partition side) ─────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MessageSubscriptionRecord {
    /// From the instance partition: open a subscription here.
    Open {
        process_instance_key: Key,
        element_instance_key: Key,
        bpmn_process_id: String,
        message_name: String,
        correlation_key: String,
        interrupting: bool,
    },
    Opened {
        subscription_key: Key,
        process_instance_key: Key,
        element_instance_key: Key,
        bpmn_process_id: String,
        message_name: String,
        correlation_key: String,
        interrupting: bool,
    },
    /// A candidate pair was picked; the correlate command is in flight.
    Correlating {
        subscription_key: Key,
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        bpmn_process_id: String,
    },
    /// Ack from the instance partition: the element accepted the message.
    Correlate {
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        bpmn_process_id: String,
    },
    Correlated {
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        bpmn_process_id: String,
    },
    /// From the instance partition: the element lost the race.
    Reject {
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        bpmn_process_id: String,
    },
    Rejected {
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        bpmn_process_id: String,
    },
    /// From the instance partition: the element stopped listening.
    Close {
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
    },
    Closed {
        subscription_key: Key,
        element_instance_key: Key,
        message_name: String,
    },
}

// ─── WorkflowInstanceSubscription (instance partition side) ───

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum WorkflowInstanceSubscriptionRecord {
    /// The element started listening; the open command to the message
    /// partition is in flight.
    Opening {
        subscription_key: Key,
        process_instance_key: Key,
        element_instance_key: Key,
        bpmn_process_id: String,
        message_name: String,
        correlation_key: String,
        interrupting: bool,
    },
    /// Ack command from the message partition; the matching event confirms
    /// the handshake.
    Open {
        element_instance_key: Key,
        message_name: String,
    },
    Opened {
        subscription_key: Key,
        element_instance_key: Key,
        message_name: String,
    },
    /// From the message partition: deliver this message to the element.
    Correlate {
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        correlation_key: String,
        bpmn_process_id: String,
        variables: Variables,
    },
    Correlated {
        subscription_key: Key,
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        variables: Variables,
    },
    /// The element stopped listening; the close command is in flight.
    Closing {
        subscription_key: Key,
        element_instance_key: Key,
        message_name: String,
        correlation_key: String,
    },
    /// Ack command from the message partition.
    Close {
        element_instance_key: Key,
        message_name: String,
    },
    Closed {
        subscription_key: Key,
        element_instance_key: Key,
        message_name: String,
    },
}

// ─── MessageStartEventSubscription ────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MessageStartEventSubscriptionRecord {
    /// Deploy fan-out command, sent once per partition per start event.
    Open {
        process_definition_key: Key,
        bpmn_process_id: String,
        version: u32,
        start_event_id: String,
        message_name: String,
    },
    Opened {
        subscription_key: Key,
        process_definition_key: Key,
        bpmn_process_id: String,
        version: u32,
        start_event_id: String,
        message_name: String,
    },
    /// A message spawned a new instance of the subscribed process.
    Correlated {
        subscription_key: Key,
        process_definition_key: Key,
        bpmn_process_id: String,
        start_event_id: String,
        message_key: Key,
        correlation_key: String,
        process_instance_key: Key,
    },
    Close {
        process_definition_key: Key,
        start_event_id: String,
    },
    Closed {
        subscription_key: Key,
        process_definition_key: Key,
        bpmn_process_id: String,
        start_event_id: String,
    },
    /// Notification from the process engine: the single active instance for
    /// this (process id, correlation key) finished, releasing the guard.
    InstanceFinished {
        bpmn_process_id: String,
        correlation_key: String,
    },
}
