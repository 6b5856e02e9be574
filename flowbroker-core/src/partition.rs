use crate::events::*;
use crate::log::PartitionLog;
use crate::message_store::MessageStore;
use crate::router::partition_for;
use crate::start_events::StartEventSubscriptionRegistry;
use crate::subscriptions::{MessageSubscriptionRegistry, WorkflowInstanceSubscriptionRegistry};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of delivering a correlated message to a waiting element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElementTrigger {
    /// The element accepted the message. `interrupted_elements` lists element
    /// instances the trigger terminated (a guarded activity, losing gateway
    /// branches); their subscriptions are closed by the broker.
    Accepted { interrupted_elements: Vec<Key> },
    /// The element is no longer waiting — a race was lost. The coordinator
    /// rejects the correlate command and retries the message elsewhere.
    Rejected,
}

/// The process-instance execution state machine, specified at its interface
/// only. The broker drives element triggers and instance creation through it
/// and never looks inside.
#[async_trait]
pub trait ProcessEngine: Send + Sync {
    /// Deliver a correlated message's variables to a waiting element
    /// instance. Message variables are merged into the element's scope by the
    /// engine (mappings included); the broker only hands them over.
    async fn correlate_to_element(
        &self,
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: &str,
        variables: &Variables,
    ) -> Result<ElementTrigger>;

    /// Create a new process instance rooted at a message start event, seeded
    /// with the message variables. The instance key is generated by the
    /// calling partition.
    async fn create_instance_for_start_event(
        &self,
        process_instance_key: Key,
        process_definition_key: Key,
        bpmn_process_id: &str,
        start_event_id: &str,
        variables: &Variables,
    ) -> Result<()>;
}

/// Request to open a subscription for a waiting element, issued by the
/// process engine on the partition that owns the instance.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenSubscription {
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub bpmn_process_id: String,
    pub message_name: String,
    pub correlation_key: String,
    pub interrupting: bool,
}

/// A command bound for a partition's queue, with its routing target.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundCommand {
    pub target: PartitionId,
    pub value: RecordValue,
}

/// Everything one processing turn produced: the records appended to this
/// partition's log, and the commands bound for other partitions (or this
/// one, for sweeper deletes).
#[derive(Debug, Default)]
pub struct Turn {
    pub records: Vec<Record>,
    pub outbox: Vec<OutboundCommand>,
}

/// The complete replicated state of one partition: plain in-memory indices,
/// mutated only through [`PartitionState::apply_event`] so that replaying the
/// event records of the log reproduces it exactly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PartitionState {
    pub keys: KeyGenerator,
    pub last_position: Position,
    pub messages: MessageStore,
    pub subscriptions: MessageSubscriptionRegistry,
    pub instance_subscriptions: WorkflowInstanceSubscriptionRegistry,
    pub start_events: StartEventSubscriptionRegistry,
}

impl PartitionState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            keys: KeyGenerator::new(partition_id),
            last_position: 0,
            messages: MessageStore::new(),
            subscriptions: MessageSubscriptionRegistry::new(),
            instance_subscriptions: WorkflowInstanceSubscriptionRegistry::new(),
            start_events: StartEventSubscriptionRegistry::new(),
        }
    }

    /// Apply one event record. Commands and rejections never mutate state.
    pub fn apply_event(&mut self, value: &RecordValue, timestamp: Timestamp) {
        match value {
            RecordValue::Message(event) => self.apply_message_event(event, timestamp),
            RecordValue::MessageSubscription(event) => {
                self.apply_subscription_event(event, timestamp)
            }
            RecordValue::WorkflowInstanceSubscription(event) => {
                self.apply_instance_subscription_event(event, timestamp)
            }
            RecordValue::MessageStartEventSubscription(event) => {
                self.apply_start_event(event, timestamp)
            }
        }
    }

    fn apply_message_event(&mut self, event: &MessageRecord, timestamp: Timestamp) {
        match event {
            MessageRecord::Published {
                message_key,
                name,
                correlation_key,
                message_id,
                variables,
                time_to_live,
                deadline,
            } => {
                self.keys.note_key(*message_key);
                self.messages.insert(Message {
                    key: *message_key,
                    name: name.clone(),
                    correlation_key: correlation_key.clone(),
                    message_id: message_id.clone(),
                    variables: variables.clone(),
                    time_to_live: *time_to_live,
                    deadline: *deadline,
                    published_at: timestamp,
                });
            }
            MessageRecord::Deleted { message_key, .. } => {
                self.messages.remove(*message_key);
            }
            _ => {}
        }
    }

    fn apply_subscription_event(&mut self, event: &MessageSubscriptionRecord, timestamp: Timestamp) {
        match event {
            MessageSubscriptionRecord::Opened {
                subscription_key,
                process_instance_key,
                element_instance_key,
                bpmn_process_id,
                message_name,
                correlation_key,
                interrupting,
            } => {
                self.keys.note_key(*subscription_key);
                self.subscriptions.insert(MessageSubscription {
                    key: *subscription_key,
                    process_instance_key: *process_instance_key,
                    element_instance_key: *element_instance_key,
                    bpmn_process_id: bpmn_process_id.clone(),
                    message_name: message_name.clone(),
                    correlation_key: correlation_key.clone(),
                    interrupting: *interrupting,
                    state: SubscriptionState::Opened,
                    correlating_message_key: None,
                    state_since: timestamp,
                });
            }
            MessageSubscriptionRecord::Correlating {
                subscription_key,
                message_key,
                bpmn_process_id,
                ..
            } => {
                self.messages.begin_correlation(*message_key, bpmn_process_id);
                if let Some(subscription) = self.subscriptions.get_mut(*subscription_key) {
                    subscription.state = SubscriptionState::Correlating;
                    subscription.correlating_message_key = Some(*message_key);
                    subscription.state_since = timestamp;
                }
            }
            MessageSubscriptionRecord::Correlated {
                element_instance_key,
                message_name,
                message_key,
                bpmn_process_id,
            } => {
                self.messages.commit_correlation(*message_key, bpmn_process_id);
                if let Some(key) = self
                    .subscriptions
                    .find_by_element(*element_instance_key, message_name)
                {
                    if let Some(subscription) = self.subscriptions.get_mut(key) {
                        if subscription.correlating_message_key == Some(*message_key) {
                            subscription.state = SubscriptionState::Opened;
                            subscription.correlating_message_key = None;
                            subscription.state_since = timestamp;
                        }
                    }
                }
            }
            MessageSubscriptionRecord::Rejected {
                element_instance_key,
                message_name,
                message_key,
                bpmn_process_id,
            } => {
                self.messages.abort_correlation(*message_key, bpmn_process_id);
                if let Some(key) = self
                    .subscriptions
                    .find_by_element(*element_instance_key, message_name)
                {
                    if let Some(subscription) = self.subscriptions.get_mut(key) {
                        if subscription.correlating_message_key == Some(*message_key) {
                            subscription.state = SubscriptionState::Opened;
                            subscription.correlating_message_key = None;
                            subscription.state_since = timestamp;
                        }
                    }
                }
            }
            MessageSubscriptionRecord::Closed {
                subscription_key, ..
            } => {
                if let Some(subscription) = self.subscriptions.remove(*subscription_key) {
                    if let Some(message_key) = subscription.correlating_message_key {
                        self.messages
                            .abort_correlation(message_key, &subscription.bpmn_process_id);
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_instance_subscription_event(
        &mut self,
        event: &WorkflowInstanceSubscriptionRecord,
        timestamp: Timestamp,
    ) {
        match event {
            WorkflowInstanceSubscriptionRecord::Opening {
                subscription_key,
                process_instance_key,
                element_instance_key,
                bpmn_process_id,
                message_name,
                correlation_key,
                interrupting,
            } => {
                self.keys.note_key(*subscription_key);
                self.instance_subscriptions.insert(WorkflowInstanceSubscription {
                    key: *subscription_key,
                    process_instance_key: *process_instance_key,
                    element_instance_key: *element_instance_key,
                    bpmn_process_id: bpmn_process_id.clone(),
                    message_name: message_name.clone(),
                    correlation_key: correlation_key.clone(),
                    interrupting: *interrupting,
                    state: SubscriptionState::Opening,
                    state_since: timestamp,
                });
            }
            WorkflowInstanceSubscriptionRecord::Opened {
                element_instance_key,
                message_name,
                ..
            } => {
                if let Some(subscription) = self
                    .instance_subscriptions
                    .get_mut(*element_instance_key, message_name)
                {
                    subscription.state = SubscriptionState::Opened;
                    subscription.state_since = timestamp;
                }
            }
            WorkflowInstanceSubscriptionRecord::Correlated {
                element_instance_key,
                message_name,
                ..
            } => {
                let interrupting = self
                    .instance_subscriptions
                    .get(*element_instance_key, message_name)
                    .map(|s| s.interrupting);
                match interrupting {
                    Some(true) => {
                        self.instance_subscriptions
                            .remove(*element_instance_key, message_name);
                    }
                    Some(false) => {
                        if let Some(subscription) = self
                            .instance_subscriptions
                            .get_mut(*element_instance_key, message_name)
                        {
                            subscription.state = SubscriptionState::Opened;
                            subscription.state_since = timestamp;
                        }
                    }
                    None => {}
                }
            }
            WorkflowInstanceSubscriptionRecord::Closing {
                element_instance_key,
                message_name,
                ..
            } => {
                if let Some(subscription) = self
                    .instance_subscriptions
                    .get_mut(*element_instance_key, message_name)
                {
                    subscription.state = SubscriptionState::Closing;
                    subscription.state_since = timestamp;
                }
            }
            WorkflowInstanceSubscriptionRecord::Closed {
                element_instance_key,
                message_name,
                ..
            } => {
                self.instance_subscriptions
                    .remove(*element_instance_key, message_name);
            }
            _ => {}
        }
    }

    fn apply_start_event(
        &mut self,
        event: &MessageStartEventSubscriptionRecord,
        _timestamp: Timestamp,
    ) {
        match event {
            MessageStartEventSubscriptionRecord::Opened {
                subscription_key,
                process_definition_key,
                bpmn_process_id,
                version,
                start_event_id,
                message_name,
            } => {
                self.keys.note_key(*subscription_key);
                self.start_events.insert(MessageStartEventSubscription {
                    key: *subscription_key,
                    process_definition_key: *process_definition_key,
                    bpmn_process_id: bpmn_process_id.clone(),
                    version: *version,
                    start_event_id: start_event_id.clone(),
                    message_name: message_name.clone(),
                });
            }
            MessageStartEventSubscriptionRecord::Closed {
                subscription_key, ..
            } => {
                self.start_events.remove(*subscription_key);
            }
            MessageStartEventSubscriptionRecord::Correlated {
                bpmn_process_id,
                message_key,
                correlation_key,
                process_instance_key,
                ..
            } => {
                self.keys.note_key(*process_instance_key);
                self.messages.commit_correlation(*message_key, bpmn_process_id);
                if !correlation_key.is_empty() {
                    self.start_events.lock_instance(
                        bpmn_process_id,
                        correlation_key,
                        *process_instance_key,
                    );
                }
            }
            MessageStartEventSubscriptionRecord::InstanceFinished {
                bpmn_process_id,
                correlation_key,
            } => {
                self.start_events
                    .release_instance(bpmn_process_id, correlation_key);
            }
            _ => {}
        }
    }
}

/// One partition of the cluster: a single-threaded processor over its own
/// durable log. All mutation goes through event records, so there is nothing
/// to lock; concurrency exists only between partitions, as commands.
pub struct Partition {
    pub(crate) id: PartitionId,
    pub(crate) partition_count: u32,
    pub(crate) state: PartitionState,
    pub(crate) log: Arc<dyn PartitionLog>,
    pub(crate) engine: Arc<dyn ProcessEngine>,
}

impl Partition {
    pub fn new(
        id: PartitionId,
        partition_count: u32,
        log: Arc<dyn PartitionLog>,
        engine: Arc<dyn ProcessEngine>,
    ) -> Self {
        Self {
            id,
            partition_count,
            state: PartitionState::new(id),
            log,
            engine,
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn state(&self) -> &PartitionState {
        &self.state
    }

    pub fn log(&self) -> Arc<dyn PartitionLog> {
        self.log.clone()
    }

    /// Serialize the in-memory state; restoring it and replaying the log tail
    /// from `last_position + 1` recovers the partition.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    pub fn restore(
        id: PartitionId,
        partition_count: u32,
        log: Arc<dyn PartitionLog>,
        engine: Arc<dyn ProcessEngine>,
        snapshot: &[u8],
    ) -> Result<Self> {
        let state: PartitionState = serde_json::from_slice(snapshot)?;
        Ok(Self {
            id,
            partition_count,
            state,
            log,
            engine,
        })
    }

    /// Replay event records after the snapshot position, rebuilding state.
    pub async fn replay(&mut self) -> Result<()> {
        let records = self.log.read_from(self.state.last_position + 1).await?;
        for record in records {
            if matches!(record.record_type, RecordType::Event) {
                self.state.apply_event(&record.value, record.timestamp);
            }
            self.state.last_position = record.position;
        }
        Ok(())
    }

    /// Process one command from the log: append the command record, validate,
    /// append the resulting events/rejections, fill the outbox.
    pub async fn apply_command(&mut self, value: RecordValue, now: Timestamp) -> Result<Turn> {
        let mut turn = Turn::default();
        self.append(&mut turn, RecordType::Command, value.clone(), now)
            .await?;

        match value {
            RecordValue::Message(MessageRecord::Publish {
                name,
                correlation_key,
                message_id,
                variables,
                time_to_live,
            }) => {
                self.process_publish(
                    &mut turn,
                    name,
                    correlation_key,
                    message_id,
                    variables,
                    time_to_live,
                    now,
                )
                .await?;
            }
            RecordValue::Message(MessageRecord::Delete { message_key }) => {
                self.process_delete(&mut turn, message_key, now).await?;
            }
            RecordValue::Message(other) => {
                warn!(?other, "dropping non-command message record");
            }
            RecordValue::MessageSubscription(command) => {
                self.process_subscription_command(&mut turn, command, now)
                    .await?;
            }
            RecordValue::WorkflowInstanceSubscription(command) => {
                self.process_instance_subscription_command(&mut turn, command, now)
                    .await?;
            }
            RecordValue::MessageStartEventSubscription(command) => {
                self.process_start_event_command(&mut turn, command, now)
                    .await?;
            }
        }
        Ok(turn)
    }

    async fn process_publish(
        &mut self,
        turn: &mut Turn,
        name: String,
        correlation_key: String,
        message_id: String,
        variables: Variables,
        time_to_live: i64,
        now: Timestamp,
    ) -> Result<()> {
        if let Some(existing) =
            self.state
                .messages
                .find_duplicate(&name, &correlation_key, &message_id, now)
        {
            debug!(%name, %correlation_key, %message_id, existing, "duplicate publish");
            self.append(
                turn,
                RecordType::Rejection {
                    reason: RejectionReason::AlreadyExists,
                    message: format!(
                        "message with id '{message_id}' already published for \
                         '{name}' / '{correlation_key}'"
                    ),
                },
                RecordValue::Message(MessageRecord::Publish {
                    name,
                    correlation_key,
                    message_id,
                    variables,
                    time_to_live,
                }),
                now,
            )
            .await?;
            return Ok(());
        }

        let message_key = self.state.keys.next_key();
        let deadline = now + time_to_live.max(0);
        self.append(
            turn,
            RecordType::Event,
            RecordValue::Message(MessageRecord::Published {
                message_key,
                name,
                correlation_key,
                message_id,
                variables,
                time_to_live,
                deadline,
            }),
            now,
        )
        .await?;

        self.correlate_published_message(turn, message_key, now)
            .await
    }

    async fn process_delete(
        &mut self,
        turn: &mut Turn,
        message_key: Key,
        now: Timestamp,
    ) -> Result<()> {
        let found = self
            .state
            .messages
            .get(message_key)
            .map(|message| (message.name.clone(), message.correlation_key.clone()));
        let Some((name, correlation_key)) = found else {
            self.append(
                turn,
                RecordType::Rejection {
                    reason: RejectionReason::NotFound,
                    message: format!("no message with key {message_key}"),
                },
                RecordValue::Message(MessageRecord::Delete { message_key }),
                now,
            )
            .await?;
            return Ok(());
        };
        if self.state.messages.has_pending(message_key) {
            // Mid-handshake; the sweeper will pick it up again next tick.
            self.append(
                turn,
                RecordType::Rejection {
                    reason: RejectionReason::InvalidState,
                    message: format!("message {message_key} has a correlation in flight"),
                },
                RecordValue::Message(MessageRecord::Delete { message_key }),
                now,
            )
            .await?;
            return Ok(());
        }
        self.append(
            turn,
            RecordType::Event,
            RecordValue::Message(MessageRecord::Deleted {
                message_key,
                name,
                correlation_key,
            }),
            now,
        )
        .await
    }

    async fn process_subscription_command(
        &mut self,
        turn: &mut Turn,
        command: MessageSubscriptionRecord,
        now: Timestamp,
    ) -> Result<()> {
        match command {
            MessageSubscriptionRecord::Open {
                process_instance_key,
                element_instance_key,
                bpmn_process_id,
                message_name,
                correlation_key,
                interrupting,
            } => {
                if self
                    .state
                    .subscriptions
                    .find_by_element(element_instance_key, &message_name)
                    .is_some()
                {
                    self.append(
                        turn,
                        RecordType::Rejection {
                            reason: RejectionReason::AlreadyExists,
                            message: format!(
                                "element {element_instance_key} already subscribed to \
                                 '{message_name}'"
                            ),
                        },
                        RecordValue::MessageSubscription(MessageSubscriptionRecord::Open {
                            process_instance_key,
                            element_instance_key,
                            bpmn_process_id,
                            message_name: message_name.clone(),
                            correlation_key,
                            interrupting,
                        }),
                        now,
                    )
                    .await?;
                    // Re-ack so a redelivered open still converges on the
                    // instance side.
                    turn.outbox.push(OutboundCommand {
                        target: partition_of_key(process_instance_key),
                        value: RecordValue::WorkflowInstanceSubscription(
                            WorkflowInstanceSubscriptionRecord::Open {
                                element_instance_key,
                                message_name,
                            },
                        ),
                    });
                    return Ok(());
                }

                let subscription_key = self.state.keys.next_key();
                self.append(
                    turn,
                    RecordType::Event,
                    RecordValue::MessageSubscription(MessageSubscriptionRecord::Opened {
                        subscription_key,
                        process_instance_key,
                        element_instance_key,
                        bpmn_process_id,
                        message_name: message_name.clone(),
                        correlation_key,
                        interrupting,
                    }),
                    now,
                )
                .await?;
                turn.outbox.push(OutboundCommand {
                    target: partition_of_key(process_instance_key),
                    value: RecordValue::WorkflowInstanceSubscription(
                        WorkflowInstanceSubscriptionRecord::Open {
                            element_instance_key,
                            message_name,
                        },
                    ),
                });
                self.try_correlate_subscription(turn, subscription_key, now)
                    .await
            }
            MessageSubscriptionRecord::Correlate {
                element_instance_key,
                message_name,
                message_key,
                bpmn_process_id,
            } => {
                let prior = self
                    .state
                    .subscriptions
                    .find_by_element(element_instance_key, &message_name)
                    .and_then(|key| self.state.subscriptions.get(key))
                    .cloned();

                self.append(
                    turn,
                    RecordType::Event,
                    RecordValue::MessageSubscription(MessageSubscriptionRecord::Correlated {
                        element_instance_key,
                        message_name: message_name.clone(),
                        message_key,
                        bpmn_process_id,
                    }),
                    now,
                )
                .await?;

                match prior {
                    Some(subscription)
                        if subscription.state == SubscriptionState::Correlating
                            && subscription.correlating_message_key == Some(message_key) =>
                    {
                        if subscription.interrupting {
                            // One-shot: the element stops listening.
                            self.append(
                                turn,
                                RecordType::Event,
                                RecordValue::MessageSubscription(
                                    MessageSubscriptionRecord::Closed {
                                        subscription_key: subscription.key,
                                        element_instance_key,
                                        message_name,
                                    },
                                ),
                                now,
                            )
                            .await?;
                        } else {
                            // Re-armed: immediately race for the next
                            // buffered message.
                            self.try_correlate_subscription(turn, subscription.key, now)
                                .await?;
                        }
                    }
                    Some(_) => {
                        warn!(
                            element_instance_key,
                            %message_name, message_key,
                            "correlate ack for a subscription not correlating this message"
                        );
                    }
                    None => {
                        warn!(
                            element_instance_key,
                            %message_name, message_key,
                            "correlate ack for unknown subscription; message state committed"
                        );
                    }
                }
                Ok(())
            }
            MessageSubscriptionRecord::Reject {
                element_instance_key,
                message_name,
                message_key,
                bpmn_process_id,
            } => {
                debug!(
                    element_instance_key,
                    %message_name, message_key, "correlation rejected, retrying"
                );
                self.append(
                    turn,
                    RecordType::Event,
                    RecordValue::MessageSubscription(MessageSubscriptionRecord::Rejected {
                        element_instance_key,
                        message_name,
                        message_key,
                        bpmn_process_id,
                    }),
                    now,
                )
                .await?;
                // The message is a candidate again; retry it against the
                // other open subscriptions right away.
                self.try_correlate_message(turn, message_key, Some(element_instance_key), now)
                    .await
            }
            MessageSubscriptionRecord::Close {
                process_instance_key,
                element_instance_key,
                message_name,
            } => {
                match self
                    .state
                    .subscriptions
                    .find_by_element(element_instance_key, &message_name)
                {
                    Some(subscription_key) => {
                        self.append(
                            turn,
                            RecordType::Event,
                            RecordValue::MessageSubscription(MessageSubscriptionRecord::Closed {
                                subscription_key,
                                element_instance_key,
                                message_name: message_name.clone(),
                            }),
                            now,
                        )
                        .await?;
                    }
                    None => {
                        self.append(
                            turn,
                            RecordType::Rejection {
                                reason: RejectionReason::NotFound,
                                message: format!(
                                    "no subscription for element {element_instance_key} and \
                                     '{message_name}'"
                                ),
                            },
                            RecordValue::MessageSubscription(MessageSubscriptionRecord::Close {
                                process_instance_key,
                                element_instance_key,
                                message_name: message_name.clone(),
                            }),
                            now,
                        )
                        .await?;
                    }
                }
                // Ack either way, so closing is idempotent under redelivery.
                turn.outbox.push(OutboundCommand {
                    target: partition_of_key(process_instance_key),
                    value: RecordValue::WorkflowInstanceSubscription(
                        WorkflowInstanceSubscriptionRecord::Close {
                            element_instance_key,
                            message_name,
                        },
                    ),
                });
                Ok(())
            }
            other => {
                warn!(?other, "dropping non-command message subscription record");
                Ok(())
            }
        }
    }

    async fn process_instance_subscription_command(
        &mut self,
        turn: &mut Turn,
        command: WorkflowInstanceSubscriptionRecord,
        now: Timestamp,
    ) -> Result<()> {
        match command {
            WorkflowInstanceSubscriptionRecord::Open {
                element_instance_key,
                message_name,
            } => {
                let found = self
                    .state
                    .instance_subscriptions
                    .get(element_instance_key, &message_name)
                    .map(|subscription| (subscription.state, subscription.key));
                match found {
                    Some((SubscriptionState::Opening, subscription_key)) => {
                        self.append(
                            turn,
                            RecordType::Event,
                            RecordValue::WorkflowInstanceSubscription(
                                WorkflowInstanceSubscriptionRecord::Opened {
                                    subscription_key,
                                    element_instance_key,
                                    message_name,
                                },
                            ),
                            now,
                        )
                        .await?;
                    }
                    Some(_) => {
                        debug!(element_instance_key, %message_name, "duplicate open ack");
                    }
                    None => {
                        warn!(
                            element_instance_key,
                            %message_name, "open ack for unknown subscription"
                        );
                    }
                }
                Ok(())
            }
            WorkflowInstanceSubscriptionRecord::Correlate {
                process_instance_key,
                element_instance_key,
                message_name,
                message_key,
                correlation_key,
                bpmn_process_id,
                variables,
            } => {
                self.process_correlate_to_instance(
                    turn,
                    process_instance_key,
                    element_instance_key,
                    message_name,
                    message_key,
                    correlation_key,
                    bpmn_process_id,
                    variables,
                    now,
                )
                .await
            }
            WorkflowInstanceSubscriptionRecord::Close {
                element_instance_key,
                message_name,
            } => {
                let found = self
                    .state
                    .instance_subscriptions
                    .get(element_instance_key, &message_name)
                    .map(|subscription| (subscription.state, subscription.key));
                match found {
                    Some((SubscriptionState::Closing, subscription_key)) => {
                        self.append(
                            turn,
                            RecordType::Event,
                            RecordValue::WorkflowInstanceSubscription(
                                WorkflowInstanceSubscriptionRecord::Closed {
                                    subscription_key,
                                    element_instance_key,
                                    message_name,
                                },
                            ),
                            now,
                        )
                        .await?;
                    }
                    _ => {
                        debug!(element_instance_key, %message_name, "close ack ignored");
                    }
                }
                Ok(())
            }
            other => {
                warn!(?other, "dropping non-command instance subscription record");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_correlate_to_instance(
        &mut self,
        turn: &mut Turn,
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
        message_key: Key,
        correlation_key: String,
        bpmn_process_id: String,
        variables: Variables,
        now: Timestamp,
    ) -> Result<()> {
        let reject_target = partition_of_key(message_key);
        let subscription = self
            .state
            .instance_subscriptions
            .get(element_instance_key, &message_name)
            .filter(|s| {
                matches!(
                    s.state,
                    SubscriptionState::Opening | SubscriptionState::Opened
                )
            })
            .cloned();

        let Some(subscription) = subscription else {
            self.append(
                turn,
                RecordType::Rejection {
                    reason: RejectionReason::InvalidState,
                    message: format!(
                        "element {element_instance_key} is not waiting for '{message_name}'"
                    ),
                },
                RecordValue::WorkflowInstanceSubscription(
                    WorkflowInstanceSubscriptionRecord::Correlate {
                        process_instance_key,
                        element_instance_key,
                        message_name: message_name.clone(),
                        message_key,
                        correlation_key,
                        bpmn_process_id: bpmn_process_id.clone(),
                        variables,
                    },
                ),
                now,
            )
            .await?;
            turn.outbox.push(OutboundCommand {
                target: reject_target,
                value: RecordValue::MessageSubscription(MessageSubscriptionRecord::Reject {
                    element_instance_key,
                    message_name,
                    message_key,
                    bpmn_process_id,
                }),
            });
            return Ok(());
        };

        match self
            .engine
            .correlate_to_element(
                process_instance_key,
                element_instance_key,
                &message_name,
                &variables,
            )
            .await?
        {
            ElementTrigger::Accepted {
                interrupted_elements,
            } => {
                self.append(
                    turn,
                    RecordType::Event,
                    RecordValue::WorkflowInstanceSubscription(
                        WorkflowInstanceSubscriptionRecord::Correlated {
                            subscription_key: subscription.key,
                            process_instance_key,
                            element_instance_key,
                            message_name: message_name.clone(),
                            message_key,
                            variables,
                        },
                    ),
                    now,
                )
                .await?;
                turn.outbox.push(OutboundCommand {
                    target: reject_target,
                    value: RecordValue::MessageSubscription(MessageSubscriptionRecord::Correlate {
                        element_instance_key,
                        message_name,
                        message_key,
                        bpmn_process_id,
                    }),
                });
                for interrupted in interrupted_elements {
                    for name in self
                        .state
                        .instance_subscriptions
                        .names_of_element(interrupted)
                    {
                        self.begin_close_subscription(turn, interrupted, &name, now)
                            .await?;
                    }
                }
                Ok(())
            }
            ElementTrigger::Rejected => {
                self.append(
                    turn,
                    RecordType::Rejection {
                        reason: RejectionReason::InvalidState,
                        message: format!(
                            "element {element_instance_key} no longer accepts '{message_name}'"
                        ),
                    },
                    RecordValue::WorkflowInstanceSubscription(
                        WorkflowInstanceSubscriptionRecord::Correlate {
                            process_instance_key,
                            element_instance_key,
                            message_name: message_name.clone(),
                            message_key,
                            correlation_key,
                            bpmn_process_id: bpmn_process_id.clone(),
                            variables,
                        },
                    ),
                    now,
                )
                .await?;
                turn.outbox.push(OutboundCommand {
                    target: reject_target,
                    value: RecordValue::MessageSubscription(MessageSubscriptionRecord::Reject {
                        element_instance_key,
                        message_name,
                        message_key,
                        bpmn_process_id,
                    }),
                });
                Ok(())
            }
        }
    }

    /// Open a subscription for an element of an instance owned by this
    /// partition. Called by the process engine from within the partition's
    /// turn when the element starts waiting.
    pub async fn open_subscription(
        &mut self,
        open: OpenSubscription,
        now: Timestamp,
    ) -> Result<Turn> {
        let mut turn = Turn::default();
        if self
            .state
            .instance_subscriptions
            .get(open.element_instance_key, &open.message_name)
            .is_some()
        {
            self.append(
                &mut turn,
                RecordType::Rejection {
                    reason: RejectionReason::AlreadyExists,
                    message: format!(
                        "element {} already waits for '{}'",
                        open.element_instance_key, open.message_name
                    ),
                },
                RecordValue::WorkflowInstanceSubscription(
                    WorkflowInstanceSubscriptionRecord::Opening {
                        subscription_key: 0,
                        process_instance_key: open.process_instance_key,
                        element_instance_key: open.element_instance_key,
                        bpmn_process_id: open.bpmn_process_id,
                        message_name: open.message_name,
                        correlation_key: open.correlation_key,
                        interrupting: open.interrupting,
                    },
                ),
                now,
            )
            .await?;
            return Ok(turn);
        }

        let subscription_key = self.state.keys.next_key();
        self.append(
            &mut turn,
            RecordType::Event,
            RecordValue::WorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord::Opening {
                subscription_key,
                process_instance_key: open.process_instance_key,
                element_instance_key: open.element_instance_key,
                bpmn_process_id: open.bpmn_process_id.clone(),
                message_name: open.message_name.clone(),
                correlation_key: open.correlation_key.clone(),
                interrupting: open.interrupting,
            }),
            now,
        )
        .await?;
        turn.outbox.push(OutboundCommand {
            target: partition_for(open.correlation_key.as_bytes(), self.partition_count),
            value: RecordValue::MessageSubscription(MessageSubscriptionRecord::Open {
                process_instance_key: open.process_instance_key,
                element_instance_key: open.element_instance_key,
                bpmn_process_id: open.bpmn_process_id,
                message_name: open.message_name,
                correlation_key: open.correlation_key,
                interrupting: open.interrupting,
            }),
        });
        Ok(turn)
    }

    /// Close a subscription because its element completed, terminated or was
    /// interrupted. Called by the process engine.
    pub async fn close_subscription(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        now: Timestamp,
    ) -> Result<Turn> {
        let mut turn = Turn::default();
        if self
            .state
            .instance_subscriptions
            .get(element_instance_key, message_name)
            .is_none()
        {
            self.append(
                &mut turn,
                RecordType::Rejection {
                    reason: RejectionReason::NotFound,
                    message: format!(
                        "element {element_instance_key} has no subscription for '{message_name}'"
                    ),
                },
                RecordValue::WorkflowInstanceSubscription(
                    WorkflowInstanceSubscriptionRecord::Close {
                        element_instance_key,
                        message_name: message_name.to_string(),
                    },
                ),
                now,
            )
            .await?;
            return Ok(turn);
        }
        self.begin_close_subscription(&mut turn, element_instance_key, message_name, now)
            .await?;
        Ok(turn)
    }

    pub(crate) async fn begin_close_subscription(
        &mut self,
        turn: &mut Turn,
        element_instance_key: Key,
        message_name: &str,
        now: Timestamp,
    ) -> Result<()> {
        let Some(subscription) = self
            .state
            .instance_subscriptions
            .get(element_instance_key, message_name)
            .cloned()
        else {
            return Ok(());
        };
        if subscription.state == SubscriptionState::Closing {
            return Ok(());
        }
        self.append(
            turn,
            RecordType::Event,
            RecordValue::WorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord::Closing {
                subscription_key: subscription.key,
                element_instance_key,
                message_name: message_name.to_string(),
                correlation_key: subscription.correlation_key.clone(),
            }),
            now,
        )
        .await?;
        turn.outbox.push(OutboundCommand {
            target: partition_for(
                subscription.correlation_key.as_bytes(),
                self.partition_count,
            ),
            value: RecordValue::MessageSubscription(MessageSubscriptionRecord::Close {
                process_instance_key: subscription.process_instance_key,
                element_instance_key,
                message_name: message_name.to_string(),
            }),
        });
        Ok(())
    }

    /// One sweeper tick: turn every expired, not-in-flight message into a
    /// delete command on this partition's own queue. The delete processor
    /// re-validates before anything is removed.
    pub async fn sweep(&mut self, now: Timestamp) -> Result<Turn> {
        let mut turn = Turn::default();
        let expired = self.state.messages.expired(now);
        if !expired.is_empty() {
            debug!(partition = self.id, count = expired.len(), "sweeping expired messages");
        }
        for message_key in expired {
            turn.outbox.push(OutboundCommand {
                target: self.id,
                value: RecordValue::Message(MessageRecord::Delete { message_key }),
            });
        }
        Ok(turn)
    }

    /// Re-send handshake commands that have been outstanding since before
    /// `cutoff`. Reprocessing is idempotent on the receiving side, so
    /// over-sending is safe; state is not touched here.
    pub fn resend_pending(&self, cutoff: Timestamp) -> Vec<OutboundCommand> {
        let mut resend = Vec::new();
        for (element_instance_key, message_name) in
            self.state.instance_subscriptions.pending_since(cutoff)
        {
            let Some(subscription) = self
                .state
                .instance_subscriptions
                .get(element_instance_key, &message_name)
            else {
                continue;
            };
            let target = partition_for(
                subscription.correlation_key.as_bytes(),
                self.partition_count,
            );
            let value = match subscription.state {
                SubscriptionState::Opening => {
                    RecordValue::MessageSubscription(MessageSubscriptionRecord::Open {
                        process_instance_key: subscription.process_instance_key,
                        element_instance_key,
                        bpmn_process_id: subscription.bpmn_process_id.clone(),
                        message_name,
                        correlation_key: subscription.correlation_key.clone(),
                        interrupting: subscription.interrupting,
                    })
                }
                SubscriptionState::Closing => {
                    RecordValue::MessageSubscription(MessageSubscriptionRecord::Close {
                        process_instance_key: subscription.process_instance_key,
                        element_instance_key,
                        message_name,
                    })
                }
                _ => continue,
            };
            resend.push(OutboundCommand { target, value });
        }

        for subscription_key in self.state.subscriptions.correlating_since(cutoff) {
            let Some(subscription) = self.state.subscriptions.get(subscription_key) else {
                continue;
            };
            let Some(message_key) = subscription.correlating_message_key else {
                continue;
            };
            let Some(message) = self.state.messages.get(message_key) else {
                continue;
            };
            resend.push(OutboundCommand {
                target: partition_of_key(subscription.process_instance_key),
                value: RecordValue::WorkflowInstanceSubscription(
                    WorkflowInstanceSubscriptionRecord::Correlate {
                        process_instance_key: subscription.process_instance_key,
                        element_instance_key: subscription.element_instance_key,
                        message_name: subscription.message_name.clone(),
                        message_key,
                        correlation_key: subscription.correlation_key.clone(),
                        bpmn_process_id: subscription.bpmn_process_id.clone(),
                        variables: message.variables.clone(),
                    },
                ),
            });
        }
        resend
    }

    pub(crate) async fn append(
        &mut self,
        turn: &mut Turn,
        record_type: RecordType,
        value: RecordValue,
        now: Timestamp,
    ) -> Result<()> {
        let mut record = Record {
            position: 0,
            partition_id: self.id,
            timestamp: now,
            record_type,
            value,
        };
        record.position = self.log.append(&record).await?;
        self.state.last_position = record.position;
        if matches!(record.record_type, RecordType::Event) {
            self.state.apply_event(&record.value, record.timestamp);
        }
        turn.records.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::testing::ScriptedProcesses;
    use std::collections::VecDeque;

    const NOW: Timestamp = 1_700_000_000_000;

    fn test_key(partition: PartitionId, sequence: u64) -> Key {
        ((partition as u64) << SEQUENCE_BITS) | sequence
    }

    fn new_partition(engine: &Arc<ScriptedProcesses>) -> Partition {
        Partition::new(1, 1, Arc::new(MemoryLog::new()), engine.clone())
    }

    fn publish_value(name: &str, message_id: &str, time_to_live: i64) -> RecordValue {
        RecordValue::Message(MessageRecord::Publish {
            name: name.to_string(),
            correlation_key: "order-123".to_string(),
            message_id: message_id.to_string(),
            variables: Variables::new(),
            time_to_live,
        })
    }

    fn open_value(element_instance_key: Key, message_name: &str) -> RecordValue {
        RecordValue::MessageSubscription(MessageSubscriptionRecord::Open {
            process_instance_key: test_key(1, 900_000),
            element_instance_key,
            bpmn_process_id: "order-process".to_string(),
            message_name: message_name.to_string(),
            correlation_key: "order-123".to_string(),
            interrupting: true,
        })
    }

    fn published_key(records: &[Record]) -> Key {
        records
            .iter()
            .find_map(|r| match &r.value {
                RecordValue::Message(MessageRecord::Published { message_key, .. }) => {
                    Some(*message_key)
                }
                _ => None,
            })
            .expect("no Published event")
    }

    fn has_rejection(records: &[Record], reason: RejectionReason) -> bool {
        records.iter().any(|r| {
            matches!(&r.record_type, RecordType::Rejection { reason: found, .. } if *found == reason)
        })
    }

    /// Pump the turn's outbox back into the partition until idle. Only valid
    /// for single-partition setups, where every command targets ourselves.
    async fn drain(partition: &mut Partition, turn: Turn) -> Vec<Record> {
        let mut records = turn.records;
        let mut queue: VecDeque<OutboundCommand> = turn.outbox.into();
        while let Some(command) = queue.pop_front() {
            assert_eq!(command.target, partition.id());
            let next = partition.apply_command(command.value, NOW).await.unwrap();
            records.extend(next.records);
            queue.extend(next.outbox);
        }
        records
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);

        let first = partition
            .apply_command(publish_value("order canceled", "id-1", 10_000), NOW)
            .await
            .unwrap();
        assert!(!has_rejection(&first.records, RejectionReason::AlreadyExists));

        let second = partition
            .apply_command(publish_value("order canceled", "id-1", 10_000), NOW)
            .await
            .unwrap();
        assert!(has_rejection(&second.records, RejectionReason::AlreadyExists));
        assert_eq!(partition.state().messages.len(), 1);
    }

    #[tokio::test]
    async fn anonymous_messages_are_never_duplicates() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);

        for _ in 0..2 {
            let turn = partition
                .apply_command(publish_value("ping", "", 10_000), NOW)
                .await
                .unwrap();
            assert!(!has_rejection(&turn.records, RejectionReason::AlreadyExists));
        }
        assert_eq!(partition.state().messages.len(), 2);
    }

    #[tokio::test]
    async fn expired_duplicate_does_not_block_republish() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);

        partition
            .apply_command(publish_value("ping", "id-1", 0), NOW)
            .await
            .unwrap();
        // Deadline == publish time, so the id is free again even before the
        // sweeper ran.
        let second = partition
            .apply_command(publish_value("ping", "id-1", 0), NOW)
            .await
            .unwrap();
        assert!(!has_rejection(&second.records, RejectionReason::AlreadyExists));
    }

    #[tokio::test]
    async fn sweep_deletes_expired_messages_via_commands() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);

        partition
            .apply_command(publish_value("ping", "", 0), NOW)
            .await
            .unwrap();
        partition
            .apply_command(publish_value("pong", "", 60_000), NOW)
            .await
            .unwrap();

        let tick = partition.sweep(NOW).await.unwrap();
        assert_eq!(tick.outbox.len(), 1);

        let records = drain(&mut partition, tick).await;
        assert!(records.iter().any(|r| matches!(
            &r.value,
            RecordValue::Message(MessageRecord::Deleted { .. })
        )));
        assert_eq!(partition.state().messages.len(), 1);

        // Deleting again is refused, not fatal.
        let key = published_key(
            &partition
                .log()
                .read_from(1)
                .await
                .unwrap()
                .into_iter()
                .filter(|r| matches!(r.value, RecordValue::Message(MessageRecord::Published { time_to_live: 0, .. })))
                .collect::<Vec<_>>(),
        );
        let again = partition
            .apply_command(
                RecordValue::Message(MessageRecord::Delete { message_key: key }),
                NOW,
            )
            .await
            .unwrap();
        assert!(has_rejection(&again.records, RejectionReason::NotFound));
    }

    #[tokio::test]
    async fn sweep_spares_messages_with_a_correlation_in_flight() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);
        let element = test_key(1, 500_000);
        engine.register_element(element, true);

        // Subscription opened; the ack and correlate stay undelivered.
        let open_turn = partition
            .apply_command(open_value(element, "ping"), NOW)
            .await
            .unwrap();
        let publish_turn = partition
            .apply_command(publish_value("ping", "", 0), NOW)
            .await
            .unwrap();
        let message_key = published_key(&publish_turn.records);
        drop(open_turn);

        // Expired, but mid-handshake: the sweeper must leave it alone.
        let tick = partition.sweep(NOW).await.unwrap();
        assert!(tick.outbox.is_empty());

        // The instance side rejects; the message becomes sweepable.
        partition
            .apply_command(
                RecordValue::MessageSubscription(MessageSubscriptionRecord::Reject {
                    element_instance_key: element,
                    message_name: "ping".to_string(),
                    message_key,
                    bpmn_process_id: "order-process".to_string(),
                }),
                NOW,
            )
            .await
            .unwrap();
        let tick = partition.sweep(NOW).await.unwrap();
        assert_eq!(tick.outbox.len(), 1);
    }

    #[tokio::test]
    async fn redelivered_open_command_is_rejected_but_acked_again() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);
        let element = test_key(1, 500_000);

        let first = partition
            .apply_command(open_value(element, "ping"), NOW)
            .await
            .unwrap();
        assert_eq!(first.outbox.len(), 1);

        let redelivered = partition
            .apply_command(open_value(element, "ping"), NOW)
            .await
            .unwrap();
        assert!(has_rejection(&redelivered.records, RejectionReason::AlreadyExists));
        // The ack is re-sent so the instance side still converges.
        assert!(redelivered.outbox.iter().any(|c| matches!(
            &c.value,
            RecordValue::WorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord::Open {
                ..
            })
        )));
        assert_eq!(partition.state().subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn full_handshake_on_one_partition_and_replay() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);
        let process_instance_key = test_key(1, 900_000);
        let element = test_key(1, 500_000);
        engine.register_element(element, true);

        let open = partition
            .open_subscription(
                OpenSubscription {
                    process_instance_key,
                    element_instance_key: element,
                    bpmn_process_id: "order-process".to_string(),
                    message_name: "order canceled".to_string(),
                    correlation_key: "order-123".to_string(),
                    interrupting: true,
                },
                NOW,
            )
            .await
            .unwrap();
        drain(&mut partition, open).await;

        let publish = partition
            .apply_command(publish_value("order canceled", "", 10_000), NOW)
            .await
            .unwrap();
        let records = drain(&mut partition, publish).await;

        // Handshake completed: correlated on both sides, one-shot closed.
        assert!(records.iter().any(|r| matches!(
            &r.value,
            RecordValue::WorkflowInstanceSubscription(
                WorkflowInstanceSubscriptionRecord::Correlated { .. }
            )
        )));
        assert!(records.iter().any(|r| matches!(
            &r.value,
            RecordValue::MessageSubscription(MessageSubscriptionRecord::Closed { .. })
        )));
        assert!(partition.state().subscriptions.is_empty());
        assert!(partition.state().instance_subscriptions.is_empty());
        assert_eq!(engine.received_by(element).len(), 1);

        // A fresh processor over the same log rebuilds identical state.
        let mut replayed = Partition::new(1, 1, partition.log(), engine.clone());
        replayed.replay().await.unwrap();
        assert_eq!(replayed.state(), partition.state());

        // So does snapshot + restore.
        let snapshot = partition.snapshot().unwrap();
        let restored =
            Partition::restore(1, 1, partition.log(), engine.clone(), &snapshot).unwrap();
        assert_eq!(restored.state(), partition.state());
    }

    #[tokio::test]
    async fn duplicate_local_open_is_rejected() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);
        let open = OpenSubscription {
            process_instance_key: test_key(1, 900_000),
            element_instance_key: test_key(1, 500_000),
            bpmn_process_id: "order-process".to_string(),
            message_name: "order canceled".to_string(),
            correlation_key: "order-123".to_string(),
            interrupting: true,
        };

        partition.open_subscription(open.clone(), NOW).await.unwrap();
        let second = partition.open_subscription(open, NOW).await.unwrap();
        assert!(has_rejection(&second.records, RejectionReason::AlreadyExists));
        assert_eq!(partition.state().instance_subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn pending_handshake_commands_are_resent() {
        let engine = ScriptedProcesses::new();
        let mut partition = new_partition(&engine);
        let process_instance_key = test_key(1, 900_000);
        let element = test_key(1, 500_000);

        // Instance side: open sent, ack never arrives.
        let open = partition
            .open_subscription(
                OpenSubscription {
                    process_instance_key,
                    element_instance_key: element,
                    bpmn_process_id: "order-process".to_string(),
                    message_name: "ping".to_string(),
                    correlation_key: "order-123".to_string(),
                    interrupting: true,
                },
                NOW,
            )
            .await
            .unwrap();
        assert_eq!(open.outbox.len(), 1);

        let resend = partition.resend_pending(NOW);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0], open.outbox[0]);
        // Not yet due: nothing to resend before the cutoff.
        assert!(partition.resend_pending(NOW - 1).is_empty());

        // Message side: correlate sent, answer never arrives.
        let other_element = test_key(1, 500_001);
        partition
            .apply_command(open_value(other_element, "pong"), NOW)
            .await
            .unwrap();
        let publish = partition
            .apply_command(publish_value("pong", "", 60_000), NOW)
            .await
            .unwrap();
        let correlate = publish
            .outbox
            .iter()
            .find(|c| {
                matches!(
                    &c.value,
                    RecordValue::WorkflowInstanceSubscription(
                        WorkflowInstanceSubscriptionRecord::Correlate { .. }
                    )
                )
            })
            .cloned()
            .expect("no correlate command sent");

        let resend = partition.resend_pending(NOW);
        assert!(resend.contains(&correlate));
    }
}
