use crate::error::CommandError;
use crate::events::*;
use crate::log::MemoryLog;
use crate::partition::{OpenSubscription, OutboundCommand, Partition, ProcessEngine, Turn};
use crate::router::partition_for;
use crate::types::*;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Broker configuration consumed by the correlation engine. Supplied at
/// bootstrap; the partition count never changes afterwards.
#[derive(Clone, Debug)]
pub struct Config {
    pub partition_count: u32,
    /// Fixed TTL sweep interval, independent of any message's deadline.
    pub sweep_interval_ms: u64,
    /// How long a handshake command may stay unanswered before re-sending.
    pub resend_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition_count: 1,
            sweep_interval_ms: 60_000,
            resend_interval_ms: 5_000,
        }
    }
}

/// Client-facing publish request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishMessage {
    pub name: String,
    pub correlation_key: String,
    /// Optional idempotency token; empty never collides.
    pub message_id: String,
    pub variables: Variables,
    pub time_to_live: i64,
}

/// One message start event of a deployed process version. A deployment fans
/// out one of these to every partition.
#[derive(Clone, Debug, PartialEq)]
pub struct StartEventSpec {
    pub process_definition_key: Key,
    pub bpmn_process_id: String,
    pub version: u32,
    pub start_event_id: String,
    pub message_name: String,
}

/// Clock origin for the deterministic cluster; tests advance from here.
const START_TIME: Timestamp = 1_700_000_000_000;

/// An in-process cluster of partitions exchanging commands over a FIFO
/// queue. Processing is deterministic: one command at a time, in submission
/// order, each inside its target partition's single-threaded turn. The
/// records every turn appended are collected for inspection, in processing
/// order across partitions.
pub struct Cluster {
    config: Config,
    partitions: Vec<Partition>,
    queue: VecDeque<OutboundCommand>,
    exported: Vec<Record>,
    now: Timestamp,
}

impl Cluster {
    pub fn new(config: Config, engine: Arc<dyn ProcessEngine>) -> Self {
        assert!(config.partition_count > 0, "partition_count must be positive");
        let partitions = (0..config.partition_count)
            .map(|index| {
                Partition::new(
                    START_PARTITION_ID + index,
                    config.partition_count,
                    Arc::new(MemoryLog::new()),
                    engine.clone(),
                )
            })
            .collect();
        Self {
            config,
            partitions,
            queue: VecDeque::new(),
            exported: Vec::new(),
            now: START_TIME,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn set_time(&mut self, now: Timestamp) {
        self.now = self.now.max(now);
    }

    pub fn increase_time(&mut self, ms: i64) {
        self.now += ms;
    }

    /// Where a correlation key routes; exposed so callers and tests can
    /// predict placement.
    pub fn partition_for_key(&self, correlation_key: &str) -> PartitionId {
        partition_for(correlation_key.as_bytes(), self.config.partition_count)
    }

    pub fn partition(&self, id: PartitionId) -> &Partition {
        &self.partitions[(id - START_PARTITION_ID) as usize]
    }

    fn partition_mut(&mut self, id: PartitionId) -> &mut Partition {
        &mut self.partitions[(id - START_PARTITION_ID) as usize]
    }

    /// Publish a message; the command lands on the partition its correlation
    /// key routes to and is processed on the next [`Cluster::run_until_idle`].
    pub fn publish(&mut self, publish: PublishMessage) -> Result<(), CommandError> {
        if publish.name.is_empty() {
            return Err(CommandError::MissingField("name"));
        }
        let target = self.partition_for_key(&publish.correlation_key);
        self.queue.push_back(OutboundCommand {
            target,
            value: RecordValue::Message(MessageRecord::Publish {
                name: publish.name,
                correlation_key: publish.correlation_key,
                message_id: publish.message_id,
                variables: publish.variables,
                time_to_live: publish.time_to_live,
            }),
        });
        Ok(())
    }

    /// Open a subscription on behalf of a waiting element. Runs immediately
    /// inside the turn of the partition owning the instance (the process
    /// engine lives there); the cross-partition open goes onto the queue.
    pub async fn open_subscription(&mut self, open: OpenSubscription) -> Result<()> {
        if open.message_name.is_empty() {
            return Err(CommandError::MissingField("messageName").into());
        }
        if open.correlation_key.is_empty() {
            return Err(CommandError::MissingField("correlationKey").into());
        }
        let now = self.now;
        let target = partition_of_key(open.process_instance_key);
        let turn = self.partition_mut(target).open_subscription(open, now).await?;
        self.absorb(turn);
        Ok(())
    }

    /// Close a subscription because its element completed or terminated.
    pub async fn close_subscription(
        &mut self,
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<()> {
        let now = self.now;
        let target = partition_of_key(process_instance_key);
        let turn = self
            .partition_mut(target)
            .close_subscription(element_instance_key, message_name, now)
            .await?;
        self.absorb(turn);
        Ok(())
    }

    /// Deploy the message start events of a process version: fan one open
    /// command out to every partition per start event. Older versions are
    /// superseded by the open processor before the new subscription opens.
    pub fn deploy(&mut self, start_events: &[StartEventSpec]) {
        for index in 0..self.config.partition_count {
            let target = START_PARTITION_ID + index;
            for spec in start_events {
                self.queue.push_back(OutboundCommand {
                    target,
                    value: RecordValue::MessageStartEventSubscription(
                        MessageStartEventSubscriptionRecord::Open {
                            process_definition_key: spec.process_definition_key,
                            bpmn_process_id: spec.bpmn_process_id.clone(),
                            version: spec.version,
                            start_event_id: spec.start_event_id.clone(),
                            message_name: spec.message_name.clone(),
                        },
                    ),
                });
            }
        }
    }

    /// Notification from the process engine that an instance created by a
    /// message start event finished, releasing its correlation-key guard.
    pub fn instance_finished(&mut self, bpmn_process_id: &str, correlation_key: &str) {
        let target = self.partition_for_key(correlation_key);
        self.queue.push_back(OutboundCommand {
            target,
            value: RecordValue::MessageStartEventSubscription(
                MessageStartEventSubscriptionRecord::InstanceFinished {
                    bpmn_process_id: bpmn_process_id.to_string(),
                    correlation_key: correlation_key.to_string(),
                },
            ),
        });
    }

    /// One sweeper tick on every partition; the resulting delete commands go
    /// onto the queue for the next [`Cluster::run_until_idle`].
    pub async fn sweep(&mut self) -> Result<()> {
        let now = self.now;
        for index in 0..self.partitions.len() {
            let turn = self.partitions[index].sweep(now).await?;
            self.absorb(turn);
        }
        Ok(())
    }

    /// Re-send handshake commands outstanding longer than the configured
    /// resend interval.
    pub fn resend_pending(&mut self) {
        let cutoff = self.now - self.config.resend_interval_ms as i64;
        for partition in &self.partitions {
            let resend = partition.resend_pending(cutoff);
            self.queue.extend(resend);
        }
    }

    /// Drain the command queue, one command per turn, FIFO. A processor
    /// error is fatal to that single command only; unrelated commands keep
    /// flowing.
    pub async fn run_until_idle(&mut self) -> Result<()> {
        while let Some(OutboundCommand { target, value }) = self.queue.pop_front() {
            let now = self.now;
            match self.partition_mut(target).apply_command(value, now).await {
                Ok(turn) => self.absorb(turn),
                Err(error) => {
                    warn!(partition = target, %error, "command processing failed; command dropped");
                }
            }
        }
        Ok(())
    }

    /// Every record appended so far, across all partitions, in processing
    /// order.
    pub fn records(&self) -> &[Record] {
        &self.exported
    }

    fn absorb(&mut self, turn: Turn) {
        self.exported.extend(turn.records);
        self.queue.extend(turn.outbox);
    }
}
