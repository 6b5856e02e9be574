//! The correlation coordinator: matching published messages against open
//! subscriptions and driving each pair through the two-phase handshake.
//!
//! Runs entirely inside the owning partition's processing turn; cross-
//! partition effects leave as outbox commands and come back as later
//! commands on this partition's log.

use crate::events::*;
use crate::partition::{OutboundCommand, Partition, Turn};
use crate::types::*;
use anyhow::Result;
use tracing::{debug, warn};

impl Partition {
    /// Matching for a freshly published message: every open catch-event
    /// subscription races for it (at most once per process definition), then
    /// start-event subscriptions get their turn.
    pub(crate) async fn correlate_published_message(
        &mut self,
        turn: &mut Turn,
        message_key: Key,
        now: Timestamp,
    ) -> Result<()> {
        self.try_correlate_message(turn, message_key, None, now)
            .await?;
        self.try_correlate_start_events(turn, message_key, now).await
    }

    /// Offer the message to every eligible open subscription. Each
    /// subscription holds at most one in-flight attempt, and the message is
    /// offered at most once per process definition; `exclude_element` keeps a
    /// rejection retry from bouncing straight back to the element that lost.
    pub(crate) async fn try_correlate_message(
        &mut self,
        turn: &mut Turn,
        message_key: Key,
        exclude_element: Option<Key>,
        now: Timestamp,
    ) -> Result<()> {
        let Some(message) = self.state.messages.get(message_key) else {
            return Ok(());
        };
        let name = message.name.clone();
        let correlation_key = message.correlation_key.clone();

        for subscription_key in self.state.subscriptions.matching(&name, &correlation_key) {
            let eligible = self
                .state
                .subscriptions
                .get(subscription_key)
                .is_some_and(|subscription| {
                    exclude_element != Some(subscription.element_instance_key)
                        && subscription.state.can_correlate()
                        && self
                            .state
                            .messages
                            .is_eligible(message_key, &subscription.bpmn_process_id)
                });
            if eligible {
                self.begin_correlation(turn, subscription_key, message_key, now)
                    .await?;
            }
        }
        Ok(())
    }

    /// Matching for a freshly opened (or re-armed) subscription: take the
    /// oldest buffered message still eligible for its process definition.
    pub(crate) async fn try_correlate_subscription(
        &mut self,
        turn: &mut Turn,
        subscription_key: Key,
        now: Timestamp,
    ) -> Result<()> {
        let candidate = self
            .state
            .subscriptions
            .get(subscription_key)
            .filter(|subscription| subscription.state.can_correlate())
            .and_then(|subscription| {
                self.state.messages.first_candidate(
                    &subscription.message_name,
                    &subscription.correlation_key,
                    &subscription.bpmn_process_id,
                )
            });
        if let Some(message_key) = candidate {
            self.begin_correlation(turn, subscription_key, message_key, now)
                .await?;
        }
        Ok(())
    }

    /// First phase of the handshake: mark the pair in flight and send the
    /// correlate command to the instance's partition.
    async fn begin_correlation(
        &mut self,
        turn: &mut Turn,
        subscription_key: Key,
        message_key: Key,
        now: Timestamp,
    ) -> Result<()> {
        let Some(subscription) = self.state.subscriptions.get(subscription_key).cloned() else {
            return Ok(());
        };
        let Some(message) = self.state.messages.get(message_key).cloned() else {
            return Ok(());
        };
        debug!(
            subscription_key,
            message_key,
            message_name = %subscription.message_name,
            bpmn_process_id = %subscription.bpmn_process_id,
            "correlating"
        );

        self.append(
            turn,
            RecordType::Event,
            RecordValue::MessageSubscription(MessageSubscriptionRecord::Correlating {
                subscription_key,
                element_instance_key: subscription.element_instance_key,
                message_name: subscription.message_name.clone(),
                message_key,
                bpmn_process_id: subscription.bpmn_process_id.clone(),
            }),
            now,
        )
        .await?;

        turn.outbox.push(OutboundCommand {
            target: partition_of_key(subscription.process_instance_key),
            value: RecordValue::WorkflowInstanceSubscription(
                WorkflowInstanceSubscriptionRecord::Correlate {
                    process_instance_key: subscription.process_instance_key,
                    element_instance_key: subscription.element_instance_key,
                    message_name: subscription.message_name,
                    message_key,
                    correlation_key: subscription.correlation_key,
                    bpmn_process_id: subscription.bpmn_process_id,
                    variables: message.variables,
                },
            ),
        });
        Ok(())
    }

    // ─── Message start events ─────────────────────────────────

    pub(crate) async fn process_start_event_command(
        &mut self,
        turn: &mut Turn,
        command: MessageStartEventSubscriptionRecord,
        now: Timestamp,
    ) -> Result<()> {
        match command {
            MessageStartEventSubscriptionRecord::Open {
                process_definition_key,
                bpmn_process_id,
                version,
                start_event_id,
                message_name,
            } => {
                // A newer deployment supersedes: close every subscription of
                // an older version of this process before opening.
                let superseded: Vec<Key> = self
                    .state
                    .start_events
                    .of_process(&bpmn_process_id)
                    .into_iter()
                    .filter(|key| {
                        self.state
                            .start_events
                            .get(*key)
                            .is_some_and(|s| s.process_definition_key != process_definition_key)
                    })
                    .collect();
                for key in superseded {
                    let Some(subscription) = self.state.start_events.get(key).cloned() else {
                        continue;
                    };
                    self.append(
                        turn,
                        RecordType::Event,
                        RecordValue::MessageStartEventSubscription(
                            MessageStartEventSubscriptionRecord::Closed {
                                subscription_key: key,
                                process_definition_key: subscription.process_definition_key,
                                bpmn_process_id: subscription.bpmn_process_id,
                                start_event_id: subscription.start_event_id,
                            },
                        ),
                        now,
                    )
                    .await?;
                }

                if self
                    .state
                    .start_events
                    .find(process_definition_key, &start_event_id)
                    .is_some()
                {
                    self.append(
                        turn,
                        RecordType::Rejection {
                            reason: RejectionReason::AlreadyExists,
                            message: format!(
                                "start event '{start_event_id}' of definition \
                                 {process_definition_key} already subscribed"
                            ),
                        },
                        RecordValue::MessageStartEventSubscription(
                            MessageStartEventSubscriptionRecord::Open {
                                process_definition_key,
                                bpmn_process_id,
                                version,
                                start_event_id,
                                message_name,
                            },
                        ),
                        now,
                    )
                    .await?;
                    return Ok(());
                }

                let subscription_key = self.state.keys.next_key();
                self.append(
                    turn,
                    RecordType::Event,
                    RecordValue::MessageStartEventSubscription(
                        MessageStartEventSubscriptionRecord::Opened {
                            subscription_key,
                            process_definition_key,
                            bpmn_process_id,
                            version,
                            start_event_id,
                            message_name,
                        },
                    ),
                    now,
                )
                .await?;
                self.try_correlate_buffered_start_messages(turn, subscription_key, now)
                    .await
            }
            MessageStartEventSubscriptionRecord::Close {
                process_definition_key,
                start_event_id,
            } => {
                match self
                    .state
                    .start_events
                    .find(process_definition_key, &start_event_id)
                {
                    Some(key) => {
                        let Some(subscription) = self.state.start_events.get(key).cloned() else {
                            return Ok(());
                        };
                        self.append(
                            turn,
                            RecordType::Event,
                            RecordValue::MessageStartEventSubscription(
                                MessageStartEventSubscriptionRecord::Closed {
                                    subscription_key: key,
                                    process_definition_key,
                                    bpmn_process_id: subscription.bpmn_process_id,
                                    start_event_id,
                                },
                            ),
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
                                    "no subscription for start event '{start_event_id}' of \
                                     definition {process_definition_key}"
                                ),
                            },
                            RecordValue::MessageStartEventSubscription(
                                MessageStartEventSubscriptionRecord::Close {
                                    process_definition_key,
                                    start_event_id,
                                },
                            ),
                            now,
                        )
                        .await?;
                    }
                }
                Ok(())
            }
            MessageStartEventSubscriptionRecord::InstanceFinished {
                bpmn_process_id,
                correlation_key,
            } => {
                self.append(
                    turn,
                    RecordType::Event,
                    RecordValue::MessageStartEventSubscription(
                        MessageStartEventSubscriptionRecord::InstanceFinished {
                            bpmn_process_id: bpmn_process_id.clone(),
                            correlation_key: correlation_key.clone(),
                        },
                    ),
                    now,
                )
                .await?;
                self.correlate_next_buffered(turn, &bpmn_process_id, &correlation_key, now)
                    .await
            }
            other => {
                warn!(?other, "dropping non-command start event record");
                Ok(())
            }
        }
    }

    /// Matching for all start-event subscriptions on a fresh publish.
    async fn try_correlate_start_events(
        &mut self,
        turn: &mut Turn,
        message_key: Key,
        now: Timestamp,
    ) -> Result<()> {
        let Some(message) = self.state.messages.get(message_key) else {
            return Ok(());
        };
        let name = message.name.clone();
        for subscription_key in self.state.start_events.matching(&name) {
            self.correlate_start_event(turn, subscription_key, message_key, now)
                .await?;
        }
        Ok(())
    }

    /// Matching for a freshly opened start-event subscription against every
    /// buffered message carrying its name.
    async fn try_correlate_buffered_start_messages(
        &mut self,
        turn: &mut Turn,
        subscription_key: Key,
        now: Timestamp,
    ) -> Result<()> {
        let Some(subscription) = self.state.start_events.get(subscription_key).cloned() else {
            return Ok(());
        };
        for message_key in self.state.messages.candidates_by_name(&subscription.message_name) {
            self.correlate_start_event(turn, subscription_key, message_key, now)
                .await?;
        }
        Ok(())
    }

    /// The active-instance guard was released: the oldest buffered message
    /// for this (process id, correlation key) spawns the next instance.
    async fn correlate_next_buffered(
        &mut self,
        turn: &mut Turn,
        bpmn_process_id: &str,
        correlation_key: &str,
        now: Timestamp,
    ) -> Result<()> {
        let mut oldest: Option<(Key, Key)> = None;
        for subscription_key in self.state.start_events.of_process(bpmn_process_id) {
            let Some(subscription) = self.state.start_events.get(subscription_key) else {
                continue;
            };
            if let Some(message_key) = self.state.messages.first_candidate(
                &subscription.message_name,
                correlation_key,
                bpmn_process_id,
            ) {
                if oldest.is_none_or(|(key, _)| message_key < key) {
                    oldest = Some((message_key, subscription_key));
                }
            }
        }
        if let Some((message_key, subscription_key)) = oldest {
            self.correlate_start_event(turn, subscription_key, message_key, now)
                .await?;
        }
        Ok(())
    }

    /// Correlate one message to one start-event subscription: create a brand
    /// new instance seeded with the message variables. Local to this
    /// partition, so no handshake — the event commits everything at once.
    async fn correlate_start_event(
        &mut self,
        turn: &mut Turn,
        subscription_key: Key,
        message_key: Key,
        now: Timestamp,
    ) -> Result<bool> {
        let Some(subscription) = self.state.start_events.get(subscription_key).cloned() else {
            return Ok(false);
        };
        let Some(message) = self.state.messages.get(message_key).cloned() else {
            return Ok(false);
        };
        if message.name != subscription.message_name {
            return Ok(false);
        }
        if !self
            .state
            .messages
            .is_eligible(message_key, &subscription.bpmn_process_id)
        {
            return Ok(false);
        }
        // One active instance per correlation key; further messages stay
        // buffered until the engine reports the instance finished.
        if !message.correlation_key.is_empty()
            && self
                .state
                .start_events
                .active_instance(&subscription.bpmn_process_id, &message.correlation_key)
                .is_some()
        {
            return Ok(false);
        }

        let process_instance_key = self.state.keys.next_key();
        self.engine
            .create_instance_for_start_event(
                process_instance_key,
                subscription.process_definition_key,
                &subscription.bpmn_process_id,
                &subscription.start_event_id,
                &message.variables,
            )
            .await?;
        debug!(
            subscription_key,
            message_key,
            process_instance_key,
            bpmn_process_id = %subscription.bpmn_process_id,
            "start event correlated"
        );
        self.append(
            turn,
            RecordType::Event,
            RecordValue::MessageStartEventSubscription(
                MessageStartEventSubscriptionRecord::Correlated {
                    subscription_key,
                    process_definition_key: subscription.process_definition_key,
                    bpmn_process_id: subscription.bpmn_process_id,
                    start_event_id: subscription.start_event_id,
                    message_key,
                    correlation_key: message.correlation_key,
                    process_instance_key,
                },
            ),
            now,
        )
        .await?;
        Ok(true)
    }
}
