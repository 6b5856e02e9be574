use crate::cluster::{Cluster, Config, PublishMessage, StartEventSpec};
use crate::error::CommandError;
use crate::events::Record;
use crate::partition::{OpenSubscription, ProcessEngine};
use crate::types::Key;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Intake {
    Publish(PublishMessage),
    OpenSubscription(OpenSubscription),
    CloseSubscription {
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
    },
    Deploy(Vec<StartEventSpec>),
    InstanceFinished {
        bpmn_process_id: String,
        correlation_key: String,
    },
    Export(oneshot::Sender<Vec<Record>>),
    Shutdown,
}

/// Runtime host for a [`Cluster`]: a single task owning all partitions,
/// fed over a channel, with interval-driven TTL sweeps and pending-command
/// resends. Partition turns stay strictly ordered because only this task
/// touches the cluster.
pub struct Broker {
    tx: mpsc::Sender<Intake>,
    task: JoinHandle<()>,
}

impl Broker {
    pub fn start(config: Config, engine: Arc<dyn ProcessEngine>) -> Self {
        let (tx, rx) = mpsc::channel(128);
        let task = tokio::spawn(run(config, engine, rx));
        Self { tx, task }
    }

    /// Validates synchronously, then hands the publish to the cluster task.
    pub async fn publish(&self, publish: PublishMessage) -> Result<()> {
        if publish.name.is_empty() {
            return Err(CommandError::MissingField("name").into());
        }
        self.send(Intake::Publish(publish)).await
    }

    pub async fn open_subscription(&self, open: OpenSubscription) -> Result<()> {
        if open.message_name.is_empty() {
            return Err(CommandError::MissingField("messageName").into());
        }
        if open.correlation_key.is_empty() {
            return Err(CommandError::MissingField("correlationKey").into());
        }
        self.send(Intake::OpenSubscription(open)).await
    }

    pub async fn close_subscription(
        &self,
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<()> {
        self.send(Intake::CloseSubscription {
            process_instance_key,
            element_instance_key,
            message_name: message_name.to_string(),
        })
        .await
    }

    pub async fn deploy(&self, start_events: Vec<StartEventSpec>) -> Result<()> {
        self.send(Intake::Deploy(start_events)).await
    }

    pub async fn instance_finished(
        &self,
        bpmn_process_id: &str,
        correlation_key: &str,
    ) -> Result<()> {
        self.send(Intake::InstanceFinished {
            bpmn_process_id: bpmn_process_id.to_string(),
            correlation_key: correlation_key.to_string(),
        })
        .await
    }

    /// Snapshot of every record appended so far, in processing order.
    pub async fn records(&self) -> Result<Vec<Record>> {
        let (reply, response) = oneshot::channel();
        self.send(Intake::Export(reply)).await?;
        response.await.map_err(|_| anyhow!("broker stopped"))
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.tx.send(Intake::Shutdown).await;
        self.task.await?;
        Ok(())
    }

    async fn send(&self, intake: Intake) -> Result<()> {
        self.tx
            .send(intake)
            .await
            .map_err(|_| anyhow!("broker stopped"))
    }
}

async fn run(config: Config, engine: Arc<dyn ProcessEngine>, mut rx: mpsc::Receiver<Intake>) {
    let mut cluster = Cluster::new(config.clone(), engine);
    let base = cluster.now();
    let started = tokio::time::Instant::now();

    let mut sweep = tokio::time::interval(Duration::from_millis(config.sweep_interval_ms));
    let mut resend = tokio::time::interval(Duration::from_millis(config.resend_interval_ms));

    loop {
        cluster.set_time(base + started.elapsed().as_millis() as i64);

        // Ticks before intake: a due sweep must not be starved by a busy
        // command stream.
        tokio::select! {
            biased;
            _ = sweep.tick() => {
                if let Err(error) = cluster.sweep().await {
                    warn!(%error, "sweep failed");
                }
            }
            _ = resend.tick() => {
                cluster.resend_pending();
            }
            intake = rx.recv() => {
                match intake {
                    Some(Intake::Publish(publish)) => {
                        if let Err(error) = cluster.publish(publish) {
                            warn!(%error, "publish refused");
                        }
                    }
                    Some(Intake::OpenSubscription(open)) => {
                        if let Err(error) = cluster.open_subscription(open).await {
                            warn!(%error, "open subscription failed");
                        }
                    }
                    Some(Intake::CloseSubscription {
                        process_instance_key,
                        element_instance_key,
                        message_name,
                    }) => {
                        if let Err(error) = cluster
                            .close_subscription(
                                process_instance_key,
                                element_instance_key,
                                &message_name,
                            )
                            .await
                        {
                            warn!(%error, "close subscription failed");
                        }
                    }
                    Some(Intake::Deploy(start_events)) => {
                        cluster.deploy(&start_events);
                    }
                    Some(Intake::InstanceFinished {
                        bpmn_process_id,
                        correlation_key,
                    }) => {
                        cluster.instance_finished(&bpmn_process_id, &correlation_key);
                    }
                    Some(Intake::Export(reply)) => {
                        let _ = reply.send(cluster.records().to_vec());
                    }
                    Some(Intake::Shutdown) | None => {
                        debug!("broker stopping");
                        break;
                    }
                }
            }
        }

        if let Err(error) = cluster.run_until_idle().await {
            warn!(%error, "cluster processing failed");
        }
    }
}
