use crate::events::Record;
use crate::types::Position;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// The durable, strictly-ordered record stream backing one partition.
///
/// The consensus layer behind it is out of scope; the engine only relies on
/// append assigning monotonically increasing positions and on reads seeing
/// every previously appended record.
#[async_trait]
pub trait PartitionLog: Send + Sync {
    /// Append a record and return its position.
    async fn append(&self, record: &Record) -> Result<Position>;

    /// Read all records at or after `from`, in position order.
    async fn read_from(&self, from: Position) -> Result<Vec<Record>>;
}

/// In-memory log, used by tests and the single-process broker.
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<Record>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartitionLog for MemoryLog {
    async fn append(&self, record: &Record) -> Result<Position> {
        let mut records = self.records.lock().await;
        let position = records.len() as Position + 1;
        let mut stored = record.clone();
        stored.position = position;
        records.push(stored);
        Ok(position)
    }

    async fn read_from(&self, from: Position) -> Result<Vec<Record>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.position >= from)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MessageRecord, RecordType, RecordValue};

    fn record(value: RecordValue) -> Record {
        Record {
            position: 0,
            partition_id: 1,
            timestamp: 0,
            record_type: RecordType::Event,
            value,
        }
    }

    #[tokio::test]
    async fn assigns_increasing_positions() {
        let log = MemoryLog::new();
        let r = record(RecordValue::Message(MessageRecord::Delete {
            message_key: 1,
        }));

        let first = log.append(&r).await.unwrap();
        let second = log.append(&r).await.unwrap();
        assert!(second > first);

        let all = log.read_from(1).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].position, first);

        let tail = log.read_from(second).await.unwrap();
        assert_eq!(tail.len(), 1);
    }
}
