use async_trait::async_trait;

use crate::error::CoreResult;

pub type PartitionId = u32;

/// Position within a partition. A committed offset `X` means every record
/// below `X` is done; reading resumes at `X`.
pub type Offset = i64;

/// One raw record as delivered by a partition reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Vec<u8>,
}

/// A cursor over one ordered source partition.
#[async_trait]
pub trait PartitionReader: Send {
    fn partition(&self) -> PartitionId;

    /// Offset of the next record `poll` will return.
    fn position(&self) -> Offset;

    /// Return up to `max` records in offset order. An empty result means no
    /// data is available right now.
    async fn poll(&mut self, max: usize) -> CoreResult<Vec<SourceRecord>>;
}

/// Vector-backed partition, used by tests and embedders feeding records
/// programmatically.
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    partition: PartitionId,
    records: Vec<Vec<u8>>,
    position: Offset,
}

impl MemoryPartition {
    pub fn new(partition: PartitionId, records: Vec<Vec<u8>>) -> Self {
        Self {
            partition,
            records,
            position: 0,
        }
    }

    pub fn seek(&mut self, offset: Offset) {
        self.position = offset.clamp(0, self.records.len() as Offset);
    }
}

#[async_trait]
impl PartitionReader for MemoryPartition {
    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn position(&self) -> Offset {
        self.position
    }

    async fn poll(&mut self, max: usize) -> CoreResult<Vec<SourceRecord>> {
        let start = self.position as usize;
        let end = (start + max).min(self.records.len());
        let batch = self.records[start..end]
            .iter()
            .enumerate()
            .map(|(i, payload)| SourceRecord {
                partition: self.partition,
                offset: (start + i) as Offset,
                payload: payload.clone(),
            })
            .collect();
        self.position = end as Offset;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_partition_polls_in_order() {
        let mut p = MemoryPartition::new(2, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        p.seek(1);
        let batch = p.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, 1);
        assert_eq!(batch[1].payload, b"c");
        assert_eq!(p.position(), 3);
        assert!(p.poll(10).await.unwrap().is_empty());
    }
}
