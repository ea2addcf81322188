//! The message-transport seam.
//!
//! The engine treats the underlying log as an external collaborator: a set
//! of `P` partitions, each a reliable FIFO per producer, with publishes
//! acknowledged durably. [`MessageTransport`] captures exactly that
//! contract; [`InMemoryMessageTransport`] is the in-process backend used by
//! tests and single-process jobs.
//!
//! Epoch completeness is carried by the records themselves (every sender
//! closes its superstep with an `EndOfStep` sentinel on every partition),
//! so the transport needs no notion of supersteps.

use crate::error::{PregelError, Result};
use crate::message::TransportRecord;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// Reliable partitioned FIFO transport.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Append records to a partition. Returns once the batch is durably
    /// accepted.
    async fn publish(&self, partition: usize, records: Vec<TransportRecord>) -> Result<()>;

    /// Wait until the partition has records, then drain and return them.
    async fn poll(&self, partition: usize) -> Result<Vec<TransportRecord>>;

    /// Number of partitions in this job's log.
    fn num_partitions(&self) -> usize;
}

struct PartitionQueue {
    records: Mutex<VecDeque<TransportRecord>>,
    available: Notify,
}

/// In-process transport: one FIFO queue per partition.
pub struct InMemoryMessageTransport {
    partitions: Vec<PartitionQueue>,
}

impl InMemoryMessageTransport {
    pub fn new(num_partitions: usize) -> Self {
        Self {
            partitions: (0..num_partitions.max(1))
                .map(|_| PartitionQueue {
                    records: Mutex::new(VecDeque::new()),
                    available: Notify::new(),
                })
                .collect(),
        }
    }

    fn queue(&self, partition: usize) -> Result<&PartitionQueue> {
        self.partitions.get(partition).ok_or_else(|| {
            PregelError::Transport(format!(
                "partition {} out of range (log has {})",
                partition,
                self.partitions.len()
            ))
        })
    }
}

#[async_trait]
impl MessageTransport for InMemoryMessageTransport {
    async fn publish(&self, partition: usize, records: Vec<TransportRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let queue = self.queue(partition)?;
        {
            let mut buffer = queue.records.lock().await;
            buffer.extend(records);
        }
        // notify_one stores a permit, so a consumer arriving later still wakes
        queue.available.notify_one();
        Ok(())
    }

    async fn poll(&self, partition: usize) -> Result<Vec<TransportRecord>> {
        let queue = self.queue(partition)?;
        loop {
            let notified = queue.available.notified();
            {
                let mut buffer = queue.records.lock().await;
                if !buffer.is_empty() {
                    return Ok(buffer.drain(..).collect());
                }
            }
            notified.await;
        }
    }

    fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageEnvelope;
    use crate::vertex::VertexId;
    use serde_json::json;
    use std::sync::Arc;

    fn msg(superstep: i32, dest: &str, payload: serde_json::Value) -> TransportRecord {
        TransportRecord::Message(MessageEnvelope {
            superstep,
            dest: VertexId::new(dest),
            payload,
        })
    }

    #[tokio::test]
    async fn test_publish_then_poll_preserves_order() {
        let transport = InMemoryMessageTransport::new(2);
        transport
            .publish(0, vec![msg(0, "a", json!(1)), msg(0, "b", json!(2))])
            .await
            .unwrap();
        transport.publish(0, vec![msg(0, "c", json!(3))]).await.unwrap();

        let records = transport.poll(0).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], msg(0, "a", json!(1)));
        assert_eq!(records[2], msg(0, "c", json!(3)));
    }

    #[tokio::test]
    async fn test_poll_blocks_until_publish() {
        let transport = Arc::new(InMemoryMessageTransport::new(1));
        let consumer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.poll(0).await })
        };
        // give the consumer a chance to park first
        tokio::task::yield_now().await;
        transport
            .publish(
                0,
                vec![TransportRecord::EndOfStep {
                    superstep: 4,
                    sender: "w0".into(),
                }],
            )
            .await
            .unwrap();

        let records = consumer.await.unwrap().unwrap();
        assert_eq!(
            records,
            vec![TransportRecord::EndOfStep {
                superstep: 4,
                sender: "w0".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_partition_out_of_range() {
        let transport = InMemoryMessageTransport::new(2);
        let err = transport.publish(5, vec![msg(0, "a", json!(1))]).await.unwrap_err();
        assert!(matches!(err, PregelError::Transport(_)));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let transport = InMemoryMessageTransport::new(2);
        transport.publish(1, vec![msg(0, "z", json!(9))]).await.unwrap();
        // partition 0 stays empty; partition 1 has the record
        let records = transport.poll(1).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
