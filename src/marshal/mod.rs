//! Coordination-log and broker access
//!
//! The consumer core never talks to the coordination log or the broker
//! directly. Everything goes through the [`Marshaler`] trait, which owns the
//! claim/heartbeat/release protocol on the shared coordination log, and
//! [`PartitionStream`], which is a single-partition message fetcher positioned
//! at a starting offset.
//!
//! Every method may perform network I/O and may block; implementations are
//! expected to carry their own timeouts. The trait is deliberately small so
//! that tests can drive the core with an in-memory implementation.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single message fetched from a partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message belongs to
    pub topic: String,

    /// Partition the message was read from
    pub partition: i32,

    /// Offset of this message within the partition
    pub offset: i64,

    /// Timestamp of the message (milliseconds since epoch)
    pub timestamp: i64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Message payload
    pub value: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: i64,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp,
            key,
            value,
        }
    }
}

/// Offset positions of a partition as reported by the broker
///
/// `earliest` is the smallest offset still present, `latest` is the offset the
/// next produced message will receive (it may never exist), and `committed` is
/// the cursor last recorded on the coordination log for this consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffsets {
    /// Smallest valid offset currently in the partition
    pub earliest: i64,
    /// Offset that will be assigned to the next produced message
    pub latest: i64,
    /// Committed cursor for this group, or 0 if none was ever recorded
    pub committed: i64,
}

/// The current claim state of a partition on the coordination log
///
/// A `last_heartbeat` of 0 means nobody holds the partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionClaim {
    /// Identifier of the claiming consumer, if any
    pub claimant: Option<String>,
    /// Unix timestamp of the claimant's last heartbeat, 0 when unclaimed
    pub last_heartbeat: i64,
    /// Cursor carried by the last heartbeat
    pub current_offset: i64,
}

/// Coordination-log operations and broker access for one consumer group
///
/// `claim_partition` is the distributed race: across all consumers of a group,
/// at most one caller wins a given `(topic, partition)` until the claim is
/// released or its heartbeats lapse.
#[async_trait]
pub trait Marshaler: Send + Sync + 'static {
    /// Number of partitions in a topic
    async fn partitions(&self, topic: &str) -> Result<i32>;

    /// Earliest/latest/committed offsets of a partition
    async fn partition_offsets(&self, topic: &str, partition: i32) -> Result<PartitionOffsets>;

    /// Current claim state of a partition
    async fn partition_claim(&self, topic: &str, partition: i32) -> PartitionClaim;

    /// Race to claim a partition; true if this consumer won
    async fn claim_partition(&self, topic: &str, partition: i32) -> bool;

    /// Record liveness and the committed cursor for a held partition
    async fn heartbeat(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Give up a held partition, recording the final cursor
    async fn release_partition(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Open a message stream over one partition, starting at `start_offset`
    async fn stream(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
    ) -> Result<Box<dyn PartitionStream>>;
}

/// A positioned message fetcher over a single partition
#[async_trait]
pub trait PartitionStream: Send {
    /// Fetch the next message, blocking until one is available
    ///
    /// Returns [`CorralError::OffsetOutOfRange`](crate::error::CorralError)
    /// when the stream's cursor has fallen off the retained log.
    async fn next_message(&mut self) -> Result<Message>;
}
