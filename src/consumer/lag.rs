//! Consumer lag reporting
//!
//! Serializable snapshots of how far each claimed partition's cursor trails
//! the partition head, for surfacing through whatever health endpoint or
//! periodic log line the embedding application has.

use serde::{Deserialize, Serialize};

/// Lag of a single claimed partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLag {
    /// Topic name
    pub topic: String,
    /// Partition ID
    pub partition: i32,
    /// Offset of the next message this consumer will read
    pub current_offset: i64,
    /// Offset the next produced message will receive
    pub latest_offset: i64,
    /// Messages between the cursor and the head
    pub lag: i64,
}

/// Lag across all partitions claimed by one consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerLag {
    /// Topic name
    pub topic: String,
    /// Per-partition lag, sorted by partition
    pub partitions: Vec<PartitionLag>,
    /// Total lag across all claimed partitions
    pub total_lag: i64,
    /// Number of claimed partitions
    pub claim_count: usize,
}

impl ConsumerLag {
    /// Build a snapshot from per-partition lag data
    pub fn from_partitions(topic: &str, partitions: Vec<PartitionLag>) -> Self {
        let total_lag = partitions.iter().map(|p| p.lag).sum();
        let claim_count = partitions.len();
        Self {
            topic: topic.to_string(),
            partitions,
            total_lag,
            claim_count,
        }
    }
}

/// Aggregate statistics over a set of partition lags
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LagStats {
    /// Maximum lag across the partitions
    pub max_lag: i64,
    /// Minimum lag across the partitions
    pub min_lag: i64,
    /// Average lag across the partitions
    pub avg_lag: f64,
    /// Total lag
    pub total_lag: i64,
    /// Number of partitions
    pub partition_count: usize,
    /// Number of partitions with non-zero lag
    pub lagging_partitions: usize,
}

impl LagStats {
    /// Calculate statistics from partition lag data
    pub fn from_partitions(partitions: &[PartitionLag]) -> Self {
        if partitions.is_empty() {
            return Self::default();
        }

        let total_lag: i64 = partitions.iter().map(|p| p.lag).sum();
        let max_lag = partitions.iter().map(|p| p.lag).max().unwrap_or(0);
        let min_lag = partitions.iter().map(|p| p.lag).min().unwrap_or(0);
        let avg_lag = total_lag as f64 / partitions.len() as f64;
        let lagging_partitions = partitions.iter().filter(|p| p.lag > 0).count();

        Self {
            max_lag,
            min_lag,
            avg_lag,
            total_lag,
            partition_count: partitions.len(),
            lagging_partitions,
        }
    }
}
