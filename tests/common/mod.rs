//! Shared fixtures for corral integration tests
//!
//! `InMemoryMarshaler` stands in for a real coordination log plus broker: a
//! single-winner claim table keyed by partition, a per-partition append-only
//! message log with truncation, and recorded heartbeat/release traffic for
//! assertions. Multiple consumers may share one instance, which is what makes
//! the ownership-race tests meaningful.
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use corral::{
    CorralError, Marshaler, Message, PartitionClaim, PartitionOffsets, PartitionStream, Result,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Default)]
struct Inner {
    partitions: i32,
    logs: HashMap<i32, Vec<Bytes>>,
    earliest: HashMap<i32, i64>,
    claims: HashMap<i32, PartitionClaim>,
    committed: HashMap<i32, i64>,
    claim_attempts: Vec<i32>,
    heartbeats: Vec<(i32, i64)>,
    releases: Vec<(i32, i64)>,
    deny_claim: HashSet<i32>,
    fail_heartbeat: HashSet<i32>,
}

/// In-memory coordination log and broker shared by any number of consumers
pub struct InMemoryMarshaler {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryMarshaler {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                partitions,
                ..Default::default()
            })),
        })
    }

    /// Append a message to a partition's log, returning its offset
    pub fn produce(&self, partition: i32, payload: impl Into<Bytes>) -> i64 {
        let mut inner = self.inner.lock();
        let log = inner.logs.entry(partition).or_default();
        log.push(payload.into());
        log.len() as i64 - 1
    }

    /// Drop everything below `offset` from a partition's log
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        self.inner.lock().earliest.insert(partition, offset);
    }

    /// Mark a partition as held by some other consumer in the group
    pub fn claim_elsewhere(&self, partition: i32) {
        self.inner.lock().claims.insert(
            partition,
            PartitionClaim {
                claimant: Some("other-consumer".to_string()),
                last_heartbeat: unix_now(),
                current_offset: 0,
            },
        );
    }

    /// Make the claim race unwinnable for a partition
    pub fn deny_claim(&self, partition: i32) {
        self.inner.lock().deny_claim.insert(partition);
    }

    /// Make heartbeats fail for a partition
    pub fn fail_heartbeat(&self, partition: i32) {
        self.inner.lock().fail_heartbeat.insert(partition);
    }

    pub fn claim_attempts(&self) -> Vec<i32> {
        self.inner.lock().claim_attempts.clone()
    }

    pub fn heartbeats(&self) -> Vec<(i32, i64)> {
        self.inner.lock().heartbeats.clone()
    }

    pub fn releases(&self) -> Vec<(i32, i64)> {
        self.inner.lock().releases.clone()
    }

    /// Whether the coordination log currently shows a live claim
    pub fn is_claimed(&self, partition: i32) -> bool {
        self.inner
            .lock()
            .claims
            .get(&partition)
            .map(|claim| claim.last_heartbeat > 0)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Marshaler for InMemoryMarshaler {
    async fn partitions(&self, _topic: &str) -> Result<i32> {
        Ok(self.inner.lock().partitions)
    }

    async fn partition_offsets(&self, _topic: &str, partition: i32) -> Result<PartitionOffsets> {
        let inner = self.inner.lock();
        Ok(PartitionOffsets {
            earliest: inner.earliest.get(&partition).copied().unwrap_or(0),
            latest: inner
                .logs
                .get(&partition)
                .map(|log| log.len() as i64)
                .unwrap_or(0),
            committed: inner.committed.get(&partition).copied().unwrap_or(0),
        })
    }

    async fn partition_claim(&self, _topic: &str, partition: i32) -> PartitionClaim {
        self.inner
            .lock()
            .claims
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    async fn claim_partition(&self, _topic: &str, partition: i32) -> bool {
        let mut inner = self.inner.lock();
        inner.claim_attempts.push(partition);
        if inner.deny_claim.contains(&partition) {
            return false;
        }
        let held = inner
            .claims
            .get(&partition)
            .map(|claim| claim.last_heartbeat > 0)
            .unwrap_or(false);
        if held {
            return false;
        }
        inner.claims.insert(
            partition,
            PartitionClaim {
                claimant: Some("test-consumer".to_string()),
                last_heartbeat: unix_now(),
                current_offset: 0,
            },
        );
        true
    }

    async fn heartbeat(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_heartbeat.contains(&partition) {
            return Err(CorralError::Coordination(format!(
                "heartbeat rejected for {topic}:{partition}"
            )));
        }
        inner.heartbeats.push((partition, offset));
        inner.committed.insert(partition, offset);
        let entry = inner.claims.entry(partition).or_default();
        entry.last_heartbeat = unix_now();
        entry.current_offset = offset;
        Ok(())
    }

    async fn release_partition(&self, _topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.releases.push((partition, offset));
        inner.committed.insert(partition, offset);
        inner.claims.insert(partition, PartitionClaim::default());
        Ok(())
    }

    async fn stream(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
    ) -> Result<Box<dyn PartitionStream>> {
        Ok(Box::new(InMemoryStream {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            partition,
            cursor: start_offset,
        }))
    }
}

struct InMemoryStream {
    inner: Arc<Mutex<Inner>>,
    topic: String,
    partition: i32,
    cursor: i64,
}

#[async_trait]
impl PartitionStream for InMemoryStream {
    async fn next_message(&mut self) -> Result<Message> {
        loop {
            {
                let inner = self.inner.lock();
                let earliest = inner.earliest.get(&self.partition).copied().unwrap_or(0);
                if self.cursor < earliest {
                    return Err(CorralError::OffsetOutOfRange(
                        self.topic.clone(),
                        self.partition,
                        self.cursor,
                    ));
                }
                if let Some(log) = inner.logs.get(&self.partition) {
                    if self.cursor < log.len() as i64 {
                        let msg = Message::new(
                            self.topic.clone(),
                            self.partition,
                            self.cursor,
                            0,
                            None,
                            log[self.cursor as usize].clone(),
                        );
                        self.cursor += 1;
                        return Ok(msg);
                    }
                }
            }
            // Nothing new; behave like a blocking broker fetch.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Poll `condition` every 10 ms until it holds or `deadline` passes
pub async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
