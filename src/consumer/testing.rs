//! In-memory marshaler for unit tests
//!
//! Implements the single-winner claim table of a real coordination log and
//! records every heartbeat and release so tests can assert on protocol
//! traffic. Partition streams are scripted per partition: a queue of messages
//! and injected errors, pending forever once drained (like a broker fetch
//! with nothing new to return).

use crate::consumer::unix_now;
use crate::error::{CorralError, Result};
use crate::marshal::{Marshaler, Message, PartitionClaim, PartitionOffsets, PartitionStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

enum ScriptedFetch {
    Message(Message),
    OutOfRange,
    Transient(String),
}

#[derive(Default)]
struct Inner {
    partitions: i32,
    offsets: HashMap<i32, PartitionOffsets>,
    claims: HashMap<i32, PartitionClaim>,
    fetches: HashMap<i32, VecDeque<ScriptedFetch>>,
    claim_attempts: Vec<i32>,
    heartbeats: Vec<(i32, i64)>,
    releases: Vec<(i32, i64)>,
    deny_claim: HashSet<i32>,
    fail_offsets: HashSet<i32>,
    fail_heartbeat: HashSet<i32>,
    fail_stream: HashSet<i32>,
}

pub(crate) struct MockMarshaler {
    inner: Arc<Mutex<Inner>>,
}

impl MockMarshaler {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                partitions,
                ..Default::default()
            })),
        })
    }

    pub fn set_offsets(&self, partition: i32, offsets: PartitionOffsets) {
        self.inner.lock().offsets.insert(partition, offsets);
    }

    pub fn set_external_claim(&self, partition: i32, last_heartbeat: i64) {
        self.inner.lock().claims.insert(
            partition,
            PartitionClaim {
                claimant: Some("other-consumer".to_string()),
                last_heartbeat,
                current_offset: 0,
            },
        );
    }

    pub fn deny_claim(&self, partition: i32) {
        self.inner.lock().deny_claim.insert(partition);
    }

    pub fn fail_offsets(&self, partition: i32) {
        self.inner.lock().fail_offsets.insert(partition);
    }

    pub fn fail_heartbeat(&self, partition: i32) {
        self.inner.lock().fail_heartbeat.insert(partition);
    }

    pub fn fail_stream(&self, partition: i32) {
        self.inner.lock().fail_stream.insert(partition);
    }

    pub fn push_message(&self, partition: i32, msg: Message) {
        self.inner
            .lock()
            .fetches
            .entry(partition)
            .or_default()
            .push_back(ScriptedFetch::Message(msg));
    }

    pub fn push_out_of_range(&self, partition: i32) {
        self.inner
            .lock()
            .fetches
            .entry(partition)
            .or_default()
            .push_back(ScriptedFetch::OutOfRange);
    }

    pub fn push_transient_error(&self, partition: i32, msg: &str) {
        self.inner
            .lock()
            .fetches
            .entry(partition)
            .or_default()
            .push_back(ScriptedFetch::Transient(msg.to_string()));
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
}

#[async_trait]
impl Marshaler for MockMarshaler {
    async fn partitions(&self, _topic: &str) -> Result<i32> {
        Ok(self.inner.lock().partitions)
    }

    async fn partition_offsets(&self, topic: &str, partition: i32) -> Result<PartitionOffsets> {
        let inner = self.inner.lock();
        if inner.fail_offsets.contains(&partition) {
            return Err(CorralError::broker_msg(format!(
                "offset query failed for {topic}:{partition}"
            )));
        }
        Ok(inner
            .offsets
            .get(&partition)
            .copied()
            .unwrap_or(PartitionOffsets {
                earliest: 0,
                latest: 0,
                committed: 0,
            }))
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
                claimant: Some("mock-consumer".to_string()),
                last_heartbeat: unix_now(),
                current_offset: 0,
            },
        );
        true
    }

    async fn heartbeat(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_heartbeat.contains(&partition) {
            return Err(CorralError::coordination_msg(format!(
                "heartbeat failed for {topic}:{partition}"
            )));
        }
        inner.heartbeats.push((partition, offset));
        let entry = inner.claims.entry(partition).or_default();
        entry.last_heartbeat = unix_now();
        entry.current_offset = offset;
        Ok(())
    }

    async fn release_partition(&self, _topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.releases.push((partition, offset));
        inner.claims.insert(partition, PartitionClaim::default());
        Ok(())
    }

    async fn stream(
        &self,
        topic: &str,
        partition: i32,
        _start_offset: i64,
    ) -> Result<Box<dyn PartitionStream>> {
        if self.inner.lock().fail_stream.contains(&partition) {
            return Err(CorralError::broker_msg(format!(
                "stream open failed for {topic}:{partition}"
            )));
        }
        Ok(Box::new(MockStream {
            inner: Arc::clone(&self.inner),
            partition,
        }))
    }
}

struct MockStream {
    inner: Arc<Mutex<Inner>>,
    partition: i32,
}

#[async_trait]
impl PartitionStream for MockStream {
    async fn next_message(&mut self) -> Result<Message> {
        loop {
            let fetch = self
                .inner
                .lock()
                .fetches
                .get_mut(&self.partition)
                .and_then(|queue| queue.pop_front());
            match fetch {
                Some(ScriptedFetch::Message(msg)) => return Ok(msg),
                Some(ScriptedFetch::OutOfRange) => {
                    return Err(CorralError::OffsetOutOfRange(
                        "events".to_string(),
                        self.partition,
                        0,
                    ));
                }
                Some(ScriptedFetch::Transient(msg)) => {
                    return Err(CorralError::broker_msg(msg));
                }
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }
}
