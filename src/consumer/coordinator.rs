//! Per-topic consumer and its assignment loop
//!
//! A [`Consumer`] owns every partition claim this process holds for one topic and
//! runs the assignment loop: a state machine that periodically refreshes
//! claim offsets, sheds unhealthy claims (capped at half the claims per sweep
//! so a bad patch never drops everything at once), and sweeps the partition
//! space for unclaimed partitions to race for.
//!
//! Create one `Consumer` per topic per process. Load splits across processes
//! through the claim race alone; no member list or generation protocol exists.

use crate::config::CoordinationConfig;
use crate::consumer::claim::Claim;
use crate::consumer::lag::{ConsumerLag, PartitionLag};
use crate::consumer::unix_now;
use crate::error::{CorralError, Result};
use crate::marshal::Marshaler;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long `consume` sleeps when every claim's channel is empty
const CONSUME_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// How eagerly the assignment loop claims free partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerBehavior {
    /// Claim every free partition in one sweep. Appropriate at low message
    /// rates, where the library mainly provides failover to standby
    /// consumers.
    Aggressive,

    /// Claim at most one partition per sweep. Ramps up slowly; appropriate at
    /// high message rates where no single consumer could carry the whole
    /// topic.
    Balanced,
}

/// Coordinated consumer for a single topic
///
/// Safe to share across tasks. `consume` may be called concurrently, though
/// each message is delivered to exactly one caller.
pub struct Consumer {
    marshal: Arc<dyn Marshaler>,
    topic: String,
    partitions: i32,
    behavior: ConsumerBehavior,
    config: CoordinationConfig,
    /// Never held across an await or a marshaler call.
    claims: RwLock<HashMap<i32, Arc<Claim>>>,
    terminated: AtomicBool,
}

impl Consumer {
    /// Create a consumer for `topic` and start its assignment loop
    ///
    /// The partition count is fetched once up front; errors from the
    /// marshaler (unknown topic, unreachable coordination log) surface here.
    pub async fn new(
        marshal: Arc<dyn Marshaler>,
        topic: impl Into<String>,
        behavior: ConsumerBehavior,
        config: CoordinationConfig,
    ) -> Result<Arc<Self>> {
        let topic = topic.into();
        let partitions = marshal.partitions(&topic).await?;

        let consumer = Arc::new(Self {
            marshal,
            topic,
            partitions,
            behavior,
            config,
            claims: RwLock::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        });
        tokio::spawn(Arc::clone(&consumer).manage_claims());

        Ok(consumer)
    }

    /// Whether `terminate` has been called
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Number of partitions currently claimed
    pub fn current_load(&self) -> usize {
        self.claims.read().len()
    }

    /// Total message lag across all claimed partitions
    ///
    /// Unstable early in a run while claims are still being won or shed;
    /// a value that keeps rising means the group lacks consumer capacity.
    pub async fn current_lag(&self) -> i64 {
        let snapshot: Vec<Arc<Claim>> = self.claims.read().values().cloned().collect();
        let mut lag = 0;
        for claim in snapshot {
            lag += claim.current_lag().await;
        }
        lag
    }

    /// Per-partition lag snapshot for reporting
    pub async fn lag_snapshot(&self) -> ConsumerLag {
        let snapshot: Vec<Arc<Claim>> = self.claims.read().values().cloned().collect();
        let mut partitions = Vec::with_capacity(snapshot.len());
        for claim in snapshot {
            let (current, latest) = claim.offsets().await;
            partitions.push(PartitionLag {
                topic: self.topic.clone(),
                partition: claim.partition(),
                current_offset: current,
                latest_offset: latest,
                lag: (latest - current).max(0),
            });
        }
        partitions.sort_by_key(|p| p.partition);
        ConsumerLag::from_partitions(&self.topic, partitions)
    }

    /// Return the next available message payload from any claimed partition
    ///
    /// Blocks until a message arrives; returns `None` once the consumer is
    /// terminated. Advances the partition's cursor past the returned message
    /// and heartbeats when the last heartbeat is a full interval old.
    /// Messages for partitions released since they were fetched are silently
    /// skipped.
    ///
    /// The scan restarts from the map each call, which can starve a busy
    /// partition behind a busier one; acceptable for at-least-once workloads,
    /// where fairness only shifts which partition lags first.
    pub async fn consume(&self) -> Option<Bytes> {
        loop {
            if self.is_terminated() {
                return None;
            }

            let snapshot: Vec<Arc<Claim>> = self.claims.read().values().cloned().collect();
            let mut next = None;
            for claim in snapshot {
                if let Some(msg) = claim.try_next_message() {
                    next = Some(msg);
                    break;
                }
            }

            let Some(msg) = next else {
                tokio::time::sleep(CONSUME_IDLE_SLEEP).await;
                continue;
            };

            let claim = self.claims.read().get(&msg.partition).cloned();
            let Some(claim) = claim else {
                // Partition was shed after the message was pumped; drop it.
                continue;
            };
            if !claim.consumed(msg.offset).await {
                continue;
            }
            claim.heartbeat_if_due(unix_now()).await;
            return Some(msg.value);
        }
    }

    /// Release every claim and stop the assignment loop
    ///
    /// Idempotent. Without this, other consumers still take over eventually,
    /// but only after this process's heartbeats lapse.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<Arc<Claim>> = {
            let mut claims = self.claims.write();
            claims.drain().map(|(_, claim)| claim).collect()
        };

        for claim in drained {
            // Claims that already released themselves have told the
            // coordination log; flipping the flag here is enough for those.
            if !claim.mark_released() {
                continue;
            }
            let offset = claim.current_offset().await;
            match self
                .marshal
                .release_partition(&self.topic, claim.partition(), offset)
                .await
            {
                Ok(()) => info!(
                    topic = %self.topic,
                    partition = claim.partition(),
                    offset,
                    "Released partition at termination"
                ),
                Err(e) => error!(
                    topic = %self.topic,
                    partition = claim.partition(),
                    error = %e,
                    "Failed to release partition at termination"
                ),
            }
        }
        info!(topic = %self.topic, "Consumer terminated");
    }

    /// The assignment loop: refresh, shed, claim, sleep
    async fn manage_claims(self: Arc<Self>) {
        let mut next_refresh = Instant::now();
        while !self.is_terminated() {
            if Instant::now() >= next_refresh {
                next_refresh = Instant::now() + self.config.heartbeat_interval();
                self.refresh_claim_offsets().await;
                self.shed_unhealthy_claims().await;
            }

            self.claim_partitions().await;
            tokio::time::sleep(self.config.sweep_sleep()).await;
        }
        debug!(topic = %self.topic, "Assignment loop exiting");
    }

    /// Refresh every claim's earliest/latest offsets in place
    async fn refresh_claim_offsets(&self) {
        let snapshot: Vec<Arc<Claim>> = self.claims.read().values().cloned().collect();
        for claim in snapshot {
            if let Err(e) = claim.refresh_offsets().await {
                error!(
                    topic = %self.topic,
                    partition = claim.partition(),
                    error = %e,
                    "Failed to refresh partition offsets"
                );
            }
        }
    }

    /// Claims the consumer-level heuristic wants shed this sweep
    ///
    /// Claims that have already flipped themselves to released are enlisted
    /// unconditionally so the sweep removes them from the map.
    async fn unhealthy_claims(&self) -> Vec<Arc<Claim>> {
        let now = unix_now();
        let max_seconds_behind = (self.config.heartbeat_interval_secs * 2) as f64;
        let snapshot: Vec<Arc<Claim>> = self.claims.read().values().cloned().collect();

        let mut unhealthy = Vec::new();
        for claim in snapshot {
            if !claim.is_claimed() {
                unhealthy.push(claim);
                continue;
            }
            if claim.falling_behind(now, max_seconds_behind).await {
                unhealthy.push(claim);
            }
        }
        unhealthy
    }

    /// Shed unhealthy claims, at most half of the current claims per sweep
    async fn shed_unhealthy_claims(&self) {
        let claim_count = self.current_load();
        let unhealthy = self.unhealthy_claims().await;
        if unhealthy.is_empty() {
            return;
        }

        let max_to_release = claim_count / 2;
        warn!(
            topic = %self.topic,
            unhealthy = unhealthy.len(),
            total = claim_count,
            "Found unhealthy partitions"
        );

        // Flag flips and map removals happen under the lock; the slow
        // coordination-log releases happen after, outside it. Only claims
        // whose transition we won still owe the coordination log a release.
        // Claims that already released themselves carry no load, so they are
        // untracked without counting against the shedding cap.
        let mut to_release = Vec::new();
        {
            let mut claims = self.claims.write();
            for claim in unhealthy {
                if !claim.is_claimed() {
                    claims.remove(&claim.partition());
                    continue;
                }
                if to_release.len() >= max_to_release {
                    warn!(
                        topic = %self.topic,
                        "Too many partitions unhealthy, keeping the rest"
                    );
                    continue;
                }
                if claim.mark_released() {
                    claims.remove(&claim.partition());
                    to_release.push(claim);
                } else {
                    claims.remove(&claim.partition());
                }
            }
        }

        for claim in to_release {
            let offset = claim.current_offset().await;
            warn!(
                topic = %self.topic,
                partition = claim.partition(),
                offset,
                "Releasing unhealthy partition"
            );
            if let Err(e) = self
                .marshal
                .release_partition(&self.topic, claim.partition(), offset)
                .await
            {
                error!(
                    topic = %self.topic,
                    partition = claim.partition(),
                    error = %e,
                    "Failed to release unhealthy partition"
                );
            }
        }
    }

    /// Sweep the partition space for unclaimed partitions
    ///
    /// Starts at a random partition so a group of consumers racing the same
    /// topic doesn't pile onto partition 0.
    async fn claim_partitions(&self) {
        if self.partitions <= 0 {
            return;
        }
        let start = rand::thread_rng().gen_range(0..self.partitions);
        for i in 0..self.partitions {
            let partition = (i + start) % self.partitions;

            if self.claims.read().contains_key(&partition) {
                continue;
            }
            if !self.try_claim_partition(partition).await {
                continue;
            }
            if self.behavior == ConsumerBehavior::Balanced {
                break;
            }
        }
    }

    /// Try to win one partition and track it
    async fn try_claim_partition(&self, partition: i32) -> bool {
        // Someone with a live heartbeat holds it; don't even enter the race.
        let current = self.marshal.partition_claim(&self.topic, partition).await;
        if current.last_heartbeat > 0 {
            return false;
        }

        let claim = match Claim::acquire(
            Arc::clone(&self.marshal),
            &self.topic,
            partition,
            self.config.clone(),
        )
        .await
        {
            Ok(claim) => claim,
            Err(CorralError::ClaimLost(..)) => return false,
            Err(e) => {
                error!(
                    topic = %self.topic,
                    partition,
                    error = %e,
                    "Failed to claim partition"
                );
                return false;
            }
        };

        let stale = {
            let mut claims = self.claims.write();
            if self.is_terminated() {
                true
            } else {
                claims.insert(partition, Arc::clone(&claim));
                false
            }
        };
        if stale {
            // Terminated between winning the race and tracking the claim;
            // hand the partition straight back.
            warn!(
                topic = %self.topic,
                partition,
                "Terminated during claim, releasing"
            );
            claim.release().await;
            return false;
        }
        true
    }
}
