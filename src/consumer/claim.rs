//! Per-partition claim lifecycle
//!
//! A [`Claim`] is instantiated for each partition this consumer owns. It is
//! responsible for pulling messages from the broker, tracking cursors,
//! heartbeating to the coordination log, and health-checking itself. Three
//! background workers run per claim:
//!
//! - the **offset updater** samples the partition's earliest/latest offsets
//!   and feeds the velocity windows
//! - the **health checker** compares partition velocity against consumption
//!   velocity, heartbeats while healthy, and releases the claim when it falls
//!   behind for too long
//! - the **message pump** fetches from the broker into a bounded channel,
//!   which is the sole backpressure mechanism: a slow application fills the
//!   channel, stalls the pump, and eventually trips the health check
//!
//! The claimed flag is the liveness bit. It flips exactly once, from active to
//! released, via compare-and-swap; workers poll it between iterations and exit
//! promptly once it clears. The flip is the commit point: the network release
//! to the coordination log always happens after it, outside all locks. A
//! released claim is never revived; the consumer builds a fresh one instead.

use crate::config::CoordinationConfig;
use crate::consumer::unix_now;
use crate::consumer::velocity::OffsetWindow;
use crate::error::{CorralError, Result};
use crate::marshal::{Marshaler, Message, PartitionStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// How long the pump blocks on a full channel before re-checking the flag
const PUMP_SEND_RETRY: Duration = Duration::from_secs(1);

/// Backoff after a transient broker consume error
const CONSUME_RETRY: Duration = Duration::from_secs(1);

/// Mutable claim state, guarded by the claim lock
///
/// The lock may be held across marshaler calls (heartbeats carry the cursor
/// they were issued with). Velocity queries take the read lock internally, so
/// the health check computes them before taking the write lock.
struct ClaimState {
    /// Offset of the next message the local consumer will read
    offset_current: i64,
    /// Smallest valid offset currently in the partition
    offset_earliest: i64,
    /// Offset the next produced message will receive
    offset_latest: i64,
    /// Value of `offset_current` when the claim began
    start_offset: i64,
    /// Unix second the claim began
    start_time: i64,
    /// Unix second of the last successful heartbeat
    last_heartbeat: i64,
    /// Consecutive velocity health checks in which consumption failed to
    /// keep pace
    cycles_behind: u32,
    /// Consecutive assignment-loop sweeps in which the time-behind heuristic
    /// found this claim behind. Independent of `cycles_behind`: the two
    /// health paths run on different cadences and must not reset each other.
    consumer_cycles_behind: u32,
    /// History of `offset_current` samples
    current_history: OffsetWindow,
    /// History of `offset_latest` samples
    latest_history: OffsetWindow,
}

/// An owned claim on a single partition
///
/// Crate-internal: claims are created and tracked by the
/// [`Consumer`](crate::consumer::Consumer), which only surfaces payloads and
/// lag snapshots.
pub(crate) struct Claim {
    topic: String,
    partition: i32,
    marshal: Arc<dyn Marshaler>,
    config: CoordinationConfig,
    claimed: AtomicBool,
    state: RwLock<ClaimState>,
    messages: parking_lot::Mutex<mpsc::Receiver<Message>>,
}

impl Claim {
    /// Claim a partition and start its background workers
    ///
    /// Runs the full claim handshake: fetch offsets, race for the claim on the
    /// coordination log, send the initial heartbeat, and open the broker
    /// stream. Any failure abandons the claim; losing the race surfaces as
    /// [`CorralError::ClaimLost`].
    pub(crate) async fn acquire(
        marshal: Arc<dyn Marshaler>,
        topic: &str,
        partition: i32,
        config: CoordinationConfig,
    ) -> Result<Arc<Self>> {
        let offsets = marshal.partition_offsets(topic, partition).await?;
        debug!(
            topic,
            partition,
            earliest = offsets.earliest,
            current = offsets.committed,
            latest = offsets.latest,
            "Fetched partition offsets"
        );

        // A committed cursor below the earliest offset means the log rolled
        // past it; resume from the earliest instead.
        let mut current = offsets.committed;
        if current < offsets.earliest {
            warn!(
                topic,
                partition,
                from = current,
                to = offsets.earliest,
                "Fast-forwarding committed cursor to earliest offset"
            );
            current = offsets.earliest;
        }

        info!(topic, partition, "Attempting to claim partition");
        if !marshal.claim_partition(topic, partition).await {
            info!(topic, partition, "Failed to claim partition");
            return Err(CorralError::ClaimLost(topic.to_string(), partition));
        }

        // The claim is ours; record liveness and the cursor before consuming.
        if let Err(e) = marshal.heartbeat(topic, partition, current).await {
            error!(topic, partition, error = %e, "Initial heartbeat failed, abandoning claim");
            return Err(e);
        }

        let stream = match marshal.stream(topic, partition, current).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(topic, partition, error = %e, "Failed to open partition stream, abandoning claim");
                return Err(e);
            }
        };

        let now = unix_now();
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let claim = Arc::new(Self {
            topic: topic.to_string(),
            partition,
            marshal,
            claimed: AtomicBool::new(true),
            state: RwLock::new(ClaimState {
                offset_current: current,
                offset_earliest: offsets.earliest,
                offset_latest: offsets.latest,
                start_offset: current,
                start_time: now,
                last_heartbeat: now,
                cycles_behind: 0,
                consumer_cycles_behind: 0,
                current_history: OffsetWindow::new(config.velocity_window),
                latest_history: OffsetWindow::new(config.velocity_window),
            }),
            messages: parking_lot::Mutex::new(rx),
            config,
        });

        tokio::spawn(Arc::clone(&claim).update_offsets_loop());
        tokio::spawn(Arc::clone(&claim).health_check_loop());
        tokio::spawn(Arc::clone(&claim).message_pump(stream, tx));

        info!(
            topic,
            partition,
            offset = current,
            behind = (offsets.latest - current).max(0),
            "Partition claimed"
        );
        Ok(claim)
    }

    /// Topic of this claim
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition of this claim
    pub(crate) fn partition(&self) -> i32 {
        self.partition
    }

    /// Whether this claim is still active
    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Record that the message at `offset` was handed to the application
    ///
    /// Returns false (without moving the cursor) when the claim has already
    /// been released.
    pub(crate) async fn consumed(&self, offset: i64) -> bool {
        if !self.is_claimed() {
            return false;
        }
        let mut state = self.state.write().await;
        state.offset_current = offset + 1;
        true
    }

    /// This partition's cursor lag
    pub(crate) async fn current_lag(&self) -> i64 {
        let state = self.state.read().await;
        (state.offset_latest - state.offset_current).max(0)
    }

    /// Average velocity of the local consumer's cursor
    pub(crate) async fn consumer_velocity(&self) -> f64 {
        self.state.read().await.current_history.velocity()
    }

    /// Average velocity of the partition's head
    pub(crate) async fn partition_velocity(&self) -> f64 {
        self.state.read().await.latest_history.velocity()
    }

    /// Release this claim on the coordination log
    ///
    /// The flag flip is the commit point: of any number of concurrent callers,
    /// exactly one wins the transition and issues the release to the
    /// coordination log. Everyone else gets false.
    pub(crate) async fn release(&self) -> bool {
        if !self.mark_released() {
            return false;
        }

        let state = self.state.read().await;
        info!(
            topic = %self.topic,
            partition = self.partition,
            offset = state.offset_current,
            "Releasing partition claim"
        );
        if let Err(e) = self
            .marshal
            .release_partition(&self.topic, self.partition, state.offset_current)
            .await
        {
            error!(
                topic = %self.topic,
                partition = self.partition,
                error = %e,
                "Failed to release partition"
            );
            return false;
        }
        true
    }

    /// Flip the claimed flag without touching the coordination log
    ///
    /// Returns true only for the caller that performed the active-to-released
    /// transition; that caller owes the coordination log the release.
    pub(crate) fn mark_released(&self) -> bool {
        self.claimed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Send a heartbeat carrying the current cursor
    ///
    /// Returns false on failure, in which case the group may already consider
    /// us dead and the caller must release the claim.
    pub(crate) async fn heartbeat(&self) -> bool {
        let mut state = self.state.write().await;
        if let Err(e) = self
            .marshal
            .heartbeat(&self.topic, self.partition, state.offset_current)
            .await
        {
            error!(
                topic = %self.topic,
                partition = self.partition,
                error = %e,
                "Failed to heartbeat"
            );
            return false;
        }
        state.last_heartbeat = unix_now();
        true
    }

    /// Heartbeat in the background if the last one is a full interval old
    ///
    /// Stamps `last_heartbeat` before spawning so a hot consume loop fires at
    /// most one heartbeat per interval. A failed heartbeat releases the claim.
    pub(crate) async fn heartbeat_if_due(self: Arc<Self>, now: i64) {
        {
            let mut state = self.state.write().await;
            if state.last_heartbeat > now - self.config.heartbeat_secs() {
                return;
            }
            state.last_heartbeat = now;
        }
        tokio::spawn(async move {
            if !self.heartbeat().await {
                self.release().await;
            }
        });
    }

    /// Current committed cursor
    pub(crate) async fn current_offset(&self) -> i64 {
        self.state.read().await.offset_current
    }

    /// Current cursor and partition head, for lag reporting
    pub(crate) async fn offsets(&self) -> (i64, i64) {
        let state = self.state.read().await;
        (state.offset_current, state.offset_latest)
    }

    /// Take one pending message without blocking
    pub(crate) fn try_next_message(&self) -> Option<Message> {
        match self.messages.lock().try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Re-fetch the partition's earliest/latest offsets, leaving the cursor alone
    pub(crate) async fn refresh_offsets(&self) -> Result<()> {
        let offsets = self
            .marshal
            .partition_offsets(&self.topic, self.partition)
            .await?;
        let mut state = self.state.write().await;
        state.offset_earliest = offsets.earliest;
        state.offset_latest = offsets.latest;
        Ok(())
    }

    /// Sample the partition's offsets into the velocity windows
    async fn update_offsets(&self, counter: u64) -> Result<()> {
        let offsets = self
            .marshal
            .partition_offsets(&self.topic, self.partition)
            .await?;
        let mut state = self.state.write().await;
        state.offset_earliest = offsets.earliest;
        state.offset_latest = offsets.latest;
        state.latest_history.record(counter, offsets.latest);
        let current = state.offset_current;
        state.current_history.record(counter, current);
        Ok(())
    }

    /// Background worker: periodic offset sampling
    async fn update_offsets_loop(self: Arc<Self>) {
        let mut counter: u64 = 0;
        while self.is_claimed() {
            tokio::time::sleep(self.config.jitter()).await;
            if !self.is_claimed() {
                break;
            }
            // A fetch failure is not grounds for release; the next tick retries.
            if let Err(e) = self.update_offsets(counter).await {
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %e,
                    "Failed to fetch partition offsets"
                );
            }
            counter += 1;
        }
        debug!(
            topic = %self.topic,
            partition = self.partition,
            "No longer claimed, offset loop exiting"
        );
    }

    /// One health check pass; true when the claim is healthy
    ///
    /// Pure decision: an unhealthy verdict obliges the caller to release the
    /// claim. Velocities are computed before the write lock is taken because
    /// they acquire the read lock internally.
    pub(crate) async fn health_check(&self) -> bool {
        let consumer_velocity = self.consumer_velocity().await;
        let partition_velocity = self.partition_velocity().await;

        let mut state = self.state.write().await;

        // An expired heartbeat means the rest of the group may already treat
        // this claim as dead; no velocity can save it.
        if state.last_heartbeat < unix_now() - self.config.heartbeat_secs() {
            warn!(
                topic = %self.topic,
                partition = self.partition,
                "Unhealthy by heartbeat age"
            );
            return false;
        }

        // Cursor at or past the head means caught up, whatever the velocities say.
        if state.offset_current >= state.offset_latest {
            state.cycles_behind = 0;
            return true;
        }

        if partition_velocity <= consumer_velocity {
            state.cycles_behind = 0;
            return true;
        }

        state.cycles_behind += 1;
        if state.cycles_behind >= self.config.max_cycles_behind {
            error!(
                topic = %self.topic,
                partition = self.partition,
                consumer_velocity,
                partition_velocity,
                "Consumption cannot keep pace"
            );
            return false;
        }

        warn!(
            topic = %self.topic,
            partition = self.partition,
            cycles_behind = state.cycles_behind,
            "Consumption behind partition velocity"
        );
        true
    }

    /// Background worker: periodic health checks, heartbeating while healthy
    ///
    /// Releases happen here, after `health_check` has dropped the claim lock.
    async fn health_check_loop(self: Arc<Self>) {
        while self.is_claimed() {
            tokio::time::sleep(self.config.jitter()).await;
            if !self.is_claimed() {
                break;
            }
            if !self.health_check().await {
                self.release().await;
                break;
            }
            if !self.heartbeat().await {
                self.release().await;
                break;
            }
        }
        debug!(
            topic = %self.topic,
            partition = self.partition,
            "Health check loop exiting"
        );
    }

    /// Whether the consumer-level time-behind heuristic wants this claim shed
    ///
    /// `(offset_current − start_offset) / (now − start_time)` estimates the
    /// consumer's long-run velocity; dividing the remaining backlog by it
    /// estimates how many seconds behind the head we are. Claims that have
    /// never consumed are skipped here: an unconsumed partition is not being
    /// heartbeated through the consume path, so it sheds through heartbeat age
    /// instead.
    ///
    /// This path keeps its own `consumer_cycles_behind` counter. The velocity
    /// check in [`Claim::health_check`] runs every sample tick and resets its
    /// counter whenever the claim looks healthy; sharing one counter would let
    /// it starve this slower-cadence heuristic.
    pub(crate) async fn falling_behind(&self, now: i64, max_seconds_behind: f64) -> bool {
        let mut state = self.state.write().await;

        if state.offset_current >= state.offset_latest {
            return false;
        }
        if state.offset_current == state.start_offset || state.start_time == now {
            return false;
        }

        let velocity =
            (state.offset_current - state.start_offset) as f64 / (now - state.start_time) as f64;
        let seconds_behind = (state.offset_latest - state.offset_current) as f64 / velocity;

        if seconds_behind > max_seconds_behind {
            state.consumer_cycles_behind += 1;
            warn!(
                topic = %self.topic,
                partition = self.partition,
                seconds_behind,
                cycles_behind = state.consumer_cycles_behind,
                "Partition falling behind"
            );
            state.consumer_cycles_behind >= self.config.max_cycles_behind
        } else {
            state.consumer_cycles_behind = 0;
            false
        }
    }

    /// Rewrite the progress fields that drive the time-behind heuristic
    #[cfg(test)]
    pub(crate) async fn override_progress(
        &self,
        start_offset: i64,
        start_time: i64,
        current: i64,
        latest: i64,
    ) {
        let mut state = self.state.write().await;
        state.start_offset = start_offset;
        state.start_time = start_time;
        state.offset_current = current;
        state.offset_latest = latest;
    }

    /// Push one message into the channel, yielding to the flag on backpressure
    ///
    /// Returns false when the pump should exit: the claim was released while
    /// blocked, or the receiver side is gone.
    async fn forward(&self, tx: &mpsc::Sender<Message>, msg: Message) -> bool {
        let mut msg = msg;
        loop {
            match tx.send_timeout(msg, PUMP_SEND_RETRY).await {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if !self.is_claimed() {
                        return false;
                    }
                    msg = returned;
                }
                Err(SendTimeoutError::Closed(_)) => return false,
            }
        }
    }

    /// Background worker: pull messages from the broker into the channel
    ///
    /// This worker never touches locked state while pumping; it is restricted
    /// to the claimed flag, the stream, and the channel, so it can run while
    /// another worker holds the claim lock across a slow marshaler call.
    async fn message_pump(
        self: Arc<Self>,
        mut stream: Box<dyn PartitionStream>,
        tx: mpsc::Sender<Message>,
    ) {
        while self.is_claimed() {
            match stream.next_message().await {
                Ok(msg) => {
                    if !self.forward(&tx, msg).await {
                        break;
                    }
                }
                Err(CorralError::OffsetOutOfRange(..)) => {
                    // The cursor fell off the retained log; give the partition
                    // back so it can be re-claimed from a fresh position.
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        "Consume offset out of range, abandoning partition"
                    );
                    self.release().await;
                    break;
                }
                Err(e) => {
                    // Often caused by data ageing out under us while we wait
                    // for the next offset update, so don't hammer the broker.
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        error = %e,
                        "Error consuming, will retry"
                    );
                    tokio::time::sleep(CONSUME_RETRY).await;
                }
            }
        }
        debug!(
            topic = %self.topic,
            partition = self.partition,
            "No longer claimed, pump exiting"
        );
    }
}
