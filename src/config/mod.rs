//! Coordination tunables
//!
//! All cadences and bounds used by the claim lifecycle live in
//! [`CoordinationConfig`] so that embedders can tighten them for tests or
//! low-latency deployments instead of relying on process-wide globals.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Default capacity of the per-claim message channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Default number of offset samples kept for velocity estimation
pub const DEFAULT_VELOCITY_WINDOW: usize = 10;

/// Default number of consecutive behind cycles tolerated before release
pub const DEFAULT_MAX_CYCLES_BEHIND: u32 = 3;

/// Default base interval between offset/health samples in milliseconds
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Default upper bound of the assignment-loop sleep in milliseconds
pub const DEFAULT_SWEEP_SLEEP_MAX_MS: u64 = 1000;

/// Configuration for claim and assignment-loop behavior
///
/// The heartbeat interval drives three thresholds: the maximum tolerated gap
/// between heartbeats, the offset-refresh cadence of the assignment loop, and
/// the seconds-behind threshold (twice the interval) used when shedding load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Maximum tolerated gap between heartbeats, in seconds
    pub heartbeat_interval_secs: u64,
    /// Capacity of the per-claim message channel
    pub channel_capacity: usize,
    /// Number of offset samples kept for velocity estimation
    pub velocity_window: usize,
    /// Consecutive behind cycles tolerated before a claim is released
    pub max_cycles_behind: u32,
    /// Base interval between offset/health samples, in milliseconds
    pub sample_interval_ms: u64,
    /// Upper bound of the random assignment-loop sleep, in milliseconds
    pub sweep_sleep_max_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            velocity_window: DEFAULT_VELOCITY_WINDOW,
            max_cycles_behind: DEFAULT_MAX_CYCLES_BEHIND,
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            sweep_sleep_max_ms: DEFAULT_SWEEP_SLEEP_MAX_MS,
        }
    }
}

impl CoordinationConfig {
    /// The heartbeat interval as a [`Duration`]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// The heartbeat interval in whole seconds, for unix-timestamp arithmetic
    pub fn heartbeat_secs(&self) -> i64 {
        self.heartbeat_interval_secs as i64
    }

    /// A jittered sampling delay, uniform in `[base/2, base*3/2)`
    ///
    /// Jitter keeps the background workers of many claims from hitting the
    /// coordination log in lockstep.
    pub fn jitter(&self) -> Duration {
        let base = self.sample_interval_ms.max(2);
        let ms = rand::thread_rng().gen_range(base / 2..base + base / 2);
        Duration::from_millis(ms)
    }

    /// A random assignment-loop sleep, uniform in `[0, sweep_sleep_max_ms)`
    pub fn sweep_sleep(&self) -> Duration {
        let max = self.sweep_sleep_max_ms.max(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}
