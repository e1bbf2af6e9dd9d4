//! Partition claiming and consumption
//!
//! This module implements the consumer side of coordinator-free group
//! consumption:
//!
//! - **Claiming**: racing other group members for partition ownership via the
//!   coordination log
//! - **Pumping**: a bounded, backpressured message pump per claimed partition
//! - **Health**: velocity- and time-based checks that shed partitions the
//!   consumer cannot keep up with
//! - **Multiplexing**: a single [`Consumer::consume`] call surface over all
//!   claimed partitions

pub(crate) mod claim;
pub mod coordinator;
pub mod lag;
pub(crate) mod velocity;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Consumer, ConsumerBehavior};
pub use lag::{ConsumerLag, LagStats, PartitionLag};

/// Current unix time in whole seconds
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
