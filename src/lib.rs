#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Corral
//!
//! Corral implements consumer coordination for partitioned, append-only logs
//! without an external coordinator: a cluster of independent processes
//! collectively consumes every partition of a topic exactly once per group,
//! rebalancing as processes join, leave, or fall behind.
//!
//! ## How it works
//!
//! - **Claims over heartbeats**: partition ownership is asserted on a shared
//!   coordination log and kept alive by heartbeats carrying the committed
//!   cursor. There is no member list and no generation protocol; a claim the
//!   group stops hearing about is simply up for grabs again.
//! - **Backpressure as health signal**: each claim pumps messages through a
//!   bounded channel. A slow application stalls the pump, the cursor lags the
//!   partition head, and velocity checks release the partition to a consumer
//!   that can keep up.
//! - **Bounded shedding**: an overloaded consumer gives up at most half of
//!   its claims per sweep, so one bad patch never drops everything at once.
//!
//! Delivery is at-least-once. Messages within a partition arrive in order;
//! across partitions there is no ordering.
//!
//! ## Usage
//!
//! Implement [`Marshaler`] over your coordination log and broker client, then
//! create one [`Consumer`] per topic:
//!
//! ```rust,ignore
//! use corral::{Consumer, ConsumerBehavior, CoordinationConfig};
//! use std::sync::Arc;
//!
//! let marshal = Arc::new(MyMarshaler::connect("kafka:9092").await?);
//! let consumer = Consumer::new(
//!     marshal,
//!     "events",
//!     ConsumerBehavior::Balanced,
//!     CoordinationConfig::default(),
//! )
//! .await?;
//!
//! while let Some(payload) = consumer.consume().await {
//!     handle(payload);
//! }
//! ```
//!
//! Call [`Consumer::terminate`] before exiting so the group reclaims your
//! partitions immediately instead of waiting out the heartbeat interval.

pub mod config;
pub mod consumer;
pub mod error;
pub mod marshal;

pub use config::CoordinationConfig;
pub use consumer::{Consumer, ConsumerBehavior, ConsumerLag, LagStats, PartitionLag};
pub use error::{CorralError, Result};
pub use marshal::{Marshaler, Message, PartitionClaim, PartitionOffsets, PartitionStream};
