//! Stream deduplication on producer-stamped UUID keys.
//!
//! Producers stamp every message with a stable unique id, carried as a message
//! attribute. The engine partitions the key space over a set of shard actors, each
//! exclusively owning the first-seen state for its slice, emits the first sighting
//! of every key and drops the repeats. Watermark barriers flowing with the data
//! garbage-collect state the watermark has moved past, so redelivery storms are
//! absorbed without unbounded memory.

pub use self::error::{Error, Result};

mod error;

/// Engine tuning: shard layout, retention, store capacity, retries.
pub mod config;

/// The dedup pipeline and its building blocks.
pub mod dedup;
pub use dedup::UuidDedup;

/// The message envelope flowing through the engine.
pub mod message;

/// Prometheus metrics exposed by the engine.
pub mod metrics;
