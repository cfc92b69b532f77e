//! Shared, store-backed URL fetch queue for distributed crawlers.
//!
//! Any number of worker processes can add, claim and update items in one
//! collection; the store's atomic primitives keep claims disjoint and urls
//! unique. Optional background tasks requeue items abandoned by crashed
//! workers and record periodic statistics snapshots.

pub mod cli;
pub mod error;
pub mod queue;
pub mod storage;
pub mod tasks;
pub mod utils;

pub use error::{ErrorKind, QueueError, Result};
pub use queue::{CrawlQueue, FetchQueue, QueueItem, QueueItemStatus, WithCallback};
