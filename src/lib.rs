//! # workq
//!
//! Crash-tolerant persistent work queue for fire-and-forget delivery.
//!
//! Provides an ordered key-value storage seam (SQLite or in-memory), a
//! double-ended queue built from single-key operations on top of it, a
//! retrying single-consumer processor that drains the queue through a
//! pluggable [`engine::ItemProcessor`], and OpenTelemetry observability.

pub mod config;
pub mod deque;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod telemetry;

pub use config::WorkQueueSettings;
pub use deque::{PersistentDeque, Position};
pub use engine::{ItemProcessor, SubmitResult, WorkQueueProcessor};
pub use error::{Error, ProcessingError, Result};
pub use model::ProcessResult;
