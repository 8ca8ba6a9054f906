//! Core data model.
//!
//! A work item is an opaque payload a producer wants delivered somewhere. The
//! processor wraps it in a [`QueuedItem`] envelope carrying identity and submit
//! time before it hits the deque, so age survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Item identity
// ---------------------------------------------------------------------------

/// Newtype for queued item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// What the processor actually stores in the deque, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem<T> {
    pub id: ItemId,
    /// When the producer submitted it. Drives `retry_discard_age`.
    pub submitted_at: DateTime<Utc>,
    pub item: T,
}

impl<T> QueuedItem<T> {
    pub fn new(item: T) -> Self {
        Self {
            id: ItemId::new(),
            submitted_at: Utc::now(),
            item,
        }
    }

    /// Time since submission, zero if the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.submitted_at).to_std().unwrap_or_default()
    }
}

/// Just the header of an envelope, for reading the eldest timestamp without
/// knowing the item type.
#[derive(Debug, Deserialize)]
pub(crate) struct EnvelopeHeader {
    pub submitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Outcome of one processing attempt, decided by the item processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResult {
    /// Delivered. The item is removed.
    Success,
    /// Transient failure. The item stays at the head and is tried again after
    /// `retry_interval`, unless it has outlived `retry_discard_age`.
    Retry,
    /// Permanent failure. The item is removed.
    Failed,
}

impl std::fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessResult::Success => "success",
            ProcessResult::Retry => "retry",
            ProcessResult::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Lifecycle of the consumer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Queue empty, waiting for work.
    Idle,
    /// Handling an item or backing off after one.
    Running,
    /// `close()` was called. Terminal.
    Closed,
}

impl WorkerState {
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, Running) | (Running, Idle) | (Idle, Closed) | (Running, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == WorkerState::Closed
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}
