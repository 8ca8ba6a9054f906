//! Work queue processor: the producer-facing handle around one deque and its
//! consumer task.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::item::ItemProcessor;
use super::worker::{self, Shared};
use crate::config::WorkQueueSettings;
use crate::deque::PersistentDeque;
use crate::model::{EnvelopeHeader, ItemId, QueuedItem, WorkerState};
use crate::telemetry::metrics;

/// What happened when an item was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// Durably queued at the tail.
    Queued(ItemId),
    /// Not queued. Already logged; the producer may ignore this.
    Dropped(DropReason),
}

impl SubmitResult {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitResult::Queued(_))
    }
}

/// Why a submission was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The queue already holds `max_events` items.
    QueueFull,
    /// `close()` has been called.
    Closed,
    /// The item could not be serialized.
    Serialization(String),
    /// The store rejected the write.
    Storage(String),
}

impl DropReason {
    fn label(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::Closed => "closed",
            DropReason::Serialization(_) | DropReason::Storage(_) => "error",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::QueueFull => write!(f, "queue full"),
            DropReason::Closed => write!(f, "processor closed"),
            DropReason::Serialization(e) => write!(f, "serialization failed: {e}"),
            DropReason::Storage(e) => write!(f, "storage failed: {e}"),
        }
    }
}

/// A persistent work queue drained by one background consumer.
///
/// Producers call [`submit`](Self::submit) from any thread. The consumer runs
/// on the Tokio runtime that was current when [`new`](Self::new) was called
/// and stops on [`close`](Self::close). Delivery is at-least-once and strictly
/// FIFO; a retried item holds the head until it succeeds, fails, or ages out.
///
/// Others may keep adding to either end of the deque, including ahead of an
/// item in flight; the consumer removes exactly the item it processed.
pub struct WorkQueueProcessor<T> {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    _item: PhantomData<fn(T) -> T>,
}

impl<T> WorkQueueProcessor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Spawn the consumer task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<P>(
        name: impl Into<String>,
        deque: Arc<PersistentDeque>,
        settings: WorkQueueSettings,
        processor: P,
    ) -> Self
    where
        P: ItemProcessor<T>,
    {
        let name = name.into();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared::new(name.clone(), deque, settings));

        let worker = tokio::spawn(worker::run::<T, P>(
            Arc::clone(&shared),
            Arc::new(processor),
            shutdown_rx,
        ));

        info!(
            queue = %name,
            max_events = shared.settings.max_events(),
            retry_interval_ms = shared.settings.retry_interval().as_millis() as u64,
            retry_discard_age_secs = shared.settings.retry_discard_age().as_secs(),
            "work queue processor created"
        );

        Self {
            shared,
            shutdown,
            worker: Mutex::new(Some(worker)),
            _item: PhantomData,
        }
    }

    /// Queue an item at the tail. Never blocks on downstream I/O and never
    /// fails: problems are logged and reported as [`SubmitResult::Dropped`].
    pub fn submit(&self, item: T) -> SubmitResult {
        let result = self.try_submit(item);

        let label = match &result {
            SubmitResult::Queued(_) => "queued",
            SubmitResult::Dropped(reason) => reason.label(),
        };
        metrics::items_submitted().add(
            1,
            &[
                KeyValue::new("queue", self.shared.name.clone()),
                KeyValue::new("result", label),
            ],
        );

        let mut stats = self.shared.stats();
        match &result {
            SubmitResult::Queued(_) => stats.submitted += 1,
            SubmitResult::Dropped(_) => stats.dropped += 1,
        }
        result
    }

    fn try_submit(&self, item: T) -> SubmitResult {
        let name = &self.shared.name;

        if *self.shutdown.borrow() {
            warn!(queue = %name, "submit after close, dropping item");
            return SubmitResult::Dropped(DropReason::Closed);
        }

        let queued = QueuedItem::new(item);
        let id = queued.id;
        let raw = match serde_json::to_string(&queued) {
            Ok(raw) => raw,
            Err(e) => {
                error!(queue = %name, error = %e, "failed to serialize item, dropping");
                return SubmitResult::Dropped(DropReason::Serialization(e.to_string()));
            }
        };

        let max_events = self.shared.settings.max_events();
        match self.shared.deque.add_last_within(&raw, max_events) {
            Ok(true) => {
                debug!(queue = %name, id = %id, "item queued");
                self.shared.wake.notify_one();
                SubmitResult::Queued(id)
            }
            Ok(false) => {
                warn!(queue = %name, id = %id, max_events, "queue full, dropping item");
                SubmitResult::Dropped(DropReason::QueueFull)
            }
            Err(e) => {
                error!(queue = %name, id = %id, error = %e, "failed to persist item, dropping");
                SubmitResult::Dropped(DropReason::Storage(e.to_string()))
            }
        }
    }
}

impl<T> WorkQueueProcessor<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> &WorkQueueSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> WorkerState {
        self.shared.stats().state
    }

    /// Items waiting, including one currently being attempted.
    pub fn queue_size(&self) -> u64 {
        self.shared.deque.size().unwrap_or_else(|e| {
            warn!(queue = %self.shared.name, error = %e, "failed to read queue size");
            0
        })
    }

    /// Submit time of the item at the head.
    pub fn eldest_item(&self) -> Option<DateTime<Utc>> {
        let raw = match self.shared.deque.peek_first() {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(queue = %self.shared.name, error = %e, "failed to read queue head");
                return None;
            }
        };
        match serde_json::from_str::<EnvelopeHeader>(&raw) {
            Ok(header) => Some(header.submitted_at),
            Err(e) => {
                debug!(queue = %self.shared.name, error = %e, "head has no readable timestamp");
                None
            }
        }
    }

    /// Counters and state for health reporting.
    pub fn debug_info(&self) -> BTreeMap<String, String> {
        let mut info = self.shared.stats().to_map();
        info.insert("name".to_string(), self.shared.name.clone());
        info.insert(
            "partition".to_string(),
            self.shared.deque.partition().to_string(),
        );
        info.insert("queue_size".to_string(), self.queue_size().to_string());
        info.insert(
            "max_events".to_string(),
            self.shared.settings.max_events().to_string(),
        );
        if let Some(eldest) = self.eldest_item() {
            info.insert("eldest_item".to_string(), eldest.to_rfc3339());
        }
        info
    }

    /// Stop the consumer and wait for it.
    ///
    /// The current item gets up to `shutdown_timeout` to finish. After that the
    /// task is aborted and the item stays at the head for the next start.
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut worker) = worker else {
            return;
        };

        let timeout = self.shared.settings.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(queue = %self.shared.name, error = %e, "work queue processor task failed");
            }
            Err(_) => {
                warn!(
                    queue = %self.shared.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "work queue processor did not stop in time, aborting"
                );
                worker.abort();
                let _ = worker.await;
            }
        }

        self.shared.set_state(WorkerState::Closed);
        info!(
            queue = %self.shared.name,
            remaining = self.queue_size(),
            "work queue processor closed"
        );
    }
}

impl<T> Drop for WorkQueueProcessor<T> {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            self.shutdown.send_replace(true);
            worker.abort();
        }
    }
}
