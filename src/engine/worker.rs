//! The consumer loop: drain the head, apply the retry policy, repeat.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use super::item::ItemProcessor;
use crate::config::WorkQueueSettings;
use crate::deque::{PersistentDeque, Position};
use crate::error::ProcessingError;
use crate::model::{ProcessResult, QueuedItem, WorkerState};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_item_span};

/// Counters and state reported through `debug_info()`.
#[derive(Debug)]
pub(super) struct Stats {
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub submitted: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub discarded: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Stats {
    fn new() -> Self {
        Self {
            state: WorkerState::Idle,
            started_at: Utc::now(),
            submitted: 0,
            dropped: 0,
            succeeded: 0,
            retried: 0,
            failed: 0,
            discarded: 0,
            last_error: None,
            last_error_at: None,
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("state".to_string(), self.state.to_string());
        map.insert("started_at".to_string(), self.started_at.to_rfc3339());
        map.insert("items_submitted".to_string(), self.submitted.to_string());
        map.insert("items_dropped".to_string(), self.dropped.to_string());
        map.insert("items_succeeded".to_string(), self.succeeded.to_string());
        map.insert("items_retried".to_string(), self.retried.to_string());
        map.insert("items_failed".to_string(), self.failed.to_string());
        map.insert("items_discarded".to_string(), self.discarded.to_string());
        if let Some(ref e) = self.last_error {
            map.insert("last_error".to_string(), e.clone());
        }
        if let Some(at) = self.last_error_at {
            map.insert("last_error_at".to_string(), at.to_rfc3339());
        }
        map
    }
}

/// State shared between the producer-facing handle and the consumer task.
pub(super) struct Shared {
    pub name: String,
    pub deque: Arc<PersistentDeque>,
    pub settings: WorkQueueSettings,
    /// Signalled on every successful submit.
    pub wake: Notify,
    stats: Mutex<Stats>,
}

impl Shared {
    pub fn new(name: String, deque: Arc<PersistentDeque>, settings: WorkQueueSettings) -> Self {
        Self {
            name,
            deque,
            settings,
            wake: Notify::new(),
            stats: Mutex::new(Stats::new()),
        }
    }

    /// Counters must stay readable after a panic elsewhere, so poisoning is
    /// ignored.
    pub fn stats(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, to: WorkerState) {
        let mut stats = self.stats();
        if stats.state.is_terminal() {
            return;
        }
        if stats.state != to && stats.state.can_transition_to(to) {
            debug!(queue = %self.name, from = %stats.state, to = %to, "worker state");
            stats.state = to;
        }
    }

    fn record_error(&self, message: String) {
        let mut stats = self.stats();
        stats.last_error = Some(message);
        stats.last_error_at = Some(Utc::now());
    }

    fn count_processed(&self, result: &'static str) {
        metrics::items_processed().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("result", result),
            ],
        );
    }
}

/// What the loop does after handling the head.
enum Step {
    /// Move straight on to the next item.
    Continue,
    /// Leave the head in place and wait `retry_interval`.
    Backoff,
    /// Shutdown arrived while waiting on the store.
    Stop,
}

/// Sleep for `duration` unless shutdown is signalled first. Returns `true`
/// on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Run until shutdown is signalled or the sender is dropped.
pub(super) async fn run<T, P>(
    shared: Arc<Shared>,
    processor: Arc<P>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: DeserializeOwned + Send + Sync + 'static,
    P: ItemProcessor<T>,
{
    info!(
        queue = %shared.name,
        partition = %shared.deque.partition(),
        "work queue processor started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let head = match shared.deque.peek_first_at() {
            Ok(head) => head,
            Err(e) => {
                error!(queue = %shared.name, error = %e, "failed to read queue head");
                shared.record_error(format!("storage: {e}"));
                if pause(&mut shutdown, shared.settings.storage_backoff()).await {
                    break;
                }
                continue;
            }
        };

        let Some((position, raw)) = head else {
            shared.set_state(WorkerState::Idle);
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(shared.settings.idle_poll_interval()) => {
                    if let Err(e) = shared.deque.refresh() {
                        warn!(queue = %shared.name, error = %e, "failed to refresh queue bounds");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            continue;
        };

        shared.set_state(WorkerState::Running);
        match handle_head::<T, P>(&shared, &processor, position, &raw, &mut shutdown).await {
            Step::Continue => {}
            Step::Backoff => {
                if pause(&mut shutdown, shared.settings.retry_interval()).await {
                    break;
                }
            }
            Step::Stop => break,
        }
    }

    shared.set_state(WorkerState::Closed);
    info!(queue = %shared.name, "work queue processor stopped");
}

/// Process the item at the head. It is only removed once the outcome is
/// known, so an item in flight at a crash is delivered again on restart.
/// Removal targets `position`, not whatever is at the head by then.
async fn handle_head<T, P>(
    shared: &Shared,
    processor: &Arc<P>,
    position: Position,
    raw: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Step
where
    T: DeserializeOwned + Send + Sync + 'static,
    P: ItemProcessor<T>,
{
    let queued: QueuedItem<T> = match serde_json::from_str(raw) {
        Ok(queued) => queued,
        Err(e) => {
            error!(queue = %shared.name, error = %e, "undecodable item at head, discarding");
            shared.record_error(format!("undecodable item discarded: {e}"));
            shared.stats().discarded += 1;
            shared.count_processed("discarded");
            return remove_head(shared, position, shutdown).await;
        }
    };

    let id = queued.id;
    let age = queued.age(Utc::now());
    let description = processor.convert_to_debug_string(&queued.item);
    let span = start_item_span(&shared.name, &id.0);

    let started = Instant::now();
    let (result, failure) = match attempt(Arc::clone(processor), queued.item, span.clone()).await {
        Ok(result) => (result, None),
        Err(e) => (ProcessResult::Failed, Some(e.to_string())),
    };
    metrics::processing_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("queue", shared.name.clone())],
    );

    match result {
        ProcessResult::Success => {
            record_outcome(&span, "success");
            debug!(queue = %shared.name, id = %id, "item processed");
            shared.stats().succeeded += 1;
            shared.count_processed("success");
            remove_head(shared, position, shutdown).await
        }
        ProcessResult::Retry if age >= shared.settings.retry_discard_age() => {
            record_outcome(&span, "discarded");
            let message = format!(
                "discarding item {id} after {}s, exceeded retry discard age: {description}",
                age.as_secs()
            );
            warn!(queue = %shared.name, id = %id, age_secs = age.as_secs(), "{message}");
            shared.record_error(message);
            shared.stats().discarded += 1;
            shared.count_processed("discarded");
            remove_head(shared, position, shutdown).await
        }
        ProcessResult::Retry => {
            record_outcome(&span, "retry");
            debug!(
                queue = %shared.name,
                id = %id,
                retry_in_ms = shared.settings.retry_interval().as_millis() as u64,
                "item will be retried"
            );
            shared.stats().retried += 1;
            shared.count_processed("retry");
            Step::Backoff
        }
        ProcessResult::Failed => {
            record_outcome(&span, "failed");
            let reason = failure.unwrap_or_else(|| "item processor reported failure".to_string());
            let message = format!("item {id} failed, discarding: {reason}: {description}");
            error!(queue = %shared.name, id = %id, "{message}");
            shared.record_error(message);
            shared.stats().failed += 1;
            shared.count_processed("failed");
            remove_head(shared, position, shutdown).await
        }
    }
}

/// Drop the processed item, retrying storage errors with `storage_backoff`
/// until it sticks or shutdown arrives.
async fn remove_head(
    shared: &Shared,
    position: Position,
    shutdown: &mut watch::Receiver<bool>,
) -> Step {
    loop {
        match shared.deque.remove_at(position) {
            Ok(true) => return Step::Continue,
            Ok(false) => {
                debug!(queue = %shared.name, ?position, "processed item already removed");
                return Step::Continue;
            }
            Err(e) => {
                error!(queue = %shared.name, error = %e, "failed to remove processed item");
                shared.record_error(format!("storage: {e}"));
                if pause(shutdown, shared.settings.storage_backoff()).await {
                    return Step::Stop;
                }
            }
        }
    }
}

/// Aborts the wrapped task when dropped, so aborting the worker doesn't leave
/// an item processor running on its own.
struct AbortOnDrop<R>(JoinHandle<R>);

impl<R> Drop for AbortOnDrop<R> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one `process` call on its own task so a panic stays contained.
async fn attempt<T, P>(
    processor: Arc<P>,
    item: T,
    span: tracing::Span,
) -> Result<ProcessResult, ProcessingError>
where
    T: Send + Sync + 'static,
    P: ItemProcessor<T>,
{
    let mut task = AbortOnDrop(tokio::spawn(
        async move { processor.process(&item).await }.instrument(span),
    ));

    match (&mut task.0).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ProcessingError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(ProcessingError::downstream(format!(
            "item processor task cancelled: {e}"
        ))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
