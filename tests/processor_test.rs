//! Integration tests for the work queue processor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use workq::engine::DropReason;
use workq::error::{Error, ProcessingError, Result};
use workq::model::{QueuedItem, WorkerState};
use workq::storage::{Direction, KvStore, MemoryStore, SqliteStore};
use workq::{
    ItemProcessor, PersistentDeque, ProcessResult, SubmitResult, WorkQueueProcessor,
    WorkQueueSettings,
};

fn fast_settings() -> workq::config::WorkQueueSettingsBuilder {
    WorkQueueSettings::builder()
        .retry_interval(Duration::from_millis(10))
        .idle_poll_interval(Duration::from_millis(20))
        .storage_backoff(Duration::from_millis(10))
        .shutdown_timeout(Duration::from_millis(200))
}

fn memory_deque(partition: &str) -> Arc<PersistentDeque> {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    Arc::new(PersistentDeque::open(store, partition).unwrap())
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ---------------------------------------------------------------------------
// Test processors
// ---------------------------------------------------------------------------

/// Records every item and reports success.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

impl ItemProcessor<u32> for Recorder {
    async fn process(&self, item: &u32) -> std::result::Result<ProcessResult, ProcessingError> {
        self.seen.lock().unwrap().push(*item);
        Ok(ProcessResult::Success)
    }

    fn convert_to_debug_string(&self, item: &u32) -> String {
        format!("item #{item}")
    }
}

/// Asks for a retry every time.
#[derive(Clone, Default)]
struct AlwaysRetry {
    attempts: Arc<AtomicUsize>,
}

impl ItemProcessor<u32> for AlwaysRetry {
    async fn process(&self, _item: &u32) -> std::result::Result<ProcessResult, ProcessingError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessResult::Retry)
    }

    fn convert_to_debug_string(&self, item: &u32) -> String {
        format!("item #{item}")
    }
}

/// Never finishes. Flags once the first attempt has started.
#[derive(Clone, Default)]
struct Stuck {
    started: Arc<AtomicBool>,
}

impl ItemProcessor<u32> for Stuck {
    async fn process(&self, _item: &u32) -> std::result::Result<ProcessResult, ProcessingError> {
        self.started.store(true, Ordering::SeqCst);
        std::future::pending().await
    }

    fn convert_to_debug_string(&self, item: &u32) -> String {
        format!("item #{item}")
    }
}

/// Misbehaves differently on items 1, 2 and 3; records the rest.
#[derive(Clone, Default)]
struct Unreliable {
    succeeded: Arc<Mutex<Vec<u32>>>,
}

impl ItemProcessor<u32> for Unreliable {
    async fn process(&self, item: &u32) -> std::result::Result<ProcessResult, ProcessingError> {
        match *item {
            1 => panic!("handler blew up on item 1"),
            2 => Err(ProcessingError::downstream("connection refused")),
            3 => Ok(ProcessResult::Failed),
            n => {
                self.succeeded.lock().unwrap().push(n);
                Ok(ProcessResult::Success)
            }
        }
    }

    fn convert_to_debug_string(&self, item: &u32) -> String {
        format!("item #{item}")
    }
}

/// Records every item; holds item 1 until a permit is released.
#[derive(Clone)]
struct Gated {
    seen: Arc<Mutex<Vec<u32>>>,
    release: Arc<tokio::sync::Semaphore>,
}

impl ItemProcessor<u32> for Gated {
    async fn process(&self, item: &u32) -> std::result::Result<ProcessResult, ProcessingError> {
        self.seen.lock().unwrap().push(*item);
        if *item == 1 {
            let _permit = self
                .release
                .acquire()
                .await
                .map_err(|e| ProcessingError::downstream(e.to_string()))?;
        }
        Ok(ProcessResult::Success)
    }

    fn convert_to_debug_string(&self, item: &u32) -> String {
        format!("item #{item}")
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drains_all_items_in_order_exactly_once() {
    let recorder = Recorder::default();
    let settings = fast_settings().max_events(5).build().unwrap();
    let processor = WorkQueueProcessor::<u32>::new(
        "ordered",
        memory_deque("ordered"),
        settings,
        recorder.clone(),
    );

    for i in 0..7 {
        assert!(eventually(Duration::from_secs(2), || processor.queue_size() < 5).await);
        assert!(processor.submit(i).is_queued());
    }

    assert!(eventually(Duration::from_secs(2), || recorder.seen().len() == 7).await);
    assert!(eventually(Duration::from_secs(1), || processor.queue_size() == 0).await);
    assert_eq!(recorder.seen(), (0..7).collect::<Vec<_>>());

    let info = processor.debug_info();
    assert_eq!(info["items_submitted"], "7");
    assert_eq!(info["items_succeeded"], "7");
    assert_eq!(info["items_dropped"], "0");

    processor.close().await;
}

#[tokio::test]
async fn item_pushed_ahead_of_the_one_in_flight_is_still_delivered() {
    let deque = memory_deque("jump");
    let gated = Gated {
        seen: Arc::new(Mutex::new(Vec::new())),
        release: Arc::new(tokio::sync::Semaphore::new(0)),
    };
    let processor = WorkQueueProcessor::<u32>::new(
        "jump",
        Arc::clone(&deque),
        fast_settings().build().unwrap(),
        gated.clone(),
    );

    processor.submit(1);
    assert!(eventually(Duration::from_secs(2), || *gated.seen.lock().unwrap() == [1]).await);

    let urgent = serde_json::to_string(&QueuedItem::new(2u32)).unwrap();
    deque.add_first(&urgent).unwrap();
    gated.release.add_permits(1);

    assert!(eventually(Duration::from_secs(2), || gated.seen.lock().unwrap().len() == 2).await);
    assert!(eventually(Duration::from_secs(1), || processor.queue_size() == 0).await);
    assert_eq!(*gated.seen.lock().unwrap(), [1, 2]);
    assert_eq!(processor.debug_info()["items_succeeded"], "2");

    processor.close().await;
}

#[tokio::test]
async fn retried_item_is_discarded_after_discard_age() {
    let retry = AlwaysRetry::default();
    let settings = fast_settings()
        .retry_discard_age(Duration::from_millis(150))
        .build()
        .unwrap();
    let processor =
        WorkQueueProcessor::<u32>::new("retry", memory_deque("retry"), settings, retry.clone());

    assert!(processor.submit(42).is_queued());
    assert!(eventually(Duration::from_secs(3), || processor.queue_size() == 0).await);

    let attempts = retry.attempts.load(Ordering::SeqCst);
    assert!(attempts >= 2, "expected several attempts, got {attempts}");

    let info = processor.debug_info();
    assert_eq!(info["items_discarded"], "1");
    assert!(info["last_error"].contains("retry discard age"));
    assert!(info["last_error"].contains("item #42"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(retry.attempts.load(Ordering::SeqCst), attempts);

    processor.close().await;
}

#[tokio::test]
async fn retry_holds_the_head_until_it_ages_out() {
    let retry = AlwaysRetry::default();
    let settings = fast_settings()
        .retry_discard_age(Duration::from_secs(3600))
        .build()
        .unwrap();
    let processor =
        WorkQueueProcessor::<u32>::new("head", memory_deque("head"), settings, retry.clone());

    processor.submit(1);
    processor.submit(2);

    assert!(
        eventually(Duration::from_secs(2), || {
            retry.attempts.load(Ordering::SeqCst) >= 3
        })
        .await
    );
    assert_eq!(processor.queue_size(), 2);
    assert_eq!(processor.state(), WorkerState::Running);

    processor.close().await;
}

#[tokio::test]
async fn failing_items_do_not_stop_the_queue() {
    let unreliable = Unreliable::default();
    let settings = fast_settings().build().unwrap();
    let processor = WorkQueueProcessor::<u32>::new(
        "unreliable",
        memory_deque("unreliable"),
        settings,
        unreliable.clone(),
    );

    for i in 0..5 {
        processor.submit(i);
    }

    assert!(
        eventually(Duration::from_secs(2), || {
            unreliable.succeeded.lock().unwrap().len() == 2
        })
        .await
    );
    assert!(eventually(Duration::from_secs(1), || processor.queue_size() == 0).await);
    assert_eq!(*unreliable.succeeded.lock().unwrap(), [0, 4]);

    let info = processor.debug_info();
    assert_eq!(info["items_failed"], "3");
    assert_eq!(info["items_succeeded"], "2");
    assert!(info.contains_key("last_error_at"));

    processor.close().await;
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_past_max_events_drops() {
    let settings = fast_settings().max_events(3).build().unwrap();
    let processor =
        WorkQueueProcessor::<u32>::new("full", memory_deque("full"), settings, Stuck::default());

    let results: Vec<SubmitResult> = (0..5).map(|i| processor.submit(i)).collect();

    assert!(results[..3].iter().all(SubmitResult::is_queued));
    assert!(
        results[3..]
            .iter()
            .all(|r| *r == SubmitResult::Dropped(DropReason::QueueFull))
    );
    assert_eq!(processor.queue_size(), 3);

    let info = processor.debug_info();
    assert_eq!(info["items_submitted"], "3");
    assert_eq!(info["items_dropped"], "2");
    assert_eq!(info["max_events"], "3");

    processor.close().await;
}

#[tokio::test]
async fn submit_after_close_is_dropped() {
    let settings = fast_settings().build().unwrap();
    let processor = WorkQueueProcessor::<u32>::new(
        "closed",
        memory_deque("closed"),
        settings,
        Recorder::default(),
    );

    processor.close().await;

    assert_eq!(processor.state(), WorkerState::Closed);
    assert_eq!(
        processor.submit(1),
        SubmitResult::Dropped(DropReason::Closed)
    );
    assert_eq!(processor.queue_size(), 0);

    // A second close is a no-op.
    processor.close().await;
}

#[tokio::test]
async fn eldest_item_reports_head_submit_time() {
    let settings = fast_settings().build().unwrap();
    let processor = WorkQueueProcessor::<u32>::new(
        "eldest",
        memory_deque("eldest"),
        settings,
        Stuck::default(),
    );

    assert_eq!(processor.eldest_item(), None);

    let before = chrono::Utc::now();
    processor.submit(1);
    processor.submit(2);
    let after = chrono::Utc::now();

    let eldest = processor.eldest_item().expect("head should have a timestamp");
    assert!(before <= eldest && eldest <= after);
    assert_eq!(processor.debug_info()["eldest_item"], eldest.to_rfc3339());

    processor.close().await;
}

// ---------------------------------------------------------------------------
// Shutdown and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_with_stuck_processor_returns_and_keeps_item() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let deque = Arc::new(PersistentDeque::open(store, "stuck").unwrap());
        let stuck = Stuck::default();
        let processor = WorkQueueProcessor::<u32>::new(
            "stuck",
            deque,
            fast_settings().build().unwrap(),
            stuck.clone(),
        );

        processor.submit(7);
        assert!(eventually(Duration::from_secs(2), || stuck.started.load(Ordering::SeqCst)).await);

        let started = Instant::now();
        processor.close().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(processor.queue_size(), 1);
    }

    // The interrupted item is delivered again after a restart.
    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let deque = Arc::new(PersistentDeque::open(store, "stuck").unwrap());
    assert_eq!(deque.size().unwrap(), 1);

    let recorder = Recorder::default();
    let processor = WorkQueueProcessor::<u32>::new(
        "stuck",
        deque,
        fast_settings().build().unwrap(),
        recorder.clone(),
    );
    assert!(eventually(Duration::from_secs(2), || recorder.seen() == [7]).await);

    processor.close().await;
}

#[tokio::test]
async fn idle_poll_picks_up_items_from_another_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let open = |partition: &str| {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
        Arc::new(PersistentDeque::open(store, partition).unwrap())
    };

    let recorder = Recorder::default();
    let processor = WorkQueueProcessor::<u32>::new(
        "shared",
        open("shared"),
        fast_settings().build().unwrap(),
        recorder.clone(),
    );

    let outside = open("shared");
    for i in [10u32, 11] {
        let raw = serde_json::to_string(&QueuedItem::new(i)).unwrap();
        outside.add_last(&raw).unwrap();
    }

    assert!(eventually(Duration::from_secs(2), || recorder.seen() == [10, 11]).await);
    assert!(eventually(Duration::from_secs(1), || processor.queue_size() == 0).await);

    processor.close().await;
}

#[tokio::test]
async fn undecodable_head_is_discarded() {
    let deque = memory_deque("garbage");
    deque.add_last("not an envelope").unwrap();

    let recorder = Recorder::default();
    let processor = WorkQueueProcessor::<u32>::new(
        "garbage",
        Arc::clone(&deque),
        fast_settings().build().unwrap(),
        recorder.clone(),
    );
    processor.submit(5);

    assert!(eventually(Duration::from_secs(2), || recorder.seen() == [5]).await);
    assert_eq!(processor.debug_info()["items_discarded"], "1");

    processor.close().await;
}

/// Fails reads and removals while `failing` is set.
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Other("injected storage fault".to_string()))
        } else {
            Ok(())
        }
    }
}

impl KvStore for FlakyStore {
    fn get(&self, partition: &str, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(partition, key)
    }

    fn put(&self, partition: &str, key: &str, value: &str) -> Result<()> {
        self.inner.put(partition, key, value)
    }

    fn insert(&self, partition: &str, key: &str, value: &str) -> Result<bool> {
        self.inner.insert(partition, key, value)
    }

    fn remove(&self, partition: &str, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.remove(partition, key)
    }

    fn size(&self, partition: &str) -> Result<u64> {
        self.inner.size(partition)
    }

    fn truncate(&self, partition: &str) -> Result<()> {
        self.inner.truncate(partition)
    }

    fn scan(
        &self,
        partition: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        self.check()?;
        self.inner.scan(partition, from, direction, limit)
    }
}

#[tokio::test]
async fn storage_errors_pause_the_loop_until_the_store_recovers() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failing: AtomicBool::new(false),
    });
    let dyn_store: Arc<dyn KvStore> = Arc::clone(&store) as Arc<dyn KvStore>;
    let deque = Arc::new(PersistentDeque::open(dyn_store, "flaky").unwrap());

    store.failing.store(true, Ordering::SeqCst);
    let recorder = Recorder::default();
    let processor = WorkQueueProcessor::<u32>::new(
        "flaky",
        deque,
        fast_settings().build().unwrap(),
        recorder.clone(),
    );
    assert!(processor.submit(9).is_queued());

    assert!(
        eventually(Duration::from_secs(2), || {
            processor
                .debug_info()
                .get("last_error")
                .is_some_and(|e| e.contains("injected storage fault"))
        })
        .await
    );
    assert!(recorder.seen().is_empty());

    store.failing.store(false, Ordering::SeqCst);
    assert!(eventually(Duration::from_secs(2), || recorder.seen() == [9]).await);
    assert!(eventually(Duration::from_secs(1), || processor.queue_size() == 0).await);

    processor.close().await;
}
