//! Persistent double-ended queue over one partition of a [`KvStore`].
//!
//! Items live under zero-padded decimal position keys, so the store's lexical
//! order is the queue order and a range scan from the head key walks the queue
//! front to back. Items occupy positions `[head, tail]`; the deque is empty
//! when `tail == head - 1`.
//!
//! The pointers are never written to the store. They are derived from the
//! first and last keys in the partition, which makes every mutation a
//! single-key operation: a crash between two calls can't leave an index
//! disagreeing with the items.
//!
//! Several instances may share a partition, in one process or across
//! processes on the same SQLite file. Writes go through
//! [`KvStore::insert`], so an instance never overwrites a key another one
//! took; on a conflict it re-derives its bounds and writes past them. Items
//! written by others become visible whenever an instance re-derives: after
//! a write conflict, when it runs empty, and on [`PersistentDeque::refresh`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::{Direction, KvStore};
use crate::telemetry::metrics;

/// Position of the first item inserted into an empty deque.
const ORIGIN: u64 = 1 << 63;

/// Entries fetched per store scan while iterating.
const SCAN_CHUNK: usize = 64;

/// Re-derivations a single write may trigger before giving up.
const MAX_WRITE_CONFLICTS: usize = 16;

fn position_key(position: u64) -> String {
    format!("{position:020}")
}

/// Inclusive item range. `tail < head` means no positions at all; `gaps`
/// counts positions inside the range whose key is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    head: u64,
    tail: u64,
    gaps: u64,
}

impl Bounds {
    const EMPTY: Bounds = Bounds {
        head: ORIGIN,
        tail: ORIGIN - 1,
        gaps: 0,
    };

    fn single(position: u64) -> Bounds {
        Bounds {
            head: position,
            tail: position,
            gaps: 0,
        }
    }

    fn span(self) -> u64 {
        if self.tail < self.head {
            0
        } else {
            self.tail - self.head + 1
        }
    }

    fn len(self) -> u64 {
        self.span().saturating_sub(self.gaps)
    }

    fn is_empty(self) -> bool {
        self.len() == 0
    }

    fn contains(self, position: u64) -> bool {
        self.head <= position && position <= self.tail
    }
}

#[derive(Debug, Clone, Copy)]
enum End {
    Head,
    Tail,
}

impl End {
    fn name(self) -> &'static str {
        match self {
            End::Head => "head",
            End::Tail => "tail",
        }
    }
}

/// Where an item sits in the deque, as returned by
/// [`PersistentDeque::peek_first_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

/// A crash-tolerant deque of opaque string payloads.
///
/// Mutations are serialized by an internal lock held across the store write
/// and the pointer update. Reads share the lock.
pub struct PersistentDeque {
    store: Arc<dyn KvStore>,
    partition: String,
    bounds: RwLock<Bounds>,
}

impl PersistentDeque {
    /// Bind to `partition`, recovering the head and tail from whatever the
    /// store already holds there.
    pub fn open(store: Arc<dyn KvStore>, partition: impl Into<String>) -> Result<Self> {
        let partition = partition.into();
        let bounds = derive_bounds(store.as_ref(), &partition)?;

        if bounds.gaps > 0 {
            warn!(
                partition = %partition,
                gaps = bounds.gaps,
                "partition has gaps between head and tail"
            );
        }
        debug!(
            partition = %partition,
            head = bounds.head,
            tail = bounds.tail,
            size = bounds.len(),
            "deque opened"
        );

        Ok(Self {
            store,
            partition,
            bounds: RwLock::new(bounds),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Re-read the head and tail from the store, picking up items other
    /// instances wrote to this partition.
    pub fn refresh(&self) -> Result<()> {
        let mut bounds = self.write()?;
        let fresh = derive_bounds(self.store.as_ref(), &self.partition)?;
        if fresh != *bounds {
            debug!(
                partition = %self.partition,
                size = fresh.len(),
                previous = bounds.len(),
                "deque bounds refreshed"
            );
            *bounds = fresh;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    pub fn add_first(&self, item: &str) -> Result<()> {
        let mut bounds = self.write()?;
        self.push(&mut bounds, End::Head, item, None).map(drop)
    }

    pub fn add_last(&self, item: &str) -> Result<()> {
        let mut bounds = self.write()?;
        self.push(&mut bounds, End::Tail, item, None).map(drop)
    }

    /// Append at the tail only if the deque holds fewer than `capacity`
    /// items. The check and the write happen under the same lock, so
    /// concurrent producers on this instance can't overshoot. Returns whether
    /// it was stored.
    pub fn add_last_within(&self, item: &str, capacity: u64) -> Result<bool> {
        let mut bounds = self.write()?;
        self.push(&mut bounds, End::Tail, item, Some(capacity))
    }

    /// Write `item` one slot outside `end`, then move the pointer. A slot
    /// already taken in the store means another instance wrote there, so the
    /// bounds are re-derived and the write retried past them.
    fn push(
        &self,
        bounds: &mut Bounds,
        end: End,
        item: &str,
        capacity: Option<u64>,
    ) -> Result<bool> {
        for _ in 0..MAX_WRITE_CONFLICTS {
            if capacity.is_some_and(|c| bounds.len() >= c) {
                return Ok(false);
            }

            let position = match end {
                End::Head => bounds.head.checked_sub(1),
                End::Tail => bounds.tail.checked_add(1),
            }
            .ok_or(Error::IndexExhausted(end.name()))?;

            if self
                .store
                .insert(&self.partition, &position_key(position), item)?
            {
                if bounds.is_empty() {
                    *bounds = Bounds::single(position);
                } else {
                    match end {
                        End::Head => bounds.head = position,
                        End::Tail => bounds.tail = position,
                    }
                }
                self.count(match end {
                    End::Head => "add_first",
                    End::Tail => "add_last",
                });
                return Ok(true);
            }

            debug!(
                partition = %self.partition,
                position,
                end = end.name(),
                "slot taken by another writer, re-deriving bounds"
            );
            *bounds = derive_bounds(self.store.as_ref(), &self.partition)?;
        }

        Err(Error::WriteConflict(self.partition.clone()))
    }

    /// Same as [`add_last`](Self::add_last).
    pub fn add(&self, item: &str) -> Result<()> {
        self.add_last(item)
    }

    /// Append at the tail, logging instead of failing. Returns whether the
    /// item was stored.
    pub fn offer(&self, item: &str) -> bool {
        match self.add_last(item) {
            Ok(()) => true,
            Err(e) => {
                warn!(partition = %self.partition, error = %e, "offer failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    pub fn remove_first(&self) -> Result<String> {
        self.take(End::Head)?.ok_or(Error::EmptyQueue)
    }

    pub fn remove_last(&self) -> Result<String> {
        self.take(End::Tail)?.ok_or(Error::EmptyQueue)
    }

    /// Same as [`remove_first`](Self::remove_first).
    pub fn remove(&self) -> Result<String> {
        self.remove_first()
    }

    pub fn poll_first(&self) -> Result<Option<String>> {
        self.take(End::Head)
    }

    pub fn poll_last(&self) -> Result<Option<String>> {
        self.take(End::Tail)
    }

    /// Same as [`poll_first`](Self::poll_first).
    pub fn poll(&self) -> Result<Option<String>> {
        self.poll_first()
    }

    /// Remove the item at `position`, wherever it now sits. Returns `false`
    /// if it is already gone.
    ///
    /// Pairs with [`peek_first_at`](Self::peek_first_at): a consumer that
    /// peeks, works, then removes only ever deletes the item it worked on,
    /// even if something was pushed in front of it meanwhile.
    pub fn remove_at(&self, position: Position) -> Result<bool> {
        let mut bounds = self.write()?;
        let Position(position) = position;
        if !bounds.contains(position) {
            return Ok(false);
        }
        if !self.store.remove(&self.partition, &position_key(position))? {
            return Ok(false);
        }

        if bounds.head == bounds.tail {
            *bounds = self.derive_or_empty();
        } else if position == bounds.head {
            bounds.head += 1;
        } else if position == bounds.tail {
            bounds.tail -= 1;
        } else {
            bounds.gaps += 1;
        }

        self.count("remove_at");
        Ok(true)
    }

    fn take(&self, end: End) -> Result<Option<String>> {
        let mut bounds = self.write()?;

        while bounds.span() > 0 {
            let position = match end {
                End::Head => bounds.head,
                End::Tail => bounds.tail,
            };
            let key = position_key(position);
            let value = self.store.get(&self.partition, &key)?;
            if value.is_some() {
                self.store.remove(&self.partition, &key)?;
            } else {
                bounds.gaps = bounds.gaps.saturating_sub(1);
                debug!(
                    partition = %self.partition,
                    key = %key,
                    end = end.name(),
                    "boundary key missing, skipping"
                );
            }

            // The last known position is gone; anything left was written by
            // another instance.
            if bounds.head == bounds.tail {
                *bounds = self.derive_or_empty();
            } else {
                match end {
                    End::Head => bounds.head += 1,
                    End::Tail => bounds.tail -= 1,
                }
            }

            if value.is_some() {
                self.count(match end {
                    End::Head => "remove_first",
                    End::Tail => "remove_last",
                });
                return Ok(value);
            }
        }

        Ok(None)
    }

    /// Bounds after the last known item was removed. The removal already
    /// happened, so a failed read must not turn into an error for the caller.
    fn derive_or_empty(&self) -> Bounds {
        derive_bounds(self.store.as_ref(), &self.partition).unwrap_or_else(|e| {
            warn!(partition = %self.partition, error = %e, "failed to re-derive bounds");
            Bounds::EMPTY
        })
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn peek_first(&self) -> Result<Option<String>> {
        Ok(self.peek_first_at()?.map(|(_, value)| value))
    }

    /// The head item together with its [`Position`], for use with
    /// [`remove_at`](Self::remove_at).
    pub fn peek_first_at(&self) -> Result<Option<(Position, String)>> {
        let bounds = self.read()?;
        Ok(self
            .boundary(*bounds, End::Head)?
            .map(|(position, value)| (Position(position), value)))
    }

    pub fn peek_last(&self) -> Result<Option<String>> {
        let bounds = self.read()?;
        Ok(self.boundary(*bounds, End::Tail)?.map(|(_, value)| value))
    }

    /// Same as [`peek_first`](Self::peek_first).
    pub fn peek(&self) -> Result<Option<String>> {
        self.peek_first()
    }

    fn boundary(&self, bounds: Bounds, end: End) -> Result<Option<(u64, String)>> {
        if bounds.is_empty() {
            return Ok(None);
        }
        let (from, direction) = match end {
            End::Head => (bounds.head, Direction::Ascending),
            End::Tail => (bounds.tail, Direction::Descending),
        };
        let entry = self
            .store
            .scan(&self.partition, &position_key(from), direction, 1)?
            .into_iter()
            .next();

        let Some((key, value)) = entry else {
            return Ok(None);
        };
        let position = parse_position(&self.partition, &key)?;
        Ok(bounds.contains(position).then_some((position, value)))
    }

    /// Number of items, from pointer arithmetic.
    pub fn size(&self) -> Result<u64> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    pub fn clear(&self) -> Result<()> {
        let mut bounds = self.write()?;
        self.store.truncate(&self.partition)?;
        *bounds = Bounds::EMPTY;
        self.count("clear");
        Ok(())
    }

    /// Head to tail over the items present when this is called.
    ///
    /// Weakly consistent: items removed while iterating are skipped, items
    /// added afterwards are not visited.
    pub fn iter(&self) -> Result<Iter<'_>> {
        Ok(Iter::new(self, *self.read()?, Direction::Ascending))
    }

    /// Tail to head, same consistency as [`iter`](Self::iter).
    pub fn descending_iter(&self) -> Result<Iter<'_>> {
        Ok(Iter::new(self, *self.read()?, Direction::Descending))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Bounds>> {
        self.bounds
            .read()
            .map_err(|e| Error::LockPoisoned(format!("deque {}: {e}", self.partition)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Bounds>> {
        self.bounds
            .write()
            .map_err(|e| Error::LockPoisoned(format!("deque {}: {e}", self.partition)))
    }

    fn count(&self, operation: &'static str) {
        metrics::deque_operations().add(
            1,
            &[
                KeyValue::new("partition", self.partition.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

/// Head and tail from the first and last keys, gaps from the key count.
fn derive_bounds(store: &dyn KvStore, partition: &str) -> Result<Bounds> {
    let first = store.scan(partition, "", Direction::Ascending, 1)?;
    let last = store.scan(partition, &position_key(u64::MAX), Direction::Descending, 1)?;

    let mut bounds = match (first.first(), last.first()) {
        (Some((head_key, _)), Some((tail_key, _))) => Bounds {
            head: parse_position(partition, head_key)?,
            tail: parse_position(partition, tail_key)?,
            gaps: 0,
        },
        _ => return Ok(Bounds::EMPTY),
    };
    bounds.gaps = bounds.span().saturating_sub(store.size(partition)?);
    Ok(bounds)
}

fn parse_position(partition: &str, key: &str) -> Result<u64> {
    key.parse().map_err(|_| Error::CorruptKey {
        partition: partition.to_string(),
        key: key.to_string(),
    })
}

/// Lazy iterator over a snapshot of the deque's bounds.
///
/// Fetches [`SCAN_CHUNK`] entries per store call. A store error is yielded
/// once and ends the iteration.
pub struct Iter<'a> {
    deque: &'a PersistentDeque,
    bounds: Bounds,
    direction: Direction,
    cursor: Option<u64>,
    buffer: std::vec::IntoIter<String>,
}

impl<'a> Iter<'a> {
    fn new(deque: &'a PersistentDeque, bounds: Bounds, direction: Direction) -> Self {
        let cursor = if bounds.is_empty() {
            None
        } else {
            match direction {
                Direction::Ascending => Some(bounds.head),
                Direction::Descending => Some(bounds.tail),
            }
        };
        Self {
            deque,
            bounds,
            direction,
            cursor,
            buffer: Vec::new().into_iter(),
        }
    }

    fn fill(&mut self) -> Result<()> {
        let Some(from) = self.cursor.take() else {
            return Ok(());
        };

        let entries = self.deque.store.scan(
            &self.deque.partition,
            &position_key(from),
            self.direction,
            SCAN_CHUNK,
        )?;
        let exhausted = entries.len() < SCAN_CHUNK;

        let mut values = Vec::with_capacity(entries.len());
        let mut last = None;
        for (key, value) in entries {
            let position = parse_position(&self.deque.partition, &key)?;
            if !self.bounds.contains(position) {
                last = None;
                break;
            }
            values.push(value);
            last = Some(position);
        }

        if !exhausted {
            self.cursor = last.and_then(|p| match self.direction {
                Direction::Ascending => p.checked_add(1).filter(|n| *n <= self.bounds.tail),
                Direction::Descending => p.checked_sub(1).filter(|n| *n >= self.bounds.head),
            });
        }
        self.buffer = values.into_iter();
        Ok(())
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.buffer.next() {
                return Some(Ok(value));
            }
            self.cursor?;
            if let Err(e) = self.fill() {
                self.cursor = None;
                return Some(Err(e));
            }
        }
    }
}
