//! In-memory store. Same ordering semantics as SQLite, no durability.

use std::collections::{BTreeMap, HashMap, btree_map};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Direction, KvStore};
use crate::error::{Error, Result};

type Partitions = HashMap<String, BTreeMap<String, String>>;

#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<Partitions>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Partitions>> {
        self.partitions
            .read()
            .map_err(|e| Error::LockPoisoned(format!("memory store: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Partitions>> {
        self.partitions
            .write()
            .map_err(|e| Error::LockPoisoned(format!("memory store: {e}")))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, partition: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .read()?
            .get(partition)
            .and_then(|p| p.get(key))
            .cloned())
    }

    fn put(&self, partition: &str, key: &str, value: &str) -> Result<()> {
        self.write()?
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn insert(&self, partition: &str, key: &str, value: &str) -> Result<bool> {
        let mut partitions = self.write()?;
        match partitions
            .entry(partition.to_string())
            .or_default()
            .entry(key.to_string())
        {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(true)
            }
            btree_map::Entry::Occupied(_) => Ok(false),
        }
    }

    fn remove(&self, partition: &str, key: &str) -> Result<bool> {
        Ok(self
            .write()?
            .get_mut(partition)
            .is_some_and(|p| p.remove(key).is_some()))
    }

    fn size(&self, partition: &str) -> Result<u64> {
        Ok(self.read()?.get(partition).map_or(0, |p| p.len() as u64))
    }

    fn truncate(&self, partition: &str) -> Result<()> {
        self.write()?.remove(partition);
        Ok(())
    }

    fn scan(
        &self,
        partition: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let partitions = self.read()?;
        let Some(entries) = partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let clone = |(k, v): (&String, &String)| (k.clone(), v.clone());
        let out = match direction {
            Direction::Ascending => entries
                .range::<str, _>((Bound::Included(from), Bound::Unbounded))
                .take(limit)
                .map(clone)
                .collect(),
            Direction::Descending => entries
                .range::<str, _>((Bound::Unbounded, Bound::Included(from)))
                .rev()
                .take(limit)
                .map(clone)
                .collect(),
        };
        Ok(out)
    }
}
