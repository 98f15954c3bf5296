//! # Record Store
//!
//! Concurrency-safe keyed storage shared by every registry kind.
//!
//! Each registry owns one [`RecordStore`] instance, injected at construction
//! by the curator facade; there is no ambient global state. Records are held
//! behind `Arc`, so a reader always gets a complete record and never observes
//! a half-written one.
//!
//! ## Concurrency contract
//!
//! - `put` / `delete` / `update` / `upsert_with` serialize per key (the
//!   key's shard is write locked for the duration of the swap), so no update
//!   is lost.
//! - `list` copies `Arc` handles shard by shard and sorts them afterwards; it
//!   never holds more than one shard read lock at a time and never blocks
//!   writers for longer than one shard scan.
//! - Ordering of `list` is insertion order of the key. Replacing an existing
//!   key keeps its original position.

pub mod key;

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub use key::ScopedKey;

/// A stored record plus its insertion sequence number.
#[derive(Debug)]
struct Slot<V> {
    seq: u64,
    record: Arc<V>,
}

/// Keyed record storage for one registry kind.
#[derive(Debug)]
pub struct RecordStore<K, V>
where
    K: Eq + Hash,
{
    /// Registry kind name, used in logs and health reports.
    kind: &'static str,
    entries: DashMap<K, Slot<V>>,
    next_seq: AtomicU64,
}

impl<K, V> RecordStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty store for the given registry kind.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Registry kind name.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Upsert a record. Returns the previous record if the key existed.
    pub fn put(&self, key: K, record: V) -> Option<Arc<V>> {
        let record = Arc::new(record);
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let previous = std::mem::replace(&mut occupied.get_mut().record, record);
                Some(previous)
            }
            Entry::Vacant(vacant) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot { seq, record });
                None
            }
        }
    }

    /// Fetch a record by key.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|slot| Arc::clone(&slot.record))
    }

    /// Whether a record exists for the key.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Point-in-time list of records matching `predicate`, in insertion order.
    pub fn list<F>(&self, predicate: F) -> Vec<Arc<V>>
    where
        F: Fn(&V) -> bool,
    {
        let mut matched: Vec<(u64, Arc<V>)> = self
            .entries
            .iter()
            .filter(|slot| predicate(&slot.record))
            .map(|slot| (slot.seq, Arc::clone(&slot.record)))
            .collect();
        matched.sort_by_key(|(seq, _)| *seq);
        matched.into_iter().map(|(_, record)| record).collect()
    }

    /// All records, in insertion order.
    pub fn all(&self) -> Vec<Arc<V>> {
        self.list(|_| true)
    }

    /// Remove a record. Returns whether anything was removed.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).is_some()
    }

    /// Remove every record matching `predicate` and return the removed records.
    ///
    /// Each removal is its own per-key operation; a concurrent `put` of a
    /// matching key after the scan is not removed.
    pub fn delete_where<F>(&self, predicate: F) -> Vec<Arc<V>>
    where
        F: Fn(&K, &V) -> bool,
    {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|slot| predicate(slot.key(), &slot.record))
            .map(|slot| slot.key().clone())
            .collect();

        keys.iter()
            .filter_map(|key| self.entries.remove(key).map(|(_, slot)| slot.record))
            .collect()
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `f` runs while the key is locked and computes the replacement from the
    /// current record. Returns `None` when the key is absent, otherwise the
    /// result of `f` (the stored replacement on success).
    pub fn update<Q, F, E>(&self, key: &Q, f: F) -> Option<Result<Arc<V>, E>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> Result<V, E>,
    {
        let mut slot = self.entries.get_mut(key)?;
        let outcome = f(&slot.record).map(|next| {
            let next = Arc::new(next);
            slot.record = Arc::clone(&next);
            next
        });
        Some(outcome)
    }

    /// Atomic insert-or-replace computed from the current record, if any.
    ///
    /// On success returns the stored record and the one it replaced. On
    /// error nothing is written.
    pub fn upsert_with<F, E>(&self, key: K, f: F) -> Result<(Arc<V>, Option<Arc<V>>), E>
    where
        F: FnOnce(Option<&V>) -> Result<V, E>,
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let next = Arc::new(f(Some(occupied.get().record.as_ref()))?);
                let previous = std::mem::replace(&mut occupied.get_mut().record, Arc::clone(&next));
                Ok((next, Some(previous)))
            }
            Entry::Vacant(vacant) => {
                let next = Arc::new(f(None)?);
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot {
                    seq,
                    record: Arc::clone(&next),
                });
                Ok((next, None))
            }
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_and_replace() {
        let store: RecordStore<String, u32> = RecordStore::new("numbers");
        assert!(store.put("a".to_string(), 1).is_none());
        let previous = store.put("a".to_string(), 2);
        assert_eq!(previous.as_deref(), Some(&1));
        assert_eq!(store.get("a").as_deref(), Some(&2));
        assert_eq!(store.len(), 1);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_list_keeps_insertion_order_across_replacement() {
        let store: RecordStore<String, u32> = RecordStore::new("numbers");
        store.put("c".to_string(), 3);
        store.put("a".to_string(), 1);
        store.put("b".to_string(), 2);
        store.put("c".to_string(), 30);

        let all: Vec<u32> = store.all().iter().map(|v| **v).collect();
        assert_eq!(all, vec![30, 1, 2]);

        let odd: Vec<u32> = store.list(|v| v % 2 == 1).iter().map(|v| **v).collect();
        assert_eq!(odd, vec![1]);
    }

    #[test]
    fn test_delete_reports_removal() {
        let store: RecordStore<String, u32> = RecordStore::new("numbers");
        store.put("a".to_string(), 1);
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_where() {
        let store: RecordStore<String, u32> = RecordStore::new("numbers");
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            store.put(key.to_string(), i as u32);
        }
        let removed = store.delete_where(|_, v| v % 2 == 0);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let store: RecordStore<String, u32> = RecordStore::new("numbers");
        assert!(store
            .update("missing", |v: &u32| Ok::<_, ()>(v + 1))
            .is_none());

        store.put("a".to_string(), 1);
        let updated = store.update("a", |v| Ok::<_, ()>(v + 1)).unwrap().unwrap();
        assert_eq!(*updated, 2);

        let rejected = store.update("a", |_| Err::<u32, _>("nope")).unwrap();
        assert_eq!(rejected.unwrap_err(), "nope");
        assert_eq!(store.get("a").as_deref(), Some(&2));
    }

    #[test]
    fn test_upsert_with_sees_current_record() {
        let store: RecordStore<String, u32> = RecordStore::new("numbers");
        let (stored, previous) = store
            .upsert_with("a".to_string(), |current| Ok::<_, ()>(current.map_or(1, |v| v + 10)))
            .unwrap();
        assert_eq!((*stored, previous), (1, None));

        let (stored, previous) = store
            .upsert_with("a".to_string(), |current| Ok::<_, ()>(current.map_or(1, |v| v + 10)))
            .unwrap();
        assert_eq!(*stored, 11);
        assert_eq!(previous.as_deref(), Some(&1));

        let rejected = store.upsert_with("b".to_string(), |_| Err::<u32, _>("no"));
        assert!(rejected.is_err());
        assert!(!store.contains("b"));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store: Arc<RecordStore<String, u64>> = Arc::new(RecordStore::new("counters"));
        store.put("hits".to_string(), 0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..500 {
                        store.update("hits", |v| Ok::<_, ()>(v + 1));
                    }
                });
            }
        });

        assert_eq!(store.get("hits").as_deref(), Some(&4000));
    }

    #[test]
    fn test_concurrent_distinct_puts() {
        let store: Arc<RecordStore<String, usize>> = Arc::new(RecordStore::new("numbers"));
        std::thread::scope(|scope| {
            for t in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for i in 0..100 {
                        store.put(format!("{}-{}", t, i), i);
                    }
                });
            }
        });
        assert_eq!(store.len(), 800);
        assert_eq!(store.all().len(), 800);
    }
}
