// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use dashmap::{mapref::entry::Entry, DashMap};
use std::{fmt::Debug, hash::Hash};

/// A sharded map safe for concurrent use without a global lock
///
/// Values are handed out by clone, so no shard lock is ever held by a caller;
/// store `Arc`s for anything expensive or shared-mutable.
pub struct ConcurrentMap<K, V>
where
  K: Eq + Hash,
{
  items: DashMap<K, V>,
}

impl<K, V> Default for ConcurrentMap<K, V>
where
  K: Eq + Hash,
{
  fn default() -> Self {
    Self {
      items: Default::default(),
    }
  }
}

impl<K, V> Debug for ConcurrentMap<K, V>
where
  K: Eq + Hash + Debug,
  V: Debug,
{
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConcurrentMap")
      .field("items", &self.items)
      .finish()
  }
}

impl<K, V> ConcurrentMap<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn load(&self, key: &K) -> Option<V> {
    self.items.get(key).map(|item| item.value().clone())
  }

  /// Inserts `value` unless `key` is already present.
  ///
  /// Returns the value now associated with `key`, and whether it was already present.
  pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
    match self.items.entry(key) {
      Entry::Occupied(existing) => (existing.get().clone(), true),
      Entry::Vacant(vacant) => {
        vacant.insert(value.clone());
        (value, false)
      }
    }
  }

  pub fn store(&self, key: K, value: V) -> Option<V> {
    self.items.insert(key, value)
  }

  pub fn delete(&self, key: &K) -> Option<V> {
    self.items.remove(key).map(|(_, value)| value)
  }

  /// Removes `key` only while its current value satisfies `predicate`
  pub fn delete_if<F: FnOnce(&V) -> bool>(&self, key: &K, predicate: F) -> Option<V> {
    self
      .items
      .remove_if(key, |_, value| predicate(value))
      .map(|(_, value)| value)
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// A point-in-time copy of all entries, ordered by key
  pub fn snapshot(&self) -> Vec<(K, V)>
  where
    K: Ord,
  {
    let mut entries: Vec<(K, V)> = self
      .items
      .iter()
      .map(|item| (item.key().clone(), item.value().clone()))
      .collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    entries
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::ConcurrentMap;

  #[test]
  fn load_or_store_keeps_first_writer() {
    let map = ConcurrentMap::<String, u32>::new();
    assert_eq!(map.load_or_store("a".into(), 1), (1, false));
    assert_eq!(map.load_or_store("a".into(), 2), (1, true));
    assert_eq!(map.load(&"a".into()), Some(1));
  }

  #[test]
  fn snapshot_is_ordered_by_key() {
    let map = ConcurrentMap::<String, u32>::new();
    for (k, v) in [("charlie", 3), ("alpha", 1), ("bravo", 2)] {
      map.store(k.into(), v);
    }
    assert_eq!(
      map.snapshot(),
      vec![
        (String::from("alpha"), 1),
        (String::from("bravo"), 2),
        (String::from("charlie"), 3),
      ]
    );
  }

  #[test]
  fn delete_if_checks_current_value() {
    let map = ConcurrentMap::<String, Arc<u32>>::new();
    let first = Arc::new(1);
    map.store("a".into(), Arc::clone(&first));
    assert!(map.delete_if(&"a".into(), |v| !Arc::ptr_eq(v, &first)).is_none());
    assert!(map.delete_if(&"a".into(), |v| Arc::ptr_eq(v, &first)).is_some());
    assert!(map.load(&"a".into()).is_none());
  }

  #[tokio::test]
  async fn concurrent_load_or_store_has_one_winner() {
    let map = Arc::new(ConcurrentMap::<String, usize>::new());
    let tasks = (0..64).map(|i| {
      let map = Arc::clone(&map);
      tokio::spawn(async move { map.load_or_store("conn".into(), i) })
    });
    let results = futures::future::join_all(tasks).await;
    let winners = results
      .iter()
      .filter(|r| !r.as_ref().unwrap().1)
      .count();
    assert_eq!(winners, 1);
    let stored = map.load(&"conn".into()).unwrap();
    assert!(results.iter().all(|r| r.as_ref().unwrap().0 == stored));
  }
}
