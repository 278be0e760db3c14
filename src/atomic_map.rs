//! A hash map for tables that are written rarely and read on the hot path: writers serialize on
//!  a mutex and publish a fresh immutable snapshot; readers follow a single atomic pointer
//!  without taking any lock. Superseded snapshots are retained until the map is dropped, which
//!  is acceptable here because the proxy's endpoint and circuit tables only ever grow (circuits
//!  accumulate for the life of the process).

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::hash::Hash;

use rustc_hash::FxHashMap;

pub struct AtomicMap<K, V> {
    current: AtomicPtr<Arc<FxHashMap<K, V>>>,
    // holds every snapshot ever published, so readers can dereference `current` lock-free
    retained: Mutex<Vec<Box<Arc<FxHashMap<K, V>>>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        let initial = Box::new(Arc::new(FxHashMap::default()));
        let raw = Box::into_raw(initial);
        AtomicMap {
            current: AtomicPtr::new(raw),
            retained: Mutex::new(vec![unsafe { Box::from_raw(raw) }]),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    /// An immutable snapshot of the map's current contents.
    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        let raw = self.current.load(Ordering::Acquire);
        // the pointee is kept alive by `retained` for as long as `self` lives
        unsafe { (*raw).clone() }
    }

    /// Inserts a binding, publishing a new snapshot. Concurrent writers are serialized; the
    ///  binding is immutable once published.
    pub fn insert(&self, key: K, value: V) {
        self.update(|map| {
            map.insert(key.clone(), value.clone());
        });
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        let mut retained = self.retained.lock()
            .expect("atomic map writer lock poisoned");

        let mut next = FxHashMap::clone(&self.snapshot());
        f(&mut next);

        let boxed = Box::new(Arc::new(next));
        let raw = Box::into_raw(boxed);
        self.current.store(raw, Ordering::Release);
        retained.push(unsafe { Box::from_raw(raw) });
    }
}
