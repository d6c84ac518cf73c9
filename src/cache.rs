//! Named-entry image cache shared between decode workers and views.
//!
//! Two tiers of locking: the structural lock guards the key -> item map and is
//! only held for the map operation itself, while every item carries its own
//! exclusive lock that consumers take with [`Cache::reserve`] (or
//! [`Cache::pin`]) and that eviction must acquire before the item is dropped.
//! The structural lock is never held while waiting for an item lock.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::CacheError;
use crate::loader::DecodedImage;

/// Cache of decoded images keyed by their logical identity (usually the path).
pub type ImageCache = Cache<DecodedImage>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Per-item lock
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ItemState {
    held: bool,
    /// The holder is an eviction, not a consumer; `release` must not undo it.
    evicting: bool,
    /// Set once the item has left the map. Waiters give up instead of acquiring.
    retired: bool,
}

/// Binary lock that can be released from a different call than the one that
/// acquired it, which is what reserve/release needs.
#[derive(Debug, Default)]
struct ItemLock {
    state: Mutex<ItemState>,
    released: Condvar,
}

impl ItemLock {
    /// Blocks until the lock is free. Returns false if the item was evicted
    /// while we were waiting.
    fn acquire(&self) -> bool {
        self.acquire_as(false)
    }

    /// Like `acquire`, but the hold can only be ended by `retire`.
    fn acquire_for_evict(&self) -> bool {
        self.acquire_as(true)
    }

    fn acquire_as(&self, evicting: bool) -> bool {
        let mut state = lock(&self.state);
        while state.held && !state.retired {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.retired {
            return false;
        }
        state.held = true;
        state.evicting = evicting;
        true
    }

    fn try_acquire(&self) -> bool {
        let mut state = lock(&self.state);
        if state.held || state.retired {
            return false;
        }
        state.held = true;
        true
    }

    fn release(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.held || state.evicting {
            return false;
        }
        state.held = false;
        drop(state);
        self.released.notify_one();
        true
    }

    /// Called by the evicting holder after the item is out of the map.
    fn retire(&self) {
        let mut state = lock(&self.state);
        state.held = false;
        state.evicting = false;
        state.retired = true;
        drop(state);
        self.released.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct CacheItem<T> {
    contents: Arc<T>,
    lock: Arc<ItemLock>,
}

impl<T> CacheItem<T> {
    fn new(contents: Arc<T>) -> Self {
        Self {
            contents,
            lock: Arc::new(ItemLock::default()),
        }
    }
}

/// Concurrent store mapping a key to a shared payload handle.
///
/// Entries are only evicted by the caller (`remove`, `trim_to`, `clear`);
/// eviction of a reserved entry blocks until the reservation is released.
pub struct Cache<T> {
    entries: Mutex<HashMap<String, CacheItem<T>>>,
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Cache");
        match self.entries.try_lock() {
            Ok(entries) => s.field("len", &entries.len()),
            Err(_) => s.field("len", &"<locked>"),
        };
        s.finish()
    }
}

impl<T> Cache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheItem<T>>> {
        lock(&self.entries)
    }

    fn item_lock(&self, key: &str) -> Option<Arc<ItemLock>> {
        self.entries().get(key).map(|item| Arc::clone(&item.lock))
    }

    /// Enter the cache's exclusive section for a multi-step sequence such as
    /// check-then-reserve.
    ///
    /// Every other operation on this cache blocks until the returned section
    /// is unlocked or dropped. Calling a `Cache` method from the thread that
    /// holds the section deadlocks; use the section's own methods instead.
    pub fn lock(&self) -> CacheSection<'_, T> {
        CacheSection {
            entries: self.entries(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Add a new entry. Returns false and leaves the cache untouched if `key`
    /// already has one.
    pub fn insert(&self, key: impl Into<String>, handle: Arc<T>) -> bool {
        self.lock().insert(key, handle)
    }

    /// Shared handle for `key`. A missing key is a logic error in the caller
    /// and is logged as such.
    pub fn get(&self, key: &str) -> Result<Arc<T>, CacheError> {
        self.lock().get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Mark `key` in use, blocking while another party holds it. Returns false
    /// if there is no such entry, or if it was evicted while we waited.
    ///
    /// Every successful call must be paired with exactly one [`Cache::release`].
    pub fn reserve(&self, key: &str) -> bool {
        self.item_lock(key).is_some_and(|item_lock| item_lock.acquire())
    }

    pub fn release(&self, key: &str) -> bool {
        let entries = self.entries();
        match entries.get(key) {
            Some(item) if item.lock.release() => true,
            Some(_) => {
                log::warn!("Cache::release() - {} was not reserved", key);
                false
            }
            None => {
                log::warn!("Cache::release() - no entry for {}", key);
                false
            }
        }
    }

    /// Reserve `key` and hand back its payload; the reservation is released
    /// when the returned guard is dropped.
    pub fn pin(&self, key: &str) -> Option<Pinned<T>> {
        let item_lock = self.item_lock(key)?;
        if !item_lock.acquire() {
            return None;
        }
        // A reserved item cannot leave the map, so the lookup succeeds.
        let contents = self.entries().get(key).map(|item| Arc::clone(&item.contents));
        match contents {
            Some(contents) => Some(Pinned {
                key: key.to_owned(),
                contents,
                item_lock,
            }),
            None => {
                item_lock.release();
                None
            }
        }
    }

    /// Remove `key`, waiting for any reservation on it to be released first.
    /// Returns true if this call removed the entry.
    pub fn remove(&self, key: &str) -> bool {
        match self.item_lock(key) {
            Some(item_lock) => self.evict(key, &item_lock),
            None => false,
        }
    }

    /// Remove every entry whose key is not in `keep`. Returns the number of
    /// entries removed. Entries inserted after the call starts are left alone.
    pub fn trim_to<I, S>(&self, keep: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep: HashSet<String> = keep.into_iter().map(|k| k.as_ref().to_owned()).collect();
        let victims: Vec<(String, Arc<ItemLock>)> = self
            .entries()
            .iter()
            .filter(|(key, _)| !keep.contains(key.as_str()))
            .map(|(key, item)| (key.clone(), Arc::clone(&item.lock)))
            .collect();

        let mut removed = 0;
        for (key, item_lock) in &victims {
            if self.evict(key, item_lock) {
                removed += 1;
            }
        }
        log::debug!("Cache::trim_to() - kept {}, removed {}", keep.len(), removed);
        removed
    }

    /// Remove every entry present when the call starts.
    pub fn clear(&self) {
        let victims: Vec<(String, Arc<ItemLock>)> = self
            .entries()
            .iter()
            .map(|(key, item)| (key.clone(), Arc::clone(&item.lock)))
            .collect();
        for (key, item_lock) in &victims {
            self.evict(key, item_lock);
        }
    }

    fn evict(&self, key: &str, item_lock: &Arc<ItemLock>) -> bool {
        // Wait for consumers without holding the structural lock.
        if !item_lock.acquire_for_evict() {
            return false;
        }
        let item = {
            let mut entries = self.entries();
            match entries.get(key) {
                Some(item) if Arc::ptr_eq(&item.lock, item_lock) => entries.remove(key),
                _ => None,
            }
        };
        item_lock.retire();
        // Dropped here, outside the structural lock.
        item.is_some()
    }
}

impl Cache<DecodedImage> {
    /// Bytes of decoded pixel data held by the cache's own references.
    pub fn mem_size(&self) -> u64 {
        self.entries()
            .values()
            .map(|item| item.contents.mem_size())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Scoped section
// ---------------------------------------------------------------------------

/// Outcome of [`CacheSection::try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryReserve {
    Reserved,
    /// Present but held by another consumer or an eviction in progress.
    Busy,
    Absent,
}

/// Exclusive section over the cache, returned by [`Cache::lock`].
///
/// Only non-blocking operations are offered here: waiting on an item lock
/// while holding the section would deadlock against the holder's `release`.
pub struct CacheSection<'a, T> {
    entries: MutexGuard<'a, HashMap<String, CacheItem<T>>>,
}

impl<T> fmt::Debug for CacheSection<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSection")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T> CacheSection<'_, T> {
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, handle: Arc<T>) -> bool {
        match self.entries.entry(key.into()) {
            Entry::Occupied(e) => {
                log::debug!("Cache::insert() - {} already cached", e.key());
                false
            }
            Entry::Vacant(e) => {
                e.insert(CacheItem::new(handle));
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<T>, CacheError> {
        match self.entries.get(key) {
            Some(item) => Ok(Arc::clone(&item.contents)),
            None => {
                log::error!(
                    "Cache::get() - no entry for {}. Caller did not reserve it first",
                    key
                );
                Err(CacheError::NotFound {
                    key: key.to_owned(),
                })
            }
        }
    }

    /// Reserve `key` if nobody holds it. A successful reservation is released
    /// with [`Cache::release`] after the section is unlocked.
    pub fn try_reserve(&self, key: &str) -> TryReserve {
        match self.entries.get(key) {
            Some(item) if item.lock.try_acquire() => TryReserve::Reserved,
            Some(_) => TryReserve::Busy,
            None => TryReserve::Absent,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unlock(self) {}
}

// ---------------------------------------------------------------------------
// Pinned reservation
// ---------------------------------------------------------------------------

/// A reserved entry's payload. The entry cannot be evicted until this is
/// dropped.
pub struct Pinned<T> {
    key: String,
    contents: Arc<T>,
    item_lock: Arc<ItemLock>,
}

impl<T> Pinned<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A handle that stays valid after the pin is dropped and the entry evicted.
    pub fn handle(&self) -> Arc<T> {
        Arc::clone(&self.contents)
    }
}

impl<T> Deref for Pinned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.contents
    }
}

impl<T> Drop for Pinned<T> {
    fn drop(&mut self) {
        if !self.item_lock.release() {
            log::warn!("Cache pin on {} was released behind its back", self.key);
        }
    }
}

impl<T> fmt::Debug for Pinned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pinned").field("key", &self.key).finish()
    }
}
