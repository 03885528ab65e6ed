//! # Resource Pool
//!
//! Purpose: Share a bounded set of expensive resources (connections) between
//! threads, creating them lazily through an injected factory.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep at most `max_len` entries and recycle them.
//! 2. **Explicit Leases**: Each entry is `Idle`, `Leased` or `Dead`; a
//!    [`Pooled`] guard returns its resource when dropped on any exit path.
//! 3. **Minimal Locking**: The mutex is never held while the factory runs.
//! 4. **Freshness**: Entries are replaced after too many reuses or when left
//!    idle past the freshness window.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use kvlink_common::PoolSettings;
use tracing::{debug, trace, warn};

/// Factory producing a new resource, or `None` when creation failed.
pub type Creator<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

enum Slot<T> {
    Idle(T),
    Leased,
    Dead,
}

struct Entry<T> {
    slot: Slot<T>,
    uses: u32,
    touched: Instant,
}

impl<T> Entry<T> {
    fn leased(now: Instant) -> Self {
        Entry {
            slot: Slot::Leased,
            uses: 0,
            touched: now,
        }
    }
}

struct PoolState<T> {
    entries: Vec<Entry<T>>,
    // Bumped whenever entries are dropped wholesale, so leases taken before
    // a reset are not returned into the new population.
    generation: u64,
    settings: PoolSettings,
    creator: Creator<T>,
}

impl<T> PoolState<T> {
    fn reset(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
}

impl<T> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        // Every critical section leaves the state consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Which entry a freshly created resource is meant for.
enum Target {
    Append,
    Replace(usize),
}

/// Pool handle; clones share the same entries.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Creates an empty pool around `creator`.
    pub fn new<F>(creator: F, settings: PoolSettings) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    entries: Vec::with_capacity(settings.max_len),
                    generation: 0,
                    settings,
                    creator: Arc::new(creator),
                }),
            }),
        }
    }

    /// Leases a resource.
    ///
    /// With pooling disabled every call creates a fresh, unpooled resource.
    /// Otherwise an idle fresh entry is reused, a dead or stale one is
    /// replaced, or a new entry is added while below `max_len`. When none of
    /// that succeeds the attempt is repeated every `retry_interval` until the
    /// retry window has passed.
    pub fn acquire(&self) -> Option<Pooled<T>> {
        let (pooling, interval, window) = {
            let state = self.inner.lock();
            (
                state.settings.idle_timeout().is_some(),
                state.settings.retry_interval(),
                state.settings.retry_window(),
            )
        };
        if !pooling {
            let creator = self.inner.lock().creator.clone();
            return creator().map(|resource| self.detached(resource));
        }

        if let Some(lease) = self.grasp() {
            return Some(lease);
        }

        // A window too large to represent never runs out.
        let deadline = Instant::now().checked_add(window);
        loop {
            thread::sleep(interval);
            if let Some(lease) = self.grasp() {
                return Some(lease);
            }
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                warn!(window_ms = window.as_millis() as u64, "pool acquisition gave up");
                return None;
            }
        }
    }

    fn grasp(&self) -> Option<Pooled<T>> {
        let now = Instant::now();
        let (target, creator, generation) = {
            let mut state = self.inner.lock();
            let generation = state.generation;
            let max_uses = state.settings.max_uses;
            let max_len = state.settings.max_len;
            let Some(fresh) = state.settings.idle_timeout() else {
                // Pooling switched off since acquire started.
                let creator = state.creator.clone();
                drop(state);
                return creator().map(|resource| self.detached(resource));
            };

            let mut dead = None;
            for (idx, entry) in state.entries.iter_mut().enumerate() {
                let reusable = match &entry.slot {
                    Slot::Leased => continue,
                    Slot::Dead => false,
                    Slot::Idle(_) => {
                        entry.uses < max_uses && now.duration_since(entry.touched) < fresh
                    }
                };

                if reusable {
                    if let Slot::Idle(resource) = mem::replace(&mut entry.slot, Slot::Leased) {
                        entry.uses += 1;
                        entry.touched = now;
                        trace!(idx, uses = entry.uses, "reusing pool entry");
                        return Some(self.lease(resource, idx, generation));
                    }
                }

                if matches!(entry.slot, Slot::Idle(_)) {
                    debug!(idx, uses = entry.uses, "evicting worn pool entry");
                    entry.slot = Slot::Dead;
                }
                dead.get_or_insert(idx);
            }

            let target = match dead {
                Some(idx) => {
                    // Reserve the slot so concurrent callers skip it.
                    state.entries[idx].slot = Slot::Leased;
                    Target::Replace(idx)
                }
                None if state.entries.len() >= max_len => return None,
                None => Target::Append,
            };
            (target, state.creator.clone(), generation)
        };

        let created = creator();

        let mut state = self.inner.lock();
        let current = state.generation == generation;
        match target {
            Target::Replace(idx) => {
                let Some(resource) = created else {
                    if current {
                        state.entries[idx].slot = Slot::Dead;
                    }
                    return None;
                };
                if !current {
                    return Some(self.detached(resource));
                }
                state.entries[idx] = Entry::leased(now);
                debug!(idx, "replaced pool entry");
                Some(self.lease(resource, idx, generation))
            }
            Target::Append => {
                let resource = created?;
                if !current || state.entries.len() >= state.settings.max_len {
                    return Some(self.detached(resource));
                }
                state.entries.push(Entry::leased(now));
                let idx = state.entries.len() - 1;
                debug!(idx, "added pool entry");
                Some(self.lease(resource, idx, generation))
            }
        }
    }

    fn lease(&self, resource: T, idx: usize, generation: u64) -> Pooled<T> {
        Pooled {
            pool: self.inner.clone(),
            home: Some((idx, generation)),
            resource: Some(resource),
        }
    }

    fn detached(&self, resource: T) -> Pooled<T> {
        Pooled {
            pool: self.inner.clone(),
            home: None,
            resource: Some(resource),
        }
    }

    /// Drops every cached entry. Outstanding leases are discarded on return.
    pub fn clear(&self) {
        self.inner.lock().reset();
    }

    /// Changes the maximum population and drops cached entries.
    pub fn set_length(&self, max_len: usize) {
        let mut state = self.inner.lock();
        state.settings.max_len = max_len;
        state.reset();
    }

    /// Changes the freshness window (zero disables pooling) and drops cached
    /// entries.
    pub fn set_timeout(&self, idle_timeout: Duration) {
        let mut state = self.inner.lock();
        state.settings.idle_timeout_secs = idle_timeout.as_secs();
        state.reset();
    }

    /// Replaces the factory and drops cached entries.
    pub fn set_creator<F>(&self, creator: F)
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        let mut state = self.inner.lock();
        state.creator = Arc::new(creator);
        state.reset();
    }

    /// Number of entries currently in the pool, whatever their state.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pooled entries currently leased out.
    pub fn leased(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| matches!(entry.slot, Slot::Leased))
            .count()
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.lock().settings.clone()
    }
}

/// A leased resource; returns to its pool entry when dropped.
pub struct Pooled<T> {
    pool: Arc<PoolInner<T>>,
    // Entry index and the pool generation it was taken from; `None` when the
    // resource does not belong to an entry.
    home: Option<(usize, u64)>,
    resource: Option<T>,
}

impl<T> Pooled<T> {
    /// True when the resource occupies a pool entry.
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Marks the entry dead and drops the resource, so the next acquisition
    /// rebuilds this slot instead of allocating a new one.
    pub fn disable(mut self) {
        let resource = self.resource.take();
        if let Some((idx, generation)) = self.home.take() {
            let mut state = self.pool.lock();
            if state.generation == generation {
                if let Some(entry) = state.entries.get_mut(idx) {
                    entry.slot = Slot::Dead;
                    debug!(idx, "pool entry disabled");
                }
            }
        }
        drop(resource);
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("pooled resource present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("pooled resource present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let (Some(resource), Some((idx, generation))) = (self.resource.take(), self.home) else {
            return;
        };
        let mut state = self.pool.lock();
        if state.generation != generation {
            return;
        }
        if let Some(entry) = state.entries.get_mut(idx) {
            if matches!(entry.slot, Slot::Leased) {
                entry.slot = Slot::Idle(resource);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("home", &self.home)
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Resource {
        id: usize,
    }

    fn settings(max_len: usize) -> PoolSettings {
        PoolSettings {
            max_len,
            retry_window_ms: 50,
            ..PoolSettings::default()
        }
    }

    fn counting_pool(settings: PoolSettings) -> (Pool<Resource>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = Pool::new(
            move || {
                Some(Resource {
                    id: counter.fetch_add(1, Ordering::SeqCst),
                })
            },
            settings,
        );
        (pool, created)
    }

    #[test]
    fn reuses_returned_entry() {
        let (pool, created) = counting_pool(settings(4));
        let first = pool.acquire().unwrap();
        assert_eq!(first.id, 0);
        assert!(first.is_pooled());
        drop(first);

        let again = pool.acquire().unwrap();
        assert_eq!(again.id, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn leased_entries_are_not_shared() {
        let (pool, _) = counting_pool(settings(4));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.leased(), 2);
        drop(a);
        assert_eq!(pool.leased(), 1);
    }

    #[test]
    fn disabled_entry_is_rebuilt_in_place() {
        let (pool, _) = counting_pool(settings(4));
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.id, 0);
        lease.disable();

        let replacement = pool.acquire().unwrap();
        assert_eq!(replacement.id, 1);
        assert_eq!(pool.len(), 1);
        drop(replacement);
        assert_eq!(pool.acquire().unwrap().id, 1);
    }

    #[test]
    fn exhausted_pool_gives_up_after_window() {
        let (pool, _) = counting_pool(settings(2));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        let started = Instant::now();
        assert!(pool.acquire().is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn waiting_acquire_gets_released_entry() {
        let (pool, _) = counting_pool(PoolSettings {
            retry_window_ms: 2000,
            ..settings(1)
        });
        let held = pool.acquire().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.id, 0);
        releaser.join().unwrap();
    }

    #[test]
    fn unbounded_window_keeps_waiting() {
        let (pool, _) = counting_pool(PoolSettings {
            retry_window_ms: u64::MAX,
            ..settings(1)
        });
        let held = pool.acquire().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        assert_eq!(pool.acquire().unwrap().id, 0);
        releaser.join().unwrap();
    }

    #[test]
    fn zero_timeout_bypasses_pooling() {
        let (pool, created) = counting_pool(PoolSettings {
            idle_timeout_secs: 0,
            ..settings(4)
        });
        let a = pool.acquire().unwrap();
        assert!(!a.is_pooled());
        drop(a);
        let b = pool.acquire().unwrap();
        assert_eq!(b.id, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn worn_entry_is_replaced() {
        let (pool, _) = counting_pool(PoolSettings {
            max_uses: 2,
            ..settings(4)
        });
        assert_eq!(pool.acquire().unwrap().id, 0);
        assert_eq!(pool.acquire().unwrap().id, 0);
        assert_eq!(pool.acquire().unwrap().id, 0);
        assert_eq!(pool.acquire().unwrap().id, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stale_entry_is_replaced() {
        let (pool, _) = counting_pool(PoolSettings {
            idle_timeout_secs: 1,
            ..settings(4)
        });
        assert_eq!(pool.acquire().unwrap().id, 0);
        thread::sleep(Duration::from_millis(1100));
        assert_eq!(pool.acquire().unwrap().id, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn failed_creation_adds_nothing() {
        let pool: Pool<Resource> = Pool::new(|| None, settings(4));
        assert!(pool.acquire().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn failed_replacement_leaves_slot_dead() {
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = healthy.clone();
        let pool = Pool::new(
            move || flag.load(Ordering::SeqCst).then_some(Resource { id: 7 }),
            settings(1),
        );
        pool.acquire().unwrap().disable();
        healthy.store(false, Ordering::SeqCst);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.leased(), 0);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(pool.acquire().unwrap().id, 7);
    }

    #[test]
    fn configuration_changes_drop_entries() {
        let (pool, _) = counting_pool(settings(4));
        let outstanding = pool.acquire().unwrap();
        drop(pool.acquire().unwrap());
        assert_eq!(pool.len(), 2);

        pool.set_length(3);
        assert!(pool.is_empty());
        assert_eq!(pool.settings().max_len, 3);

        // A lease from before the reset is not returned.
        drop(outstanding);
        assert!(pool.is_empty());

        drop(pool.acquire().unwrap());
        pool.set_timeout(Duration::from_secs(30));
        assert!(pool.is_empty());

        drop(pool.acquire().unwrap());
        pool.set_creator(|| Some(Resource { id: 99 }));
        assert!(pool.is_empty());
        assert_eq!(pool.acquire().unwrap().id, 99);
    }

    #[test]
    fn population_stays_bounded_under_contention() {
        let (pool, _) = counting_pool(PoolSettings {
            retry_window_ms: 5000,
            ..settings(3)
        });
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let lease = pool.acquire().expect("lease");
                        assert!(pool.len() <= 3);
                        assert!(pool.leased() <= 3);
                        thread::sleep(Duration::from_millis(1));
                        drop(lease);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(pool.len() <= 3);
        assert_eq!(pool.leased(), 0);
    }
}
