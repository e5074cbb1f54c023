//! Fingerprint-keyed pool of idle workers with LRU eviction.
//!
//! `acquire` turns "create" into "borrow or create"; `release` turns "drop"
//! into "return for reuse". A checked-out worker is owned by its
//! [`Checkout`] and by nothing else, so two callers can never drive the same
//! worker concurrently.
//!
//! State lives behind one `std::sync::Mutex` and the lock is never held
//! across an `.await`: factory construction and `reset` run outside it.
//! Invariant after every operation:
//!
//! ```text
//! current_size == Σ len(idle[fp]) == len(order) <= max_size
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{WorkerConfig, DEFAULT_POOL_CAPACITY};
use crate::errors::{HeavyError, WorkerError};
use crate::fingerprint::ConfigFingerprint;
use crate::worker::{HeavyWorkerFactory, Worker, WorkerFactory};

/// Counters plus the idle count, read under one lock acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub idle: usize,
}

/// A worker borrowed from the pool. Hand it back with [`WorkerPool::release`];
/// dropping it instead simply discards the worker.
pub struct Checkout {
    fingerprint: ConfigFingerprint,
    instance_id: u64,
    worker: Box<dyn Worker>,
}

impl Checkout {
    pub fn fingerprint(&self) -> &ConfigFingerprint {
        &self.fingerprint
    }

    /// Pool-assigned identity, stable for the worker's whole lifetime.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub async fn run(&mut self, task: &str) -> Result<String, WorkerError> {
        self.worker.run(task).await
    }
}

impl fmt::Debug for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("fingerprint", &self.fingerprint)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

struct IdleEntry {
    seq: u64,
    instance_id: u64,
    worker: Box<dyn Worker>,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct PoolState {
    idle: HashMap<ConfigFingerprint, Vec<IdleEntry>>,
    /// Insertion sequence → fingerprint. Least recently added is the LRU end.
    order: LruCache<u64, ConfigFingerprint>,
    next_seq: u64,
    counters: Counters,
}

impl PoolState {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            order: LruCache::unbounded(),
            next_seq: 0,
            counters: Counters::default(),
        }
    }

    fn size(&self) -> usize {
        self.order.len()
    }

    fn take(&mut self, fingerprint: &ConfigFingerprint) -> Option<IdleEntry> {
        let bucket = self.idle.get_mut(fingerprint)?;
        let entry = bucket.pop();
        if bucket.is_empty() {
            self.idle.remove(fingerprint);
        }
        let entry = entry?;
        if self.order.pop(&entry.seq).is_none() {
            report_inconsistency(format!(
                "idle worker {} (seq {}) missing from eviction order",
                entry.instance_id, entry.seq
            ));
        }
        Some(entry)
    }

    /// Remove the least recently added idle entry. Order entries whose
    /// bucket no longer holds them are discarded and skipped.
    fn pop_oldest(&mut self) -> Option<IdleEntry> {
        while let Some((seq, fingerprint)) = self.order.pop_lru() {
            let Some(bucket) = self.idle.get_mut(&fingerprint) else {
                report_inconsistency(format!("eviction order names empty bucket {fingerprint}"));
                continue;
            };
            let Some(pos) = bucket.iter().position(|e| e.seq == seq) else {
                report_inconsistency(format!("seq {seq} not found in bucket {fingerprint}"));
                continue;
            };
            let entry = bucket.remove(pos);
            if bucket.is_empty() {
                self.idle.remove(&fingerprint);
            }
            return Some(entry);
        }
        None
    }

    fn insert(
        &mut self,
        fingerprint: ConfigFingerprint,
        instance_id: u64,
        worker: Box<dyn Worker>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.put(seq, fingerprint.clone());
        self.idle.entry(fingerprint).or_default().push(IdleEntry {
            seq,
            instance_id,
            worker,
        });
    }

    fn is_consistent(&self) -> bool {
        let bucket_total: usize = self.idle.values().map(Vec::len).sum();
        bucket_total == self.order.len()
    }

    /// Remove every idle entry, leaving empty bookkeeping.
    fn drain(&mut self) -> Vec<IdleEntry> {
        self.order.clear();
        self.idle.drain().flat_map(|(_, bucket)| bucket).collect()
    }
}

fn report_inconsistency(message: String) {
    let err = HeavyError::PoolConsistency(message);
    error!(error = %err, "worker pool bookkeeping repaired");
}

/// Bounded pool of idle workers keyed by [`ConfigFingerprint`].
pub struct WorkerPool {
    factory: Arc<dyn WorkerFactory>,
    max_size: usize,
    next_instance: AtomicU64,
    state: Mutex<PoolState>,
}

static GLOBAL_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

impl WorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>, max_size: usize) -> Self {
        Self {
            factory,
            max_size,
            next_instance: AtomicU64::new(1),
            state: Mutex::new(PoolState::new()),
        }
    }

    /// Process-wide pool backed by [`HeavyWorkerFactory`]. Initialized once.
    pub fn global() -> Arc<WorkerPool> {
        Self::global_with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Like [`WorkerPool::global`]; the capacity of the first call wins.
    pub fn global_with_capacity(max_size: usize) -> Arc<WorkerPool> {
        GLOBAL_POOL
            .get_or_init(|| Arc::new(WorkerPool::new(Arc::new(HeavyWorkerFactory), max_size)))
            .clone()
    }

    pub fn factory(&self) -> &Arc<dyn WorkerFactory> {
        &self.factory
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the state consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow an idle worker for `config`, or build a new one.
    ///
    /// Factory errors propagate; the caller decides whether they fail one
    /// slot or the whole run.
    pub async fn acquire(&self, config: &WorkerConfig) -> Result<Checkout, WorkerError> {
        let fingerprint = config.fingerprint();
        {
            let mut state = self.lock();
            if let Some(entry) = state.take(&fingerprint) {
                state.counters.hits += 1;
                debug!(fingerprint = %fingerprint, instance = entry.instance_id, "pool hit");
                return Ok(Checkout {
                    fingerprint,
                    instance_id: entry.instance_id,
                    worker: entry.worker,
                });
            }
            state.counters.misses += 1;
        }

        debug!(
            fingerprint = %fingerprint,
            provider = %config.provider,
            model = %config.model,
            "pool miss, building worker"
        );
        let worker = self.factory.build(config).await?;
        let instance_id = self.next_instance.fetch_add(1, Ordering::Relaxed);
        Ok(Checkout {
            fingerprint,
            instance_id,
            worker,
        })
    }

    /// Reset the worker and return it to the pool, evicting the oldest idle
    /// entry if the pool is full. Never fails: cleanup errors are logged and
    /// the worker is dropped.
    pub async fn release(&self, checkout: Checkout) {
        let Checkout {
            fingerprint,
            instance_id,
            mut worker,
        } = checkout;

        if let Err(e) = worker.reset().await {
            warn!(
                fingerprint = %fingerprint,
                instance = instance_id,
                error = %e,
                "worker reset failed, dropping"
            );
            return;
        }

        let evicted = {
            let mut state = self.lock();
            let mut evicted = None;
            if state.size() >= self.max_size {
                state.counters.evictions += 1;
                match state.pop_oldest() {
                    Some(oldest) => evicted = Some(oldest),
                    None => {
                        debug!(
                            fingerprint = %fingerprint,
                            instance = instance_id,
                            "pool has no idle entry to evict, dropping returned worker"
                        );
                        return;
                    }
                }
            }
            state.insert(fingerprint.clone(), instance_id, worker);

            if !state.is_consistent() {
                report_inconsistency(format!(
                    "size mismatch after release of {fingerprint}; clearing idle workers"
                ));
                drop(state.drain());
            }
            evicted
        };

        if let Some(mut entry) = evicted {
            info!(
                instance = entry.instance_id,
                max_size = self.max_size,
                "evicted oldest idle worker"
            );
            if let Err(e) = entry.worker.reset().await {
                debug!(
                    instance = entry.instance_id,
                    error = %e,
                    "cleanup of evicted worker failed"
                );
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            hits: state.counters.hits,
            misses: state.counters.misses,
            evictions: state.counters.evictions,
            idle: state.size(),
        }
    }

    pub fn current_size(&self) -> usize {
        self.lock().size()
    }

    /// Drop every idle worker, running cleanup best-effort. Counters survive.
    pub async fn clear(&self) {
        let drained = self.lock().drain();
        let count = drained.len();
        for mut entry in drained {
            if let Err(e) = entry.worker.reset().await {
                debug!(instance = entry.instance_id, error = %e, "cleanup during clear failed");
            }
        }
        info!(count, "worker pool cleared");
    }
}
