//! Pooling of [`SpanRecord`]s.
//!
//! Every observed pipeline step borrows a record on start and returns it on
//! end, so the pool is on the hottest path of the crate. Acquire and
//! release never block: the free list is a bounded lock-free channel and
//! all statistics are atomics.
//!
//! Steps that fail outside their normal flow may never emit an end event,
//! leaving their record borrowed forever. A lease tracker records every
//! outstanding borrow and a background sweeper reclaims leases older than
//! a configured age, so pool capacity is not lost permanently.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use opentelemetry::{otel_debug, otel_warn};

use crate::error::Error;
use crate::record::SpanRecord;

/// Whether record pooling is enabled.
pub(crate) const OTEL_PIPELINE_POOL_ENABLED: &str = "OTEL_PIPELINE_POOL_ENABLED";
pub(crate) const OTEL_PIPELINE_POOL_ENABLED_DEFAULT: bool = true;
/// Maximum number of idle records retained by the pool.
pub(crate) const OTEL_PIPELINE_POOL_MAX_SIZE: &str = "OTEL_PIPELINE_POOL_MAX_SIZE";
pub(crate) const OTEL_PIPELINE_POOL_MAX_SIZE_DEFAULT: usize = 200;
/// Number of records allocated up front at construction.
pub(crate) const OTEL_PIPELINE_POOL_INITIAL_SIZE: &str = "OTEL_PIPELINE_POOL_INITIAL_SIZE";
pub(crate) const OTEL_PIPELINE_POOL_INITIAL_SIZE_DEFAULT: usize = 50;
/// Delay in milliseconds between two stale-lease sweeps.
pub(crate) const OTEL_PIPELINE_POOL_SWEEP_INTERVAL: &str = "OTEL_PIPELINE_POOL_SWEEP_INTERVAL";
pub(crate) const OTEL_PIPELINE_POOL_SWEEP_INTERVAL_DEFAULT: u64 = 120_000;
/// Age in milliseconds past which a borrowed record counts as leaked.
pub(crate) const OTEL_PIPELINE_POOL_MAX_LEASE_AGE: &str = "OTEL_PIPELINE_POOL_MAX_LEASE_AGE";
pub(crate) const OTEL_PIPELINE_POOL_MAX_LEASE_AGE_DEFAULT: u64 = 300_000;

/// Record pool configuration.
/// Use [`PoolConfigBuilder`] to configure your own instance of [`PoolConfig`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Pooling can be disabled entirely, in which case every acquire
    /// allocates and release only clears the lease. This is the safety
    /// fallback if pooling ever misbehaves.
    pub(crate) enabled: bool,

    /// Maximum number of idle records retained. Released records beyond
    /// this are dropped. The default is 200.
    pub(crate) max_size: usize,

    /// Number of records pre-allocated at construction. The default is 50.
    pub(crate) initial_size: usize,

    /// Delay between two stale-lease sweeps. The default is 120 seconds.
    pub(crate) sweep_interval: Duration,

    /// Borrow age past which the sweeper reclaims a lease. The default is
    /// 5 minutes.
    pub(crate) max_lease_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::default().build()
    }
}

/// A builder for creating [`PoolConfig`] instances.
#[derive(Debug)]
pub struct PoolConfigBuilder {
    enabled: bool,
    max_size: usize,
    initial_size: usize,
    sweep_interval: Duration,
    max_lease_age: Duration,
}

impl Default for PoolConfigBuilder {
    /// Create a new [`PoolConfigBuilder`] initialized with the default
    /// values, overridden by environment variables if set. The supported
    /// environment variables are:
    /// * `OTEL_PIPELINE_POOL_ENABLED`
    /// * `OTEL_PIPELINE_POOL_MAX_SIZE`
    /// * `OTEL_PIPELINE_POOL_INITIAL_SIZE`
    /// * `OTEL_PIPELINE_POOL_SWEEP_INTERVAL` (milliseconds)
    /// * `OTEL_PIPELINE_POOL_MAX_LEASE_AGE` (milliseconds)
    fn default() -> Self {
        PoolConfigBuilder {
            enabled: OTEL_PIPELINE_POOL_ENABLED_DEFAULT,
            max_size: OTEL_PIPELINE_POOL_MAX_SIZE_DEFAULT,
            initial_size: OTEL_PIPELINE_POOL_INITIAL_SIZE_DEFAULT,
            sweep_interval: Duration::from_millis(OTEL_PIPELINE_POOL_SWEEP_INTERVAL_DEFAULT),
            max_lease_age: Duration::from_millis(OTEL_PIPELINE_POOL_MAX_LEASE_AGE_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl PoolConfigBuilder {
    /// Enable or disable pooling.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum number of idle records retained by the pool.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the number of records allocated up front.
    pub fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    /// Set the delay between two stale-lease sweeps.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the borrow age past which a lease is reclaimed.
    pub fn with_max_lease_age(mut self, max_lease_age: Duration) -> Self {
        self.max_lease_age = max_lease_age;
        self
    }

    /// Builds a [`PoolConfig`], capping the initial size at the maximum
    /// size.
    pub fn build(self) -> PoolConfig {
        PoolConfig {
            enabled: self.enabled,
            max_size: self.max_size,
            initial_size: self.initial_size.min(self.max_size),
            sweep_interval: self.sweep_interval,
            max_lease_age: self.max_lease_age,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(enabled) = std::env::var(OTEL_PIPELINE_POOL_ENABLED)
            .ok()
            .and_then(|enabled| bool::from_str(&enabled).ok())
        {
            self.enabled = enabled;
        }

        if let Some(max_size) = std::env::var(OTEL_PIPELINE_POOL_MAX_SIZE)
            .ok()
            .and_then(|size| usize::from_str(&size).ok())
        {
            self.max_size = max_size;
        }

        if let Some(initial_size) = std::env::var(OTEL_PIPELINE_POOL_INITIAL_SIZE)
            .ok()
            .and_then(|size| usize::from_str(&size).ok())
        {
            self.initial_size = initial_size;
        }

        if let Some(sweep_interval) = std::env::var(OTEL_PIPELINE_POOL_SWEEP_INTERVAL)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.sweep_interval = Duration::from_millis(sweep_interval);
        }

        if let Some(max_lease_age) = std::env::var(OTEL_PIPELINE_POOL_MAX_LEASE_AGE)
            .ok()
            .and_then(|age| u64::from_str(&age).ok())
        {
            self.max_lease_age = Duration::from_millis(max_lease_age);
        }

        self
    }
}

/// Point-in-time snapshot of the pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Records allocated fresh (including pre-warmed ones).
    pub created: u64,
    /// Acquires served from the free list.
    pub reused: u64,
    /// Releases that made it back into the free list.
    pub returned: u64,
    /// Releases dropped because the free list was full.
    pub dropped: u64,
    /// Leases reclaimed by the sweeper.
    pub forced_reclaims: u64,
    /// Idle records currently in the free list.
    pub free: usize,
    /// Records currently borrowed.
    pub outstanding: usize,
}

enum SweepMessage {
    Shutdown(SyncSender<()>),
}

/// Tracks which records are currently borrowed, keyed by
/// `transaction-id|location`.
#[derive(Debug, Default)]
struct LeaseTracker {
    leases: DashMap<String, Instant>,
}

impl LeaseTracker {
    fn register(&self, key: String, at: Instant) {
        self.leases.insert(key, at);
    }

    fn release(&self, key: &str) -> bool {
        self.leases.remove(key).is_some()
    }

    /// Keys of leases older than `max_age` as of `now`.
    fn stale(&self, now: Instant, max_age: Duration) -> Vec<String> {
        self.leases
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) >= max_age)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn outstanding(&self) -> usize {
        self.leases.len()
    }

    fn clear(&self) {
        self.leases.clear();
    }
}

struct PoolInner {
    config: PoolConfig,
    free_tx: Sender<SpanRecord>,
    free_rx: Receiver<SpanRecord>,
    leases: LeaseTracker,
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    dropped: AtomicU64,
    forced: AtomicU64,
}

/// A bounded, non-blocking pool of reusable [`SpanRecord`]s with stale
/// borrow reclamation.
pub struct RecordPool {
    inner: Arc<PoolInner>,
    control: Option<SyncSender<SweepMessage>>,
    sweeper: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl std::fmt::Debug for RecordPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for RecordPool {
    fn default() -> Self {
        RecordPool::new(PoolConfig::default())
    }
}

impl RecordPool {
    /// Create a pool, pre-warm its free list and, when pooling is enabled,
    /// start the stale-lease sweeper thread.
    pub fn new(config: PoolConfig) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(config.max_size.max(1));
        let inner = Arc::new(PoolInner {
            free_tx,
            free_rx,
            leases: LeaseTracker::default(),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            forced: AtomicU64::new(0),
            config,
        });

        let mut control = None;
        let mut sweeper = None;
        if inner.config.enabled {
            for _ in 0..inner.config.initial_size {
                if inner.free_tx.try_send(SpanRecord::blank()).is_err() {
                    break;
                }
                inner.created.fetch_add(1, Ordering::Relaxed);
            }

            let (control_tx, control_rx) = sync_channel(1);
            let sweep_inner = inner.clone();
            let handle = thread::Builder::new()
                .name("PipelineRecordPoolSweeper".to_string())
                .spawn(move || loop {
                    match control_rx.recv_timeout(sweep_inner.config.sweep_interval) {
                        Ok(SweepMessage::Shutdown(ack)) => {
                            let _ = ack.send(());
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => sweep(&sweep_inner),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .expect("Failed to spawn thread");
            control = Some(control_tx);
            sweeper = Some(handle);
        }

        RecordPool {
            inner,
            control,
            sweeper: Mutex::new(sweeper),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// Hand out a record for the given transaction and step, recycled from
    /// the free list when possible. Never blocks.
    pub fn acquire(
        &self,
        transaction_id: &str,
        name: &str,
        location: Option<&str>,
    ) -> SpanRecord {
        let mut record = if self.pooling() {
            match self.inner.free_rx.try_recv() {
                Ok(mut recycled) => {
                    recycled.reset(transaction_id, name);
                    self.inner.reused.fetch_add(1, Ordering::Relaxed);
                    recycled
                }
                Err(_) => {
                    self.inner.created.fetch_add(1, Ordering::Relaxed);
                    SpanRecord::new(transaction_id, name)
                }
            }
        } else {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            SpanRecord::new(transaction_id, name)
        };

        if let Some(location) = location {
            record.set_location(location);
        }
        let now = Instant::now();
        record.mark_borrowed(now);
        self.inner
            .leases
            .register(lease_key(transaction_id, location.unwrap_or(name)), now);
        record
    }

    /// Return a record. The lease is cleared, the record's mutable state is
    /// wiped and, while the free list has room, it is retained for reuse;
    /// otherwise it is dropped.
    pub fn release(&self, mut record: SpanRecord) {
        let key = lease_key(
            record.transaction_id(),
            record.location().unwrap_or_else(|| record.name()),
        );
        self.inner.leases.release(&key);

        if !self.pooling() {
            return;
        }
        record.clear();
        match self.inner.free_tx.try_send(record) {
            Ok(()) => {
                self.inner.returned.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Stop the sweeper and clear all outstanding leases. Further acquires
    /// allocate fresh records.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyShutdown);
        }

        if let Some(control) = &self.control {
            let (ack_tx, ack_rx) = sync_channel(1);
            control
                .try_send(SweepMessage::Shutdown(ack_tx))
                .map_err(|_| Error::ShutdownFailed("sweeper control channel closed".to_string()))?;
            ack_rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| {
                    Error::ShutdownFailed("sweeper did not acknowledge shutdown".to_string())
                })?;
            let handle = self
                .sweeper
                .lock()
                .map_err(|_| Error::ShutdownFailed("sweeper handle lock poisoned".to_string()))?
                .take();
            if let Some(handle) = handle {
                handle
                    .join()
                    .map_err(|_| Error::ShutdownFailed("sweeper thread panicked".to_string()))?;
            }
        }

        let outstanding = self.inner.leases.outstanding();
        if outstanding > 0 {
            otel_warn!(
                name: "RecordPool.Shutdown.OutstandingLeases",
                count = outstanding
            );
            self.inner.leases.clear();
        }
        otel_debug!(name: "RecordPool.Shutdown");
        Ok(())
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            forced_reclaims: self.inner.forced.load(Ordering::Relaxed),
            free: self.inner.free_rx.len(),
            outstanding: self.inner.leases.outstanding(),
        }
    }

    fn pooling(&self) -> bool {
        self.inner.config.enabled && !self.is_shutdown.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn sweep_now(&self) {
        sweep(&self.inner);
    }
}

/// Reclaim leases older than the configured age. The leaked record itself
/// is gone with its borrower; a replacement is pushed into the free list so
/// capacity is restored.
fn sweep(inner: &PoolInner) {
    let now = Instant::now();
    for key in inner.leases.stale(now, inner.config.max_lease_age) {
        if inner.leases.release(&key) {
            inner.forced.fetch_add(1, Ordering::Relaxed);
            otel_warn!(
                name: "RecordPool.LeaseExpired",
                lease = format!("{key}"),
                max_age_ms = inner.config.max_lease_age.as_millis() as u64
            );
            let _ = inner.free_tx.try_send(SpanRecord::blank());
        }
    }
}

fn lease_key(transaction_id: &str, location: &str) -> String {
    let mut key = String::with_capacity(transaction_id.len() + location.len() + 1);
    key.push_str(transaction_id);
    key.push('|');
    key.push_str(location);
    key
}
