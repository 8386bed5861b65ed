//! Session-affine pool of remote sandbox instances
//!
//! Each session maps to at most one instance, and an instance serves one call
//! at a time. Concurrent calls for the same session queue on the session's
//! slot; calls for different sessions compete only for capacity, which is a
//! fair (FIFO) semaphore of `max_instances` permits. Every live instance,
//! spare or assigned, holds one permit.
//!
//! Slot state machine:
//!
//! ```text
//!   Idle(no instance) --acquire--> Acquiring --provisioned--> Busy
//!   Idle(instance)    --acquire--> Busy --release--> Idle(instance)
//!   Acquiring --provision failed--> Idle(no instance)
//! ```
//!
//! Provisioning runs on its own task. A caller that gives up mid-provision
//! leaves the task to finish; the instance it produces lands in the slot as
//! `Idle` for the next call, and a failed or panicked provision still resets
//! the slot. Waiting for a busy slot is bounded by `acquire_timeout`.
//!
//! Idle instances are evicted by a background sweeper after `idle_timeout`,
//! and on demand (least recently used first) when capacity is exhausted.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::remote::RemoteSandbox;
use crate::request::validate_session_id;
use crate::Result;

/// Creates and destroys pooled instances
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Create an instance, optionally tagged with the session it is for
    async fn provision(&self, session_id: Option<&str>) -> Result<RemoteSandbox>;

    async fn destroy(&self, instance: &RemoteSandbox) -> Result<()>;

    async fn is_available(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live instances, spares included
    pub max_instances: usize,
    /// Warm unassigned instances kept ready
    pub min_idle: usize,
    /// Idle time after which a session's instance is destroyed
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long an acquire may wait for capacity
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 8,
            min_idle: 0,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Acquiring,
    Busy,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub sessions: usize,
    pub busy: usize,
    pub idle: usize,
    pub spares: usize,
    pub available_permits: usize,
}

/// A live instance and the capacity it occupies
struct Instance {
    sandbox: Arc<RemoteSandbox>,
    _permit: OwnedSemaphorePermit,
}

struct SlotInner {
    state: EntryState,
    instance: Option<Instance>,
    last_used: Instant,
    /// Bumped on every Busy grant so stale leases can't release a newer one
    generation: u64,
    /// Removed from the map; waiters must look the session up again
    retired: bool,
}

impl SlotInner {
    fn holds_idle_instance(&self) -> bool {
        !self.retired && self.state == EntryState::Idle && self.instance.is_some()
    }
}

struct SessionSlot {
    inner: Mutex<SlotInner>,
    changed: Notify,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: EntryState::Idle,
                instance: None,
                last_used: Instant::now(),
                generation: 0,
                retired: false,
            }),
            changed: Notify::new(),
        }
    }
}

/// Returns a slot still `Acquiring` to `Idle` when provisioning ends without
/// handing it out, including by panic or cancellation
struct AcquiringReset(Arc<SessionSlot>);

impl Drop for AcquiringReset {
    fn drop(&mut self) {
        {
            let mut inner = self.0.inner.lock();
            if inner.state != EntryState::Acquiring {
                return;
            }
            inner.state = EntryState::Idle;
        }
        self.0.changed.notify_waiters();
    }
}

enum Step<'a> {
    Ready(PoolLease),
    Provision,
    Wait(tokio::sync::futures::Notified<'a>),
    Retry,
}

pub struct Pool {
    config: PoolConfig,
    provider: Arc<dyn InstanceProvider>,
    slots: DashMap<String, Arc<SessionSlot>>,
    spares: Mutex<Vec<Instance>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    sweeper: CancellationToken,
}

impl Pool {
    pub fn new(config: PoolConfig, provider: Arc<dyn InstanceProvider>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_instances.max(1)));
        Arc::new(Self {
            config,
            provider,
            slots: DashMap::new(),
            spares: Mutex::new(Vec::new()),
            permits,
            closed: AtomicBool::new(false),
            sweeper: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_available(&self) -> bool {
        !self.is_closed() && self.provider.is_available().await
    }

    /// Spawn the idle sweeper. It stops on `shutdown` or when the pool is dropped.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let token = self.sweeper.clone();
        let period = self.config.sweep_interval.max(Duration::from_millis(10));
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, pool sweeper not started");
            return;
        };
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let evicted = pool.sweep_idle().await;
                        if evicted > 0 {
                            debug!(evicted, "pool sweep evicted idle instances");
                        }
                        if let Err(e) = pool.warm_up().await {
                            warn!("pool warm-up failed: {}", e);
                        }
                    }
                }
            }
            debug!("pool sweeper stopped");
        });
    }

    /// Exclusive use of the session's instance, provisioning one if needed
    pub async fn acquire(self: &Arc<Self>, session_id: &str) -> Result<PoolLease> {
        validate_session_id(session_id)?;
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        loop {
            if self.is_closed() {
                return Err(SandboxError::PoolClosed);
            }
            let slot = self
                .slots
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionSlot::new()))
                .clone();

            let step = {
                let mut inner = slot.inner.lock();
                if inner.retired {
                    Step::Retry
                } else {
                    match inner.state {
                        EntryState::Idle => match inner.instance.as_ref().map(|i| i.sandbox.clone()) {
                            Some(sandbox) => {
                                inner.state = EntryState::Busy;
                                inner.generation += 1;
                                Step::Ready(PoolLease::new(self, session_id, &slot, sandbox, inner.generation))
                            }
                            None => {
                                inner.state = EntryState::Acquiring;
                                Step::Provision
                            }
                        },
                        EntryState::Acquiring | EntryState::Busy => Step::Wait(slot.changed.notified()),
                    }
                }
            };

            match step {
                Step::Ready(lease) => {
                    debug!(session = session_id, "pool reusing session instance");
                    return Ok(lease);
                }
                Step::Retry => continue,
                Step::Wait(notified) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(session = session_id, "gave up waiting for busy session instance");
                        return Err(SandboxError::PoolExhausted(self.config.acquire_timeout));
                    }
                    continue;
                }
                Step::Provision => {}
            }

            // if this caller is cancelled the task still settles the slot, and
            // a lease nobody collects is released when the task output drops
            let task = tokio::spawn(self.clone().provision_slot(session_id.to_string(), slot.clone()));
            match task.await {
                Ok(Ok(Some(lease))) => return Ok(lease),
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(SandboxError::InvalidState(format!("provisioning task failed: {e}"))),
            }
        }
    }

    /// Fill a slot this caller moved to `Acquiring` and hand it out as `Busy`.
    /// `None` means the slot was retired meanwhile.
    async fn provision_slot(self: Arc<Self>, session_id: String, slot: Arc<SessionSlot>) -> Result<Option<PoolLease>> {
        let _reset = AcquiringReset(slot.clone());
        let provisioned = self.instance_for(&session_id).await;

        let mut inner = slot.inner.lock();
        match provisioned {
            Ok(instance) if inner.retired || self.is_closed() => {
                drop(inner);
                self.destroy_later(instance);
                if self.is_closed() {
                    Err(SandboxError::PoolClosed)
                } else {
                    Ok(None)
                }
            }
            Ok(instance) => {
                let sandbox = instance.sandbox.clone();
                inner.instance = Some(instance);
                inner.state = EntryState::Busy;
                inner.generation += 1;
                let lease = PoolLease::new(&self, &session_id, &slot, sandbox, inner.generation);
                drop(inner);
                info!(session = %session_id, instance = lease.sandbox().id(), "pool assigned instance");
                Ok(Some(lease))
            }
            Err(e) => Err(e),
        }
    }

    /// A warm spare if there is one, else a freshly provisioned instance
    async fn instance_for(&self, session_id: &str) -> Result<Instance> {
        let spare = self.spares.lock().pop();
        if let Some(spare) = spare {
            debug!(session = session_id, instance = spare.sandbox.id(), "pool handing out spare");
            return Ok(spare);
        }
        let permit = self.capacity(session_id).await?;
        let sandbox = self.provider.provision(Some(session_id)).await?;
        Ok(Instance {
            sandbox: Arc::new(sandbox),
            _permit: permit,
        })
    }

    async fn capacity(&self, session_id: &str) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if let Some(instance) = self.evict_lru(Some(session_id)) {
            info!(instance = instance.sandbox.id(), "pool saturated, evicting least recently used instance");
            self.destroy(instance).await;
        }
        match tokio::time::timeout(self.config.acquire_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SandboxError::PoolClosed),
            Err(_) => Err(SandboxError::PoolExhausted(self.config.acquire_timeout)),
        }
    }

    /// Retire the least recently used idle instance not owned by `except`
    fn evict_lru(&self, except: Option<&str>) -> Option<Instance> {
        if let Some(spare) = self.spares.lock().pop() {
            return Some(spare);
        }
        let victim = self
            .slots
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != except)
            .filter_map(|entry| {
                let inner = entry.value().inner.lock();
                inner
                    .holds_idle_instance()
                    .then(|| (inner.last_used, entry.key().clone()))
            })
            .min_by_key(|(last_used, _)| *last_used)
            .map(|(_, key)| key)?;
        self.retire_if(&victim, SlotInner::holds_idle_instance)
    }

    /// Remove a slot from the map when `pred` holds, returning its idle instance
    fn retire_if(&self, session_id: &str, pred: impl Fn(&SlotInner) -> bool) -> Option<Instance> {
        let mut taken = None;
        self.slots.remove_if(session_id, |_, slot| {
            let mut inner = slot.inner.lock();
            if !pred(&inner) {
                return false;
            }
            inner.retired = true;
            // a busy instance is destroyed by whoever releases it
            if inner.state == EntryState::Idle {
                taken = inner.instance.take();
            }
            true
        });
        taken
    }

    async fn destroy(&self, instance: Instance) {
        if let Err(e) = self.provider.destroy(&instance.sandbox).await {
            warn!(instance = instance.sandbox.id(), "failed to destroy instance: {}", e);
        }
        // permit returns to the pool here
        drop(instance);
    }

    fn destroy_later(self: &Arc<Self>, instance: Instance) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move { pool.destroy(instance).await });
            }
            Err(_) => warn!(instance = instance.sandbox.id(), "no runtime to destroy instance"),
        }
    }

    fn release_slot(self: &Arc<Self>, slot: &SessionSlot, generation: Option<u64>) {
        let mut inner = slot.inner.lock();
        if inner.state != EntryState::Busy || generation.map_or(false, |g| g != inner.generation) {
            return;
        }
        inner.state = EntryState::Idle;
        inner.last_used = Instant::now();
        let orphan = if inner.retired { inner.instance.take() } else { None };
        drop(inner);
        slot.changed.notify_waiters();
        if let Some(instance) = orphan {
            self.destroy_later(instance);
        }
    }

    /// Return a session's instance to Idle
    pub fn release(self: &Arc<Self>, session_id: &str) {
        let slot = self.slots.get(session_id).map(|entry| entry.value().clone());
        if let Some(slot) = slot {
            self.release_slot(&slot, None);
        }
    }

    pub fn state(&self, session_id: &str) -> Option<EntryState> {
        let slot = self.slots.get(session_id).map(|entry| entry.value().clone())?;
        let state = slot.inner.lock().state;
        Some(state)
    }

    /// Destroy instances idle longer than `idle_timeout`. Returns how many.
    pub async fn sweep_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let expired = |inner: &SlotInner| inner.holds_idle_instance() && inner.last_used.elapsed() >= timeout;
        let empty = |inner: &SlotInner| !inner.retired && inner.state == EntryState::Idle && inner.instance.is_none();

        let keys: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut evicted = Vec::new();
        for key in keys {
            if let Some(instance) = self.retire_if(&key, expired) {
                info!(session = %key, instance = instance.sandbox.id(), "evicting idle instance");
                evicted.push(instance);
            } else {
                self.retire_if(&key, empty);
            }
        }
        let count = evicted.len();
        for instance in evicted {
            self.destroy(instance).await;
        }
        count
    }

    /// Provision spares until `min_idle` are ready or capacity runs out
    pub async fn warm_up(&self) -> Result<usize> {
        let mut created = 0;
        while !self.is_closed() && self.spares.lock().len() < self.config.min_idle {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else { break };
            let sandbox = self.provider.provision(None).await?;
            self.spares.lock().push(Instance {
                sandbox: Arc::new(sandbox),
                _permit: permit,
            });
            created += 1;
        }
        if created > 0 {
            debug!(created, "pool warmed spare instances");
        }
        Ok(created)
    }

    /// Drop a session's instance. A busy instance is destroyed once released.
    pub async fn remove(&self, session_id: &str) {
        if let Some(instance) = self.retire_if(session_id, |_| true) {
            self.destroy(instance).await;
        }
    }

    /// Stop the sweeper and destroy every instance. Later acquires fail.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sweeper.cancel();
        self.permits.close();

        let mut doomed: Vec<Instance> = self.spares.lock().drain(..).collect();
        let keys: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                let mut inner = slot.inner.lock();
                inner.retired = true;
                if inner.state == EntryState::Idle {
                    doomed.extend(inner.instance.take());
                }
                drop(inner);
                slot.changed.notify_waiters();
            }
        }
        info!(instances = doomed.len(), "pool shutting down");
        for instance in doomed {
            self.destroy(instance).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            spares: self.spares.lock().len(),
            available_permits: self.permits.available_permits(),
            ..Default::default()
        };
        for entry in self.slots.iter() {
            let inner = entry.value().inner.lock();
            stats.sessions += 1;
            match inner.state {
                EntryState::Busy => stats.busy += 1,
                EntryState::Idle if inner.instance.is_some() => stats.idle += 1,
                _ => {}
            }
        }
        stats
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

/// Exclusive hold on a session's instance; released on drop
pub struct PoolLease {
    pool: Arc<Pool>,
    session_id: String,
    slot: Arc<SessionSlot>,
    sandbox: Arc<RemoteSandbox>,
    generation: u64,
    done: bool,
}

impl PoolLease {
    fn new(pool: &Arc<Pool>, session_id: &str, slot: &Arc<SessionSlot>, sandbox: Arc<RemoteSandbox>, generation: u64) -> Self {
        Self {
            pool: pool.clone(),
            session_id: session_id.to_string(),
            slot: slot.clone(),
            sandbox,
            generation,
            done: false,
        }
    }

    pub fn sandbox(&self) -> &RemoteSandbox {
        &self.sandbox
    }

    pub(crate) fn shared_sandbox(&self) -> Arc<RemoteSandbox> {
        self.sandbox.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn release(mut self) {
        self.done = true;
        self.pool.release_slot(&self.slot, Some(self.generation));
    }

    /// Give the instance up instead of returning it, e.g. after it stopped responding
    pub fn discard(mut self) {
        self.done = true;
        {
            let mut inner = self.slot.inner.lock();
            if inner.generation == self.generation {
                inner.retired = true;
            }
        }
        let slot = self.slot.clone();
        self.pool
            .slots
            .remove_if(&self.session_id, |_, current| Arc::ptr_eq(current, &slot));
        self.pool.release_slot(&self.slot, Some(self.generation));
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if !self.done {
            self.pool.release_slot(&self.slot, Some(self.generation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingProvider {
        provisioned: AtomicUsize,
        destroyed: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl InstanceProvider for CountingProvider {
        async fn provision(&self, _session_id: Option<&str>) -> Result<RemoteSandbox> {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(SandboxError::unavailable(crate::BackendKind::Pooled, "down"));
            }
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteSandbox::new(
                reqwest::Client::new(),
                "http://127.0.0.1:1",
                format!("sb-{n}"),
                None,
            ))
        }

        async fn destroy(&self, _instance: &RemoteSandbox) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool_with(config: PoolConfig, delay: Duration) -> (Arc<Pool>, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            delay,
            ..Default::default()
        });
        (Pool::new(config, provider.clone()), provider)
    }

    #[tokio::test]
    async fn test_reuses_instance_per_session() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::ZERO);
        let first = pool.acquire("s1").await.unwrap().sandbox().id().to_string();
        let second = pool.acquire("s1").await.unwrap().sandbox().id().to_string();
        assert_eq!(first, second);
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 1);
        assert_eq!(pool.state("s1"), Some(EntryState::Idle));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_provision_once() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::from_millis(50));
        let in_use = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire("s1").await.unwrap();
                assert_eq!(in_use.fetch_add(1, Ordering::SeqCst), 0, "two calls shared an instance");
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                lease.sandbox().id().to_string()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| id == &ids[0]));
    }

    #[tokio::test]
    async fn test_different_sessions_get_different_instances() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::ZERO);
        let a = pool.acquire("a").await.unwrap();
        let b = pool.acquire("b").await.unwrap();
        assert_ne!(a.sandbox().id(), b.sandbox().id());
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().busy, 2);
    }

    #[tokio::test]
    async fn test_failed_provision_returns_to_idle() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::ZERO);
        provider.fail.store(true, Ordering::SeqCst);
        let err = pool.acquire("s1").await.err().unwrap();
        assert!(matches!(err, SandboxError::BackendUnavailable { .. }));
        assert_eq!(pool.state("s1"), Some(EntryState::Idle));
        assert_eq!(pool.stats().available_permits, 8);

        provider.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire("s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_still_settles_slot() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::from_millis(200));
        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.acquire("s1")).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.state("s1"), Some(EntryState::Acquiring));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.state("s1"), Some(EntryState::Idle));
        assert_eq!(pool.stats().idle, 1);

        let lease = tokio::time::timeout(Duration::from_secs(1), pool.acquire("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.sandbox().id(), "sb-0");
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_failed_provision_resets_slot() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::from_millis(100));
        provider.fail.store(true, Ordering::SeqCst);
        assert!(tokio::time::timeout(Duration::from_millis(20), pool.acquire("s1")).await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.state("s1"), Some(EntryState::Idle));
        assert_eq!(pool.stats().available_permits, 8);
    }

    #[tokio::test]
    async fn test_waiter_behind_cancelled_provision_is_served() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::from_millis(100));
        let (first, second) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(20), pool.acquire("s1")),
            pool.acquire("s1"),
        );
        assert!(first.is_err());
        assert_eq!(second.unwrap().sandbox().id(), "sb-0");
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_slot_wait_is_bounded() {
        let config = PoolConfig {
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (pool, _provider) = pool_with(config, Duration::ZERO);
        let _held = pool.acquire("s1").await.unwrap();
        let err = pool.acquire("s1").await.err().unwrap();
        assert!(matches!(err, SandboxError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_saturation_evicts_lru_idle() {
        let config = PoolConfig {
            max_instances: 2,
            ..Default::default()
        };
        let (pool, provider) = pool_with(config, Duration::ZERO);
        drop(pool.acquire("a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(pool.acquire("b").await.unwrap());

        let _c = pool.acquire("c").await.unwrap();
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.state("a"), None);
        assert_eq!(pool.state("b"), Some(EntryState::Idle));
    }

    #[tokio::test]
    async fn test_exhausted_when_all_busy() {
        let config = PoolConfig {
            max_instances: 1,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (pool, _provider) = pool_with(config, Duration::ZERO);
        let _held = pool.acquire("a").await.unwrap();
        let err = pool.acquire("b").await.err().unwrap();
        assert!(matches!(err, SandboxError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_waiter_gets_capacity_on_release() {
        let config = PoolConfig {
            max_instances: 1,
            acquire_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (pool, _provider) = pool_with(config, Duration::ZERO);
        let held = pool.acquire("a").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("b").await.map(|l| l.sandbox().id().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.remove("a").await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_instances() {
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (pool, provider) = pool_with(config, Duration::ZERO);
        drop(pool.acquire("s1").await.unwrap());
        let busy = pool.acquire("s2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(pool.sweep_idle().await, 1);
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.state("s1"), None);
        assert_eq!(pool.state("s2"), Some(EntryState::Busy));
        drop(busy);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (pool, provider) = pool_with(config, Duration::ZERO);
        pool.start();
        drop(pool.acquire("s1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_warm_spares_are_used_first() {
        let config = PoolConfig {
            min_idle: 2,
            ..Default::default()
        };
        let (pool, provider) = pool_with(config, Duration::ZERO);
        assert_eq!(pool.warm_up().await.unwrap(), 2);
        assert_eq!(pool.stats().spares, 2);

        let _lease = pool.acquire("s1").await.unwrap();
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().spares, 1);
    }

    #[tokio::test]
    async fn test_removing_busy_session_destroys_on_release() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::ZERO);
        let lease = pool.acquire("s1").await.unwrap();
        pool.remove("s1").await;
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 0);
        drop(lease);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discard_replaces_instance() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::ZERO);
        let lease = pool.acquire("s1").await.unwrap();
        let first = lease.sandbox().id().to_string();
        lease.discard();
        let lease = pool.acquire("s1").await.unwrap();
        assert_ne!(lease.sandbox().id(), first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires() {
        let (pool, provider) = pool_with(PoolConfig::default(), Duration::ZERO);
        drop(pool.acquire("s1").await.unwrap());
        pool.shutdown().await;
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire("s1").await.err(), Some(SandboxError::PoolClosed)));
    }
}
