//! Bounded, per-device pools of reusable library handles.
//!
//! A [`DeviceHandle`] owns the expensive per-device state a numerical library
//! needs: FFT planners whose internal plan caches amortize across calls, plus
//! a slot id for diagnostics. Handles are constructed lazily, owned
//! exclusively by the pool, and lent to exactly one caller at a time through
//! a [`HandleGuard`] that returns them on every exit path — early returns and
//! unwinding included.
//!
//! ## Blocking semantics
//!
//! `acquire` blocks the calling thread when a device's pool is at capacity
//! with no idle handle, and wakes when a peer releases. There is deliberately
//! no timeout and no deadlock detection: a borrower that never releases
//! starves every other caller on that key. That trade-off favors simplicity
//! over deadlock avoidance and is part of the contract, not an oversight —
//! [`crate::StatusCode::ResourceExhausted`] stays reserved for a future
//! bounded-wait policy.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::error::{DespacharError, Result};

/// Opaque identifier selecting which pool a call's handle comes from.
///
/// Two calls with the same key share pooled handles; the pool serializes them
/// if they are concurrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Device ordinal
    pub device: u32,
    /// Execution-stream identifier within the device
    pub stream: u32,
}

impl DeviceKey {
    /// Key for a device ordinal and stream
    #[must_use]
    pub fn new(device: u32, stream: u32) -> Self {
        Self { device, stream }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}/s{}", self.device, self.stream)
    }
}

/// Pool sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum handles constructed per device key. Clamped to at least 1.
    pub capacity_per_device: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_per_device: 4,
        }
    }
}

/// Snapshot of one device pool's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Handles constructed so far (never exceeds capacity)
    pub live: usize,
    /// Handles sitting idle in the pool
    pub idle: usize,
    /// Handles currently lent out
    pub borrowed: usize,
}

/// Per-device library context: the expensive, reusable state.
///
/// Construction is the costly step (planner setup stands in for device
/// allocation and driver initialization); reuse is cheap. The FFT planners
/// cache plans internally, so repeated dispatches of the same transform
/// length on one handle skip planning entirely.
pub struct DeviceHandle {
    key: DeviceKey,
    slot: u32,
    planner_f32: FftPlanner<f32>,
    planner_f64: FftPlanner<f64>,
}

impl DeviceHandle {
    fn new(key: DeviceKey, slot: u32) -> Self {
        log::debug!("constructing handle {slot} for {key}");
        Self {
            key,
            slot,
            planner_f32: FftPlanner::new(),
            planner_f64: FftPlanner::new(),
        }
    }

    /// Device key this handle is bound to
    #[must_use]
    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// Slot index within the device pool, for diagnostics
    #[must_use]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Single-precision transform planner (plan cache)
    pub fn planner_f32(&mut self) -> &mut FftPlanner<f32> {
        &mut self.planner_f32
    }

    /// Double-precision transform planner (plan cache)
    pub fn planner_f64(&mut self) -> &mut FftPlanner<f64> {
        &mut self.planner_f64
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Accounting invariant: `live == idle.len() + borrowed` except transiently
/// inside a locked section.
struct PoolState {
    idle: Vec<DeviceHandle>,
    live: usize,
    borrowed: usize,
    /// Monotonic, so a slot id names one handle for the pool's lifetime even
    /// across drains
    next_slot: u32,
    /// Set when release accounting underflowed; the pool refuses further
    /// service so the programming error surfaces instead of corrupting
    /// borrow tracking.
    fault: bool,
}

struct DevicePool {
    key: DeviceKey,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl DevicePool {
    fn new(key: DeviceKey, capacity: usize) -> Self {
        Self {
            key,
            capacity,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                live: 0,
                borrowed: 0,
                next_slot: 0,
                fault: false,
            }),
            available: Condvar::new(),
        }
    }

    fn take(&self) -> Result<DeviceHandle> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DespacharError::PoolPoisoned { key: self.key })?;
        loop {
            if state.fault {
                return Err(DespacharError::ReleaseUnderflow { key: self.key });
            }
            if let Some(handle) = state.idle.pop() {
                state.borrowed += 1;
                return Ok(handle);
            }
            if state.live < self.capacity {
                state.live += 1;
                state.borrowed += 1;
                let slot = state.next_slot;
                state.next_slot += 1;
                return Ok(DeviceHandle::new(self.key, slot));
            }
            log::debug!("pool {} exhausted, blocking until a handle frees", self.key);
            state = self
                .available
                .wait(state)
                .map_err(|_| DespacharError::PoolPoisoned { key: self.key })?;
        }
    }

    fn give_back(&self, handle: DeviceHandle) {
        let Ok(mut state) = self.state.lock() else {
            log::error!("pool {} mutex poisoned while returning a handle", self.key);
            return;
        };
        if state.borrowed == 0 {
            // Unreachable through HandleGuard; kept so a foreign release is
            // reported as Internal instead of silently absorbed.
            state.fault = true;
            log::error!(
                "handle {} returned to {} with no outstanding borrow",
                handle.slot(),
                self.key
            );
            return;
        }
        state.borrowed -= 1;
        state.idle.push(handle);
        drop(state);
        self.available.notify_one();
    }

    fn stats(&self) -> Result<PoolStats> {
        let state = self
            .state
            .lock()
            .map_err(|_| DespacharError::PoolPoisoned { key: self.key })?;
        Ok(PoolStats {
            live: state.live,
            idle: state.idle.len(),
            borrowed: state.borrowed,
        })
    }
}

/// Thread-safe pool of device handles, one bounded sub-pool per device key.
///
/// Sub-pools are created lazily on first demand and never merged or shrunk at
/// runtime; handles die at [`HandlePool::drain`] or process exit.
pub struct HandlePool {
    capacity_per_device: usize,
    pools: Mutex<HashMap<DeviceKey, Arc<DevicePool>>>,
}

impl HandlePool {
    /// Create an empty pool with the given sizing
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            capacity_per_device: config.capacity_per_device.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Per-device handle cap
    #[must_use]
    pub fn capacity_per_device(&self) -> usize {
        self.capacity_per_device
    }

    fn device_pool(&self, key: DeviceKey) -> Result<Arc<DevicePool>> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| DespacharError::PoolPoisoned { key })?;
        Ok(Arc::clone(pools.entry(key).or_insert_with(|| {
            Arc::new(DevicePool::new(key, self.capacity_per_device))
        })))
    }

    /// Borrow a handle for `key`, constructing one if the sub-pool is below
    /// capacity.
    ///
    /// Blocks the calling thread indefinitely when the sub-pool is exhausted;
    /// see the module docs for why there is no timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the sub-pool is poisoned or has recorded a release
    /// underflow.
    pub fn acquire(&self, key: DeviceKey) -> Result<HandleGuard<'_>> {
        let pool = self.device_pool(key)?;
        let handle = pool.take()?;
        Ok(HandleGuard {
            pool,
            handle: Some(handle),
            _borrow: PhantomData,
        })
    }

    /// Accounting snapshot for a device key, if its sub-pool exists.
    pub fn stats(&self, key: DeviceKey) -> Result<Option<PoolStats>> {
        let pools = self
            .pools
            .lock()
            .map_err(|_| DespacharError::PoolPoisoned { key })?;
        pools.get(&key).map(|p| p.stats()).transpose()
    }

    /// Drop all idle handles. Borrowed handles survive until their guards
    /// drop, at which point they rejoin their (now smaller) sub-pools.
    pub fn drain(&self) {
        let Ok(pools) = self.pools.lock() else {
            log::error!("handle pool map poisoned during drain");
            return;
        };
        for pool in pools.values() {
            if let Ok(mut state) = pool.state.lock() {
                let dropped = state.idle.len();
                state.live -= dropped;
                state.idle.clear();
                if dropped > 0 {
                    log::debug!("drained {dropped} idle handles from {}", pool.key);
                }
            }
        }
    }
}

impl fmt::Debug for HandlePool {
    // No interior detail: taking the map lock inside fmt would be a lock
    // acquisition the hot path never expects.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("capacity_per_device", &self.capacity_per_device)
            .finish_non_exhaustive()
    }
}

/// Scoped borrow of a [`DeviceHandle`].
///
/// Dereferences to the handle; dropping the guard returns the handle to its
/// pool and wakes one blocked acquirer. The lifetime ties the borrow to the
/// pool so a handle cannot be stashed past the borrowing call.
pub struct HandleGuard<'pool> {
    pool: Arc<DevicePool>,
    handle: Option<DeviceHandle>,
    _borrow: PhantomData<&'pool HandlePool>,
}

impl Deref for HandleGuard<'_> {
    type Target = DeviceHandle;

    fn deref(&self) -> &DeviceHandle {
        self.handle.as_ref().expect("handle present until drop")
    }
}

impl DerefMut for HandleGuard<'_> {
    fn deref_mut(&mut self) -> &mut DeviceHandle {
        self.handle.as_mut().expect("handle present until drop")
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle);
        }
    }
}

impl fmt::Debug for HandleGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_capacity(n: usize) -> HandlePool {
        HandlePool::new(PoolConfig {
            capacity_per_device: n,
        })
    }

    // ==================== Acquire / release ====================

    #[test]
    fn test_acquire_constructs_lazily() {
        let pool = pool_with_capacity(2);
        let key = DeviceKey::new(0, 0);
        assert_eq!(pool.stats(key).expect("stats"), None);

        let guard = pool.acquire(key).expect("acquire");
        assert_eq!(guard.key(), key);
        let stats = pool.stats(key).expect("stats").expect("pool exists");
        assert_eq!(
            stats,
            PoolStats {
                live: 1,
                idle: 0,
                borrowed: 1
            }
        );
    }

    #[test]
    fn test_release_returns_handle_to_pool() {
        let pool = pool_with_capacity(2);
        let key = DeviceKey::new(0, 0);
        let guard = pool.acquire(key).expect("acquire");
        let slot = guard.slot();
        drop(guard);

        let stats = pool.stats(key).expect("stats").expect("pool exists");
        assert_eq!(
            stats,
            PoolStats {
                live: 1,
                idle: 1,
                borrowed: 0
            }
        );

        // Reacquire reuses the same handle rather than constructing.
        let guard = pool.acquire(key).expect("acquire");
        assert_eq!(guard.slot(), slot);
    }

    #[test]
    fn test_capacity_bounds_construction() {
        let pool = pool_with_capacity(2);
        let key = DeviceKey::new(1, 0);
        let g1 = pool.acquire(key).expect("acquire");
        let g2 = pool.acquire(key).expect("acquire");
        assert_ne!(g1.slot(), g2.slot());
        let stats = pool.stats(key).expect("stats").expect("pool exists");
        assert_eq!(stats.live, 2);
        assert_eq!(stats.borrowed, 2);
    }

    #[test]
    fn test_keys_get_independent_pools() {
        let pool = pool_with_capacity(1);
        let a = DeviceKey::new(0, 0);
        let b = DeviceKey::new(0, 1);
        let _ga = pool.acquire(a).expect("acquire a");
        // Capacity 1 on `a` must not block `b`.
        let _gb = pool.acquire(b).expect("acquire b");
        assert_eq!(pool.stats(a).expect("stats").expect("exists").live, 1);
        assert_eq!(pool.stats(b).expect("stats").expect("exists").live, 1);
    }

    #[test]
    fn test_capacity_clamped_to_one() {
        let pool = pool_with_capacity(0);
        assert_eq!(pool.capacity_per_device(), 1);
        let key = DeviceKey::default();
        let _g = pool.acquire(key).expect("acquire");
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let pool = Arc::new(pool_with_capacity(1));
        let key = DeviceKey::new(0, 0);
        let guard = pool.acquire(key).expect("acquire");

        let (tx, rx) = mpsc::channel();
        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let _g = pool2.acquire(key).expect("acquire after wake");
            tx.send(()).expect("send");
        });

        // The waiter must be blocked while the guard is held.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).expect("woken");
        waiter.join().expect("join");
    }

    #[test]
    fn test_drain_drops_idle_only() {
        let pool = pool_with_capacity(2);
        let key = DeviceKey::new(0, 0);
        let g1 = pool.acquire(key).expect("acquire");
        let g2 = pool.acquire(key).expect("acquire");
        drop(g2);

        pool.drain();
        let stats = pool.stats(key).expect("stats").expect("exists");
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.borrowed, 1);
        drop(g1);
        let stats = pool.stats(key).expect("stats").expect("exists");
        assert_eq!(stats.idle, 1);
    }

    // ==================== Handle contents ====================

    #[test]
    fn test_handle_planners_are_usable() {
        use rustfft::Fft;

        let pool = pool_with_capacity(1);
        let mut guard = pool.acquire(DeviceKey::default()).expect("acquire");
        let fft = guard.planner_f64().plan_fft_forward(8);
        assert_eq!(fft.len(), 8);
        let fft32 = guard.planner_f32().plan_fft_inverse(16);
        assert_eq!(fft32.len(), 16);
    }

    #[test]
    fn test_device_key_display() {
        assert_eq!(DeviceKey::new(3, 1).to_string(), "dev3/s1");
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity_per_device, 4);
    }
}
