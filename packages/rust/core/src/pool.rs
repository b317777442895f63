//! Bounded pool of reusable processing units.
//!
//! Units are created lazily, up to `max_size`, and handed out through the
//! [`PooledUnit`] guard. The guard returns its unit in `Drop`, so the unit
//! comes back exactly once whether the holder finishes, fails, panics or is
//! cancelled. Waiters are served in FIFO order.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use batchscout_shared::{BatchScoutError, Result};

use crate::ports::UnitFactory;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    /// Units alive right now (idle + in use).
    pub created: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct IdleUnit<U> {
    id: u64,
    unit: U,
    last_used_at: Instant,
}

struct PoolState<U> {
    idle: VecDeque<IdleUnit<U>>,
    created: usize,
    in_use: usize,
    next_id: u64,
    closed: bool,
}

/// Pool of units produced by a [`UnitFactory`].
pub struct ResourcePool<F: UnitFactory> {
    factory: F,
    max_size: usize,
    /// One permit per unit that may exist; held by every checked-out unit.
    slots: Arc<Semaphore>,
    state: Mutex<PoolState<F::Unit>>,
}

impl<F: UnitFactory> ResourcePool<F> {
    /// Create an empty pool. No unit is built until the first `acquire`.
    pub fn new(factory: F, max_size: usize) -> Result<Arc<Self>> {
        if max_size == 0 {
            return Err(BatchScoutError::config("max_pool_size must be at least 1"));
        }
        Ok(Arc::new(Self {
            factory,
            max_size,
            slots: Arc::new(Semaphore::new(max_size)),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                created: 0,
                in_use: 0,
                next_id: 0,
                closed: false,
            }),
        }))
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Wait for a free unit, building one if the pool is below capacity.
    ///
    /// Fails with `ResourceCreation` if the factory fails or the pool is
    /// closed. Retrying is up to the caller.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledUnit<F>> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BatchScoutError::resource_creation("resource pool is closed"))?;

        let reused = {
            let mut state = self.lock();
            if state.closed {
                return Err(BatchScoutError::resource_creation("resource pool is closed"));
            }
            let reused = state.idle.pop_front();
            if reused.is_some() {
                state.in_use += 1;
            }
            reused
        };

        if let Some(idle) = reused {
            debug!(unit_id = idle.id, idle_ms = idle.last_used_at.elapsed().as_millis(), "reusing pooled unit");
            return Ok(PooledUnit::new(self.clone(), idle.id, idle.unit, permit));
        }

        // The held permit bounds idle + in use + being created by `max_size`.
        let unit = self.factory.create().await.map_err(|err| match err {
            BatchScoutError::ResourceCreation(_) => err,
            other => BatchScoutError::resource_creation(other.to_string()),
        })?;

        let id = {
            let mut state = self.lock();
            state.created += 1;
            state.in_use += 1;
            state.next_id += 1;
            state.next_id
        };
        info!(unit_id = id, max_size = self.max_size, "created pooled unit");
        Ok(PooledUnit::new(self.clone(), id, unit, permit))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            max_size: self.max_size,
            created: state.created,
            idle: state.idle.len(),
            in_use: state.in_use,
        }
    }

    /// Refuse further acquisitions and destroy every idle unit. Units still
    /// checked out are destroyed through the factory when their guards drop.
    #[instrument(skip_all)]
    pub async fn close(&self) {
        self.slots.close();
        let drained: Vec<IdleUnit<F::Unit>> = {
            let mut state = self.lock();
            state.closed = true;
            let idle = state.idle.len();
            state.created -= idle;
            state.idle.drain(..).collect()
        };

        let count = drained.len();
        for idle in drained {
            self.factory.destroy(idle.unit).await;
        }
        info!(destroyed = count, "resource pool closed");
    }

    /// Put a unit back on the idle list. Hands it back to the caller when the
    /// pool has been closed in the meantime.
    fn give_back(&self, id: u64, unit: F::Unit) -> Option<F::Unit> {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.closed {
            state.created = state.created.saturating_sub(1);
            return Some(unit);
        }
        state.idle.push_back(IdleUnit {
            id,
            unit,
            last_used_at: Instant::now(),
        });
        None
    }

    /// Destroy a unit returned after `close` on a background task.
    fn destroy_detached(self: &Arc<Self>, id: u64, unit: F::Unit) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move {
                    pool.factory.destroy(unit).await;
                    debug!(unit_id = id, "destroyed unit returned after close");
                });
            }
            Err(_) => {
                warn!(unit_id = id, "no runtime to destroy unit returned after close, dropping it");
                drop(unit);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Unit>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// PooledUnit
// ---------------------------------------------------------------------------

/// A unit checked out of a [`ResourcePool`]. Dereferences to the unit.
pub struct PooledUnit<F: UnitFactory> {
    pool: Arc<ResourcePool<F>>,
    id: u64,
    unit: Option<F::Unit>,
    // Dropped after `Drop::drop` has put the unit back, so the next waiter
    // always finds it idle.
    _permit: OwnedSemaphorePermit,
}

impl<F: UnitFactory> PooledUnit<F> {
    fn new(pool: Arc<ResourcePool<F>>, id: u64, unit: F::Unit, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            id,
            unit: Some(unit),
            _permit: permit,
        }
    }

    /// Pool-local identifier of the unit.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Return the unit to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl<F: UnitFactory> Deref for PooledUnit<F> {
    type Target = F::Unit;

    fn deref(&self) -> &Self::Target {
        self.unit.as_ref().expect("pooled unit is present until dropped")
    }
}

impl<F: UnitFactory> DerefMut for PooledUnit<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.unit.as_mut().expect("pooled unit is present until dropped")
    }
}

impl<F: UnitFactory> Drop for PooledUnit<F> {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            match self.pool.give_back(self.id, unit) {
                None => debug!(unit_id = self.id, "released pooled unit"),
                Some(unit) => self.pool.destroy_detached(self.id, unit),
            }
        }
    }
}
