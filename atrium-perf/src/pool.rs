//! Capacity-bounded resource pools shared by all sandboxes.
//!
//! A request that does not fit joins a FIFO queue instead of failing. Each
//! release re-evaluates the queue head and grants as many waiters as now
//! fit. Grants happen under the pool lock, so `used` can never pass
//! `capacity` even when releases race with new requests.

use crate::{PerfError, PoolConfig, Result};
use atrium_types::{ResourceLimits, SandboxId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Network,
    Storage,
}

impl ResourceKind {
    /// Acquisition order used by [`ResourcePools::reserve`].
    pub const ALL: [ResourceKind; 4] = [Self::Memory, Self::Cpu, Self::Network, Self::Storage];

    /// Amount a sandbox with `limits` reserves from this pool.
    pub fn demand(&self, limits: &ResourceLimits) -> u64 {
        match self {
            Self::Memory => limits.max_memory_mb,
            Self::Cpu => limits.max_cpu_percent,
            Self::Network => limits.max_network_requests,
            Self::Storage => limits.max_storage_kb,
        }
    }

    fn capacity_in(&self, config: &PoolConfig) -> u64 {
        match self {
            Self::Memory => config.memory_mb,
            Self::Cpu => config.cpu_percent,
            Self::Network => config.network_requests,
            Self::Storage => config.storage_kb,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Cpu => write!(f, "cpu"),
            Self::Network => write!(f, "network"),
            Self::Storage => write!(f, "storage"),
        }
    }
}

/// Read-only view of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub kind: ResourceKind,
    pub capacity: u64,
    pub used: u64,
    pub available: u64,
    /// Sandboxes blocked on allocation, head first.
    pub waiting_queue: Vec<SandboxId>,
}

struct Waiter {
    id: u64,
    owner: SandboxId,
    amount: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct PoolState {
    used: u64,
    held: HashMap<SandboxId, u64>,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
}

impl PoolState {
    fn grant(&mut self, owner: SandboxId, amount: u64) {
        self.used += amount;
        *self.held.entry(owner).or_default() += amount;
    }

    fn revoke(&mut self, owner: SandboxId, amount: u64) {
        self.used = self.used.saturating_sub(amount);
        if let Some(held) = self.held.get_mut(&owner) {
            *held = held.saturating_sub(amount);
            if *held == 0 {
                self.held.remove(&owner);
            }
        }
    }

    /// Grants queued requests from the head while they fit. Waiters whose
    /// caller went away are skipped.
    fn drain_queue(&mut self, capacity: u64) {
        while let Some(front) = self.queue.front() {
            if front.grant.is_closed() {
                self.queue.pop_front();
                continue;
            }
            if self.used + front.amount > capacity {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.grant(waiter.owner, waiter.amount);
            if waiter.grant.send(()).is_err() {
                self.revoke(waiter.owner, waiter.amount);
            }
        }
    }
}

/// One resource kind's pool.
pub struct ResourcePool {
    kind: ResourceKind,
    capacity: u64,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(kind: ResourceKind, capacity: u64) -> Self {
        Self {
            kind,
            capacity,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    /// Amount currently held by `owner`.
    pub fn allocated_to(&self, owner: SandboxId) -> u64 {
        self.state.lock().held.get(&owner).copied().unwrap_or(0)
    }

    fn check_capacity(&self, amount: u64) -> Result<()> {
        if amount > self.capacity {
            return Err(PerfError::CapacityExceeded {
                kind: self.kind,
                requested: amount,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Grants `amount` immediately if it fits and nobody is queued ahead.
    pub fn try_acquire(&self, owner: SandboxId, amount: u64) -> Result<bool> {
        self.check_capacity(amount)?;
        let mut state = self.state.lock();
        state.queue.retain(|w| !w.grant.is_closed());
        if state.queue.is_empty() && state.used + amount <= self.capacity {
            state.grant(owner, amount);
            return Ok(true);
        }
        Ok(false)
    }

    /// Acquires `amount` for `owner`, queueing until `deadline` if the pool
    /// is short. Requests larger than the whole pool fail immediately.
    pub async fn acquire(&self, owner: SandboxId, amount: u64, deadline: Instant) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        if self.try_acquire(owner, amount)? {
            return Ok(());
        }

        let (waiter_id, mut granted) = {
            let mut state = self.state.lock();
            // Capacity may have been released since the fast path.
            if state.queue.is_empty() && state.used + amount <= self.capacity {
                state.grant(owner, amount);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.queue.push_back(Waiter {
                id,
                owner,
                amount,
                grant: tx,
            });
            debug!(
                kind = %self.kind,
                sandbox_id = %owner,
                amount,
                position = state.queue.len(),
                "Resource request queued"
            );
            (id, rx)
        };

        match tokio::time::timeout_at(deadline, &mut granted).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PerfError::AllocationTimeout {
                kind: self.kind,
                requested: amount,
            }),
            Err(_) => {
                let mut state = self.state.lock();
                if let Some(pos) = state.queue.iter().position(|w| w.id == waiter_id) {
                    state.queue.remove(pos);
                    drop(state);
                    warn!(
                        kind = %self.kind,
                        sandbox_id = %owner,
                        amount,
                        "Resource request timed out"
                    );
                    return Err(PerfError::AllocationTimeout {
                        kind: self.kind,
                        requested: amount,
                    });
                }
                drop(state);
                // Popped by a release between the deadline and the lock.
                match granted.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(PerfError::AllocationTimeout {
                        kind: self.kind,
                        requested: amount,
                    }),
                }
            }
        }
    }

    /// Releases everything `owner` holds, drops its queued requests and
    /// grants waiting requests that now fit. Returns the amount freed.
    pub fn release_all(&self, owner: SandboxId) -> u64 {
        let mut state = self.state.lock();
        let freed = state.held.remove(&owner).unwrap_or(0);
        state.used = state.used.saturating_sub(freed);
        state.queue.retain(|w| w.owner != owner);
        state.drain_queue(self.capacity);
        freed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            kind: self.kind,
            capacity: self.capacity,
            used: state.used,
            available: self.capacity - state.used,
            waiting_queue: state
                .queue
                .iter()
                .filter(|w| !w.grant.is_closed())
                .map(|w| w.owner)
                .collect(),
        }
    }
}

/// The four pools, reserved and released together per sandbox.
pub struct ResourcePools {
    pools: [ResourcePool; 4],
}

impl ResourcePools {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            pools: ResourceKind::ALL.map(|kind| ResourcePool::new(kind, kind.capacity_in(config))),
        }
    }

    pub fn pool(&self, kind: ResourceKind) -> &ResourcePool {
        match kind {
            ResourceKind::Memory => &self.pools[0],
            ResourceKind::Cpu => &self.pools[1],
            ResourceKind::Network => &self.pools[2],
            ResourceKind::Storage => &self.pools[3],
        }
    }

    /// Reserves the ceilings in `limits` for `owner`, pool by pool in a
    /// fixed order, sharing one deadline. On failure nothing stays reserved.
    pub async fn reserve(
        &self,
        owner: SandboxId,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for pool in &self.pools {
            if let Err(e) = pool.acquire(owner, pool.kind.demand(limits), deadline).await {
                self.release(owner);
                return Err(e);
            }
        }
        debug!(sandbox_id = %owner, "Sandbox resources reserved");
        Ok(())
    }

    pub fn release(&self, owner: SandboxId) {
        for pool in &self.pools {
            pool.release_all(owner);
        }
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.pools.iter().map(ResourcePool::status).collect()
    }
}
