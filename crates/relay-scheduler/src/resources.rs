//! Bounded-capacity resource registry.
//!
//! Every resource has a fixed integer capacity. A job acquires its whole
//! requirement set in one step or not at all, so no job ever holds part of
//! what it needs while waiting for the rest. Acquisition never blocks: a
//! request that cannot be met right now is denied and the caller retries in a
//! later cycle.

use chrono::{DateTime, Utc};
use relay_core::RunId;
use relay_core::pipeline::ResourceRequirements;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Why a request was not granted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceDenied {
    #[error("resource '{resource}' exhausted: requested {requested}, available {available}")]
    Exhausted {
        resource: String,
        requested: u32,
        available: u32,
    },

    #[error("unknown resource '{resource}'")]
    Unknown { resource: String },
}

impl ResourceDenied {
    pub fn resource(&self) -> &str {
        match self {
            ResourceDenied::Exhausted { resource, .. } | ResourceDenied::Unknown { resource } => {
                resource
            }
        }
    }
}

/// A quantity of one resource held by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceLock {
    pub resource: String,
    pub holder: RunId,
    pub quantity: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Point-in-time usage of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub resource: String,
    pub outstanding: u32,
    pub capacity: u32,
}

#[derive(Debug)]
struct Slot {
    capacity: u32,
    outstanding: u32,
}

#[derive(Debug, Default)]
struct Pool {
    slots: BTreeMap<String, Slot>,
}

impl Pool {
    fn check(&self, reqs: &ResourceRequirements) -> Result<(), ResourceDenied> {
        for (name, qty) in reqs.iter() {
            let slot = self.slots.get(name).ok_or_else(|| ResourceDenied::Unknown {
                resource: name.to_string(),
            })?;
            let available = slot.capacity - slot.outstanding;
            if qty > available {
                return Err(ResourceDenied::Exhausted {
                    resource: name.to_string(),
                    requested: qty,
                    available,
                });
            }
        }
        Ok(())
    }

    fn release(&mut self, locks: &[ResourceLock]) {
        for lock in locks {
            if let Some(slot) = self.slots.get_mut(&lock.resource) {
                slot.outstanding = slot.outstanding.saturating_sub(lock.quantity);
            }
        }
    }
}

/// Registry of named, capacity-bounded resources.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct ResourceManager {
    pool: Arc<Mutex<Pool>>,
}

fn lock_pool(pool: &Mutex<Pool>) -> MutexGuard<'_, Pool> {
    // Pool updates cannot panic half-way, so a poisoned lock is still consistent.
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceManager {
    pub fn new<S: Into<String>>(capacities: impl IntoIterator<Item = (S, u32)>) -> Self {
        let slots = capacities
            .into_iter()
            .map(|(name, capacity)| {
                (
                    name.into(),
                    Slot {
                        capacity,
                        outstanding: 0,
                    },
                )
            })
            .collect();
        Self {
            pool: Arc::new(Mutex::new(Pool { slots })),
        }
    }

    /// Try to take `quantity` of a single resource.
    pub fn try_acquire(
        &self,
        resource: &str,
        quantity: u32,
        holder: RunId,
    ) -> Result<ResourceGrant, ResourceDenied> {
        let reqs: ResourceRequirements = [(resource, quantity)].into_iter().collect();
        self.try_acquire_all(holder, &reqs)
    }

    /// Take every resource in `reqs`, or nothing.
    pub fn try_acquire_all(
        &self,
        holder: RunId,
        reqs: &ResourceRequirements,
    ) -> Result<ResourceGrant, ResourceDenied> {
        let mut pool = lock_pool(&self.pool);
        pool.check(reqs)?;

        let now = Utc::now();
        let mut locks = Vec::with_capacity(reqs.len());
        for (name, qty) in reqs.iter() {
            if let Some(slot) = pool.slots.get_mut(name) {
                slot.outstanding += qty;
            }
            locks.push(ResourceLock {
                resource: name.to_string(),
                holder,
                quantity: qty,
                acquired_at: now,
            });
        }
        drop(pool);

        debug!(run_id = %holder, resources = ?reqs, "resources granted");
        Ok(ResourceGrant {
            pool: Arc::clone(&self.pool),
            holder,
            locks,
            released: false,
        })
    }

    /// Whether `reqs` could be granted right now, without taking anything.
    pub fn check(&self, reqs: &ResourceRequirements) -> Result<(), ResourceDenied> {
        lock_pool(&self.pool).check(reqs)
    }

    /// Return a grant's resources. Releasing twice is a no-op.
    pub fn release(&self, grant: &mut ResourceGrant) {
        grant.release();
    }

    pub fn usage(&self) -> Vec<ResourceUsage> {
        lock_pool(&self.pool)
            .slots
            .iter()
            .map(|(name, slot)| ResourceUsage {
                resource: name.clone(),
                outstanding: slot.outstanding,
                capacity: slot.capacity,
            })
            .collect()
    }

    pub fn outstanding(&self, resource: &str) -> Option<u32> {
        lock_pool(&self.pool)
            .slots
            .get(resource)
            .map(|slot| slot.outstanding)
    }

    pub fn capacities(&self) -> BTreeMap<String, u32> {
        lock_pool(&self.pool)
            .slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.capacity))
            .collect()
    }
}

/// Resources held by one run.
///
/// Released explicitly with [`ResourceGrant::release`] or implicitly on drop,
/// so a panicking or aborted executor still gives everything back.
#[derive(Debug)]
pub struct ResourceGrant {
    pool: Arc<Mutex<Pool>>,
    holder: RunId,
    locks: Vec<ResourceLock>,
    released: bool,
}

impl ResourceGrant {
    pub fn holder(&self) -> RunId {
        self.holder
    }

    pub fn locks(&self) -> &[ResourceLock] {
        &self.locks
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        lock_pool(&self.pool).release(&self.locks);
        trace!(run_id = %self.holder, "resources released");
    }
}

impl Drop for ResourceGrant {
    fn drop(&mut self) {
        self.release();
    }
}
