//! Per-tenant concurrency gate.
//!
//! Caps how many attempts one tenant may have in flight on this dispatcher.
//! The check and the increment happen under one lock, so two callers can
//! never both take the last slot. Slots are held by `GatePermit` and returned
//! on drop, whichever way the attempt ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use plansight_core::TenantId;

#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: usize,
    in_flight: Mutex<HashMap<TenantId, usize>>,
    released: Arc<Notify>,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            in_flight: Mutex::new(HashMap::new()),
            released: Arc::new(Notify::new()),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Take a slot for `tenant_id` if one is free.
    pub fn try_acquire(self: &Arc<Self>, tenant_id: TenantId) -> Option<GatePermit> {
        let mut counts = self.counts();
        let current = counts.entry(tenant_id).or_insert(0);
        if *current >= self.limit {
            return None;
        }
        *current += 1;
        Some(GatePermit {
            gate: Arc::clone(self),
            tenant_id,
        })
    }

    /// Take a slot regardless of the limit (forced execution).
    ///
    /// The slot still counts against the tenant until released.
    pub fn acquire_override(self: &Arc<Self>, tenant_id: TenantId) -> GatePermit {
        let mut counts = self.counts();
        let current = counts.entry(tenant_id).or_insert(0);
        if *current >= self.limit {
            debug!(
                tenant_id = %tenant_id,
                in_flight = *current,
                limit = self.limit,
                "concurrency limit overridden by forced execution"
            );
        }
        *current += 1;
        GatePermit {
            gate: Arc::clone(self),
            tenant_id,
        }
    }

    pub fn in_flight(&self, tenant_id: TenantId) -> usize {
        self.counts().get(&tenant_id).copied().unwrap_or(0)
    }

    /// Tenants with no free slot.
    pub fn saturated(&self) -> Vec<TenantId> {
        self.counts()
            .iter()
            .filter(|(_, n)| **n >= self.limit)
            .map(|(tenant_id, _)| *tenant_id)
            .collect()
    }

    /// Signalled every time a slot is returned.
    pub fn released(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }

    fn release(&self, tenant_id: TenantId) {
        {
            let mut counts = self.counts();
            if let Some(current) = counts.get_mut(&tenant_id) {
                *current = current.saturating_sub(1);
                if *current == 0 {
                    counts.remove(&tenant_id);
                }
            }
        }
        self.released.notify_one();
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<TenantId, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One occupied slot. Returned to the gate on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    tenant_id: TenantId,
}

impl GatePermit {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release(self.tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_enforced_per_tenant() {
        let gate = ConcurrencyGate::new(2);
        let t1 = TenantId::new();
        let t2 = TenantId::new();

        let a = gate.try_acquire(t1).unwrap();
        let _b = gate.try_acquire(t1).unwrap();
        assert!(gate.try_acquire(t1).is_none());
        assert!(gate.try_acquire(t2).is_some());

        drop(a);
        assert_eq!(gate.in_flight(t1), 1);
        assert!(gate.try_acquire(t1).is_some());
    }

    #[test]
    fn override_exceeds_limit_and_still_counts() {
        let gate = ConcurrencyGate::new(1);
        let tenant = TenantId::new();

        let _a = gate.try_acquire(tenant).unwrap();
        let forced = gate.acquire_override(tenant);
        assert_eq!(gate.in_flight(tenant), 2);

        drop(forced);
        assert_eq!(gate.in_flight(tenant), 1);
        assert!(gate.try_acquire(tenant).is_none());
    }

    #[test]
    fn saturated_lists_only_full_tenants() {
        let gate = ConcurrencyGate::new(2);
        let full = TenantId::new();
        let partial = TenantId::new();
        let _a = gate.try_acquire(full).unwrap();
        let _b = gate.try_acquire(full).unwrap();
        let _c = gate.try_acquire(partial).unwrap();

        assert_eq!(gate.saturated(), vec![full]);
    }

    #[test]
    fn concurrent_acquires_never_exceed_limit() {
        let gate = ConcurrencyGate::new(3);
        let tenant = TenantId::new();

        let permits: Vec<Option<GatePermit>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| gate.try_acquire(tenant)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(permits.iter().filter(|p| p.is_some()).count(), 3);
        assert_eq!(gate.in_flight(tenant), 3);
        drop(permits);
        assert_eq!(gate.in_flight(tenant), 0);
    }

    #[tokio::test]
    async fn release_wakes_waiters() {
        let gate = ConcurrencyGate::new(1);
        let tenant = TenantId::new();
        let released = gate.released();
        let permit = gate.try_acquire(tenant).unwrap();

        let waiter = tokio::spawn(async move { released.notified().await });
        tokio::task::yield_now().await;
        drop(permit);

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
