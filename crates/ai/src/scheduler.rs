//! Scheduling policy: which jobs may run now, and in what order.
//!
//! Ordering is priority ascending (1 runs first), then creation time
//! ascending (FIFO within a priority band), then id as a final tie-break so
//! the order is total and deterministic. This is the only fairness
//! mechanism: a steady stream of higher-priority work can starve lower
//! priorities.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use plansight_core::TenantId;

use crate::job::Job;

/// Tenant scope for a scheduling query.
///
/// - `Any`: jobs of every tenant (the shared dispatcher).
/// - `Tenant`: only the given tenant (tenant-facing queue views).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TenantScope {
    Any,
    Tenant(TenantId),
}

impl TenantScope {
    pub fn allows(&self, tenant_id: TenantId) -> bool {
        match self {
            TenantScope::Any => true,
            TenantScope::Tenant(t) => *t == tenant_id,
        }
    }

    pub fn tenant(&self) -> Option<TenantId> {
        match self {
            TenantScope::Any => None,
            TenantScope::Tenant(t) => Some(*t),
        }
    }
}

/// Total order used by every eligibility query.
pub fn scheduling_order(a: &Job, b: &Job) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Eligible jobs within `scope`, in scheduling order, at most `limit`.
pub fn select_eligible<'a, I>(jobs: I, scope: TenantScope, now: DateTime<Utc>, limit: usize) -> Vec<&'a Job>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut eligible: Vec<&Job> = jobs
        .into_iter()
        .filter(|j| scope.allows(j.tenant_id) && j.is_eligible(now))
        .collect();

    eligible.sort_by(|a, b| scheduling_order(a, b));
    eligible.truncate(limit);
    eligible
}
