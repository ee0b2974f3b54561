//! # Admission policy
//!
//! This crate decides whether an operation is interesting for the rest of the
//! system or if it should be discarded. Decisions are taken at different
//! points of the operation lifecycle, because the information needed to
//! discard is not available at syscall entry:
//!
//! - **Admission** (syscall entry): the event type must be enabled (or always
//!   enabled), and the calling process must not be discarded when the type is
//!   filtered. A rejected operation creates no state at all.
//! - **Approvers** (internal probe): once basenames are known, a `deny` policy
//!   keeps the operation only if an approver matches. A non approved
//!   operation is marked discarded: it still completes its lifecycle, but its
//!   event is suppressed unless the type is always enabled.
//! - **Inode discarders** (path resolution): an object, and everything below
//!   it, can be excluded from future monitoring. A discarder is stamped with
//!   the revision of the object and it's void as soon as the object changes.
//!
//! # Policy source
//!
//! The policy is read-only for the pipeline: handlers take a snapshot with
//! [`PolicyHandle::current`] and keep it for the whole operation, while the
//! [`PolicyUpdater`] replaces it from outside.

pub mod approvers;
pub(crate) mod config;
pub mod discarders;
pub mod policy;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use sensor_common::{Pid, Timestamp};
use sensor_core::event::EventType;
use serde::{Deserialize, Serialize};

pub use approvers::filter_syscall;
pub use discarders::Discarders;
pub use policy::{policy_channel, Policy, PolicyHandle, PolicyMode, PolicySet, PolicyUpdater};

/// Reason of an admission rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The event type is neither enabled nor always enabled
    Disabled,
    /// The calling process is discarded for this event type
    ProcessDiscarded,
}

/// Entry point of the admission policy: the current policy snapshot, the
/// discarders and the filtering counters.
pub struct Filter {
    policy: PolicyHandle,
    discarders: Discarders,
    stats: FilterStats,
}

impl Filter {
    pub fn new(policy: PolicyHandle, discarders: Discarders) -> Self {
        Self {
            policy,
            discarders,
            stats: FilterStats::default(),
        }
    }

    /// Decide whether to track an operation at all. On success returns the
    /// policy snapshot the operation must be evaluated against.
    pub fn admit(
        &self,
        event_type: EventType,
        pid: Pid,
        now: Timestamp,
    ) -> Result<Arc<PolicySet>, Rejection> {
        let policy = self.policy.current();
        if !policy.is_enabled(event_type) && !policy.is_always_enabled(event_type) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Rejection::Disabled);
        }
        if policy.policy(event_type).mode != PolicyMode::NoFilter
            && self.discarders.is_process_discarded(pid, event_type, now)
        {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            self.stats
                .process_discarders_hit
                .fetch_add(1, Ordering::Relaxed);
            return Err(Rejection::ProcessDiscarded);
        }
        Ok(policy)
    }

    pub fn discarders(&self) -> &Discarders {
        &self.discarders
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    /// Count an operation discarded by approvers
    pub fn record_approver_discard(&self) {
        self.stats
            .discarded_by_approvers
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count an operation discarded during path resolution
    pub fn record_resolver_discard(&self) {
        self.stats
            .discarded_by_resolver
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FilterStatsSnapshot {
        self.stats.snapshot()
    }
}

#[derive(Debug, Default)]
struct FilterStats {
    rejected: AtomicU64,
    discarded_by_approvers: AtomicU64,
    discarded_by_resolver: AtomicU64,
    process_discarders_hit: AtomicU64,
}

impl FilterStats {
    fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded_by_approvers: self.discarded_by_approvers.load(Ordering::Relaxed),
            discarded_by_resolver: self.discarded_by_resolver.load(Ordering::Relaxed),
            process_discarders_hit: self.process_discarders_hit.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the filtering counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStatsSnapshot {
    pub rejected: u64,
    pub discarded_by_approvers: u64,
    pub discarded_by_resolver: u64,
    pub process_discarders_hit: u64,
}
