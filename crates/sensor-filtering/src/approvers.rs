//! Approvers are evaluated once the basenames involved in an operation are
//! known. They never reject an operation at entry: a non approved operation
//! is only marked as discarded.

use sensor_core::event::EventType;

use crate::policy::{PolicyMode, PolicySet};

/// Returns true if the operation must be discarded.
///
/// `NoFilter` and `Accept` keep every operation, `Deny` keeps it only when
/// one of the given basenames is approved.
pub fn filter_syscall(policy: &PolicySet, event_type: EventType, basenames: &[&str]) -> bool {
    let policy = policy.policy(event_type);
    match policy.mode {
        PolicyMode::NoFilter | PolicyMode::Accept => false,
        PolicyMode::Deny => {
            let approved = basenames
                .iter()
                .any(|name| policy.basename_approvers.contains(*name));
            if !approved {
                log::trace!("{event_type} on {basenames:?} not approved");
            }
            !approved
        }
    }
}
