use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use sensor_core::event::EventType;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::watch;

/// Filtering mode of an event type.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Every operation is monitored, no discarder is evaluated
    #[default]
    NoFilter,
    /// Operations are monitored unless a discarder matches
    Accept,
    /// Operations are discarded unless an approver matches
    Deny,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Policy {
    pub mode: PolicyMode,
    /// Basenames which approve an operation in `Deny` mode
    pub basename_approvers: HashSet<String>,
}

/// Complete admission policy for all event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    enabled: u64,
    always_enabled: u64,
    policies: HashMap<EventType, Policy>,
}

/// Everything enabled, nothing filtered.
impl Default for PolicySet {
    fn default() -> Self {
        Self {
            enabled: mask(&EventType::ALL),
            always_enabled: 0,
            policies: HashMap::new(),
        }
    }
}

fn mask(types: &[EventType]) -> u64 {
    types.iter().fold(0, |acc, t| acc | t.mask())
}

impl PolicySet {
    pub fn with_enabled(mut self, types: &[EventType]) -> Self {
        self.enabled = mask(types);
        self
    }

    pub fn with_always_enabled(mut self, types: &[EventType]) -> Self {
        self.always_enabled = mask(types);
        self
    }

    pub fn with_policy(mut self, event_type: EventType, policy: Policy) -> Self {
        self.policies.insert(event_type, policy);
        self
    }

    pub fn is_enabled(&self, event_type: EventType) -> bool {
        self.enabled & event_type.mask() != 0
    }

    /// Always enabled types are passed upstream even when discarded.
    pub fn is_always_enabled(&self, event_type: EventType) -> bool {
        self.always_enabled & event_type.mask() != 0
    }

    pub fn policy(&self, event_type: EventType) -> Policy {
        self.policies.get(&event_type).cloned().unwrap_or_default()
    }

    pub fn mode(&self, event_type: EventType) -> PolicyMode {
        self.policies
            .get(&event_type)
            .map(|policy| policy.mode)
            .unwrap_or_default()
    }

    /// Whether an operation of this type should produce an event.
    pub fn pass_to_userspace(&self, event_type: EventType, discarded: bool) -> bool {
        self.is_always_enabled(event_type) || (!discarded && self.is_enabled(event_type))
    }
}

/// Create the policy channel. The updater is kept by whoever owns the
/// configuration, handles are given to the pipeline.
pub fn policy_channel(initial: PolicySet) -> (PolicyUpdater, PolicyHandle) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (PolicyUpdater { tx }, PolicyHandle { rx })
}

/// Read side of the policy.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    rx: watch::Receiver<Arc<PolicySet>>,
}

impl PolicyHandle {
    /// Snapshot of the current policy. The snapshot is never modified, later
    /// updates produce a new one.
    pub fn current(&self) -> Arc<PolicySet> {
        self.rx.borrow().clone()
    }

    /// Wait for the next policy update. Returns false if the updater was dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Write side of the policy.
#[derive(Debug)]
pub struct PolicyUpdater {
    tx: watch::Sender<Arc<PolicySet>>,
}

impl PolicyUpdater {
    pub fn update(&self, policy: PolicySet) {
        log::debug!("updating admission policy: {policy:?}");
        // `send_replace` stores the value even if no handle is alive
        self.tx.send_replace(Arc::new(policy));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = PolicySet::default();
        assert!(policy.is_enabled(EventType::Link));
        assert!(policy.is_enabled(EventType::Mkdir));
        assert!(!policy.is_always_enabled(EventType::Link));
        assert_eq!(policy.mode(EventType::Link), PolicyMode::NoFilter);
    }

    #[test]
    fn pass_to_userspace() {
        let policy = PolicySet::default()
            .with_enabled(&[EventType::Link])
            .with_always_enabled(&[EventType::Mkdir]);
        assert!(policy.pass_to_userspace(EventType::Link, false));
        assert!(!policy.pass_to_userspace(EventType::Link, true));
        assert!(policy.pass_to_userspace(EventType::Mkdir, true));
    }

    #[tokio::test]
    async fn snapshots_survive_updates() {
        let (updater, mut handle) = policy_channel(PolicySet::default());
        let snapshot = handle.current();
        updater.update(PolicySet::default().with_enabled(&[]));
        assert!(handle.changed().await);
        assert!(snapshot.is_enabled(EventType::Link));
        assert!(!handle.current().is_enabled(EventType::Link));
        drop(updater);
        assert!(!handle.changed().await);
    }

    #[test]
    fn mode_names() {
        assert_eq!("no_filter".parse::<PolicyMode>().unwrap(), PolicyMode::NoFilter);
        assert_eq!(PolicyMode::Deny.to_string(), "deny");
    }
}
