use sensor_common::EventSender;
use sensor_core::{
    context::ContextProvider,
    event::{EventType, FileRecord, PathKey, SensorMessage},
};
use sensor_filtering::{filter_syscall, PolicyMode};

use crate::{
    continuation::{Continuation, ContinuationQueue, ProgKey},
    dentry::{DentryHandle, DentryTree},
    resolver::{ResolveResult, ResolverCallback, ResolverState},
    syscall_cache::SyscallData,
    HookStatus, Invocation, Sensor,
};

const RESOLVE: Continuation = Continuation {
    event_type: EventType::Link,
    prog: ProgKey::Resolve,
};

impl<T, C, S> Sensor<T, C, S>
where
    T: DentryTree,
    C: ContextProvider,
    S: EventSender<SensorMessage>,
{
    /// `link` and `linkat` entry.
    pub(crate) fn trace_link(&self, invocation: &Invocation, is_async: bool) -> HookStatus {
        self.trace_syscall(invocation, SyscallData::link(), is_async)
    }

    /// `do_linkat` is reached without a syscall when the link is issued
    /// asynchronously (eg. io_uring).
    pub(crate) fn do_linkat(&self, invocation: &Invocation) -> HookStatus {
        if self.syscalls.contains(invocation.tid, EventType::Link) {
            return HookStatus::Ignored;
        }
        self.trace_link(invocation, true)
    }

    pub(crate) fn vfs_link(
        &self,
        invocation: &Invocation,
        src_dentry: DentryHandle,
        target_dentry: DentryHandle,
        mount_id: u32,
        queue: &mut ContinuationQueue,
    ) -> HookStatus {
        let Some(entry) = self.syscalls.peek(invocation.tid, EventType::Link) else {
            return HookStatus::Ignored;
        };
        // Nested call (eg. overlayfs linking in its upper layer)
        if let SyscallData::Link {
            target_dentry: Some(_),
            ..
        } = entry.data
        {
            return HookStatus::Ignored;
        }
        let Some((src_name, inode)) = self
            .tree
            .lookup(src_dentry)
            .and_then(|dentry| dentry.inode.map(|inode| (dentry.name, inode)))
        else {
            log::debug!("link source {src_dentry:?} has no inode");
            self.syscalls.pop(invocation.tid, EventType::Link);
            return HookStatus::Aborted;
        };
        let target_name = self
            .tree
            .lookup(target_dentry)
            .map(|dentry| dentry.name)
            .unwrap_or_default();

        // Source and target are on the same mount
        let source_key = PathKey {
            ino: inode.ino,
            mount_id,
            path_id: self.inodes.path_id(mount_id, inode.ino),
        };

        let (metadata, flags) = self.file_metadata(mount_id, &inode);
        let source = FileRecord {
            path_key: source_key,
            metadata,
            flags,
            ..Default::default()
        };
        // The target has the same inode as the source: it gets a synthetic key
        let target = FileRecord {
            path_key: PathKey::synthetic(mount_id, rand::random()),
            metadata,
            flags,
            ..Default::default()
        };
        let data = SyscallData::Link {
            src_dentry: Some(src_dentry),
            target_dentry: Some(target_dentry),
            source,
            target,
        };

        let discarded = filter_syscall(&entry.policy, EventType::Link, &[&src_name, &target_name]);
        if discarded {
            self.filter.record_approver_discard();
        }
        let discarded = discarded || entry.discarded;
        // Always enabled types still carry both paths
        if !entry.policy.pass_to_userspace(EventType::Link, discarded) {
            self.syscalls.peek_mut(invocation.tid, EventType::Link, |entry| {
                entry.data = data;
                entry.discarded = discarded;
            });
            return HookStatus::Handled;
        }

        let discarder_type =
            (entry.policy.mode(EventType::Link) != PolicyMode::NoFilter).then_some(EventType::Link);
        let resolver = ResolverState::new(
            Some(src_dentry),
            source_key,
            discarder_type,
            ResolverCallback::LinkSrc,
        );
        self.syscalls.peek_mut(invocation.tid, EventType::Link, |entry| {
            entry.data = data;
            entry.discarded = discarded;
            entry.resolver = resolver;
        });
        if self.tail_call(invocation, RESOLVE, queue) {
            HookStatus::Handled
        } else {
            HookStatus::Aborted
        }
    }

    /// Source path resolved.
    pub(crate) fn link_src_callback(&self, invocation: &Invocation) {
        let result = self
            .syscalls
            .peek_mut(invocation.tid, EventType::Link, |entry| {
                let result = entry.resolver.result;
                let path_ref = entry.resolver.path_ref;
                if let SyscallData::Link { source, .. } = &mut entry.data {
                    source.path_ref = path_ref;
                    source.path_status = result.path_status();
                }
                if result == ResolveResult::Discarded {
                    entry.discarded = true;
                }
                result
            });
        if result == Some(ResolveResult::Discarded) {
            self.filter.record_resolver_discard();
        }
    }

    /// `link`, `linkat` or `do_linkat` return.
    pub(crate) fn link_ret(
        &self,
        invocation: &Invocation,
        retval: i64,
        queue: &mut ContinuationQueue,
    ) -> HookStatus {
        if let Some(status) = self.pop_on_unhandled_error(invocation, EventType::Link, retval) {
            return status;
        }
        let Some(entry) = self.syscalls.peek(invocation.tid, EventType::Link) else {
            return HookStatus::Ignored;
        };
        let pass_to_userspace = entry
            .policy
            .pass_to_userspace(EventType::Link, entry.discarded);
        if retval >= 0 {
            // The link count of the source changed
            self.invalidate(&entry.data, pass_to_userspace);
        }
        if !pass_to_userspace {
            self.syscalls.pop(invocation.tid, EventType::Link);
            return HookStatus::Handled;
        }

        let (target_dentry, target_key) = match &entry.data {
            SyscallData::Link {
                target_dentry,
                target,
                ..
            } => (*target_dentry, target.path_key),
            SyscallData::Mkdir { .. } => (None, PathKey::default()),
        };
        let resolver =
            ResolverState::new(target_dentry, target_key, None, ResolverCallback::LinkDst);
        self.syscalls.peek_mut(invocation.tid, EventType::Link, |entry| {
            entry.retval = retval;
            entry.resolver = resolver;
        });
        if self.tail_call(invocation, RESOLVE, queue) {
            HookStatus::Handled
        } else {
            HookStatus::Aborted
        }
    }

    /// Target path resolved: the operation is complete.
    pub(crate) fn link_dst_callback(&self, invocation: &Invocation) {
        let Some(mut entry) = self.syscalls.pop(invocation.tid, EventType::Link) else {
            return;
        };
        let path_status = entry.resolver.result.path_status();
        if let SyscallData::Link { target, .. } = &mut entry.data {
            target.path_ref = entry.resolver.path_ref;
            target.path_status = path_status;
        }
        self.emitter.emit(entry, invocation.tid, invocation.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nix::errno::Errno;
    use sensor_common::{PathRing, Pid, Timestamp};
    use sensor_core::{
        context::ProcessCache,
        event::{Payload, PathStatus},
    };
    use sensor_filtering::{policy_channel, Policy, PolicySet, PolicyUpdater};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{test_utils::MemoryTree, Config, Hook, KernelCall, KernelFunction, Syscall};

    const TID: Pid = Pid::from_raw(42);
    const MOUNT: u32 = 7;

    type TestSensor = Sensor<Arc<MemoryTree>, ProcessCache, mpsc::Sender<SensorMessage>>;

    struct Fixture {
        sensor: TestSensor,
        tree: Arc<MemoryTree>,
        ring: Arc<PathRing>,
        rx: mpsc::Receiver<SensorMessage>,
        updater: PolicyUpdater,
    }

    fn fixture(config: Config, policy: PolicySet) -> Fixture {
        let tree = Arc::new(MemoryTree::new());
        let ring = config.path_ring();
        let (tx, rx) = mpsc::channel(64);
        let (updater, handle) = policy_channel(policy);
        let sensor = Sensor::new(
            &config,
            ring.clone(),
            tree.clone(),
            ProcessCache::new(),
            handle,
            tx,
        );
        Fixture {
            sensor,
            tree,
            ring,
            rx,
            updater,
        }
    }

    fn invocation(hook: Hook) -> Invocation {
        Invocation {
            tid: TID,
            pid: TID,
            timestamp: Timestamp::from(1000),
            hook,
        }
    }

    impl Fixture {
        fn dispatch(&self, hook: Hook) -> HookStatus {
            self.sensor.dispatch(&invocation(hook))
        }

        /// Full `link(source, target)` sequence, returns the status of each hook
        fn link(&self, source: &str, target: &str, retval: i64) -> [HookStatus; 3] {
            let source = self.tree.find(source).unwrap();
            let target = self.tree.add_negative(target);
            [
                self.dispatch(Hook::SyscallEnter(Syscall::Link)),
                self.dispatch(Hook::Kprobe(KernelCall::VfsLink {
                    source,
                    target,
                    mount_id: MOUNT,
                })),
                self.dispatch(Hook::SyscallExit {
                    syscall: Syscall::Link,
                    retval,
                }),
            ]
        }

        fn messages(&mut self) -> Vec<SensorMessage> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }

        fn path(&self, record: &FileRecord) -> String {
            self.ring.read(&record.path_ref.unwrap()).unwrap()
        }
    }

    fn link_payload(message: &SensorMessage) -> (&FileRecord, &FileRecord) {
        match message.event().map(|event| event.payload()) {
            Some(Payload::Link { source, target }) => (source, target),
            other => panic!("expected a link event, found {other:?}"),
        }
    }

    fn deny_all(event_type: EventType) -> PolicySet {
        PolicySet::default().with_policy(
            event_type,
            Policy {
                mode: PolicyMode::Deny,
                ..Default::default()
            },
        )
    }

    #[test]
    fn hardlink() {
        let mut f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/tmp/a");
        let ino = f.tree.inode(source).unwrap().ino;
        let revision = f.sensor.inodes().revision(MOUNT, ino);

        let statuses = f.link("/tmp/a", "/tmp/b", 0);
        assert_eq!(
            statuses,
            [HookStatus::Tracked, HookStatus::Handled, HookStatus::Handled]
        );

        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        let event = messages[0].event().unwrap();
        assert_eq!(event.header().event_type, EventType::Link);
        assert!(!event.header().is_async);
        let (source, target) = link_payload(&messages[0]);
        assert_eq!(source.path_key.ino, ino);
        assert_eq!(source.path_key.mount_id, MOUNT);
        assert_eq!(source.path_status, PathStatus::Resolved);
        assert_eq!(f.path(source), "/tmp/a");
        assert!(target.path_key.is_synthetic());
        assert_eq!(target.path_key.mount_id, MOUNT);
        assert_eq!(target.metadata, source.metadata);
        assert_eq!(f.path(target), "/tmp/b");

        assert!(f.sensor.inodes().revision(MOUNT, ino) > revision);
        assert!(f.sensor.syscalls().is_empty());
    }

    #[test]
    fn duplicate_entry_probes() {
        let f = fixture(Config::default(), PolicySet::default());
        assert_eq!(
            f.dispatch(Hook::SyscallEnter(Syscall::Linkat)),
            HookStatus::Tracked
        );
        assert_eq!(
            f.dispatch(Hook::Kprobe(KernelCall::DoLinkat)),
            HookStatus::Ignored
        );
        let entry = f.sensor.syscalls().peek(TID, EventType::Link).unwrap();
        assert!(!entry.is_async);
        assert_eq!(f.sensor.syscalls().len(), 1);
    }

    #[test]
    fn async_link() {
        let mut f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/tmp/a");
        let target = f.tree.add_negative("/tmp/b");
        assert_eq!(
            f.dispatch(Hook::Kprobe(KernelCall::DoLinkat)),
            HookStatus::Tracked
        );
        f.dispatch(Hook::Kprobe(KernelCall::VfsLink {
            source,
            target,
            mount_id: MOUNT,
        }));
        f.dispatch(Hook::Kretprobe {
            function: KernelFunction::DoLinkat,
            retval: 0,
        });
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].event().unwrap().header().is_async);
    }

    #[test]
    fn nested_vfs_link_is_ignored() {
        let f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/tmp/a");
        let target = f.tree.add_negative("/tmp/b");
        let other = f.tree.add_negative("/upper/b");
        f.dispatch(Hook::SyscallEnter(Syscall::Link));
        let vfs_link = |target| {
            f.dispatch(Hook::Kprobe(KernelCall::VfsLink {
                source,
                target,
                mount_id: MOUNT,
            }))
        };
        assert_eq!(vfs_link(target), HookStatus::Handled);
        assert_eq!(vfs_link(other), HookStatus::Ignored);
        let entry = f.sensor.syscalls().peek(TID, EventType::Link).unwrap();
        assert!(matches!(
            entry.data,
            SyscallData::Link {
                target_dentry: Some(t),
                ..
            } if t == target
        ));
    }

    #[test]
    fn disabled_type_is_rejected() {
        let mut f = fixture(
            Config::default(),
            PolicySet::default().with_enabled(&[EventType::Mkdir]),
        );
        f.tree.add_file("/tmp/a");
        let statuses = f.link("/tmp/a", "/tmp/b", 0);
        assert!(matches!(statuses[0], HookStatus::Rejected(_)));
        assert_eq!(statuses[1], HookStatus::Ignored);
        assert_eq!(statuses[2], HookStatus::Ignored);
        assert!(f.messages().is_empty());
        assert!(f.sensor.syscalls().is_empty());
        assert_eq!(f.sensor.stats().filter.rejected, 1);
    }

    #[test]
    fn discarded_by_approvers() {
        let mut f = fixture(Config::default(), deny_all(EventType::Link));
        let source = f.tree.add_file("/tmp/a");
        let ino = f.tree.inode(source).unwrap().ino;
        let revision = f.sensor.inodes().revision(MOUNT, ino);

        f.link("/tmp/a", "/tmp/b", 0);

        // invalidation still happens, and the consumer is told about it
        let new_revision = f.sensor.inodes().revision(MOUNT, ino);
        assert!(new_revision > revision);
        assert_eq!(
            f.messages(),
            vec![SensorMessage::InvalidateDentry {
                mount_id: MOUNT,
                ino,
                revision: new_revision,
            }]
        );
        assert!(f.sensor.syscalls().is_empty());
        let stats = f.sensor.stats();
        assert_eq!(stats.filter.discarded_by_approvers, 1);
        assert_eq!(stats.resolver.hops, 0);
    }

    #[test]
    fn approved_basename() {
        let mut policy = Policy {
            mode: PolicyMode::Deny,
            ..Default::default()
        };
        policy.basename_approvers.insert("shadow".to_string());
        let mut f = fixture(
            Config::default(),
            PolicySet::default().with_policy(EventType::Link, policy),
        );
        f.tree.add_file("/etc/shadow");
        f.link("/etc/shadow", "/tmp/copy", 0);
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        let (source, _) = link_payload(&messages[0]);
        assert_eq!(f.path(source), "/etc/shadow");
    }

    #[test]
    fn always_enabled_ignores_discards() {
        let mut f = fixture(
            Config::default(),
            deny_all(EventType::Link).with_always_enabled(&[EventType::Link]),
        );
        let a = f.tree.add_file("/tmp/a");
        let ino = f.tree.inode(a).unwrap().ino;
        f.link("/tmp/a", "/tmp/b", 0);
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        let (source, target) = link_payload(&messages[0]);
        assert_eq!(source.path_key.ino, ino);
        assert_eq!(source.metadata.nlink, 1);
        assert_eq!(source.path_status, PathStatus::Resolved);
        assert_eq!(f.path(source), "/tmp/a");
        assert!(target.path_key.is_synthetic());
        assert_eq!(target.path_key.mount_id, MOUNT);
        assert_eq!(target.path_status, PathStatus::Resolved);
        assert_eq!(f.path(target), "/tmp/b");
        assert_eq!(f.sensor.stats().filter.discarded_by_approvers, 1);
    }

    #[test]
    fn nested_vfs_link_after_discard_is_ignored() {
        let f = fixture(Config::default(), deny_all(EventType::Link));
        let source = f.tree.add_file("/tmp/a");
        let target = f.tree.add_negative("/tmp/b");
        let other = f.tree.add_negative("/upper/b");
        f.dispatch(Hook::SyscallEnter(Syscall::Link));
        let vfs_link = |target| {
            f.dispatch(Hook::Kprobe(KernelCall::VfsLink {
                source,
                target,
                mount_id: MOUNT,
            }))
        };
        assert_eq!(vfs_link(target), HookStatus::Handled);
        assert_eq!(vfs_link(other), HookStatus::Ignored);
        assert_eq!(f.sensor.stats().filter.discarded_by_approvers, 1);
        let entry = f.sensor.syscalls().peek(TID, EventType::Link).unwrap();
        assert!(entry.discarded);
        assert!(matches!(
            entry.data,
            SyscallData::Link {
                src_dentry: Some(s),
                target_dentry: Some(t),
                ..
            } if s == source && t == target
        ));
    }

    #[test]
    fn discarded_by_inode_discarder() {
        let accept = PolicySet::default().with_policy(
            EventType::Link,
            Policy {
                mode: PolicyMode::Accept,
                ..Default::default()
            },
        );
        let mut f = fixture(Config::default(), accept);
        f.tree.add_file("/var/log/syslog");
        let log = f.tree.inode(f.tree.find("/var/log").unwrap()).unwrap().ino;
        f.sensor.discard_inode(EventType::Link, MOUNT, log).unwrap();

        f.link("/var/log/syslog", "/tmp/b", 0);
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            SensorMessage::InvalidateDentry { .. }
        ));
        assert_eq!(f.sensor.stats().filter.discarded_by_resolver, 1);
        assert!(f.sensor.syscalls().is_empty());
    }

    #[test]
    fn unhandled_error() {
        let mut f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/tmp/a");
        let ino = f.tree.inode(source).unwrap().ino;
        let revision = f.sensor.inodes().revision(MOUNT, ino);

        let statuses = f.link("/tmp/a", "/tmp/b", -(Errno::EEXIST as i64));
        assert_eq!(statuses[2], HookStatus::Handled);
        assert!(f.messages().is_empty());
        assert!(f.sensor.syscalls().is_empty());
        assert_eq!(f.sensor.inodes().revision(MOUNT, ino), revision);
    }

    #[test]
    fn handled_error_is_emitted_without_invalidation() {
        let mut f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/tmp/a");
        let ino = f.tree.inode(source).unwrap().ino;
        let revision = f.sensor.inodes().revision(MOUNT, ino);
        let eacces = -(Errno::EACCES as i64);

        f.link("/tmp/a", "/tmp/b", eacces);
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event().unwrap().header().retval, eacces);
        assert_eq!(f.sensor.inodes().revision(MOUNT, ino), revision);
    }

    #[test]
    fn stale_metadata_is_not_served() {
        let mut f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/tmp/a");
        f.link("/tmp/a", "/tmp/b", 0);
        f.tree.update_inode(source, |inode| inode.metadata.nlink = 2);
        f.link("/tmp/a", "/tmp/c", 0);
        let messages = f.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(link_payload(&messages[0]).0.metadata.nlink, 1);
        assert_eq!(link_payload(&messages[1]).0.metadata.nlink, 2);
        assert_ne!(
            link_payload(&messages[0]).0.path_key.path_id,
            link_payload(&messages[1]).0.path_key.path_id
        );
    }

    #[test]
    fn upper_layer_flag() {
        let mut f = fixture(Config::default(), PolicySet::default());
        let source = f.tree.add_file("/merged/a");
        f.tree.update_inode(source, |inode| inode.upper_layer = true);
        f.link("/merged/a", "/merged/b", 0);
        let messages = f.messages();
        let (source, target) = link_payload(&messages[0]);
        assert!(source.flags.contains(sensor_core::event::FileFlags::UPPER_LAYER));
        assert!(target.flags.contains(sensor_core::event::FileFlags::UPPER_LAYER));
    }

    #[test]
    fn deep_path_is_truncated() {
        let config = Config {
            segments_per_hop: 1,
            max_iterations: 4,
            ..Default::default()
        };
        let mut f = fixture(config, PolicySet::default());
        f.tree.add_file("/a/b/c/d/e/f/source");
        f.link("/a/b/c/d/e/f/source", "/a/b/c/d/e/f/target", 0);
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        let (source, target) = link_payload(&messages[0]);
        assert_eq!(source.path_status, PathStatus::Truncated);
        assert_eq!(f.path(source), "d/e/f/source");
        assert_eq!(target.path_status, PathStatus::Truncated);
        assert_eq!(f.path(target), "d/e/f/target");
    }

    #[test]
    fn policy_snapshot_is_kept() {
        let mut f = fixture(Config::default(), PolicySet::default());
        f.tree.add_file("/tmp/a");
        let source = f.tree.find("/tmp/a").unwrap();
        let target = f.tree.add_negative("/tmp/b");
        f.dispatch(Hook::SyscallEnter(Syscall::Link));
        // disabling the type doesn't affect operations already admitted
        f.updater
            .update(PolicySet::default().with_enabled(&[EventType::Mkdir]));
        f.dispatch(Hook::Kprobe(KernelCall::VfsLink {
            source,
            target,
            mount_id: MOUNT,
        }));
        f.dispatch(Hook::SyscallExit {
            syscall: Syscall::Link,
            retval: 0,
        });
        assert_eq!(f.messages().len(), 1);
    }
}
