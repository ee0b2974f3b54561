use sensor_common::EventSender;
use sensor_core::{
    context::ContextProvider,
    event::{EventType, PathKey, SensorMessage},
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
    event_type: EventType::Mkdir,
    prog: ProgKey::Resolve,
};

impl<T, C, S> Sensor<T, C, S>
where
    T: DentryTree,
    C: ContextProvider,
    S: EventSender<SensorMessage>,
{
    pub(crate) fn trace_mkdir(&self, invocation: &Invocation, mode: u32, is_async: bool) -> HookStatus {
        self.trace_syscall(invocation, SyscallData::mkdir(mode), is_async)
    }

    pub(crate) fn do_mkdirat(&self, invocation: &Invocation, mode: u32) -> HookStatus {
        if self.syscalls.contains(invocation.tid, EventType::Mkdir) {
            return HookStatus::Ignored;
        }
        self.trace_mkdir(invocation, mode, true)
    }

    pub(crate) fn vfs_mkdir(
        &self,
        invocation: &Invocation,
        dentry: DentryHandle,
        mount_id: u32,
    ) -> HookStatus {
        let Some(entry) = self.syscalls.peek(invocation.tid, EventType::Mkdir) else {
            return HookStatus::Ignored;
        };
        if let SyscallData::Mkdir {
            dentry: Some(_), ..
        } = entry.data
        {
            return HookStatus::Ignored;
        }
        let name = self
            .tree
            .lookup(dentry)
            .map(|dentry| dentry.name)
            .unwrap_or_default();
        let discarded = filter_syscall(&entry.policy, EventType::Mkdir, &[&name]);
        if discarded {
            self.filter.record_approver_discard();
        }
        self.syscalls.peek_mut(invocation.tid, EventType::Mkdir, |entry| {
            entry.discarded |= discarded;
            if let SyscallData::Mkdir {
                dentry: entry_dentry,
                file,
                ..
            } = &mut entry.data
            {
                *entry_dentry = Some(dentry);
                // The directory doesn't exist yet
                file.path_key = PathKey::synthetic(mount_id, rand::random());
            }
        });
        HookStatus::Handled
    }

    /// `mkdir`, `mkdirat` or `do_mkdirat` return.
    pub(crate) fn mkdir_ret(
        &self,
        invocation: &Invocation,
        retval: i64,
        queue: &mut ContinuationQueue,
    ) -> HookStatus {
        if let Some(status) = self.pop_on_unhandled_error(invocation, EventType::Mkdir, retval) {
            return status;
        }
        let Some(mut entry) = self.syscalls.peek(invocation.tid, EventType::Mkdir) else {
            return HookStatus::Ignored;
        };
        let pass_to_userspace = entry
            .policy
            .pass_to_userspace(EventType::Mkdir, entry.discarded);

        let SyscallData::Mkdir { dentry, file, .. } = &mut entry.data else {
            return HookStatus::Ignored;
        };
        let dentry = *dentry;
        if retval >= 0 {
            // The new directory may reuse the inode number of a deleted object
            if let Some(inode) = dentry.and_then(|handle| self.tree.lookup(handle)?.inode) {
                let mount_id = file.path_key.mount_id;
                file.path_key.ino = inode.ino;
                self.invalidate(&entry.data, pass_to_userspace);
                let (metadata, flags) = self.file_metadata(mount_id, &inode);
                if let SyscallData::Mkdir { file, .. } = &mut entry.data {
                    file.path_key.path_id = self.inodes.path_id(mount_id, inode.ino);
                    file.metadata = metadata;
                    file.flags = flags;
                }
            }
        }
        if !pass_to_userspace {
            self.syscalls.pop(invocation.tid, EventType::Mkdir);
            return HookStatus::Handled;
        }

        let key = match &entry.data {
            SyscallData::Mkdir { file, .. } => file.path_key,
            SyscallData::Link { .. } => PathKey::default(),
        };
        let discarder_type = (entry.policy.mode(EventType::Mkdir) != PolicyMode::NoFilter)
            .then_some(EventType::Mkdir);
        let resolver = ResolverState::new(dentry, key, discarder_type, ResolverCallback::Mkdir);
        self.syscalls.peek_mut(invocation.tid, EventType::Mkdir, |cached| {
            cached.data = entry.data;
            cached.retval = retval;
            cached.resolver = resolver;
        });
        if self.tail_call(invocation, RESOLVE, queue) {
            HookStatus::Handled
        } else {
            HookStatus::Aborted
        }
    }

    /// Directory path resolved: the operation is complete.
    pub(crate) fn mkdir_callback(&self, invocation: &Invocation) {
        let Some(mut entry) = self.syscalls.pop(invocation.tid, EventType::Mkdir) else {
            return;
        };
        let result = entry.resolver.result;
        let SyscallData::Mkdir { file, .. } = &mut entry.data else {
            return;
        };
        file.path_ref = entry.resolver.path_ref;
        file.path_status = result.path_status();
        let key = file.path_key;

        if result == ResolveResult::Discarded {
            self.filter.record_resolver_discard();
            entry.discarded = true;
            // Invalidated at exit without notice, as the event was expected
            // to reach userspace
            if entry.retval >= 0
                && key.ino != 0
                && !key.is_synthetic()
                && !entry.policy.pass_to_userspace(EventType::Mkdir, true)
            {
                let revision = self.inodes.revision(key.mount_id, key.ino);
                self.emitter
                    .send_invalidation(key.mount_id, key.ino, revision);
            }
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
        event::{FileRecord, PathStatus, Payload},
    };
    use sensor_filtering::{policy_channel, Policy, PolicySet};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{test_utils::MemoryTree, Config, Hook, KernelCall, KernelFunction, Syscall};

    const TID: Pid = Pid::from_raw(7);
    const MOUNT: u32 = 3;
    const MODE: u32 = 0o040755;

    type TestSensor = Sensor<Arc<MemoryTree>, ProcessCache, mpsc::Sender<SensorMessage>>;

    struct Fixture {
        sensor: TestSensor,
        tree: Arc<MemoryTree>,
        ring: Arc<PathRing>,
        rx: mpsc::Receiver<SensorMessage>,
    }

    fn fixture(policy: PolicySet) -> Fixture {
        let config = Config::default();
        let tree = Arc::new(MemoryTree::new());
        let ring = config.path_ring();
        let (tx, rx) = mpsc::channel(64);
        let (_updater, handle) = policy_channel(policy);
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
        }
    }

    impl Fixture {
        fn dispatch(&self, hook: Hook) -> HookStatus {
            self.sensor.dispatch(&Invocation {
                tid: TID,
                pid: TID,
                timestamp: Timestamp::from(500),
                hook,
            })
        }

        /// Full `mkdir(path)` sequence. On success the directory is created
        /// between `vfs_mkdir` and the exit.
        fn mkdir(&self, path: &str, retval: i64) -> DentryHandle {
            let dentry = self.tree.add_negative(path);
            self.dispatch(Hook::SyscallEnter(Syscall::Mkdir { mode: 0o755 }));
            self.dispatch(Hook::Kprobe(KernelCall::VfsMkdir {
                dentry,
                mount_id: MOUNT,
            }));
            if retval >= 0 {
                self.tree.instantiate(dentry, MODE);
            }
            self.dispatch(Hook::SyscallExit {
                syscall: Syscall::Mkdir { mode: 0o755 },
                retval,
            });
            dentry
        }

        fn messages(&mut self) -> Vec<SensorMessage> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }
    }

    fn mkdir_payload(message: &SensorMessage) -> (&FileRecord, u32) {
        match message.event().map(|event| event.payload()) {
            Some(Payload::Mkdir { file, mode }) => (file, *mode),
            other => panic!("expected a mkdir event, found {other:?}"),
        }
    }

    #[test]
    fn mkdir() {
        let mut f = fixture(PolicySet::default());
        let dentry = f.mkdir("/home/user/projects", 0);
        let ino = f.tree.inode(dentry).unwrap().ino;

        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        let (file, mode) = mkdir_payload(&messages[0]);
        assert_eq!(mode, 0o755);
        assert_eq!(file.path_key.ino, ino);
        assert_eq!(file.path_key.mount_id, MOUNT);
        assert_eq!(file.metadata.mode, MODE);
        assert_eq!(file.path_status, PathStatus::Resolved);
        assert_eq!(
            f.ring.read(&file.path_ref.unwrap()).unwrap(),
            "/home/user/projects"
        );
        // the target was invalidated
        let revision = f.sensor.inodes().revision(MOUNT, ino);
        assert!(revision > 0);
        assert_eq!(file.path_key.path_id, revision as u32);
        assert!(f.sensor.syscalls().is_empty());
    }

    #[test]
    fn failed_mkdir_keeps_a_synthetic_key() {
        let mut f = fixture(PolicySet::default());
        f.mkdir("/root/secret", -(Errno::EACCES as i64));
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        let (file, _) = mkdir_payload(&messages[0]);
        assert!(file.path_key.is_synthetic());
        assert_eq!(
            f.ring.read(&file.path_ref.unwrap()).unwrap(),
            "/root/secret"
        );
    }

    #[test]
    fn unhandled_error() {
        let mut f = fixture(PolicySet::default());
        f.mkdir("/tmp/exists", -(Errno::EEXIST as i64));
        assert!(f.messages().is_empty());
        assert!(f.sensor.syscalls().is_empty());
    }

    #[test]
    fn async_mkdir() {
        let mut f = fixture(PolicySet::default());
        let dentry = f.tree.add_negative("/tmp/uring");
        assert_eq!(
            f.dispatch(Hook::Kprobe(KernelCall::DoMkdirat { mode: 0o700 })),
            HookStatus::Tracked
        );
        f.dispatch(Hook::Kprobe(KernelCall::VfsMkdir {
            dentry,
            mount_id: MOUNT,
        }));
        f.tree.instantiate(dentry, MODE);
        f.dispatch(Hook::Kretprobe {
            function: KernelFunction::DoMkdirat,
            retval: 0,
        });
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].event().unwrap().header().is_async);
        assert_eq!(mkdir_payload(&messages[0]).1, 0o700);
    }

    #[test]
    fn discarded_by_approvers() {
        let mut f = fixture(PolicySet::default().with_policy(
            EventType::Mkdir,
            Policy {
                mode: PolicyMode::Deny,
                ..Default::default()
            },
        ));
        let dentry = f.mkdir("/tmp/new", 0);
        let ino = f.tree.inode(dentry).unwrap().ino;
        assert_eq!(
            f.messages(),
            vec![SensorMessage::InvalidateDentry {
                mount_id: MOUNT,
                ino,
                revision: f.sensor.inodes().revision(MOUNT, ino),
            }]
        );
        assert_eq!(f.sensor.stats().filter.discarded_by_approvers, 1);
        assert_eq!(f.sensor.stats().resolver.hops, 0);
    }

    #[test]
    fn discarded_by_resolver() {
        let mut f = fixture(PolicySet::default().with_policy(
            EventType::Mkdir,
            Policy {
                mode: PolicyMode::Accept,
                ..Default::default()
            },
        ));
        let tmp = f.tree.add_dir("/tmp");
        let tmp_ino = f.tree.inode(tmp).unwrap().ino;
        f.sensor
            .discard_inode(EventType::Mkdir, MOUNT, tmp_ino)
            .unwrap();

        let dentry = f.mkdir("/tmp/new", 0);
        let ino = f.tree.inode(dentry).unwrap().ino;
        let messages = f.messages();
        assert_eq!(
            messages,
            vec![SensorMessage::InvalidateDentry {
                mount_id: MOUNT,
                ino,
                revision: f.sensor.inodes().revision(MOUNT, ino),
            }]
        );
        assert_eq!(f.sensor.stats().filter.discarded_by_resolver, 1);
        assert_eq!(f.sensor.stats().emitter.suppressed, 1);
    }

    #[test]
    fn discarder_expires_when_the_inode_changes() {
        let mut f = fixture(PolicySet::default().with_policy(
            EventType::Mkdir,
            Policy {
                mode: PolicyMode::Accept,
                ..Default::default()
            },
        ));
        let tmp = f.tree.add_dir("/tmp");
        let tmp_ino = f.tree.inode(tmp).unwrap().ino;
        f.sensor
            .discard_inode(EventType::Mkdir, MOUNT, tmp_ino)
            .unwrap();
        f.sensor.inodes().bump(MOUNT, tmp_ino);

        f.mkdir("/tmp/new", 0);
        let messages = f.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].event().is_some());
    }
}
