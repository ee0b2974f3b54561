//! Hook handlers. Every monitored operation follows the same template: entry
//! admission, internal probes filling the syscall entry, exit with
//! invalidation and a final resolution whose callback emits the event.

mod link;
mod mkdir;

use sensor_common::EventSender;
use sensor_core::{
    context::ContextProvider,
    event::{EventType, FileFlags, FileMetadata, SensorMessage},
};

use crate::{
    dentry::{DentryTree, Inode},
    emitter::is_unhandled_error,
    invalidator::{invalidate_inode, invalidated_key},
    syscall_cache::{PushResult, SyscallData, SyscallEntry},
    HookStatus, Invocation, Sensor,
};

impl<T, C, S> Sensor<T, C, S>
where
    T: DentryTree,
    C: ContextProvider,
    S: EventSender<SensorMessage>,
{
    /// Admission of a new operation.
    fn trace_syscall(
        &self,
        invocation: &Invocation,
        data: SyscallData,
        is_async: bool,
    ) -> HookStatus {
        let policy = match self.filter.admit(data.event_type(), invocation.pid, invocation.timestamp)
        {
            Ok(policy) => policy,
            Err(rejection) => return HookStatus::Rejected(rejection),
        };
        let entry = SyscallEntry::new(
            policy,
            invocation.pid,
            invocation.timestamp,
            is_async,
            data,
        );
        match self.syscalls.push(invocation.tid, entry) {
            PushResult::Refused => HookStatus::Refused,
            PushResult::Pushed | PushResult::Duplicate | PushResult::Replaced => {
                HookStatus::Tracked
            }
        }
    }

    /// An unhandled error terminates the operation at exit: no event and no
    /// invalidation.
    fn pop_on_unhandled_error(
        &self,
        invocation: &Invocation,
        event_type: EventType,
        retval: i64,
    ) -> Option<HookStatus> {
        if !is_unhandled_error(retval) {
            return None;
        }
        Some(match self.syscalls.pop(invocation.tid, event_type) {
            Some(_) => HookStatus::Handled,
            None => HookStatus::Ignored,
        })
    }

    /// Invalidate the object changed by a successful operation. Its discarders
    /// are stale from now on, so they are dropped too.
    fn invalidate(&self, data: &SyscallData, pass_to_userspace: bool) -> Option<u64> {
        invalidated_key(data).map(|key| {
            self.filter
                .discarders()
                .remove_inode(key.mount_id, key.ino);
            invalidate_inode(&self.inodes, &self.emitter, &key, !pass_to_userspace)
        })
    }

    /// Metadata of an inode, from the cache when it's fresh.
    fn file_metadata(&self, mount_id: u32, inode: &Inode) -> (FileMetadata, FileFlags) {
        if let Some(cached) = self.inodes.get(mount_id, inode.ino) {
            if let Some(metadata) = cached.metadata {
                return (metadata, cached.flags);
            }
        }
        let mut flags = FileFlags::default();
        if inode.upper_layer {
            flags.insert(FileFlags::UPPER_LAYER);
        }
        let revision = self.inodes.revision(mount_id, inode.ino);
        self.inodes
            .insert_metadata(mount_id, inode.ino, revision, inode.metadata, flags);
        (inode.metadata, flags)
    }
}
