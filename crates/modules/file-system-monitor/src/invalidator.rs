//! Inode cache invalidation after successful mutating operations.
//!
//! Which object changed depends on the operation:
//! - an operation adding a name to an existing object (hard link) changes the
//!   **source**: its link count is different and the target didn't exist.
//! - an operation creating a new object (mkdir) changes the **target**: its
//!   inode number may be recycled and any record of the old object must go.

use sensor_common::EventSender;
use sensor_core::{
    context::ContextProvider,
    event::{EventType, PathKey, SensorMessage},
};

use crate::{emitter::Emitter, inode_cache::InodeCache, syscall_cache::SyscallData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationTarget {
    Source,
    Target,
}

pub fn invalidation_target(event_type: EventType) -> InvalidationTarget {
    match event_type {
        EventType::Link => InvalidationTarget::Source,
        EventType::Mkdir => InvalidationTarget::Target,
    }
}

/// Key of the object an operation changed, if it's known.
pub fn invalidated_key(data: &SyscallData) -> Option<PathKey> {
    let key = match (data, invalidation_target(data.event_type())) {
        (SyscallData::Link { source, .. }, InvalidationTarget::Source) => source.path_key,
        (SyscallData::Link { target, .. }, InvalidationTarget::Target) => target.path_key,
        (SyscallData::Mkdir { file, .. }, _) => file.path_key,
    };
    (key.ino != 0 && !key.is_synthetic()).then_some(key)
}

/// Bump the revision of an object. When its event won't reach userspace
/// (`send_invalidate`), the consumer is told to drop what it knows about it.
/// Returns the new revision.
pub fn invalidate_inode<C, S>(
    inodes: &InodeCache,
    emitter: &Emitter<C, S>,
    key: &PathKey,
    send_invalidate: bool,
) -> u64
where
    C: ContextProvider,
    S: EventSender<SensorMessage>,
{
    let revision = inodes.bump(key.mount_id, key.ino);
    log::trace!("invalidated {key}, revision {revision}");
    if send_invalidate {
        emitter.send_invalidation(key.mount_id, key.ino, revision);
    }
    revision
}

#[cfg(test)]
mod tests {
    use sensor_core::context::ProcessCache;
    use tokio::sync::mpsc;

    use super::*;

    const KEY: PathKey = PathKey {
        ino: 42,
        mount_id: 3,
        path_id: 0,
    };

    #[test]
    fn targets() {
        assert_eq!(
            invalidation_target(EventType::Link),
            InvalidationTarget::Source
        );
        assert_eq!(
            invalidation_target(EventType::Mkdir),
            InvalidationTarget::Target
        );
    }

    #[test]
    fn link_invalidates_the_source() {
        let mut data = SyscallData::link();
        assert_eq!(invalidated_key(&data), None);
        if let SyscallData::Link { source, target, .. } = &mut data {
            source.path_key = KEY;
            target.path_key = PathKey::synthetic(3, 7);
        }
        assert_eq!(invalidated_key(&data), Some(KEY));
    }

    #[test]
    fn mkdir_invalidates_the_target() {
        let mut data = SyscallData::mkdir(0o755);
        if let SyscallData::Mkdir { file, .. } = &mut data {
            file.path_key = KEY;
        }
        assert_eq!(invalidated_key(&data), Some(KEY));
    }

    #[test]
    fn notice_only_when_requested() {
        let inodes = InodeCache::new(64, 1, 64);
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = Emitter::new(ProcessCache::new(), tx);

        assert_eq!(invalidate_inode(&inodes, &emitter, &KEY, false), 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(invalidate_inode(&inodes, &emitter, &KEY, true), 2);
        assert_eq!(
            rx.try_recv().unwrap(),
            SensorMessage::InvalidateDentry {
                mount_id: 3,
                ino: 42,
                revision: 2
            }
        );
        assert_eq!(inodes.revision(3, 42), 2);
    }
}
