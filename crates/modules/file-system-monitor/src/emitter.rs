use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use nix::errno::Errno;
use sensor_common::{EventSender, Pid, Timestamp};
use sensor_core::{
    context::ContextProvider,
    event::{Event, Header, Payload, SensorMessage},
};
use serde::{Deserialize, Serialize};

use crate::syscall_cache::{SyscallData, SyscallEntry};

/// A failed syscall is still interesting when it fails for one of these
/// reasons. Every other error is unhandled: no event, no invalidation.
const HANDLED_ERRORS: [Errno; 3] = [Errno::EACCES, Errno::EPERM, Errno::ENOENT];

pub fn is_unhandled_error(retval: i64) -> bool {
    retval < 0
        && !HANDLED_ERRORS
            .iter()
            .any(|errno| retval == -(*errno as i64))
}

/// Builds events out of terminated operations and hands them to the transport.
pub struct Emitter<C, S> {
    context: Arc<C>,
    sender: S,
    stats: Stats,
}

#[derive(Debug, Default)]
struct Stats {
    emitted: AtomicU64,
    suppressed: AtomicU64,
    dropped: AtomicU64,
    invalidation_notices: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitterStats {
    pub emitted: u64,
    /// Discarded, disabled or failed with an unhandled error
    pub suppressed: u64,
    /// Refused by the transport
    pub dropped: u64,
    pub invalidation_notices: u64,
}

impl<C, S> Emitter<C, S>
where
    C: ContextProvider,
    S: EventSender<SensorMessage>,
{
    pub fn new(context: C, sender: S) -> Self {
        Self {
            context: Arc::new(context),
            sender,
            stats: Stats::default(),
        }
    }

    /// Emit the event of a popped entry, if it should reach userspace.
    /// Returns true if the event was handed to the transport.
    pub fn emit(&self, entry: SyscallEntry, tid: Pid, timestamp: Timestamp) -> bool {
        if is_unhandled_error(entry.retval)
            || !entry.policy.pass_to_userspace(entry.event_type, entry.discarded)
        {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let header = Header {
            event_type: entry.event_type,
            timestamp,
            retval: entry.retval,
            is_async: entry.is_async,
        };
        let payload = match entry.data {
            SyscallData::Link { source, target, .. } => Payload::Link { source, target },
            SyscallData::Mkdir { file, mode, .. } => Payload::Mkdir { file, mode },
        };
        let context = self.context.context(entry.pid, tid, timestamp);
        let sent = self.send(SensorMessage::Event(Event::new(header, context, payload)));
        if sent {
            self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Tell the consumer an object changed.
    pub fn send_invalidation(&self, mount_id: u32, ino: u64, revision: u64) {
        if self.send(SensorMessage::InvalidateDentry {
            mount_id,
            ino,
            revision,
        }) {
            self.stats
                .invalidation_notices
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send(&self, message: SensorMessage) -> bool {
        match self.sender.send(message) {
            Ok(()) => true,
            Err(err) => {
                log::debug!("message dropped: {err}");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            emitted: self.stats.emitted.load(Ordering::Relaxed),
            suppressed: self.stats.suppressed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            invalidation_notices: self.stats.invalidation_notices.load(Ordering::Relaxed),
        }
    }
}
