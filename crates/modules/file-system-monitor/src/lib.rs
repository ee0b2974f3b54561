//! # File system monitor
//!
//! Turns the independent hook invocations of a file system operation (syscall
//! entry, internal kernel functions, syscall exit) into a single filtered and
//! enriched [`Event`](sensor_core::event::Event).
//!
//! Handlers can't wait and can't keep a call stack between invocations: the
//! state of an operation lives in the [`SyscallCache`], and long work (path
//! resolution) is split in bounded steps chained through continuations.
//!
//! The life of a hard link:
//!
//! 1. `link` entry: admission, an entry is pushed.
//! 2. `vfs_link`: source inode, approvers, metadata, synthetic target key.
//!    The source path is resolved, `LinkSrc` stores it.
//! 3. `link` exit: the source inode is invalidated and, if the event will be
//!    sent, the target path is resolved.
//! 4. `LinkDst`: the entry is popped and the event emitted.

pub mod config;
pub mod continuation;
pub mod dentry;
pub mod emitter;
mod hooks;
pub mod inode_cache;
pub mod invalidator;
pub mod resolver;
pub mod syscall_cache;
#[cfg(any(test, feature = "test-suite"))]
pub mod test_utils;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use sensor_common::{EventSender, PathRing, Pid, Timestamp, MAX_TAIL_CALLS};
use sensor_core::{
    context::ContextProvider,
    event::{EventType, SensorMessage},
};
use sensor_filtering::{
    discarders::DiscarderError, Discarders, Filter, FilterStatsSnapshot, PolicyHandle, Rejection,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub use config::Config;

use crate::{
    continuation::{Continuation, ContinuationQueue, ProgKey},
    dentry::{DentryHandle, DentryTree},
    emitter::{Emitter, EmitterStats},
    inode_cache::{InodeCache, InodeCacheStats},
    resolver::{Hop, Resolver, ResolverCallback, ResolverStats},
    syscall_cache::{SyscallCache, SyscallCacheStats},
};

/// Syscalls observed at entry and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Link,
    Linkat,
    Mkdir { mode: u32 },
    Mkdirat { mode: u32 },
}

impl Syscall {
    pub fn event_type(&self) -> EventType {
        match self {
            Syscall::Link | Syscall::Linkat => EventType::Link,
            Syscall::Mkdir { .. } | Syscall::Mkdirat { .. } => EventType::Mkdir,
        }
    }
}

/// Internal kernel functions, with their arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCall {
    DoLinkat,
    VfsLink {
        source: DentryHandle,
        target: DentryHandle,
        mount_id: u32,
    },
    DoMkdirat {
        mode: u32,
    },
    VfsMkdir {
        dentry: DentryHandle,
        mount_id: u32,
    },
}

/// Internal kernel functions observed on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFunction {
    DoLinkat,
    DoMkdirat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    SyscallEnter(Syscall),
    SyscallExit { syscall: Syscall, retval: i64 },
    Kprobe(KernelCall),
    Kretprobe { function: KernelFunction, retval: i64 },
    /// The invoking thread exited
    ThreadExit,
}

/// A hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub tid: Pid,
    pub pid: Pid,
    pub timestamp: Timestamp,
    pub hook: Hook,
}

/// What a hook did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    /// The operation is tracked
    Tracked,
    /// The operation was not admitted, nothing is tracked
    Rejected(Rejection),
    /// The syscall cache is full, nothing is tracked
    Refused,
    /// The hook updated the tracked operation
    Handled,
    /// No tracked operation for this hook
    Ignored,
    /// The operation could not be completed and was dropped
    Aborted,
}

/// The file system operations pipeline.
///
/// `T` gives access to dentries, `C` enriches events with process context
/// and `S` is where events are sent.
pub struct Sensor<T, C, S> {
    tree: T,
    syscalls: Arc<SyscallCache>,
    inodes: InodeCache,
    filter: Filter,
    resolver: Resolver,
    emitter: Emitter<C, S>,
    sweep_interval: Duration,
    aborted: AtomicU64,
}

/// Counters of all the pipeline components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorStats {
    pub syscall_cache: SyscallCacheStats,
    pub inode_cache: InodeCacheStats,
    pub filter: FilterStatsSnapshot,
    pub resolver: ResolverStats,
    pub emitter: EmitterStats,
    /// Operations dropped because a continuation could not be scheduled
    pub aborted: u64,
}

const INODE_CACHE_SHARDS: usize = 16;

impl<T, C, S> Sensor<T, C, S>
where
    T: DentryTree,
    C: ContextProvider,
    S: EventSender<SensorMessage>,
{
    pub fn new(
        config: &Config,
        ring: Arc<PathRing>,
        tree: T,
        context: C,
        policy: PolicyHandle,
        sender: S,
    ) -> Self {
        Self {
            tree,
            syscalls: Arc::new(SyscallCache::new(
                config.syscall_cache_shards,
                config.syscall_cache_capacity,
                config.max_entry_age,
            )),
            inodes: InodeCache::new(
                config.revision_slots,
                INODE_CACHE_SHARDS,
                config.inode_cache_capacity,
            ),
            filter: Filter::new(
                policy,
                Discarders::new(INODE_CACHE_SHARDS, config.inode_cache_capacity),
            ),
            resolver: Resolver::new(config.segments_per_hop, config.max_iterations, ring),
            emitter: Emitter::new(context, sender),
            sweep_interval: config.sweep_interval,
            aborted: AtomicU64::new(0),
        }
    }

    /// Handle a hook invocation and every continuation it schedules.
    pub fn dispatch(&self, invocation: &Invocation) -> HookStatus {
        let mut queue = ContinuationQueue::new(MAX_TAIL_CALLS);
        let status = match invocation.hook {
            Hook::SyscallEnter(Syscall::Link | Syscall::Linkat) => {
                self.trace_link(invocation, false)
            }
            Hook::SyscallEnter(Syscall::Mkdir { mode } | Syscall::Mkdirat { mode }) => {
                self.trace_mkdir(invocation, mode, false)
            }
            Hook::SyscallExit { syscall, retval } => match syscall.event_type() {
                EventType::Link => self.link_ret(invocation, retval, &mut queue),
                EventType::Mkdir => self.mkdir_ret(invocation, retval, &mut queue),
            },
            Hook::Kprobe(KernelCall::DoLinkat) => self.do_linkat(invocation),
            Hook::Kprobe(KernelCall::VfsLink {
                source,
                target,
                mount_id,
            }) => self.vfs_link(invocation, source, target, mount_id, &mut queue),
            Hook::Kprobe(KernelCall::DoMkdirat { mode }) => self.do_mkdirat(invocation, mode),
            Hook::Kprobe(KernelCall::VfsMkdir { dentry, mount_id }) => {
                self.vfs_mkdir(invocation, dentry, mount_id)
            }
            Hook::Kretprobe {
                function: KernelFunction::DoLinkat,
                retval,
            } => self.link_ret(invocation, retval, &mut queue),
            Hook::Kretprobe {
                function: KernelFunction::DoMkdirat,
                retval,
            } => self.mkdir_ret(invocation, retval, &mut queue),
            Hook::ThreadExit => self.thread_exit(invocation),
        };
        // Every continuation consumes a tail call: this loop is bounded
        while let Some(continuation) = queue.next() {
            match continuation.prog {
                ProgKey::Resolve => {
                    self.resolve_hop(invocation, continuation.event_type, &mut queue)
                }
                ProgKey::Callback(ResolverCallback::LinkSrc) => self.link_src_callback(invocation),
                ProgKey::Callback(ResolverCallback::LinkDst) => self.link_dst_callback(invocation),
                ProgKey::Callback(ResolverCallback::Mkdir) => self.mkdir_callback(invocation),
            }
        }
        status
    }

    fn resolve_hop(
        &self,
        invocation: &Invocation,
        event_type: EventType,
        queue: &mut ContinuationQueue,
    ) {
        let hop = self.syscalls.peek_mut(invocation.tid, event_type, |entry| {
            self.resolver.hop(
                &mut entry.resolver,
                &self.tree,
                &self.inodes,
                self.filter.discarders(),
            )
        });
        let prog = match hop {
            Some(Hop::Continue) => ProgKey::Resolve,
            Some(Hop::Done(Some(callback))) => ProgKey::Callback(callback),
            Some(Hop::Done(None)) | None => return,
        };
        self.tail_call(invocation, Continuation { event_type, prog }, queue);
    }

    /// Schedule a continuation. If that's not possible the operation is
    /// dropped and false is returned.
    pub(crate) fn tail_call(
        &self,
        invocation: &Invocation,
        continuation: Continuation,
        queue: &mut ContinuationQueue,
    ) -> bool {
        match queue.tail_call(continuation) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "dropping {} operation of thread {}: {err}",
                    continuation.event_type,
                    invocation.tid
                );
                self.syscalls.pop(invocation.tid, continuation.event_type);
                self.aborted.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Exclude an object from future monitoring of an event type, until it
    /// changes.
    pub fn discard_inode(
        &self,
        event_type: EventType,
        mount_id: u32,
        ino: u64,
    ) -> Result<(), DiscarderError> {
        let revision = self.inodes.revision(mount_id, ino);
        self.filter
            .discarders()
            .discard_inode(event_type, mount_id, ino, revision)
    }

    /// Exclude a process from monitoring of an event type.
    pub fn discard_process(&self, pid: Pid, event_type: EventType, expire: Option<Timestamp>) {
        self.filter
            .discarders()
            .discard_process(pid, event_type, expire)
    }

    /// Drop the operations of an exiting thread. When the thread group
    /// leader exits, the discarders of the process go too.
    fn thread_exit(&self, invocation: &Invocation) -> HookStatus {
        let mut status = HookStatus::Ignored;
        for event_type in EventType::ALL {
            if self.syscalls.pop(invocation.tid, event_type).is_some() {
                log::debug!("thread {} exited during {event_type}", invocation.tid);
                status = HookStatus::Handled;
            }
        }
        if invocation.tid == invocation.pid {
            self.filter.discarders().remove_process(invocation.pid);
        }
        status
    }

    /// Reclaim orphan syscall entries and stale process context in the
    /// background. The task stops once the sensor is dropped.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let syscalls = Arc::downgrade(&self.syscalls);
        let context = Arc::downgrade(self.emitter.context());
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let (Some(syscalls), Some(context)) = (syscalls.upgrade(), context.upgrade())
                else {
                    break;
                };
                let now = Timestamp::now();
                let reclaimed = syscalls.sweep(now);
                if reclaimed > 0 {
                    log::warn!("reclaimed {reclaimed} orphan syscall entries");
                }
                let removed = context.cleanup(now);
                if removed > 0 {
                    log::trace!("removed {removed} exited processes from context");
                }
            }
        })
    }

    pub fn syscalls(&self) -> &SyscallCache {
        &self.syscalls
    }

    pub fn inodes(&self) -> &InodeCache {
        &self.inodes
    }

    pub fn path_ring(&self) -> &Arc<PathRing> {
        self.resolver.ring()
    }

    pub fn stats(&self) -> SensorStats {
        SensorStats {
            syscall_cache: self.syscalls.stats(),
            inode_cache: self.inodes.stats(),
            filter: self.filter.stats(),
            resolver: self.resolver.stats(),
            emitter: self.emitter.stats(),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(feature = "test-suite")]
pub mod test_suite;
