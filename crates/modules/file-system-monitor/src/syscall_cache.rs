//! In-flight operations, one per thread and event type.
//!
//! An entry is pushed when an operation is admitted, mutated by the internal
//! probes and popped exactly once when the operation terminates. Entries of
//! threads killed in the middle of a syscall are never popped: they are
//! reclaimed by [`SyscallCache::sweep`], or replaced by the next push of the
//! same thread once they're older than the maximum age.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use sensor_common::{Pid, Timestamp};
use sensor_core::event::{EventType, FileRecord};
use sensor_filtering::PolicySet;
use serde::{Deserialize, Serialize};

use crate::{dentry::DentryHandle, resolver::ResolverState};

#[derive(Debug, Clone)]
pub struct SyscallEntry {
    pub event_type: EventType,
    /// Policy snapshot taken at admission
    pub policy: Arc<PolicySet>,
    pub discarded: bool,
    pub is_async: bool,
    pub timestamp: Timestamp,
    pub pid: Pid,
    pub retval: i64,
    pub resolver: ResolverState,
    pub data: SyscallData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallData {
    Link {
        src_dentry: Option<DentryHandle>,
        target_dentry: Option<DentryHandle>,
        source: FileRecord,
        target: FileRecord,
    },
    Mkdir {
        dentry: Option<DentryHandle>,
        file: FileRecord,
        mode: u32,
    },
}

impl SyscallData {
    pub fn link() -> Self {
        SyscallData::Link {
            src_dentry: None,
            target_dentry: None,
            source: FileRecord::default(),
            target: FileRecord::default(),
        }
    }

    pub fn mkdir(mode: u32) -> Self {
        SyscallData::Mkdir {
            dentry: None,
            file: FileRecord::default(),
            mode,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            SyscallData::Link { .. } => EventType::Link,
            SyscallData::Mkdir { .. } => EventType::Mkdir,
        }
    }
}

impl SyscallEntry {
    pub fn new(
        policy: Arc<PolicySet>,
        pid: Pid,
        timestamp: Timestamp,
        is_async: bool,
        data: SyscallData,
    ) -> Self {
        Self {
            event_type: data.event_type(),
            policy,
            discarded: false,
            is_async,
            timestamp,
            pid,
            retval: 0,
            resolver: ResolverState::default(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Pushed,
    /// An entry already exists, nothing was changed
    Duplicate,
    /// A leaked entry was found and replaced
    Replaced,
    /// The shard is full, the operation is not tracked
    Refused,
}

type Key = (Pid, EventType);

pub struct SyscallCache {
    shards: Vec<Mutex<HashMap<Key, SyscallEntry>>>,
    capacity: usize,
    max_age: Duration,
    stats: Stats,
}

#[derive(Debug, Default)]
struct Stats {
    pushed: AtomicU64,
    duplicates: AtomicU64,
    reclaimed: AtomicU64,
    refused: AtomicU64,
    popped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallCacheStats {
    pub pushed: u64,
    pub duplicates: u64,
    /// Leaked entries replaced on push or removed by the sweep
    pub reclaimed: u64,
    pub refused: u64,
    pub popped: u64,
}

impl SyscallCache {
    pub fn new(shards: usize, capacity: usize, max_age: Duration) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            capacity,
            max_age,
            stats: Stats::default(),
        }
    }

    fn shard(&self, tid: Pid) -> &Mutex<HashMap<Key, SyscallEntry>> {
        &self.shards[tid.as_raw().unsigned_abs() as usize % self.shards.len()]
    }

    fn lock(&self, tid: Pid) -> std::sync::MutexGuard<'_, HashMap<Key, SyscallEntry>> {
        self.shard(tid).lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, tid: Pid, entry: SyscallEntry) -> PushResult {
        let key = (tid, entry.event_type);
        let mut shard = self.lock(tid);
        if let Some(existing) = shard.get(&key) {
            if entry.timestamp.elapsed_since(existing.timestamp) <= self.max_age {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return PushResult::Duplicate;
            }
            log::debug!(
                "replacing leaked {} entry of thread {tid} (created at {})",
                existing.event_type,
                existing.timestamp
            );
            shard.insert(key, entry);
            self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
            return PushResult::Replaced;
        }
        if shard.len() >= self.capacity {
            self.stats.refused.fetch_add(1, Ordering::Relaxed);
            return PushResult::Refused;
        }
        shard.insert(key, entry);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        PushResult::Pushed
    }

    /// Copy of the entry of a thread.
    pub fn peek(&self, tid: Pid, event_type: EventType) -> Option<SyscallEntry> {
        self.lock(tid).get(&(tid, event_type)).cloned()
    }

    pub fn contains(&self, tid: Pid, event_type: EventType) -> bool {
        self.lock(tid).contains_key(&(tid, event_type))
    }

    /// Modify the entry of a thread in place. The shard is locked while `f`
    /// runs, it must not access this cache.
    pub fn peek_mut<R>(
        &self,
        tid: Pid,
        event_type: EventType,
        f: impl FnOnce(&mut SyscallEntry) -> R,
    ) -> Option<R> {
        self.lock(tid).get_mut(&(tid, event_type)).map(f)
    }

    pub fn pop(&self, tid: Pid, event_type: EventType) -> Option<SyscallEntry> {
        let entry = self.lock(tid).remove(&(tid, event_type));
        if entry.is_some() {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries older than the maximum age. Returns how many were removed.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let mut reclaimed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            shard.retain(|(tid, event_type), entry| {
                let alive = now.elapsed_since(entry.timestamp) <= self.max_age;
                if !alive {
                    log::debug!("reclaiming orphan {event_type} entry of thread {tid}");
                    reclaimed += 1;
                }
                alive
            });
        }
        self.stats
            .reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }

    pub fn stats(&self) -> SyscallCacheStats {
        SyscallCacheStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            reclaimed: self.stats.reclaimed.load(Ordering::Relaxed),
            refused: self.stats.refused.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
        }
    }
}
