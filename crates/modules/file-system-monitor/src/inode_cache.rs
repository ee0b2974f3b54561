//! Revisioned cache of file system objects.
//!
//! Every object has a revision, bumped by the invalidator after an operation
//! changed it. Cached records are stamped with the revision they were read at
//! and are never served once the revision moved on.
//!
//! Revisions are kept in a fixed array of atomic slots indexed by a hash of
//! `(mount_id, ino)`: bumps never take a lock. Two objects sharing a slot
//! only invalidate each other more often than needed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use sensor_core::event::{FileFlags, FileMetadata};
use serde::{Deserialize, Serialize};

type InodeKey = (u32, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedInode {
    pub revision: u64,
    pub metadata: Option<FileMetadata>,
    pub flags: FileFlags,
    /// Resolved path, only cached for directories
    pub path: Option<String>,
}

pub struct InodeCache {
    revisions: Box<[AtomicU64]>,
    // top bits of the hash select the revision slot
    shift: u32,
    shards: Vec<RwLock<HashMap<InodeKey, CachedInode>>>,
    capacity: usize,
    stats: Stats,
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups which found a record with an old revision
    pub stale: u64,
    pub invalidations: u64,
}

fn mix(mount_id: u32, ino: u64) -> u64 {
    (ino ^ ((mount_id as u64) << 48 | (mount_id as u64) >> 16)).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

impl InodeCache {
    /// `revision_slots` is rounded up to a power of two.
    pub fn new(revision_slots: usize, shards: usize, capacity: usize) -> Self {
        let slots = revision_slots.max(1).next_power_of_two();
        Self {
            revisions: (0..slots).map(|_| AtomicU64::new(0)).collect(),
            shift: 64 - slots.trailing_zeros(),
            shards: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            capacity: capacity.max(1),
            stats: Stats::default(),
        }
    }

    fn slot(&self, mount_id: u32, ino: u64) -> &AtomicU64 {
        let index = mix(mount_id, ino).checked_shr(self.shift).unwrap_or(0) as usize;
        &self.revisions[index]
    }

    fn shard(&self, mount_id: u32, ino: u64) -> &RwLock<HashMap<InodeKey, CachedInode>> {
        &self.shards[mix(mount_id, ino) as usize % self.shards.len()]
    }

    /// Current revision of an object.
    pub fn revision(&self, mount_id: u32, ino: u64) -> u64 {
        self.slot(mount_id, ino).load(Ordering::Acquire)
    }

    /// Path identifier of an object: the low word of its revision.
    pub fn path_id(&self, mount_id: u32, ino: u64) -> u32 {
        self.revision(mount_id, ino) as u32
    }

    /// Bump the revision of an object and drop its record. Returns the new
    /// revision.
    pub fn bump(&self, mount_id: u32, ino: u64) -> u64 {
        let revision = self.slot(mount_id, ino).fetch_add(1, Ordering::AcqRel) + 1;
        self.shard(mount_id, ino)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(mount_id, ino));
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        revision
    }

    /// Cached record of an object, only if it's stamped with the current revision.
    pub fn get(&self, mount_id: u32, ino: u64) -> Option<CachedInode> {
        let current = self.revision(mount_id, ino);
        let shard = self
            .shard(mount_id, ino)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match shard.get(&(mount_id, ino)) {
            Some(cached) if cached.revision == current => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(cached.clone())
            }
            Some(_) => {
                self.stats.stale.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache the metadata of an object, read while the object was at `revision`.
    pub fn insert_metadata(
        &self,
        mount_id: u32,
        ino: u64,
        revision: u64,
        metadata: FileMetadata,
        flags: FileFlags,
    ) {
        self.update(mount_id, ino, revision, |cached| {
            cached.metadata = Some(metadata);
            cached.flags = flags;
        });
    }

    /// Cache the resolved path of an object, resolved while the object was at `revision`.
    pub fn insert_path(&self, mount_id: u32, ino: u64, revision: u64, path: String) {
        self.update(mount_id, ino, revision, |cached| cached.path = Some(path));
    }

    fn update(&self, mount_id: u32, ino: u64, revision: u64, f: impl FnOnce(&mut CachedInode)) {
        let mut shard = self
            .shard(mount_id, ino)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Checked under the shard lock: a bump after this point removes the record
        if self.revision(mount_id, ino) != revision {
            return;
        }
        let key = (mount_id, ino);
        if shard.len() >= self.capacity && !shard.contains_key(&key) {
            shard.retain(|(m, i), cached| self.revision(*m, *i) == cached.revision);
            if shard.len() >= self.capacity {
                if let Some(victim) = shard.keys().next().copied() {
                    shard.remove(&victim);
                }
            }
        }
        let cached = shard.entry(key).or_insert_with(|| CachedInode {
            revision,
            metadata: None,
            flags: FileFlags::default(),
            path: None,
        });
        if cached.revision != revision {
            *cached = CachedInode {
                revision,
                metadata: None,
                flags: FileFlags::default(),
                path: None,
            };
        }
        f(cached);
    }

    pub fn stats(&self) -> InodeCacheStats {
        InodeCacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            stale: self.stats.stale.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(nlink: u32) -> FileMetadata {
        FileMetadata {
            nlink,
            ..Default::default()
        }
    }

    #[test]
    fn bump_is_monotonic() {
        let cache = InodeCache::new(16, 2, 8);
        assert_eq!(cache.revision(1, 10), 0);
        assert_eq!(cache.bump(1, 10), 1);
        assert_eq!(cache.bump(1, 10), 2);
        assert_eq!(cache.revision(1, 10), 2);
        assert_eq!(cache.path_id(1, 10), 2);
    }

    #[test]
    fn stale_records_are_never_served() {
        let cache = InodeCache::new(16, 2, 8);
        let revision = cache.revision(1, 10);
        cache.insert_metadata(1, 10, revision, metadata(1), FileFlags::default());
        assert_eq!(cache.get(1, 10).unwrap().metadata, Some(metadata(1)));
        cache.bump(1, 10);
        assert_eq!(cache.get(1, 10), None);
        // a record read before the bump is refused
        cache.insert_metadata(1, 10, revision, metadata(1), FileFlags::default());
        assert_eq!(cache.get(1, 10), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.invalidations, 1);
    }

    #[test]
    fn records_merge_metadata_and_path() {
        let cache = InodeCache::new(16, 1, 8);
        cache.insert_path(3, 5, 0, "/tmp".to_string());
        cache.insert_metadata(3, 5, 0, metadata(2), FileFlags::UPPER_LAYER);
        let cached = cache.get(3, 5).unwrap();
        assert_eq!(cached.path.as_deref(), Some("/tmp"));
        assert_eq!(cached.metadata, Some(metadata(2)));
        assert!(cached.flags.contains(FileFlags::UPPER_LAYER));
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = InodeCache::new(1024, 1, 2);
        for ino in 0..10 {
            cache.insert_path(1, ino, 0, format!("/{ino}"));
        }
        let cached = (0..10).filter(|ino| cache.get(1, *ino).is_some()).count();
        assert_eq!(cached, 2);
        // the most recent insert is always kept
        assert!(cache.get(1, 9).is_some());
    }
}
