use std::{
    collections::{hash_map::RandomState, HashMap},
    hash::{BuildHasher, Hash, Hasher},
    sync::{PoisonError, RwLock},
};

use sensor_common::{Pid, Timestamp};
use sensor_core::event::EventType;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscarderError {
    #[error("discarder shard is full ({capacity} entries)")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InodeKey {
    event_type: EventType,
    mount_id: u32,
    ino: u64,
}

/// Inode and process discarders.
///
/// Inode discarders are stamped with the revision of the object when they
/// were added: a discarder whose revision differs from the current one is
/// void. Process discarders can have an expiration time.
pub struct Discarders {
    hasher: RandomState,
    inodes: Vec<RwLock<HashMap<InodeKey, u64>>>,
    capacity: usize,
    processes: RwLock<HashMap<(Pid, EventType), Option<Timestamp>>>,
}

impl Discarders {
    /// `shards` inode maps of `capacity` entries each.
    pub fn new(shards: usize, capacity: usize) -> Self {
        Self {
            hasher: RandomState::new(),
            inodes: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            capacity,
            processes: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, key: &InodeKey) -> &RwLock<HashMap<InodeKey, u64>> {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        &self.inodes[hasher.finish() as usize % self.inodes.len()]
    }

    /// Exclude an object from future monitoring of an event type, as long as
    /// its revision stays `revision`.
    pub fn discard_inode(
        &self,
        event_type: EventType,
        mount_id: u32,
        ino: u64,
        revision: u64,
    ) -> Result<(), DiscarderError> {
        let key = InodeKey {
            event_type,
            mount_id,
            ino,
        };
        let mut shard = self
            .shard(&key)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if shard.len() >= self.capacity && !shard.contains_key(&key) {
            return Err(DiscarderError::Full {
                capacity: self.capacity,
            });
        }
        log::trace!("discarding {event_type} on {mount_id}:{ino} at revision {revision}");
        shard.insert(key, revision);
        Ok(())
    }

    /// Check if an object is discarded. `revision` is the current revision of
    /// the object.
    pub fn is_inode_discarded(
        &self,
        event_type: EventType,
        mount_id: u32,
        ino: u64,
        revision: u64,
    ) -> bool {
        let key = InodeKey {
            event_type,
            mount_id,
            ino,
        };
        self.shard(&key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .is_some_and(|stamped| *stamped == revision)
    }

    /// Remove the discarders of an object for every event type.
    pub fn remove_inode(&self, mount_id: u32, ino: u64) {
        for event_type in EventType::ALL {
            let key = InodeKey {
                event_type,
                mount_id,
                ino,
            };
            self.shard(&key)
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }

    /// Exclude a process from monitoring of an event type, optionally until
    /// the `expire` timestamp.
    pub fn discard_process(&self, pid: Pid, event_type: EventType, expire: Option<Timestamp>) {
        log::trace!("discarding {event_type} for process {pid}");
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((pid, event_type), expire);
    }

    pub fn is_process_discarded(&self, pid: Pid, event_type: EventType, now: Timestamp) -> bool {
        match self
            .processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(pid, event_type))
        {
            Some(None) => true,
            Some(Some(expire)) => now < *expire,
            None => false,
        }
    }

    /// Drop all discarders of an exited process.
    pub fn remove_process(&self, pid: Pid) {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(discarded, _), _| *discarded != pid);
    }
}
