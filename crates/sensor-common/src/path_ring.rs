//! [`PathRing`] is the store where resolved paths are written. A writer gets
//! back a [`PathRef`], a small `Copy` reference which can travel inside events
//! and points to a sub-slice of one ring shard. It can be considered as a
//! pointer, which allows to extract the actual path only when paired with the
//! ring.
//!
//! The ring never grows: old paths are overwritten once a shard wraps around,
//! so reading a stale reference fails with [`PathRefError::Overwritten`]
//! instead of returning someone else's path.

use std::{
    str::{from_utf8, Utf8Error},
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub struct PathRing {
    shards: Box<[Mutex<RingShard>]>,
    /// Size in bytes of every shard
    capacity: usize,
}

struct RingShard {
    buffer: Vec<u8>,
    /// Total number of bytes ever written in this shard. The write head is
    /// `written % capacity`.
    written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathRef {
    /// Shard the path was written to
    shard: u16,
    /// Absolute start offset of the path in the shard
    start: u64,
    /// Length of the pointed-at path
    len: u16,
}

impl PathRef {
    /// Return length of the pointed at path
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Return if the path is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PathRefError {
    #[error("path of {len} bytes doesn't fit a ring shard of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },
    #[error("path [{start}-{end}] was overwritten (shard head at {written})")]
    Overwritten { start: u64, end: u64, written: u64 },
    #[error("path [{start}-{end}] is past the shard head {written}")]
    OutOfRange { start: u64, end: u64, written: u64 },
    #[error("ring shard {shard} doesn't exist")]
    InvalidShard { shard: usize },
    #[error("path is not a valid string. {bytes:?} {error:?}")]
    NotAString {
        #[source]
        error: Utf8Error,
        bytes: Vec<u8>,
    },
}

impl PathRing {
    /// Create a ring made of `shards` shards of `capacity` bytes each.
    /// Both values are clamped to at least 1.
    pub fn new(shards: usize, capacity: usize) -> Self {
        let shards = shards.clamp(1, u16::MAX as usize);
        let capacity = capacity.max(1);
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(RingShard {
                        buffer: vec![0; capacity],
                        written: 0,
                    })
                })
                .collect(),
            capacity,
        }
    }

    /// Write a path in the shard selected by `hint` (usually the execution
    /// context writing it) and return a reference to it.
    pub fn write(&self, hint: u64, path: &str) -> Result<PathRef, PathRefError> {
        let bytes = path.as_bytes();
        if bytes.len() > self.capacity || bytes.len() > u16::MAX as usize {
            return Err(PathRefError::TooLarge {
                len: bytes.len(),
                capacity: self.capacity.min(u16::MAX as usize),
            });
        }
        let shard_index = (hint % self.shards.len() as u64) as usize;
        let mut shard = self.shards[shard_index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let start = shard.written;
        let head = (start % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - head);
        shard.buffer[head..head + first].copy_from_slice(&bytes[..first]);
        shard.buffer[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        shard.written += bytes.len() as u64;
        Ok(PathRef {
            shard: shard_index as u16,
            start,
            len: bytes.len() as u16,
        })
    }

    /// Given a reference, try to extract the pointed at path.
    pub fn read(&self, path_ref: &PathRef) -> Result<String, PathRefError> {
        let shard = self
            .shards
            .get(path_ref.shard as usize)
            .ok_or(PathRefError::InvalidShard {
                shard: path_ref.shard as usize,
            })?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let start = path_ref.start;
        let end = start + path_ref.len as u64;
        if end > shard.written {
            return Err(PathRefError::OutOfRange {
                start,
                end,
                written: shard.written,
            });
        }
        if shard.written - start > self.capacity as u64 {
            return Err(PathRefError::Overwritten {
                start,
                end,
                written: shard.written,
            });
        }
        let head = (start % self.capacity as u64) as usize;
        let len = path_ref.len();
        let first = len.min(self.capacity - head);
        let mut bytes = Vec::with_capacity(len);
        bytes.extend_from_slice(&shard.buffer[head..head + first]);
        bytes.extend_from_slice(&shard.buffer[..len - first]);
        let path = from_utf8(&bytes).map_err(|error| PathRefError::NotAString {
            error,
            bytes: bytes.clone(),
        })?;
        Ok(path.to_string())
    }
}
