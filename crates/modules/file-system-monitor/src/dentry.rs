//! Read-only view of the kernel dentry tree.
//!
//! Hooks receive opaque [`DentryHandle`]s; names, parents and inodes are only
//! reachable through a [`DentryTree`].

use std::sync::Arc;

use sensor_core::event::FileMetadata;

/// Opaque reference to a dentry, like a `struct dentry *`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DentryHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub ino: u64,
    pub metadata: FileMetadata,
    /// The inode lives in the upper layer of an overlay file system
    pub upper_layer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    pub name: String,
    /// Equal to the dentry's own handle at the root of the mount
    pub parent: DentryHandle,
    /// `None` for negative dentries (names which don't exist yet)
    pub inode: Option<Inode>,
}

pub trait DentryTree: Send + Sync + 'static {
    /// Read a dentry. `None` if the handle is no longer valid.
    fn lookup(&self, handle: DentryHandle) -> Option<Dentry>;
}

impl<T: DentryTree> DentryTree for Arc<T> {
    fn lookup(&self, handle: DentryHandle) -> Option<Dentry> {
        self.as_ref().lookup(handle)
    }
}
