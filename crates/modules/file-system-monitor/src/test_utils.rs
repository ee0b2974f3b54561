//! In-memory dentry tree used by unit tests and the test suite.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use sensor_core::event::FileMetadata;

use crate::dentry::{Dentry, DentryHandle, DentryTree, Inode};

const ROOT: DentryHandle = DentryHandle(1);
const ROOT_INO: u64 = 2;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

pub struct MemoryTree {
    dentries: RwLock<HashMap<DentryHandle, Dentry>>,
    next_handle: AtomicU64,
    next_ino: AtomicU64,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        let mut dentries = HashMap::new();
        dentries.insert(
            ROOT,
            Dentry {
                name: "/".to_string(),
                parent: ROOT,
                inode: Some(Inode {
                    ino: ROOT_INO,
                    metadata: metadata(S_IFDIR | 0o755),
                    upper_layer: false,
                }),
            },
        );
        Self {
            dentries: RwLock::new(dentries),
            next_handle: AtomicU64::new(ROOT.0 + 1),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }

    pub fn root(&self) -> DentryHandle {
        ROOT
    }

    /// Find the dentry of an absolute path.
    pub fn find(&self, path: &str) -> Option<DentryHandle> {
        let dentries = self.dentries.read().unwrap_or_else(PoisonError::into_inner);
        components(path).try_fold(ROOT, |parent, name| {
            dentries
                .iter()
                .find(|(handle, d)| d.parent == parent && **handle != parent && d.name == name)
                .map(|(handle, _)| *handle)
        })
    }

    pub fn inode(&self, handle: DentryHandle) -> Option<Inode> {
        self.lookup(handle).and_then(|dentry| dentry.inode)
    }

    /// Create a directory and its missing parents.
    pub fn add_dir(&self, path: &str) -> DentryHandle {
        components(path).fold(ROOT, |parent, name| {
            self.child(parent, name)
                .unwrap_or_else(|| self.insert(parent, name, Some(S_IFDIR | 0o755)))
        })
    }

    /// Create a regular file and its missing parents.
    pub fn add_file(&self, path: &str) -> DentryHandle {
        let (dir, name) = split(path);
        let parent = self.add_dir(dir);
        self.insert(parent, name, Some(S_IFREG | 0o644))
    }

    /// Create a negative dentry: a name which doesn't exist yet.
    pub fn add_negative(&self, path: &str) -> DentryHandle {
        let (dir, name) = split(path);
        let parent = self.add_dir(dir);
        self.insert(parent, name, None)
    }

    /// Give an inode to a negative dentry. Returns the inode number.
    pub fn instantiate(&self, handle: DentryHandle, mode: u32) -> u64 {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let mut dentries = self.dentries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(dentry) = dentries.get_mut(&handle) {
            dentry.inode = Some(Inode {
                ino,
                metadata: metadata(mode),
                upper_layer: false,
            });
        }
        ino
    }

    /// Update the inode of a dentry.
    pub fn update_inode(&self, handle: DentryHandle, f: impl FnOnce(&mut Inode)) {
        let mut dentries = self.dentries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(inode) = dentries.get_mut(&handle).and_then(|d| d.inode.as_mut()) {
            f(inode);
        }
    }

    fn child(&self, parent: DentryHandle, name: &str) -> Option<DentryHandle> {
        self.dentries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(handle, d)| d.parent == parent && **handle != parent && d.name == name)
            .map(|(handle, _)| *handle)
    }

    fn insert(&self, parent: DentryHandle, name: &str, mode: Option<u32>) -> DentryHandle {
        let handle = DentryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let inode = mode.map(|mode| Inode {
            ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
            metadata: metadata(mode),
            upper_layer: false,
        });
        self.dentries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                handle,
                Dentry {
                    name: name.to_string(),
                    parent,
                    inode,
                },
            );
        handle
    }
}

impl DentryTree for MemoryTree {
    fn lookup(&self, handle: DentryHandle) -> Option<Dentry> {
        self.dentries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }
}

fn metadata(mode: u32) -> FileMetadata {
    FileMetadata {
        uid: 1000,
        gid: 1000,
        mode,
        nlink: 1,
        ..Default::default()
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn split(path: &str) -> (&str, &str) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}
