//! Path resolver.
//!
//! A path is resolved by walking the dentry tree from the leaf up to the root
//! of the mount. A single hop visits at most `segments_per_hop` dentries; a
//! deeper path needs more hops, each one scheduled as a continuation carrying
//! the [`ResolverState`] forward. After `max_iterations` hops the walk gives
//! up and the partial path is reported as truncated.
//!
//! When a discard check is requested, every visited dentry is checked against
//! the inode discarders of the event type. Otherwise the resolved paths of
//! directories are cached and a cached ancestor ends the walk early.
//!
//! Leaf paths are never cached: hard links share the same inode under
//! different names.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use sensor_common::{PathRef, PathRing};
use sensor_core::event::{EventType, PathKey, PathStatus};
use sensor_filtering::Discarders;
use serde::{Deserialize, Serialize};

use crate::{
    dentry::{DentryHandle, DentryTree},
    inode_cache::InodeCache,
};

/// Program resumed once a resolution terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolverCallback {
    LinkSrc,
    LinkDst,
    Mkdir,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResolveResult {
    #[default]
    Pending,
    Resolved,
    /// A visited dentry matched an inode discarder
    Discarded,
    /// A dentry could not be read
    Error,
    Truncated,
}

impl ResolveResult {
    pub fn path_status(self) -> PathStatus {
        match self {
            ResolveResult::Pending => PathStatus::Unresolved,
            ResolveResult::Resolved => PathStatus::Resolved,
            ResolveResult::Discarded => PathStatus::Discarded,
            ResolveResult::Error => PathStatus::Error,
            ResolveResult::Truncated => PathStatus::Truncated,
        }
    }
}

/// Resolution request, persisted between hops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolverState {
    /// Next dentry to visit
    pub dentry: Option<DentryHandle>,
    /// Key of the leaf
    pub key: PathKey,
    /// Check inode discarders of this type
    pub discarder_type: Option<EventType>,
    pub callback: Option<ResolverCallback>,
    /// Hops done so far
    pub iteration: u32,
    /// Dentries visited so far
    pub segments: u32,
    pub result: ResolveResult,
    pub path_ref: Option<PathRef>,
    // names and inodes of the visited dentries, leaf first
    names: Vec<String>,
    inodes: Vec<u64>,
}

impl ResolverState {
    pub fn new(
        dentry: Option<DentryHandle>,
        key: PathKey,
        discarder_type: Option<EventType>,
        callback: ResolverCallback,
    ) -> Self {
        Self {
            dentry,
            key,
            discarder_type,
            callback: Some(callback),
            ..Default::default()
        }
    }
}

/// Outcome of a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// Another hop is needed
    Continue,
    /// The state holds the result, resume the given program
    Done(Option<ResolverCallback>),
}

pub struct Resolver {
    segments_per_hop: u32,
    max_iterations: u32,
    ring: Arc<PathRing>,
    stats: Stats,
}

#[derive(Debug, Default)]
struct Stats {
    resolved: AtomicU64,
    truncated: AtomicU64,
    discarded: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    hops: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStats {
    pub resolved: u64,
    pub truncated: u64,
    pub discarded: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub hops: u64,
}

impl Resolver {
    pub fn new(segments_per_hop: u32, max_iterations: u32, ring: Arc<PathRing>) -> Self {
        Self {
            segments_per_hop: segments_per_hop.max(1),
            max_iterations: max_iterations.max(1),
            ring,
            stats: Stats::default(),
        }
    }

    pub fn ring(&self) -> &Arc<PathRing> {
        &self.ring
    }

    /// Walk up to `segments_per_hop` dentries.
    pub fn hop<T: DentryTree>(
        &self,
        state: &mut ResolverState,
        tree: &T,
        inodes: &InodeCache,
        discarders: &Discarders,
    ) -> Hop {
        if state.result != ResolveResult::Pending {
            return Hop::Done(state.callback);
        }
        state.iteration += 1;
        self.stats.hops.fetch_add(1, Ordering::Relaxed);
        let mount_id = state.key.mount_id;

        for _ in 0..self.segments_per_hop {
            let Some(handle) = state.dentry else {
                return self.finish(state, inodes, ResolveResult::Error, None);
            };
            let Some(dentry) = tree.lookup(handle) else {
                log::debug!("dentry {handle:?} of {} not found", state.key);
                return self.finish(state, inodes, ResolveResult::Error, None);
            };
            let leaf = state.segments == 0;
            let ino = if leaf {
                state.key.ino
            } else {
                match &dentry.inode {
                    Some(inode) => inode.ino,
                    None => {
                        log::debug!("negative ancestor {} of {}", dentry.name, state.key);
                        return self.finish(state, inodes, ResolveResult::Error, None);
                    }
                }
            };

            match state.discarder_type {
                Some(event_type) => {
                    let revision = inodes.revision(mount_id, ino);
                    if discarders.is_inode_discarded(event_type, mount_id, ino, revision) {
                        return self.finish(state, inodes, ResolveResult::Discarded, None);
                    }
                }
                None if !leaf => {
                    if let Some(prefix) = inodes.get(mount_id, ino).and_then(|cached| cached.path)
                    {
                        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return self.finish(state, inodes, ResolveResult::Resolved, Some(prefix));
                    }
                }
                None => {}
            }

            if dentry.parent == handle {
                // root of the mount
                return self.finish(state, inodes, ResolveResult::Resolved, Some(String::new()));
            }
            state.names.push(dentry.name);
            state.inodes.push(ino);
            state.segments += 1;
            state.dentry = Some(dentry.parent);
        }

        if state.iteration >= self.max_iterations {
            return self.finish(state, inodes, ResolveResult::Truncated, None);
        }
        Hop::Continue
    }

    fn finish(
        &self,
        state: &mut ResolverState,
        inodes: &InodeCache,
        mut result: ResolveResult,
        prefix: Option<String>,
    ) -> Hop {
        let path = match result {
            ResolveResult::Resolved => {
                let mount_id = state.key.mount_id;
                let mut path = prefix.unwrap_or_default();
                for (index, name) in state.names.iter().enumerate().rev() {
                    path.push('/');
                    path.push_str(name);
                    if index > 0 {
                        let ino = state.inodes[index];
                        inodes.insert_path(
                            mount_id,
                            ino,
                            inodes.revision(mount_id, ino),
                            path.clone(),
                        );
                    }
                }
                if path.is_empty() {
                    path.push('/');
                }
                Some(path)
            }
            ResolveResult::Truncated => Some(
                state
                    .names
                    .iter()
                    .rev()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("/"),
            ),
            _ => None,
        };
        if let Some(path) = path {
            match self.ring.write(state.key.ino, &path) {
                Ok(path_ref) => state.path_ref = Some(path_ref),
                Err(err) => {
                    log::warn!("writing path of {} failed: {err}", state.key);
                    result = ResolveResult::Error;
                }
            }
        }
        let counter = match result {
            ResolveResult::Resolved => &self.stats.resolved,
            ResolveResult::Truncated => &self.stats.truncated,
            ResolveResult::Discarded => &self.stats.discarded,
            _ => &self.stats.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        state.result = result;
        state.dentry = None;
        state.names.clear();
        state.inodes.clear();
        Hop::Done(state.callback)
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            resolved: self.stats.resolved.load(Ordering::Relaxed),
            truncated: self.stats.truncated.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            hops: self.stats.hops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryTree;

    const MOUNT: u32 = 1;

    struct Fixture {
        tree: MemoryTree,
        inodes: InodeCache,
        discarders: Discarders,
        resolver: Resolver,
    }

    fn fixture(segments_per_hop: u32, max_iterations: u32) -> Fixture {
        Fixture {
            tree: MemoryTree::new(),
            inodes: InodeCache::new(64, 2, 64),
            discarders: Discarders::new(2, 64),
            resolver: Resolver::new(
                segments_per_hop,
                max_iterations,
                Arc::new(PathRing::new(1, 4096)),
            ),
        }
    }

    impl Fixture {
        fn state(&self, path: &str, discarder_type: Option<EventType>) -> ResolverState {
            let handle = self.tree.find(path).unwrap();
            let ino = self.tree.inode(handle).unwrap().ino;
            ResolverState::new(
                Some(handle),
                PathKey {
                    ino,
                    mount_id: MOUNT,
                    path_id: 0,
                },
                discarder_type,
                ResolverCallback::LinkSrc,
            )
        }

        /// Run hops until done, like the dispatcher would
        fn run(&self, state: &mut ResolverState) -> Option<ResolverCallback> {
            loop {
                if let Hop::Done(callback) =
                    self.resolver
                        .hop(state, &self.tree, &self.inodes, &self.discarders)
                {
                    return callback;
                }
            }
        }

        fn path(&self, state: &ResolverState) -> String {
            self.resolver.ring().read(&state.path_ref.unwrap()).unwrap()
        }
    }

    fn deep_path(depth: usize) -> String {
        (0..depth).map(|i| format!("/d{i}")).collect()
    }

    #[test]
    fn resolve_in_one_hop() {
        let f = fixture(16, 29);
        f.tree.add_file("/tmp/file");
        let mut state = f.state("/tmp/file", None);
        assert_eq!(f.run(&mut state), Some(ResolverCallback::LinkSrc));
        assert_eq!(state.result, ResolveResult::Resolved);
        assert_eq!(state.iteration, 1);
        assert_eq!(f.path(&state), "/tmp/file");
    }

    #[test]
    fn resolve_in_three_hops() {
        let f = fixture(4, 29);
        // 10 components plus the root: 4 + 4 + 3 dentries
        let path = deep_path(10);
        f.tree.add_file(&path);
        let mut state = f.state(&path, None);
        f.run(&mut state);
        assert_eq!(state.result, ResolveResult::Resolved);
        assert_eq!(state.iteration, 3);
        assert_eq!(state.segments, 10);
        assert_eq!(f.path(&state), path);
        assert_eq!(f.resolver.stats().hops, 3);
    }

    #[test]
    fn too_deep_is_truncated() {
        let f = fixture(2, 3);
        let path = deep_path(10);
        f.tree.add_file(&path);
        let mut state = f.state(&path, None);
        f.run(&mut state);
        assert_eq!(state.result, ResolveResult::Truncated);
        assert_eq!(state.iteration, 3);
        assert_eq!(f.path(&state), "d4/d5/d6/d7/d8/d9");
        assert_eq!(f.resolver.stats().truncated, 1);
    }

    #[test]
    fn iteration_never_exceeds_cap() {
        for depth in [1, 5, 31, 64] {
            let f = fixture(1, 29);
            let path = deep_path(depth);
            f.tree.add_file(&path);
            let mut state = f.state(&path, None);
            f.run(&mut state);
            assert!(state.iteration <= 29);
            if depth >= 29 {
                assert_eq!(state.result, ResolveResult::Truncated);
            } else {
                assert_eq!(state.result, ResolveResult::Resolved);
            }
        }
    }

    #[test]
    fn cached_ancestor_ends_the_walk() {
        let f = fixture(16, 29);
        f.tree.add_file("/a/b/c/file1");
        f.tree.add_file("/a/b/c/file2");
        let mut first = f.state("/a/b/c/file1", None);
        f.run(&mut first);
        assert_eq!(f.resolver.stats().cache_hits, 0);

        let mut second = f.state("/a/b/c/file2", None);
        f.run(&mut second);
        assert_eq!(f.path(&second), "/a/b/c/file2");
        assert_eq!(second.segments, 1);
        assert_eq!(f.resolver.stats().cache_hits, 1);
    }

    #[test]
    fn invalidated_ancestor_is_walked_again() {
        let f = fixture(16, 29);
        f.tree.add_file("/a/b/file1");
        let mut first = f.state("/a/b/file1", None);
        f.run(&mut first);
        let b = f.tree.inode(f.tree.find("/a/b").unwrap()).unwrap().ino;
        f.inodes.bump(MOUNT, b);
        let mut second = f.state("/a/b/file1", None);
        f.run(&mut second);
        // "/a" is still cached
        assert_eq!(second.segments, 2);
        assert_eq!(f.path(&second), "/a/b/file1");
    }

    #[test]
    fn discarded_ancestor() {
        let f = fixture(16, 29);
        f.tree.add_file("/var/log/syslog");
        let log = f.tree.inode(f.tree.find("/var/log").unwrap()).unwrap().ino;
        f.discarders
            .discard_inode(EventType::Link, MOUNT, log, f.inodes.revision(MOUNT, log))
            .unwrap();
        let mut state = f.state("/var/log/syslog", Some(EventType::Link));
        f.run(&mut state);
        assert_eq!(state.result, ResolveResult::Discarded);
        assert_eq!(state.path_ref, None);

        // other event types are not affected
        let mut state = f.state("/var/log/syslog", Some(EventType::Mkdir));
        f.run(&mut state);
        assert_eq!(state.result, ResolveResult::Resolved);

        // the discarder is void once the directory changed
        f.inodes.bump(MOUNT, log);
        let mut state = f.state("/var/log/syslog", Some(EventType::Link));
        f.run(&mut state);
        assert_eq!(state.result, ResolveResult::Resolved);
    }

    #[test]
    fn missing_dentry_is_an_error() {
        let f = fixture(16, 29);
        let mut state = ResolverState::new(
            Some(DentryHandle(12345)),
            PathKey::default(),
            None,
            ResolverCallback::LinkDst,
        );
        assert_eq!(f.run(&mut state), Some(ResolverCallback::LinkDst));
        assert_eq!(state.result, ResolveResult::Error);
        assert_eq!(state.result.path_status(), PathStatus::Error);

        let mut state = ResolverState::new(None, PathKey::default(), None, ResolverCallback::LinkDst);
        f.run(&mut state);
        assert_eq!(state.result, ResolveResult::Error);
    }

    #[test]
    fn root_leaf() {
        let f = fixture(16, 29);
        let root = f.tree.root();
        let mut state = ResolverState::new(
            Some(root),
            PathKey::default(),
            None,
            ResolverCallback::Mkdir,
        );
        f.run(&mut state);
        assert_eq!(f.path(&state), "/");
    }
}
