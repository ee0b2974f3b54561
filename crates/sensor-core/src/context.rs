//! Context enrichment: who was running when an operation completed.
//!
//! Hook handlers call [`ContextProvider::context`] inline, so it must never
//! wait. [`ProcessCache`] only ever tries to take its read locks: if an update
//! is in progress the event is enriched with a best-effort context (pid and
//! tid only).

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};

use sensor_common::{Pid, Timestamp};

use crate::event::{ContainerContext, EventContext, ProcessContext, SpanContext};

pub trait ContextProvider: Send + Sync + 'static {
    /// Must not block. Missing information is left empty.
    fn context(&self, pid: Pid, tid: Pid, ts: Timestamp) -> EventContext;

    /// Drop state which can no longer be referenced by events. Called
    /// periodically by the sensor sweeper. Returns how many items were
    /// removed.
    fn cleanup(&self, _now: Timestamp) -> usize {
        0
    }
}

impl<T: ContextProvider> ContextProvider for Arc<T> {
    fn context(&self, pid: Pid, tid: Pid, ts: Timestamp) -> EventContext {
        self.as_ref().context(pid, tid, ts)
    }

    fn cleanup(&self, now: Timestamp) -> usize {
        self.as_ref().cleanup(now)
    }
}

#[derive(Debug)]
pub enum ProcessUpdate {
    Fork {
        pid: Pid,
        ppid: Pid,
        timestamp: Timestamp,
        uid: u32,
        gid: u32,
        container: Option<ContainerContext>,
    },
    Exec {
        pid: Pid,
        timestamp: Timestamp,
        image: String,
    },
    Exit {
        pid: Pid,
        timestamp: Timestamp,
    },
}

/// Cleanup timeout in nanoseconds. This is how long an exited process
/// is kept inside the cache before being eligible for delete.
const CLEANUP_TIMEOUT: u64 = 5_000_000_000; // 5 seconds

#[derive(Debug)]
struct ProcessData {
    ppid: Pid,
    exit_time: Option<Timestamp>,
    original_image: String,
    exec_changes: BTreeMap<
        Timestamp, // exec event timestamp
        String,    // new image name
    >,
    uid: u32,
    gid: u32,
    container: Option<ContainerContext>,
}

/// In-memory [`ContextProvider`] fed by process lifecycle updates and span
/// registrations.
#[derive(Default)]
pub struct ProcessCache {
    processes: RwLock<HashMap<Pid, ProcessData>>,
    /// active span of every thread
    spans: RwLock<HashMap<Pid, SpanContext>>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, update: ProcessUpdate) {
        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match update {
            ProcessUpdate::Fork {
                pid,
                ppid,
                timestamp,
                uid,
                gid,
                container,
            } => {
                let original_image = get_image(&processes, ppid, timestamp);
                let container = container.or_else(|| {
                    processes
                        .get(&ppid)
                        .and_then(|parent| parent.container.clone())
                });
                processes.insert(
                    pid,
                    ProcessData {
                        ppid,
                        exit_time: None,
                        original_image,
                        exec_changes: BTreeMap::new(),
                        uid,
                        gid,
                        container,
                    },
                );
            }
            ProcessUpdate::Exec {
                pid,
                timestamp,
                image,
            } => match processes.get_mut(&pid) {
                Some(p) => {
                    p.exec_changes.insert(timestamp, image);
                }
                None => log::debug!("(exec) Process {pid} not found in process cache"),
            },
            ProcessUpdate::Exit { pid, timestamp } => match processes.get_mut(&pid) {
                Some(p) => p.exit_time = Some(timestamp),
                None => log::debug!("(exit) Process {pid} not found in process cache"),
            },
        }
    }

    /// Register the span a thread is currently serving, or clear it.
    pub fn set_span(&self, tid: Pid, span: Option<SpanContext>) {
        let mut spans = self.spans.write().unwrap_or_else(PoisonError::into_inner);
        match span {
            Some(span) => spans.insert(tid, span),
            None => spans.remove(&tid),
        };
    }
}

/// get image name at a certain point of time
fn get_image(processes: &HashMap<Pid, ProcessData>, pid: Pid, ts: Timestamp) -> String {
    match processes.get(&pid) {
        Some(p) => p
            .exec_changes
            .range(..=ts)
            .next_back()
            .map(|(_timestamp, image)| image)
            .unwrap_or(&p.original_image)
            .clone(),
        None => String::new(),
    }
}

impl ContextProvider for ProcessCache {
    /// Remove processes exited by more than CLEANUP_TIMEOUT. Returns how
    /// many were removed.
    fn cleanup(&self, now: Timestamp) -> usize {
        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = processes.len();
        processes.retain(|pid, p| match p.exit_time {
            Some(exit_time) if now.elapsed_since(exit_time).as_nanos() > CLEANUP_TIMEOUT as u128 => {
                log::trace!("deleting [{}:{}] from process cache", pid, p.original_image);
                false
            }
            _ => true,
        });
        before - processes.len()
    }

    fn context(&self, pid: Pid, tid: Pid, ts: Timestamp) -> EventContext {
        let mut context = EventContext {
            process: ProcessContext {
                pid: pid.as_raw(),
                tid: tid.as_raw(),
                ..Default::default()
            },
            container: None,
            span: None,
        };
        match self.processes.try_read() {
            Ok(processes) => {
                if let Some(p) = processes.get(&pid) {
                    context.process.ppid = p.ppid.as_raw();
                    context.process.image = get_image(&processes, pid, ts);
                    context.process.uid = p.uid;
                    context.process.gid = p.gid;
                    context.container = p.container.clone();
                }
            }
            Err(_) => log::trace!("process cache busy, best effort context for {pid}"),
        }
        match self.spans.try_read() {
            Ok(spans) => context.span = spans.get(&tid).copied(),
            Err(_) => log::trace!("span cache busy, no span for {tid}"),
        }
        context
    }
}
