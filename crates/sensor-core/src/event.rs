use std::fmt;

use sensor_common::{PathRef, Timestamp};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Kind of monitored operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Link,
    Mkdir,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::Link, EventType::Mkdir];

    /// Bit of this type inside event type masks
    pub fn mask(self) -> u64 {
        1 << (self as u64)
    }
}

/// Location of a file system object.
///
/// Hard links share `ino`. A name which doesn't exist yet gets a synthetic
/// inode number, see [`PathKey::synthetic`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    pub ino: u64,
    pub mount_id: u32,
    pub path_id: u32,
}

/// Most significant word of synthetic inode numbers
pub const FAKE_INODE_MSW: u64 = 0xdead_c001;

impl PathKey {
    /// Key for an object which has no real inode yet (eg. the target of a
    /// hard link before the link exists).
    pub fn synthetic(mount_id: u32, random: u32) -> Self {
        Self {
            ino: FAKE_INODE_MSW << 32 | random as u64,
            mount_id,
            path_id: 0,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.ino >> 32 == FAKE_INODE_MSW
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.mount_id, self.ino, self.path_id)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    /// Change time in nanoseconds
    pub ctime: u64,
    /// Modification time in nanoseconds
    pub mtime: u64,
}

// High level abstraction for file record flags bitmask
#[repr(C)]
#[derive(Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags(u32);

impl FileFlags {
    /// The object lives in the upper layer of an overlay file system
    pub const UPPER_LAYER: FileFlags = FileFlags(1 << 0);

    pub fn from_raw_unchecked(flags: u32) -> Self {
        Self(flags)
    }

    pub fn contains(&self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FileFlags) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for FileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self)
    }
}

impl fmt::Display for FileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(FileFlags::UPPER_LAYER) {
            write!(f, "(UPPER_LAYER)")
        } else {
            write!(f, "()")
        }
    }
}

/// Outcome of the resolution of a [`FileRecord`] path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    #[default]
    Unresolved,
    Resolved,
    /// The path was deeper than the resolver budget. The path reference
    /// points to the partial path, starting from the leaf.
    Truncated,
    Discarded,
    Error,
}

/// A file system object participating in an operation.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path_key: PathKey,
    pub metadata: FileMetadata,
    pub flags: FileFlags,
    pub path_ref: Option<PathRef>,
    pub path_status: PathStatus,
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ key: {}, mode: {:o}, status: {:?} }}",
            self.path_key, self.metadata.mode, self.path_status
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessContext {
    pub pid: i32,
    pub tid: i32,
    pub ppid: i32,
    pub image: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerContext {
    pub id: String,
}

/// Distributed trace the thread was serving when the operation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

/// Context supplied by the [`ContextProvider`](crate::context::ContextProvider).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    pub process: ProcessContext,
    pub container: Option<ContainerContext>,
    pub span: Option<SpanContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub event_type: EventType,
    pub timestamp: Timestamp,
    pub retval: i64,
    /// The operation was not started by a syscall of the observed thread
    /// (eg. io_uring).
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Payload {
    Link {
        source: FileRecord,
        target: FileRecord,
    },
    Mkdir {
        file: FileRecord,
        mode: u32,
    },
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Link { source, target } => {
                write!(f, "Link {{ source: {source}, target: {target} }}")
            }
            Payload::Mkdir { file, mode } => write!(f, "Mkdir {{ file: {file}, mode: {mode:o} }}"),
        }
    }
}

/// Immutable record of one completed operation. Built only by the emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub(crate) header: Header,
    pub(crate) context: EventContext,
    pub(crate) payload: Payload,
}

impl Event {
    pub fn new(header: Header, context: EventContext, payload: Payload) -> Self {
        Self {
            header,
            context,
            payload,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        let process = &self.context.process;
        let process_info = match self.context.container {
            Some(ref container) => {
                format!("{} {} ({})", container.id, process.image, process.pid)
            }
            None => format!("{} ({})", process.image, process.pid),
        };
        let asynchronous = if header.is_async { " async" } else { "" };
        writeln!(
            f,
            "[{} EVENT {process_info}] [{}{asynchronous} = {}] {}",
            header.timestamp, header.event_type, header.retval, self.payload
        )
    }
}

/// What the sensor hands to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum SensorMessage {
    Event(Event),
    /// The consumer must drop anything it cached about this object. Sent
    /// when an object changed but its event was not passed upstream.
    InvalidateDentry {
        mount_id: u32,
        ino: u64,
        revision: u64,
    },
}

impl SensorMessage {
    pub fn event(&self) -> Option<&Event> {
        match self {
            SensorMessage::Event(event) => Some(event),
            SensorMessage::InvalidateDentry { .. } => None,
        }
    }
}
