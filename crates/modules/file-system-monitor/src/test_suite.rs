use std::sync::Arc;

use sensor_common::{
    test_runner::{TestCase, TestRunner, TestSender, TestSuite},
    PathRing, Pid, Timestamp,
};
use sensor_core::{
    context::{ProcessCache, ProcessUpdate},
    event::{EventType, Payload, PathStatus, SensorMessage},
    event_check,
};
use sensor_filtering::{policy_channel, Policy, PolicyMode, PolicySet};

use super::*;
use crate::test_utils::MemoryTree;

const PID: Pid = Pid::from_raw(4242);
const MOUNT: u32 = 1;

type TestSensor = Sensor<Arc<MemoryTree>, ProcessCache, TestSender<SensorMessage>>;

pub fn tests() -> TestSuite {
    TestSuite {
        name: "file-system-monitor",
        tests: vec![
            hardlink(),
            hardlink_process_context(),
            hardlink_discarded(),
            hardlink_unhandled_error(),
            hardlink_async(),
            mkdir(),
            mkdir_deep_path(),
            mkdir_discarded_inode(),
            disabled_event_type(),
        ],
    }
}

fn sensor(
    tree: Arc<MemoryTree>,
    ring: Arc<PathRing>,
    policy: PolicySet,
    sender: TestSender<SensorMessage>,
) -> TestSensor {
    sensor_with(&Config::default(), tree, ring, policy, sender)
}

fn sensor_with(
    config: &Config,
    tree: Arc<MemoryTree>,
    ring: Arc<PathRing>,
    policy: PolicySet,
    sender: TestSender<SensorMessage>,
) -> TestSensor {
    let (_, handle) = policy_channel(policy);
    let context = ProcessCache::new();
    context.update(ProcessUpdate::Fork {
        pid: PID,
        ppid: Pid::from_raw(1),
        timestamp: Timestamp::from(0),
        uid: 1000,
        gid: 1000,
        container: None,
    });
    context.update(ProcessUpdate::Exec {
        pid: PID,
        timestamp: Timestamp::from(1),
        image: "/usr/bin/ln".to_string(),
    });
    Sensor::new(config, ring, tree, context, handle, sender)
}

fn fire(sensor: &TestSensor, hook: Hook) -> HookStatus {
    sensor.dispatch(&Invocation {
        tid: PID,
        pid: PID,
        timestamp: Timestamp::from(10),
        hook,
    })
}

fn link(sensor: &TestSensor, tree: &MemoryTree, source: &str, target: &str, retval: i64) {
    let Some(source) = tree.find(source) else {
        return;
    };
    let target = tree.add_negative(target);
    fire(sensor, Hook::SyscallEnter(Syscall::Linkat));
    fire(
        sensor,
        Hook::Kprobe(KernelCall::VfsLink {
            source,
            target,
            mount_id: MOUNT,
        }),
    );
    fire(
        sensor,
        Hook::SyscallExit {
            syscall: Syscall::Linkat,
            retval,
        },
    );
}

fn mkdir_hooks(sensor: &TestSensor, tree: &MemoryTree, path: &str) {
    let dentry = tree.add_negative(path);
    fire(sensor, Hook::SyscallEnter(Syscall::Mkdirat { mode: 0o750 }));
    fire(
        sensor,
        Hook::Kprobe(KernelCall::VfsMkdir {
            dentry,
            mount_id: MOUNT,
        }),
    );
    tree.instantiate(dentry, 0o040750);
    fire(
        sensor,
        Hook::SyscallExit {
            syscall: Syscall::Mkdirat { mode: 0o750 },
            retval: 0,
        },
    );
}

fn is_event(message: &SensorMessage) -> bool {
    message.event().is_some()
}

fn hardlink() -> TestCase {
    TestCase::new("hardlink", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        tree.add_file("/etc/passwd");
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, PolicySet::default(), sender)
        })
        .run(|sensor| link(sensor, &tree, "/etc/passwd", "/tmp/passwd", 0))
        .await
        .expect_event(event_check!(
            Payload::Link,
            (source.path_ref, "/etc/passwd".to_string(), "source path"),
            (source.path_status, PathStatus::Resolved, "source status"),
            (target.path_ref, "/tmp/passwd".to_string(), "target path"),
            (target.path_status, PathStatus::Resolved, "target status"),
            (source.path_key.mount_id, MOUNT, "mount id")
        ))
        .expect_count("events", 1, is_event)
        .expect_state("no leftover entry", |sensor| sensor.syscalls().is_empty())
        .report()
    })
}

fn hardlink_process_context() -> TestCase {
    TestCase::new("hardlink_process_context", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        tree.add_file("/tmp/a");
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, PolicySet::default(), sender)
        })
        .run(|sensor| link(sensor, &tree, "/tmp/a", "/tmp/b", 0))
        .await
        .expect_count("event with process context", 1, |message| {
            message.event().is_some_and(|event| {
                event.context().process.pid == PID.as_raw()
                    && event.context().process.image == "/usr/bin/ln"
            })
        })
        .report()
    })
}

fn hardlink_discarded() -> TestCase {
    TestCase::new("hardlink_discarded", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        let source = tree.add_file("/tmp/a");
        let ino = tree.inode(source).map(|inode| inode.ino).unwrap_or_default();
        let policy = PolicySet::default().with_policy(
            EventType::Link,
            Policy {
                mode: PolicyMode::Deny,
                ..Default::default()
            },
        );
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, policy, sender)
        })
        .run(|sensor| link(sensor, &tree, "/tmp/a", "/tmp/b", 0))
        .await
        .expect_none("events", is_event)
        .expect_count("invalidation notices", 1, move |message| {
            matches!(
                message,
                SensorMessage::InvalidateDentry { ino: notified, .. } if *notified == ino
            )
        })
        .report()
    })
}

fn hardlink_unhandled_error() -> TestCase {
    TestCase::new("hardlink_unhandled_error", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        let source = tree.add_file("/tmp/a");
        let ino = tree.inode(source).map(|inode| inode.ino).unwrap_or_default();
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, PolicySet::default(), sender)
        })
        .run(|sensor| {
            link(
                sensor,
                &tree,
                "/tmp/a",
                "/tmp/b",
                -(nix::errno::Errno::EEXIST as i64),
            )
        })
        .await
        .expect_none("messages", |_| true)
        .expect_state("entry popped", |sensor| sensor.syscalls().is_empty())
        .expect_state("source not invalidated", move |sensor| {
            sensor.inodes().revision(MOUNT, ino) == 0
        })
        .report()
    })
}

fn hardlink_async() -> TestCase {
    TestCase::new("hardlink_async", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        let source = tree.add_file("/tmp/a");
        let target = tree.add_negative("/tmp/b");
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, PolicySet::default(), sender)
        })
        .run(|sensor| {
            fire(sensor, Hook::Kprobe(KernelCall::DoLinkat));
            fire(
                sensor,
                Hook::Kprobe(KernelCall::VfsLink {
                    source,
                    target,
                    mount_id: MOUNT,
                }),
            );
            fire(
                sensor,
                Hook::Kretprobe {
                    function: KernelFunction::DoLinkat,
                    retval: 0,
                },
            );
        })
        .await
        .expect_count("async events", 1, |message| {
            message.event().is_some_and(|event| event.header().is_async)
        })
        .report()
    })
}

fn mkdir() -> TestCase {
    TestCase::new("mkdir", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, PolicySet::default(), sender)
        })
        .run(|sensor| mkdir_hooks(sensor, &tree, "/var/lib/data"))
        .await
        .expect_event(event_check!(
            Payload::Mkdir,
            (file.path_ref, "/var/lib/data".to_string(), "path"),
            (mode, 0o750, "mode"),
            (file.metadata.mode, 0o040750, "inode mode")
        ))
        .report()
    })
}

fn mkdir_deep_path() -> TestCase {
    TestCase::new("mkdir_deep_path", async {
        let config = Config {
            segments_per_hop: 2,
            ..Default::default()
        };
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        let path: String = (0..20).map(|i| format!("/level{i}")).collect();
        let expected = path.clone();
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor_with(&config, tree.clone(), ring, PolicySet::default(), sender)
        })
        .run(|sensor| mkdir_hooks(sensor, &tree, &path))
        .await
        .expect_event(event_check!(
            Payload::Mkdir,
            (file.path_ref, expected, "path"),
            (file.path_status, PathStatus::Resolved, "status")
        ))
        .report()
    })
}

fn mkdir_discarded_inode() -> TestCase {
    TestCase::new("mkdir_discarded_inode", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        let cache = tree.add_dir("/var/cache");
        let ino = tree.inode(cache).map(|inode| inode.ino).unwrap_or_default();
        let policy = PolicySet::default().with_policy(
            EventType::Mkdir,
            Policy {
                mode: PolicyMode::Accept,
                ..Default::default()
            },
        );
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, policy, sender)
        })
        .run(|sensor| {
            let _ = sensor.discard_inode(EventType::Mkdir, MOUNT, ino);
            mkdir_hooks(sensor, &tree, "/var/cache/apt");
            mkdir_hooks(sensor, &tree, "/var/log");
        })
        .await
        .expect_event(event_check!(
            Payload::Mkdir,
            (file.path_ref, "/var/log".to_string(), "path")
        ))
        .expect_count("events", 1, is_event)
        .expect_state("resolver discards", |sensor| {
            sensor.stats().filter.discarded_by_resolver == 1
        })
        .report()
    })
}

fn disabled_event_type() -> TestCase {
    TestCase::new("disabled_event_type", async {
        let config = Config::default();
        let ring = config.path_ring();
        let tree = Arc::new(MemoryTree::new());
        tree.add_file("/tmp/a");
        let policy = PolicySet::default().with_enabled(&[EventType::Mkdir]);
        TestRunner::with_sensor(ring.clone(), |sender| {
            sensor(tree.clone(), ring, policy, sender)
        })
        .run(|sensor| {
            link(sensor, &tree, "/tmp/a", "/tmp/b", 0);
            mkdir_hooks(sensor, &tree, "/tmp/c");
        })
        .await
        .expect_none("link events", |message| {
            matches!(
                message.event().map(|event| event.header().event_type),
                Some(EventType::Link)
            )
        })
        .expect_count("mkdir events", 1, is_event)
        .expect_state("rejections", |sensor| sensor.stats().filter.rejected == 1)
        .report()
    })
}
