//! File system sensor: turns hook invocations of file system operations into
//! filtered and enriched events.
//!
//! A monitored operation is observed as several independent hook invocations
//! (syscall entry, internal kernel functions, syscall exit). The
//! [`Sensor`](file_system_monitor::Sensor) correlates them through a
//! per-thread lifecycle cache, applies the admission policy, resolves paths in
//! bounded steps and emits one event per completed operation.
//!
//! ```ignore
//! let config = Config::default();
//! let (updater, policy) = policy_channel(PolicySet::default());
//! let bus = Bus::new();
//! let sensor = Sensor::new(&config, config.path_ring(), tree, ProcessCache::new(), policy, bus.clone());
//! let _sweeper = sensor.start_sweeper();
//! sensor.dispatch(&invocation);
//! ```
//!
//! ## Crates
//!
//! - [`sensor_common`]: timestamps, transport trait, path ring and test runner
//! - [`sensor_core`]: events, module configuration, bus and context enrichment
//! - [`sensor_filtering`]: approvers, discarders and policy updates
//! - [`file_system_monitor`]: the pipeline

pub use file_system_monitor;
pub use sensor_common;
pub use sensor_core;
pub use sensor_filtering;
