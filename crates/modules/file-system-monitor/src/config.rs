use std::{sync::Arc, time::Duration};

use sensor_common::PathRing;
use sensor_core::config::{ConfigError, ModuleConfig};

/// Dentries visited by a single resolver hop
pub const DEFAULT_SEGMENTS_PER_HOP: u32 = 16;
/// Resolver hops before a path is truncated
pub const DEFAULT_MAX_ITERATIONS: u32 = 29;
/// A resolution plus its callback must fit the tail call limit
const MAX_ITERATIONS_LIMIT: u32 = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub segments_per_hop: u32,
    pub max_iterations: u32,
    pub syscall_cache_shards: usize,
    pub syscall_cache_capacity: usize,
    pub max_entry_age: Duration,
    pub sweep_interval: Duration,
    pub inode_cache_capacity: usize,
    pub revision_slots: usize,
    pub path_ring_shards: usize,
    pub path_ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segments_per_hop: DEFAULT_SEGMENTS_PER_HOP,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            syscall_cache_shards: 16,
            syscall_cache_capacity: 1024,
            max_entry_age: Duration::from_millis(5000),
            sweep_interval: Duration::from_millis(1000),
            inode_cache_capacity: 4096,
            revision_slots: 4096,
            path_ring_shards: 8,
            path_ring_capacity: 65536,
        }
    }
}

impl Config {
    /// Path ring sized by this configuration.
    pub fn path_ring(&self) -> Arc<PathRing> {
        Arc::new(PathRing::new(self.path_ring_shards, self.path_ring_capacity))
    }
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = Config::default();
        let max_iterations = config.with_default("max_iterations", default.max_iterations)?;
        if !(1..=MAX_ITERATIONS_LIMIT).contains(&max_iterations) {
            return Err(invalid(
                "max_iterations",
                max_iterations,
                format!("must be between 1 and {MAX_ITERATIONS_LIMIT}"),
            ));
        }
        let segments_per_hop = config.with_default("segments_per_hop", default.segments_per_hop)?;
        if segments_per_hop == 0 {
            return Err(invalid("segments_per_hop", 0, "must be positive".to_string()));
        }
        let revision_slots = config.with_default("revision_slots", default.revision_slots)?;
        if !revision_slots.is_power_of_two() {
            return Err(invalid(
                "revision_slots",
                revision_slots,
                "must be a power of two".to_string(),
            ));
        }
        Ok(Config {
            segments_per_hop,
            max_iterations,
            syscall_cache_shards: config
                .with_default("syscall_cache_shards", default.syscall_cache_shards)?,
            syscall_cache_capacity: config
                .with_default("syscall_cache_capacity", default.syscall_cache_capacity)?,
            max_entry_age: Duration::from_millis(config.with_default("max_entry_age_ms", 5000)?),
            sweep_interval: Duration::from_millis(config.with_default("sweep_interval_ms", 1000)?),
            inode_cache_capacity: config
                .with_default("inode_cache_capacity", default.inode_cache_capacity)?,
            revision_slots,
            path_ring_shards: config.with_default("path_ring_shards", default.path_ring_shards)?,
            path_ring_capacity: config
                .with_default("path_ring_capacity", default.path_ring_capacity)?,
        })
    }
}

fn invalid(field: &str, value: impl ToString, err: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        err,
    }
}
