//! Pools and filesystems

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tapestage_common::config::{FilesystemConfig, PoolConfig, SelectionPolicy};
use tapestage_common::{AllocMode, ReqId};

/// One filesystem providing disk cache capacity
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Filesystem {
    pub host: String,
    pub mount: PathBuf,
    pub capacity: u64,
    pub free: u64,
    pub read_streams: u32,
    pub write_streams: u32,
}

impl Filesystem {
    #[must_use]
    pub fn from_config(config: &FilesystemConfig) -> Self {
        Self {
            host: config.host.clone(),
            mount: config.mount.clone(),
            capacity: config.capacity,
            free: config.free.unwrap_or(config.capacity).min(config.capacity),
            read_streams: 0,
            write_streams: 0,
        }
    }

    /// Identifier used in reservations: `host:mount`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.mount.display())
    }

    #[must_use]
    pub const fn used(&self) -> u64 {
        self.capacity - self.free
    }

    #[must_use]
    pub const fn streams(&self, mode: AllocMode) -> u32 {
        match mode {
            AllocMode::Read => self.read_streams,
            AllocMode::Write => self.write_streams,
        }
    }

    pub const fn open_stream(&mut self, mode: AllocMode) {
        match mode {
            AllocMode::Read => self.read_streams += 1,
            AllocMode::Write => self.write_streams += 1,
        }
    }

    pub const fn close_stream(&mut self, mode: AllocMode) {
        match mode {
            AllocMode::Read => self.read_streams = self.read_streams.saturating_sub(1),
            AllocMode::Write => self.write_streams = self.write_streams.saturating_sub(1),
        }
    }

    /// Whether `path` lives on this filesystem
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.mount)
    }
}

/// A named group of filesystems
#[derive(Clone, Debug)]
pub struct Pool {
    pub name: String,
    pub filesystems: Vec<Filesystem>,
    pub gc_start_threshold: u8,
    pub gc_stop_threshold: u8,
    pub read_policy: SelectionPolicy,
    pub write_policy: SelectionPolicy,
    pub(crate) cursor: usize,
    /// Entries counted as waiting for migration
    pub(crate) migration_pending: BTreeSet<ReqId>,
}

impl Pool {
    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            filesystems: config.filesystems.iter().map(Filesystem::from_config).collect(),
            gc_start_threshold: config.gc_start_threshold,
            gc_stop_threshold: config.gc_stop_threshold,
            read_policy: config.read_policy,
            write_policy: config.write_policy,
            cursor: 0,
            migration_pending: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.filesystems.iter().map(|fs| fs.capacity).sum()
    }

    #[must_use]
    pub fn free(&self) -> u64 {
        self.filesystems.iter().map(|fs| fs.free).sum()
    }

    /// Largest single free extent, what an allocation can hope for
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.filesystems.iter().map(|fs| fs.free).max().unwrap_or(0)
    }

    /// Free space as a percentage of capacity; an empty pool counts as full
    #[must_use]
    pub fn free_percent(&self) -> u64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        self.free().saturating_mul(100) / capacity
    }

    /// Free space is under the start threshold
    #[must_use]
    pub fn below_gc_start(&self) -> bool {
        self.free_percent() < u64::from(self.gc_start_threshold)
    }

    /// Bytes a reclaim pass must free to get back to the stop threshold
    #[must_use]
    pub fn reclaim_target(&self) -> u64 {
        let goal = self.capacity() / 100 * u64::from(self.gc_stop_threshold);
        goal.saturating_sub(self.free())
    }

    #[must_use]
    pub const fn policy(&self, mode: AllocMode) -> SelectionPolicy {
        match mode {
            AllocMode::Read => self.read_policy,
            AllocMode::Write => self.write_policy,
        }
    }

    #[must_use]
    pub fn migration_pending(&self) -> usize {
        self.migration_pending.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            capacity: self.capacity(),
            free: self.free(),
            filesystems: self.filesystems.len(),
            migration_pending: self.migration_pending(),
        }
    }
}

/// Snapshot reported by query requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: u64,
    pub free: u64,
    pub filesystems: usize,
    pub migration_pending: usize,
}
