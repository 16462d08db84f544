//! Space reservation and reconciliation

use crate::policy;
use crate::pool::{Filesystem, Pool, PoolStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tapestage_common::config::PoolConfig;
use tapestage_common::{AllocMode, Error, ReqId, Result};
use tracing::{debug, info, warn};

/// Where an allocation may be placed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceRequest<'a> {
    Pool(&'a str),
    /// Any filesystem of any pool, for entries that belong to no pool
    Anywhere,
}

impl std::fmt::Display for SpaceRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pool(name) => f.write_str(name),
            Self::Anywhere => f.write_str("*"),
        }
    }
}

/// A reservation handed out by [`SpaceAllocator::allocate`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Pool the filesystem belongs to
    pub pool: String,
    /// Filesystem id, `host:mount`
    pub filesystem: String,
    pub path: PathBuf,
    pub size: u64,
    pub mode: AllocMode,
    /// A read or write stream is open on the filesystem for this allocation
    pub streaming: bool,
}

/// Result of reconciling a reservation with the written size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Bytes given back (positive) or taken (negative)
    pub delta: i64,
    /// The correction had to be clamped to keep free space within bounds
    pub clamped: bool,
}

/// Owner of the pool/filesystem table
#[derive(Debug, Default)]
pub struct SpaceAllocator {
    pools: BTreeMap<String, Pool>,
}

impl SpaceAllocator {
    #[must_use]
    pub fn new(configs: &[PoolConfig]) -> Self {
        let pools = configs
            .iter()
            .map(|c| (c.name.clone(), Pool::from_config(c)))
            .collect();
        Self { pools }
    }

    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    #[must_use]
    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.values().map(Pool::stats).collect()
    }

    /// Reserve `size` bytes for a file called `name`.
    ///
    /// Free space is decremented immediately and a stream of the given
    /// mode is opened on the chosen filesystem.
    pub fn allocate(
        &mut self,
        request: SpaceRequest<'_>,
        size: u64,
        mode: AllocMode,
        name: &str,
    ) -> Result<Allocation> {
        let names: Vec<String> = match request {
            SpaceRequest::Pool(pool) => {
                if !self.pools.contains_key(pool) {
                    return Err(Error::UnknownPool(pool.to_string()));
                }
                vec![pool.to_string()]
            }
            SpaceRequest::Anywhere => self.pools.keys().cloned().collect(),
        };

        for pool_name in &names {
            let Some(pool) = self.pools.get_mut(pool_name) else {
                continue;
            };
            let policy = pool.policy(mode);
            let Some(index) = policy::select(policy, &pool.filesystems, size, mode, &mut pool.cursor)
            else {
                continue;
            };
            let fs = &mut pool.filesystems[index];
            fs.free -= size;
            fs.open_stream(mode);
            let allocation = Allocation {
                pool: pool.name.clone(),
                filesystem: fs.id(),
                path: fs.mount.join(name),
                size,
                mode,
                streaming: true,
            };
            debug!(
                "Reserved {} bytes on {} for {}",
                size,
                allocation.filesystem,
                allocation.path.display()
            );
            return Ok(allocation);
        }

        let available = names
            .iter()
            .filter_map(|n| self.pools.get(n))
            .map(Pool::largest_free)
            .max()
            .unwrap_or(0);
        Err(Error::InsufficientSpace {
            pool: request.to_string(),
            required: size,
            available,
        })
    }

    /// Give `size` bytes back to a filesystem
    pub fn release(&mut self, filesystem: &str, path: &Path, size: u64) -> Result<()> {
        let fs = self.filesystem_mut(filesystem)?;
        let restored = fs.free.saturating_add(size);
        if restored > fs.capacity {
            warn!(
                "Release of {} bytes for {} would exceed capacity of {}, clamping",
                size,
                path.display(),
                filesystem
            );
            fs.free = fs.capacity;
        } else {
            fs.free = restored;
        }
        debug!("Released {} bytes on {} for {}", size, filesystem, path.display());
        Ok(())
    }

    /// Correct a reservation once the written size is known
    pub fn reconcile(
        &mut self,
        filesystem: &str,
        path: &Path,
        reserved: u64,
        actual: u64,
    ) -> Result<ReconcileOutcome> {
        let fs = self.filesystem_mut(filesystem)?;
        if actual <= reserved {
            let give_back = reserved - actual;
            let restored = fs.free.saturating_add(give_back);
            let clamped = restored > fs.capacity;
            if clamped {
                warn!(
                    "Reconcile of {} ({} reserved, {} written) would exceed capacity of {}, clamping",
                    path.display(),
                    reserved,
                    actual,
                    filesystem
                );
            }
            let before = fs.free;
            fs.free = restored.min(fs.capacity);
            Ok(ReconcileOutcome {
                delta: i64::try_from(fs.free - before).unwrap_or(i64::MAX),
                clamped,
            })
        } else {
            let extra = actual - reserved;
            let clamped = extra > fs.free;
            if clamped {
                warn!(
                    "Underestimate for {}: {} bytes reserved, {} written, only {} free on {}",
                    path.display(),
                    reserved,
                    actual,
                    fs.free,
                    filesystem
                );
            }
            let taken = extra.min(fs.free);
            fs.free -= taken;
            Ok(ReconcileOutcome {
                delta: -i64::try_from(taken).unwrap_or(i64::MAX),
                clamped,
            })
        }
    }

    /// Close the stream opened by an allocation
    pub fn close_stream(&mut self, allocation: &mut Allocation) {
        if !allocation.streaming {
            return;
        }
        allocation.streaming = false;
        if let Ok(fs) = self.filesystem_mut(&allocation.filesystem) {
            fs.close_stream(allocation.mode);
        }
    }

    /// Account for a file that already exists at `path` (catalogued files,
    /// entries recovered at startup). The space is taken without checking
    /// the policy; free space is clamped at zero.
    pub fn adopt(&mut self, path: &Path, size: u64, mode: AllocMode) -> Option<Allocation> {
        for pool in self.pools.values_mut() {
            if let Some(fs) = pool.filesystems.iter_mut().find(|fs| fs.contains(path)) {
                if size > fs.free {
                    warn!(
                        "Adopting {} ({} bytes) overcommits {} ({} free)",
                        path.display(),
                        size,
                        fs.id(),
                        fs.free
                    );
                }
                let taken = size.min(fs.free);
                fs.free -= taken;
                return Some(Allocation {
                    pool: pool.name.clone(),
                    filesystem: fs.id(),
                    path: path.to_path_buf(),
                    size: taken,
                    mode,
                    streaming: false,
                });
            }
        }
        None
    }

    /// Replace the pool table with a new configuration.
    ///
    /// Filesystems present in both keep their used bytes and streams;
    /// migration counters of surviving pools are kept.
    pub fn reload(&mut self, configs: &[PoolConfig]) {
        let mut pools = BTreeMap::new();
        for config in configs {
            let mut pool = Pool::from_config(config);
            if let Some(old) = self.pools.get(&config.name) {
                pool.migration_pending.clone_from(&old.migration_pending);
                for fs in &mut pool.filesystems {
                    if let Some(previous) = old
                        .filesystems
                        .iter()
                        .find(|o| o.host == fs.host && o.mount == fs.mount)
                    {
                        fs.free = fs.capacity.saturating_sub(previous.used());
                        fs.read_streams = previous.read_streams;
                        fs.write_streams = previous.write_streams;
                    }
                }
            }
            pools.insert(config.name.clone(), pool);
        }
        for name in self.pools.keys().filter(|n| !pools.contains_key(*n)) {
            warn!("Pool {} removed by configuration reload", name);
        }
        info!("Loaded {} pools", pools.len());
        self.pools = pools;
    }

    /// Count an entry as waiting for migration. Returns false when it was
    /// already counted.
    pub fn migration_add(&mut self, pool: &str, reqid: ReqId) -> bool {
        self.pools
            .get_mut(pool)
            .is_some_and(|p| p.migration_pending.insert(reqid))
    }

    /// Stop counting an entry. Returns false when it was not counted.
    pub fn migration_remove(&mut self, pool: &str, reqid: ReqId) -> bool {
        self.pools
            .get_mut(pool)
            .is_some_and(|p| p.migration_pending.remove(&reqid))
    }

    #[must_use]
    pub fn migration_pending(&self, pool: &str) -> usize {
        self.pools.get(pool).map_or(0, Pool::migration_pending)
    }

    /// Pools whose free space dropped under their start threshold
    #[must_use]
    pub fn pools_below_gc_start(&self) -> Vec<String> {
        self.pools
            .values()
            .filter(|p| p.below_gc_start())
            .map(|p| p.name.clone())
            .collect()
    }

    fn filesystem_mut(&mut self, id: &str) -> Result<&mut Filesystem> {
        self.pools
            .values_mut()
            .flat_map(|p| p.filesystems.iter_mut())
            .find(|fs| fs.id() == id)
            .ok_or_else(|| Error::NotFound(format!("filesystem {id}")))
    }

    #[must_use]
    pub fn filesystem(&self, id: &str) -> Option<&Filesystem> {
        self.pools
            .values()
            .flat_map(|p| p.filesystems.iter())
            .find(|fs| fs.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use tapestage_common::config::{FilesystemConfig, SelectionPolicy};

    fn pool_config(name: &str, filesystems: &[(&str, u64)]) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            gc_start_threshold: 10,
            gc_stop_threshold: 20,
            read_policy: SelectionPolicy::MostFree,
            write_policy: SelectionPolicy::MostFree,
            filesystems: filesystems
                .iter()
                .map(|(mount, capacity)| FilesystemConfig {
                    host: "disk01".into(),
                    mount: PathBuf::from(mount),
                    capacity: *capacity,
                    free: None,
                })
                .collect(),
        }
    }

    fn allocator() -> SpaceAllocator {
        SpaceAllocator::new(&[
            pool_config("default", &[("/srv/a", 1000), ("/srv/b", 2000)]),
            pool_config("small", &[("/srv/c", 100)]),
        ])
    }

    #[test]
    fn test_allocate_reserves_immediately() {
        let mut alloc = allocator();
        let a = alloc
            .allocate(SpaceRequest::Pool("default"), 500, AllocMode::Read, "u/x.1")
            .unwrap();
        assert_eq!(a.filesystem, "disk01:/srv/b");
        assert_eq!(a.path, PathBuf::from("/srv/b/u/x.1"));
        assert_eq!(alloc.pool("default").unwrap().free(), 2500);
        assert_eq!(alloc.filesystem("disk01:/srv/b").unwrap().read_streams, 1);
    }

    #[test]
    fn test_allocate_unknown_pool() {
        let mut alloc = allocator();
        assert!(matches!(
            alloc.allocate(SpaceRequest::Pool("nope"), 1, AllocMode::Read, "x"),
            Err(Error::UnknownPool(_))
        ));
    }

    #[test]
    fn test_insufficient_space_reports_largest_extent() {
        let mut alloc = allocator();
        match alloc.allocate(SpaceRequest::Pool("small"), 500, AllocMode::Write, "x") {
            Err(Error::InsufficientSpace {
                pool,
                required,
                available,
            }) => {
                assert_eq!(pool, "small");
                assert_eq!(required, 500);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_anywhere_spans_pools() {
        let mut alloc = SpaceAllocator::new(&[
            pool_config("a", &[("/srv/a", 10)]),
            pool_config("b", &[("/srv/b", 1000)]),
        ]);
        let a = alloc
            .allocate(SpaceRequest::Anywhere, 500, AllocMode::Write, "x")
            .unwrap();
        assert_eq!(a.pool, "b");
        assert!(matches!(
            alloc.allocate(SpaceRequest::Anywhere, 5000, AllocMode::Write, "y"),
            Err(Error::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_allocate_release_balanced() {
        let mut alloc = allocator();
        let start = alloc.pool("default").unwrap().free();
        let mut rng = rand::thread_rng();
        let mut live = Vec::new();
        for i in 0..200 {
            if rng.gen_bool(0.6) {
                let size = rng.gen_range(0..400);
                if let Ok(a) =
                    alloc.allocate(SpaceRequest::Pool("default"), size, AllocMode::Write, &i.to_string())
                {
                    live.push(a);
                }
            } else if !live.is_empty() {
                let a = live.swap_remove(rng.gen_range(0..live.len()));
                alloc.release(&a.filesystem, &a.path, a.size).unwrap();
            }
            for fs in &alloc.pool("default").unwrap().filesystems {
                assert!(fs.free <= fs.capacity);
            }
        }
        for a in live.drain(..) {
            alloc.release(&a.filesystem, &a.path, a.size).unwrap();
        }
        assert_eq!(alloc.pool("default").unwrap().free(), start);
    }

    #[test]
    fn test_release_clamps_to_capacity() {
        let mut alloc = allocator();
        alloc
            .release("disk01:/srv/c", Path::new("/srv/c/x"), 50)
            .unwrap();
        assert_eq!(alloc.pool("small").unwrap().free(), 100);
    }

    #[test]
    fn test_reconcile_gives_back_overestimate() {
        let mut alloc = allocator();
        let a = alloc
            .allocate(SpaceRequest::Pool("small"), 80, AllocMode::Read, "x")
            .unwrap();
        let outcome = alloc.reconcile(&a.filesystem, &a.path, 80, 30).unwrap();
        assert_eq!(outcome, ReconcileOutcome { delta: 50, clamped: false });
        assert_eq!(alloc.pool("small").unwrap().free(), 70);
    }

    #[test]
    fn test_reconcile_underestimate_clamps_at_zero() {
        let mut alloc = allocator();
        let a = alloc
            .allocate(SpaceRequest::Pool("small"), 80, AllocMode::Write, "x")
            .unwrap();
        let outcome = alloc.reconcile(&a.filesystem, &a.path, 80, 150).unwrap();
        assert_eq!(outcome, ReconcileOutcome { delta: -20, clamped: true });
        assert_eq!(alloc.pool("small").unwrap().free(), 0);
    }

    #[test]
    fn test_reconcile_unknown_filesystem() {
        let mut alloc = allocator();
        assert!(alloc
            .reconcile("nowhere:/x", Path::new("/x/y"), 1, 1)
            .is_err());
    }

    #[test]
    fn test_close_stream_once() {
        let mut alloc = allocator();
        let mut a = alloc
            .allocate(SpaceRequest::Pool("small"), 10, AllocMode::Write, "x")
            .unwrap();
        alloc.close_stream(&mut a);
        alloc.close_stream(&mut a);
        assert_eq!(alloc.filesystem(&a.filesystem).unwrap().write_streams, 0);
        assert!(!a.streaming);
    }

    #[test]
    fn test_adopt_existing_file() {
        let mut alloc = allocator();
        let a = alloc
            .adopt(Path::new("/srv/a/u/file"), 300, AllocMode::Read)
            .unwrap();
        assert_eq!(a.pool, "default");
        assert_eq!(alloc.filesystem("disk01:/srv/a").unwrap().free, 700);
        assert!(alloc.adopt(Path::new("/elsewhere/file"), 1, AllocMode::Read).is_none());
    }

    #[test]
    fn test_reload_keeps_used_space() {
        let mut alloc = allocator();
        alloc
            .allocate(SpaceRequest::Pool("small"), 60, AllocMode::Write, "x")
            .unwrap();
        alloc.migration_add("small", ReqId::new(9));
        alloc.reload(&[pool_config("small", &[("/srv/c", 200), ("/srv/d", 50)])]);
        let small = alloc.pool("small").unwrap();
        assert_eq!(small.filesystems[0].free, 140);
        assert_eq!(small.filesystems[1].free, 50);
        assert_eq!(small.migration_pending(), 1);
        assert!(!alloc.has_pool("default"));
    }

    #[test]
    fn test_migration_counter_is_idempotent() {
        let mut alloc = allocator();
        let id = ReqId::new(4);
        assert!(alloc.migration_add("default", id));
        assert!(!alloc.migration_add("default", id));
        assert_eq!(alloc.migration_pending("default"), 1);
        assert!(alloc.migration_remove("default", id));
        assert!(!alloc.migration_remove("default", id));
        assert_eq!(alloc.migration_pending("default"), 0);
    }

    #[test]
    fn test_gc_thresholds() {
        let mut alloc = allocator();
        assert!(alloc.pools_below_gc_start().is_empty());
        alloc
            .allocate(SpaceRequest::Pool("small"), 95, AllocMode::Write, "x")
            .unwrap();
        assert_eq!(alloc.pools_below_gc_start(), vec!["small".to_string()]);
        // stop threshold 20% of 100 bytes, 5 free
        assert_eq!(alloc.pool("small").unwrap().reclaim_target(), 15);
    }
}
