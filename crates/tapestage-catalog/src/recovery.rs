//! Catalog recovery at startup
//!
//! Entries restored from the store describe work that was in flight when
//! the daemon stopped. Work that needs a live client or worker is dropped,
//! failed migrations are kept for a later put, and the space held by every
//! surviving entry is adopted again by the fresh allocator.

use crate::catalog::StageCatalog;
use crate::paths::PathCatalog;
use crate::state::{EntryState, Transition};
use std::path::PathBuf;
use tapestage_common::{Modifiers, ReqId, RequestKind, Result};
use tapestage_space::SpaceAllocator;
use tracing::{info, warn};

/// What recovery did to the restored catalog
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub kept: usize,
    pub removed: Vec<ReqId>,
    /// Entries turned into failed puts
    pub put_failed: Vec<ReqId>,
    /// Internal files of removed entries, left for the caller to unlink
    pub orphaned_files: Vec<PathBuf>,
    /// Paths that pointed at no entry
    pub dangling_paths: usize,
}

enum Decision {
    Keep,
    Drop,
    Fail,
}

fn decide(state: EntryState, dependent: bool, delayed: bool) -> Decision {
    if dependent {
        return Decision::Drop;
    }
    match state.kind {
        RequestKind::StageIn => {
            if state.is_staged() {
                Decision::Keep
            } else {
                Decision::Drop
            }
        }
        RequestKind::StageOut | RequestKind::StageAlloc => {
            if state
                .modifiers
                .intersects(Modifiers::WAITING_SPACE | Modifiers::WAITING_NAMESPACE)
            {
                Decision::Drop
            } else {
                Decision::Keep
            }
        }
        RequestKind::StageWrite => {
            if state.modifiers.contains(Modifiers::CAN_BE_MIGRATED) || delayed {
                Decision::Keep
            } else {
                Decision::Drop
            }
        }
        RequestKind::StagePut => Decision::Fail,
        RequestKind::StageCatalogued => Decision::Keep,
    }
}

/// Bring a freshly restored catalog back to a consistent state
pub fn recover(
    catalog: &mut StageCatalog,
    paths: &mut PathCatalog,
    space: &mut SpaceAllocator,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let reqids: Vec<ReqId> = catalog.iter().map(|e| e.reqid).collect();

    for reqid in reqids {
        // Persisted reservations refer to the previous allocator
        let (state, dependent, delayed, reservation) = catalog.update(reqid, |e| {
            (
                e.state,
                e.dependent,
                e.migrate_after.is_some(),
                e.reservation.take(),
            )
        })?;

        match decide(state, dependent, delayed) {
            Decision::Drop => {
                catalog.delete(reqid, false, space)?;
                paths.remove_all(reqid);
                if let Some(r) = reservation {
                    report.orphaned_files.push(r.path);
                }
                report.removed.push(reqid);
                continue;
            }
            Decision::Fail => {
                if let Transition::To(next) = state.failed() {
                    catalog.set_state(reqid, next, space)?;
                }
                report.put_failed.push(reqid);
            }
            Decision::Keep => {}
        }

        if let Some(r) = reservation {
            match space.adopt(&r.path, r.size, r.mode) {
                Some(adopted) => {
                    catalog.update(reqid, |e| e.reservation = Some(adopted))?;
                }
                None => warn!(
                    "Entry {}: {} is on no configured filesystem",
                    reqid,
                    r.path.display()
                ),
            }
        }

        let entry = catalog.entry(reqid)?;
        if entry.state.counts_for_migration()
            && let Some(pool) = entry.accounting_pool().map(str::to_string)
        {
            space.migration_add(&pool, reqid);
        }
        report.kept += 1;
    }

    let dangling: Vec<String> = paths
        .iter()
        .filter(|(_, reqid)| catalog.get(*reqid).is_none())
        .map(|(path, _)| path.to_string())
        .collect();
    for path in &dangling {
        paths.remove(path);
    }
    report.dangling_paths = dangling.len();

    info!(
        "Recovered catalog: {} kept, {} removed, {} failed puts",
        report.kept,
        report.removed.len(),
        report.put_failed.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::StageCatalogEntry;
    use tapestage_common::AllocMode;
    use tapestage_common::config::{FilesystemConfig, PoolConfig, SelectionPolicy};
    use tapestage_common::{
        FileSeq, HsmSystem, HsmTarget, Label, PoolAssignment, PoolName, Requester, StagePath,
        TapeTarget, Target, Vid,
    };
    use tapestage_space::Allocation;

    fn space() -> SpaceAllocator {
        SpaceAllocator::new(&[PoolConfig {
            name: "public".into(),
            gc_start_threshold: 10,
            gc_stop_threshold: 15,
            read_policy: SelectionPolicy::MostFree,
            write_policy: SelectionPolicy::MostFree,
            filesystems: vec![FilesystemConfig {
                host: "disk01".into(),
                mount: "/srv/stage1".into(),
                capacity: 10_000,
                free: None,
            }],
        }])
    }

    fn add(
        catalog: &mut StageCatalog,
        kind: RequestKind,
        modifiers: Modifiers,
        hsm: bool,
        size: u64,
    ) -> ReqId {
        let target = if hsm {
            Target::Hsm(HsmTarget {
                path: StagePath::new("/ns/file").unwrap(),
                server: "ns01".into(),
                file_id: 11,
                file_class: 1,
                system: HsmSystem::Native,
            })
        } else {
            Target::Tape(TapeTarget {
                vid: Vid::new("T00001").unwrap(),
                side: 0,
                fseq: FileSeq::Number(1),
                label: Label::new("al").unwrap(),
                fid: None,
            })
        };
        catalog
            .create(|reqid| {
                let mut e = StageCatalogEntry::new(
                    reqid,
                    EntryState::checked(kind, modifiers).unwrap(),
                    target,
                    PoolAssignment::Named(PoolName::new("public").unwrap()),
                    Requester::new("alice", "cms", 1001, 100),
                    size,
                );
                e.reservation = Some(Allocation {
                    pool: "public".into(),
                    filesystem: "disk01:/srv/stage1".into(),
                    path: PathBuf::from(format!("/srv/stage1/{reqid}")),
                    size,
                    mode: AllocMode::Read,
                    streaming: true,
                });
                e
            })
            .unwrap()
    }

    #[test]
    fn test_recovery_drops_in_flight_work() {
        let mut catalog = StageCatalog::new(100, None);
        let mut paths = PathCatalog::new(None);
        let mut space = space();

        let staged = add(&mut catalog, RequestKind::StageIn, Modifiers::STAGED, false, 1000);
        let recalling = add(&mut catalog, RequestKind::StageIn, Modifiers::empty(), false, 2000);
        let waiting = add(&mut catalog, RequestKind::StageOut, Modifiers::WAITING_SPACE, false, 0);
        let writing = add(&mut catalog, RequestKind::StageWrite, Modifiers::empty(), false, 300);
        let migratable =
            add(&mut catalog, RequestKind::StageWrite, Modifiers::CAN_BE_MIGRATED, true, 400);
        let putting = add(&mut catalog, RequestKind::StagePut, Modifiers::CAN_BE_MIGRATED, true, 500);
        paths.register("/data/staged", staged);
        paths.register("/data/recalling", recalling);
        paths.register("/data/gone", ReqId::new(99));

        let report = recover(&mut catalog, &mut paths, &mut space).unwrap();

        assert_eq!(report.removed, vec![recalling, waiting, writing]);
        assert_eq!(report.put_failed, vec![putting]);
        assert_eq!(report.kept, 3);
        assert_eq!(report.orphaned_files.len(), 3);
        assert_eq!(report.dangling_paths, 1);
        assert_eq!(paths.resolve("/data/staged"), Some(staged));
        assert_eq!(paths.resolve("/data/recalling"), None);

        let put = catalog.entry(putting).unwrap();
        assert_eq!(put.state.kind, RequestKind::StageOut);
        assert_eq!(put.state.modifiers, Modifiers::PUT_FAILED);

        // kept reservations are accounted again, without open streams
        let pool = space.pool("public").unwrap();
        assert_eq!(pool.free(), 10_000 - 1000 - 400 - 500);
        assert_eq!(pool.filesystems[0].read_streams, 0);
        assert_eq!(space.migration_pending("public"), 1);
        assert!(catalog.entry(migratable).unwrap().reservation.is_some());
    }

    #[test]
    fn test_recovery_keeps_delayed_writes() {
        let mut catalog = StageCatalog::new(100, None);
        let mut paths = PathCatalog::new(None);
        let mut space = space();
        let delayed = add(&mut catalog, RequestKind::StageWrite, Modifiers::empty(), true, 10);
        catalog.update(delayed, |e| e.migrate_after = Some(1)).unwrap();
        let report = recover(&mut catalog, &mut paths, &mut space).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(space.migration_pending("public"), 0);
    }
}
