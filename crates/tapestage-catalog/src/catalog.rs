//! In-memory stage catalog
//!
//! Owns every [`StageCatalogEntry`], hands out request ids and keeps the
//! space accounting of each entry consistent with its state: a reservation
//! is released at most once and the migration counter of a pool counts
//! exactly the entries whose state carries `CAN_BE_MIGRATED`.

use crate::entry::StageCatalogEntry;
use crate::state::EntryState;
use crate::store::CatalogStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tapestage_common::{Error, PoolConstraint, ReqId, Result, Target};
use tapestage_space::{ReconcileOutcome, SpaceAllocator};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct StageCatalog {
    entries: BTreeMap<ReqId, StageCatalogEntry>,
    last_reqid: u32,
    max_reqid: u32,
    store: Option<Arc<CatalogStore>>,
}

impl StageCatalog {
    #[must_use]
    pub fn new(max_reqid: u32, store: Option<Arc<CatalogStore>>) -> Self {
        Self {
            entries: BTreeMap::new(),
            last_reqid: 0,
            max_reqid: max_reqid.max(1),
            store,
        }
    }

    /// Load persisted entries without writing them back
    pub fn restore(&mut self, entries: Vec<StageCatalogEntry>, last_reqid: Option<ReqId>) {
        for entry in entries {
            self.entries.insert(entry.reqid, entry);
        }
        self.last_reqid = last_reqid
            .map(ReqId::get)
            .or_else(|| self.entries.keys().next_back().map(|r| r.get()))
            .unwrap_or(0)
            .min(self.max_reqid);
        info!(
            "Restored {} stage entries, last reqid {}",
            self.entries.len(),
            self.last_reqid
        );
    }

    /// Next free request id after the last one handed out, wrapping to 1
    fn next_reqid(&self) -> Result<ReqId> {
        let mut candidate = self.last_reqid;
        for _ in 0..self.max_reqid {
            candidate = if candidate >= self.max_reqid { 1 } else { candidate + 1 };
            let reqid = ReqId::new(candidate);
            if !self.entries.contains_key(&reqid) {
                return Ok(reqid);
            }
        }
        Err(Error::CatalogFull)
    }

    /// Insert a new entry built around a fresh request id
    pub fn create(
        &mut self,
        build: impl FnOnce(ReqId) -> StageCatalogEntry,
    ) -> Result<ReqId> {
        let reqid = self.next_reqid()?;
        let mut entry = build(reqid);
        entry.reqid = reqid;
        EntryState::checked(entry.state.kind, entry.state.modifiers)?;
        debug!(
            "Created entry {} {} {} for {}",
            reqid, entry.state.kind, entry.state.modifiers, entry.target
        );
        self.last_reqid = reqid.get();
        if let Some(store) = &self.store {
            store.put_entry(&entry);
            store.put_last_reqid(reqid);
        }
        self.entries.insert(reqid, entry);
        Ok(reqid)
    }

    #[must_use]
    pub fn get(&self, reqid: ReqId) -> Option<&StageCatalogEntry> {
        self.entries.get(&reqid)
    }

    pub fn entry(&self, reqid: ReqId) -> Result<&StageCatalogEntry> {
        self.entries.get(&reqid).ok_or(Error::UnknownRequest(reqid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageCatalogEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutate an entry and persist the result
    pub fn update<R>(
        &mut self,
        reqid: ReqId,
        f: impl FnOnce(&mut StageCatalogEntry) -> R,
    ) -> Result<R> {
        let entry = self
            .entries
            .get_mut(&reqid)
            .ok_or(Error::UnknownRequest(reqid))?;
        let result = f(entry);
        if let Some(store) = &self.store {
            store.put_entry(entry);
        }
        Ok(result)
    }

    /// Move an entry to a new state and keep its pool's migration counter
    /// in step with the `CAN_BE_MIGRATED` flag.
    pub fn set_state(
        &mut self,
        reqid: ReqId,
        state: EntryState,
        space: &mut SpaceAllocator,
    ) -> Result<()> {
        let state = EntryState::checked(state.kind, state.modifiers)?;
        let (before, pool) = {
            let entry = self.entry(reqid)?;
            (
                entry.state,
                entry.accounting_pool().map(str::to_string),
            )
        };
        if let Some(pool) = &pool {
            match (before.counts_for_migration(), state.counts_for_migration()) {
                (false, true) => {
                    space.migration_add(pool, reqid);
                }
                (true, false) => {
                    space.migration_remove(pool, reqid);
                }
                _ => {}
            }
        }
        debug!(
            "Entry {} {}|{} -> {}|{}",
            reqid, before.kind, before.modifiers, state.kind, state.modifiers
        );
        self.update(reqid, |e| e.state = state)
    }

    /// Find a live entry able to serve `target`.
    ///
    /// Dependent (waiting) entries are never returned. Entries holding data
    /// are preferred over entries still being produced. An HSM entry found
    /// through its file id under an old name is renamed in place.
    pub fn find_match(&mut self, target: &Target, constraint: &PoolConstraint) -> Option<ReqId> {
        let mut best: Option<(bool, ReqId)> = None;
        let mut renamed = Vec::new();
        for entry in self.entries.values() {
            if entry.dependent || !constraint.accepts(&entry.pool) {
                continue;
            }
            let hit = match (&entry.target, target) {
                (Target::Tape(mine), Target::Tape(theirs)) => mine.matches(theirs),
                (Target::Disk(mine), Target::Disk(theirs)) => {
                    mine.external_path == theirs.external_path
                }
                (Target::Hsm(mine), Target::Hsm(theirs)) => {
                    if mine.path == theirs.path && mine.server == theirs.server {
                        true
                    } else if mine.same_file(theirs) {
                        renamed.push((entry.reqid, theirs.path.clone()));
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !hit {
                continue;
            }
            let holds = entry.state.holds_data();
            if best.is_none_or(|(best_holds, _)| holds && !best_holds) {
                best = Some((holds, entry.reqid));
            }
        }
        let (_, reqid) = best?;
        if let Some((_, path)) = renamed.into_iter().find(|(id, _)| *id == reqid) {
            info!("Entry {} renamed in namespace to {}", reqid, path);
            if let Err(e) = self.update(reqid, |e| {
                if let Target::Hsm(hsm) = &mut e.target {
                    hsm.path = path;
                }
            }) {
                warn!("Could not record the new path of entry {}: {}", reqid, e);
            }
        }
        Some(reqid)
    }

    /// Entries whose HSM target has the given namespace path
    pub fn find_by_hsm_path(&self, path: &str) -> Vec<ReqId> {
        self.entries
            .values()
            .filter(|e| e.target.as_hsm().is_some_and(|h| h.path.as_str() == path))
            .map(|e| e.reqid)
            .collect()
    }

    /// Correct the reservation of an entry with the size actually written
    pub fn reconcile(
        &mut self,
        reqid: ReqId,
        actual: u64,
        space: &mut SpaceAllocator,
    ) -> Result<Option<ReconcileOutcome>> {
        let reservation = self.entry(reqid)?.reservation.clone();
        let outcome = match reservation {
            Some(allocation) => {
                let outcome =
                    space.reconcile(&allocation.filesystem, &allocation.path, allocation.size, actual)?;
                let new_size = i128::from(allocation.size) - i128::from(outcome.delta);
                let new_size = u64::try_from(new_size.max(0)).unwrap_or(u64::MAX);
                self.update(reqid, |e| {
                    if let Some(r) = e.reservation.as_mut() {
                        r.size = new_size;
                    }
                    e.actual_size = actual;
                })?;
                Some(outcome)
            }
            None => {
                self.update(reqid, |e| e.actual_size = actual)?;
                None
            }
        };
        Ok(outcome)
    }

    /// Close the stream opened by an entry's reservation, keeping the space
    pub fn close_stream(&mut self, reqid: ReqId, space: &mut SpaceAllocator) -> Result<()> {
        self.update(reqid, |e| {
            if let Some(r) = e.reservation.as_mut() {
                space.close_stream(r);
            }
        })
    }

    /// Remove an entry.
    ///
    /// When `release` is true its reserved bytes go back to the filesystem;
    /// otherwise they stay accounted (the file is still on disk and will be
    /// re-adopted). The reservation is taken out of the entry so it can
    /// never be released twice.
    pub fn delete(
        &mut self,
        reqid: ReqId,
        release: bool,
        space: &mut SpaceAllocator,
    ) -> Result<StageCatalogEntry> {
        let mut entry = self
            .entries
            .remove(&reqid)
            .ok_or(Error::UnknownRequest(reqid))?;
        if entry.state.counts_for_migration()
            && let Some(pool) = entry.accounting_pool()
        {
            space.migration_remove(pool, reqid);
        }
        if let Some(mut allocation) = entry.reservation.take() {
            space.close_stream(&mut allocation);
            if release
                && let Err(e) = space.release(&allocation.filesystem, &allocation.path, allocation.size)
            {
                warn!("Could not release space of entry {}: {}", reqid, e);
            }
        }
        if let Some(store) = &self.store {
            store.delete_entry(reqid);
        }
        debug!("Deleted entry {} (release={})", reqid, release);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RecallResult;
    use tapestage_common::config::{FilesystemConfig, PoolConfig, SelectionPolicy};
    use tapestage_common::{
        AllocMode, FileSeq, HsmSystem, HsmTarget, Label, Modifiers, PoolAssignment, PoolName,
        RequestKind, Requester, StagePath, TapeTarget, Vid,
    };
    use tapestage_space::SpaceRequest;

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

    fn tape(fseq: FileSeq) -> Target {
        Target::Tape(TapeTarget {
            vid: Vid::new("T00001").unwrap(),
            side: 0,
            fseq,
            label: Label::new("al").unwrap(),
            fid: None,
        })
    }

    fn hsm(path: &str, file_id: u64) -> Target {
        Target::Hsm(HsmTarget {
            path: StagePath::new(path).unwrap(),
            server: "ns01".into(),
            file_id,
            file_class: 2,
            system: HsmSystem::Native,
        })
    }

    fn public() -> PoolAssignment {
        PoolAssignment::Named(PoolName::new("public").unwrap())
    }

    fn add(catalog: &mut StageCatalog, kind: RequestKind, target: Target) -> ReqId {
        catalog
            .create(|reqid| {
                StageCatalogEntry::new(
                    reqid,
                    EntryState::initial(kind, false).unwrap(),
                    target,
                    public(),
                    Requester::new("alice", "cms", 1001, 100),
                    1000,
                )
            })
            .unwrap()
    }

    #[test]
    fn test_reqids_wrap_and_skip_live_entries() {
        let mut catalog = StageCatalog::new(3, None);
        let a = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(1)));
        let b = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(2)));
        let c = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(3)));
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));

        let result = catalog.create(|reqid| catalog_entry(reqid));
        assert!(matches!(result, Err(Error::CatalogFull)));

        catalog.delete(b, true, &mut space()).unwrap();
        let d = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(4)));
        assert_eq!(d, b);
    }

    fn catalog_entry(reqid: ReqId) -> StageCatalogEntry {
        StageCatalogEntry::new(
            reqid,
            EntryState::initial(RequestKind::StageIn, false).unwrap(),
            tape(FileSeq::Number(9)),
            public(),
            Requester::new("alice", "cms", 1001, 100),
            1,
        )
    }

    #[test]
    fn test_reqids_unique_under_churn() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut catalog = StageCatalog::new(50, None);
        let mut space = space();
        let mut live = Vec::new();
        for _ in 0..2000 {
            if live.len() < 50 && rng.gen_bool(0.6) {
                let id = catalog.create(catalog_entry).unwrap();
                assert!(!live.contains(&id));
                live.push(id);
            } else if !live.is_empty() {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                catalog.delete(victim, true, &mut space).unwrap();
            }
            assert_eq!(catalog.len(), live.len());
        }
    }

    #[test]
    fn test_find_match_covers_concatenated_range() {
        let mut catalog = StageCatalog::new(100, None);
        let open = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::From(3)));
        assert_eq!(
            catalog.find_match(&tape(FileSeq::Number(5)), &PoolConstraint::Any),
            Some(open)
        );
        assert_eq!(
            catalog.find_match(&tape(FileSeq::Number(2)), &PoolConstraint::Any),
            None
        );
        assert_eq!(
            catalog.find_match(&tape(FileSeq::Number(5)), &PoolConstraint::NoPool),
            None
        );
    }

    #[test]
    fn test_find_match_skips_dependents_and_prefers_data() {
        let mut catalog = StageCatalog::new(100, None);
        let mut space = space();
        let target = tape(FileSeq::Number(3));
        let running = add(&mut catalog, RequestKind::StageIn, target.clone());
        let waiter = add(&mut catalog, RequestKind::StageIn, target.clone());
        catalog.update(waiter, |e| e.dependent = true).unwrap();
        assert_eq!(catalog.find_match(&target, &PoolConstraint::Any), Some(running));

        let staged = add(&mut catalog, RequestKind::StageIn, target.clone());
        let done = catalog
            .entry(staged)
            .unwrap()
            .state
            .recall_done(RecallResult::default())
            .unwrap();
        catalog.set_state(staged, done, &mut space).unwrap();
        assert_eq!(catalog.find_match(&target, &PoolConstraint::Any), Some(staged));
    }

    #[test]
    fn test_find_match_renames_hsm_entry() {
        let mut catalog = StageCatalog::new(100, None);
        let id = add(&mut catalog, RequestKind::StageIn, hsm("/ns/old", 42));
        assert_eq!(
            catalog.find_match(&hsm("/ns/new", 42), &PoolConstraint::Any),
            Some(id)
        );
        assert_eq!(catalog.find_by_hsm_path("/ns/new"), vec![id]);
        assert!(catalog.find_by_hsm_path("/ns/old").is_empty());
        // unregistered files never match by id
        assert_eq!(catalog.find_match(&hsm("/ns/other", 0), &PoolConstraint::Any), None);
    }

    #[test]
    fn test_namespace_rename_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path().join("stage.redb")).unwrap());
        let mut catalog = StageCatalog::new(100, Some(Arc::clone(&store)));
        let id = add(&mut catalog, RequestKind::StageIn, hsm("/ns/old", 42));
        assert_eq!(
            catalog.find_match(&hsm("/ns/new", 42), &PoolConstraint::Any),
            Some(id)
        );

        let mut restored = StageCatalog::new(100, Some(Arc::clone(&store)));
        restored.restore(store.load_entries().unwrap(), store.last_reqid().unwrap());
        assert_eq!(restored.find_by_hsm_path("/ns/new"), vec![id]);
        assert!(restored.find_by_hsm_path("/ns/old").is_empty());
    }

    #[test]
    fn test_migration_counter_follows_state() {
        let mut catalog = StageCatalog::new(100, None);
        let mut space = space();
        let id = add(&mut catalog, RequestKind::StageOut, hsm("/ns/f", 7));
        let write = EntryState::checked(RequestKind::StageWrite, Modifiers::CAN_BE_MIGRATED).unwrap();
        catalog.set_state(id, write, &mut space).unwrap();
        catalog.set_state(id, write, &mut space).unwrap();
        assert_eq!(space.migration_pending("public"), 1);

        let put = write.put_started().unwrap();
        catalog.set_state(id, put, &mut space).unwrap();
        assert_eq!(space.migration_pending("public"), 1);

        catalog.delete(id, true, &mut space).unwrap();
        assert_eq!(space.migration_pending("public"), 0);
    }

    #[test]
    fn test_delete_releases_reservation_once() {
        let mut catalog = StageCatalog::new(100, None);
        let mut space = space();
        let id = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(1)));
        let allocation = space
            .allocate(SpaceRequest::Pool("public"), 4000, AllocMode::Read, "f1")
            .unwrap();
        catalog.update(id, |e| e.reservation = Some(allocation)).unwrap();
        assert_eq!(space.pool("public").unwrap().free(), 6000);

        let outcome = catalog.reconcile(id, 3000, &mut space).unwrap().unwrap();
        assert_eq!(outcome.delta, 1000);
        assert_eq!(catalog.entry(id).unwrap().reservation.as_ref().unwrap().size, 3000);

        let removed = catalog.delete(id, true, &mut space).unwrap();
        assert!(removed.reservation.is_none());
        assert_eq!(space.pool("public").unwrap().free(), 10_000);
        assert!(matches!(
            catalog.delete(id, true, &mut space),
            Err(Error::UnknownRequest(_))
        ));
        assert_eq!(space.pool("public").unwrap().free(), 10_000);
    }

    #[test]
    fn test_delete_without_release_keeps_space() {
        let mut catalog = StageCatalog::new(100, None);
        let mut space = space();
        let id = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(1)));
        let allocation = space
            .allocate(SpaceRequest::Pool("public"), 500, AllocMode::Read, "f1")
            .unwrap();
        catalog.update(id, |e| e.reservation = Some(allocation)).unwrap();
        catalog.delete(id, false, &mut space).unwrap();
        let fs = &space.pool("public").unwrap().filesystems[0];
        assert_eq!(fs.free, 9500);
        assert_eq!(fs.read_streams, 0);
    }

    #[test]
    fn test_persisted_catalog_restores() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path().join("stage.redb")).unwrap());
        let mut catalog = StageCatalog::new(100, Some(Arc::clone(&store)));
        let a = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(1)));
        let b = add(&mut catalog, RequestKind::StageIn, tape(FileSeq::Number(2)));
        catalog.delete(a, true, &mut space()).unwrap();

        let mut restored = StageCatalog::new(100, Some(Arc::clone(&store)));
        restored.restore(store.load_entries().unwrap(), store.last_reqid().unwrap());
        assert_eq!(restored.len(), 1);
        assert!(restored.get(b).is_some());
        let next = add(&mut restored, RequestKind::StageIn, tape(FileSeq::Number(3)));
        assert_eq!(next.get(), 3);
    }
}
