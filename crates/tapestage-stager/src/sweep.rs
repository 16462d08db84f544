//! Periodic sweep
//!
//! Every tick the coordinator expires idle staged files, promotes written
//! files whose migration delay elapsed, starts reclaim workers for pools
//! short on space, retries groups parked on space and dispatches whatever
//! became ready.

use crate::coordinator::{ReclaimJob, Stager};
use crate::waitq::GroupId;
use crate::worker::WorkerSpec;
use std::collections::{BTreeMap, BTreeSet};
use tapestage_common::{ReqId, RequestKind, Result, StatusCode, now_secs};
use tapestage_proto::worker::{FileOutcome, JobAction, JobInput, WorkerJob, WorkerKind, WorkerReport};
use tapestage_space::Allocation;
use tracing::{debug, error, info, warn};

impl Stager {
    pub(crate) async fn sweep(&mut self) {
        let now = now_secs();
        self.expire(now);
        self.promote(now);
        self.start_reclaims().await;
        self.retry_space();
        self.dispatch_ready().await;
    }

    /// Drop staged files nobody touched within their retention
    fn expire(&mut self, now: u64) {
        let expired: Vec<ReqId> = self
            .catalog
            .iter()
            .filter(|e| e.state.is_staged() && !e.dependent)
            .filter(|e| !e.state.counts_for_migration())
            .filter(|e| !self.queue.is_busy(e.reqid))
            .filter(|e| now.saturating_sub(e.last_access_at) > self.retention_of(e))
            .map(|e| e.reqid)
            .collect();
        for reqid in expired {
            match self.discard_entry(reqid, true) {
                Ok(paths) => info!("Expired {} ({} user paths)", reqid, paths.len()),
                Err(e) => error!("Could not expire {}: {}", reqid, e),
            }
        }
    }

    /// Written HSM files whose migration delay elapsed become migratable
    fn promote(&mut self, now: u64) {
        let due: Vec<ReqId> = self
            .catalog
            .iter()
            .filter(|e| e.kind() == RequestKind::StageWrite && !e.state.counts_for_migration())
            .filter(|e| e.migrate_after.is_some_and(|at| at <= now))
            .map(|e| e.reqid)
            .collect();
        for reqid in due {
            if let Err(e) = self.promote_one(reqid) {
                error!("Could not promote {} for migration: {}", reqid, e);
            }
        }
    }

    fn promote_one(&mut self, reqid: ReqId) -> Result<()> {
        let next = self.catalog.entry(reqid)?.state.promote_for_migration()?;
        self.catalog.set_state(reqid, next, &mut self.space)?;
        self.catalog.update(reqid, |e| e.migrate_after = None)?;
        debug!("{} can be migrated", reqid);
        Ok(())
    }

    /// Bytes wanted by groups parked on each named pool
    fn space_wanted(&self) -> BTreeMap<String, u64> {
        let mut wanted = BTreeMap::new();
        for group in self.queue.iter() {
            let Some(pool) = group.waiting_space.as_deref() else {
                continue;
            };
            if !self.space.has_pool(pool) {
                continue;
            }
            let bytes: u64 = group
                .driving()
                .into_iter()
                .filter_map(|reqid| self.catalog.get(reqid))
                .filter(|e| e.state.is_waiting_space())
                .map(|e| e.requested_size)
                .sum();
            *wanted.entry(pool.to_string()).or_insert(0) += bytes;
        }
        wanted
    }

    async fn start_reclaims(&mut self) {
        let wanted = self.space_wanted();
        let pools: BTreeSet<String> = self
            .space
            .pools_below_gc_start()
            .into_iter()
            .chain(wanted.keys().cloned())
            .collect();

        for pool in pools {
            if self.reclaims.contains_key(&pool) {
                continue;
            }
            let Some(target) = self.space.pool(&pool).map(|p| {
                p.reclaim_target()
                    .max(wanted.get(&pool).copied().unwrap_or(0))
            }) else {
                continue;
            };
            if target == 0 {
                continue;
            }
            let victims = self.select_victims(&pool, target);
            if victims.is_empty() {
                debug!("Pool {} needs {} bytes but nothing can be reclaimed", pool, target);
                continue;
            }
            if let Err(e) = self.admit() {
                debug!("Reclaim of pool {} deferred: {}", pool, e);
                break;
            }
            self.launch_reclaim(pool, victims).await;
        }
    }

    /// Least recently used recalled files of a pool, enough to free `target`
    fn select_victims(&self, pool: &str, target: u64) -> Vec<ReqId> {
        let mut candidates: Vec<(u64, ReqId, u64)> = self
            .catalog
            .iter()
            .filter(|e| e.kind() == RequestKind::StageIn && e.state.is_staged() && !e.dependent)
            .filter(|e| !self.queue.is_busy(e.reqid))
            .filter_map(|e| {
                e.reservation
                    .as_ref()
                    .filter(|r| r.pool == pool)
                    .map(|r| (e.last_access_at, e.reqid, r.size))
            })
            .collect();
        candidates.sort_unstable();

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for (_, reqid, size) in candidates {
            if freed >= target {
                break;
            }
            freed = freed.saturating_add(size);
            victims.push(reqid);
        }
        victims
    }

    async fn launch_reclaim(&mut self, pool: String, victims: Vec<ReqId>) {
        let entries: Vec<_> = victims
            .iter()
            .filter_map(|reqid| self.catalog.get(*reqid))
            .map(|e| e.snapshot(self.paths.first_path(e.reqid)))
            .collect();
        let id = self.next_worker_id();
        let spec = WorkerSpec {
            id,
            command: self.config.workers.reclaim.clone(),
            input: JobInput {
                job: WorkerJob {
                    job_id: id.0,
                    kind: WorkerKind::Reclaim,
                    action: JobAction::Reclaim,
                    files: entries.len(),
                    concat_off_fseq: None,
                },
                entries,
            },
            timeout: self.worker_timeout(),
        };

        let worker = match self.launcher.launch(spec).await {
            Ok(worker) => worker,
            Err(e) => {
                warn!("Could not start reclaim of pool {}: {}", pool, e);
                return;
            }
        };

        // The entries go now; their bytes come back as the worker reports
        let mut job = ReclaimJob {
            worker,
            victims: BTreeMap::new(),
        };
        for reqid in victims {
            match self.take_victim(reqid) {
                Ok(Some(allocation)) => {
                    job.victims.insert(reqid.get(), allocation);
                }
                Ok(None) => {}
                Err(e) => error!("Could not hand {} to the reclaim: {}", reqid, e),
            }
        }
        info!(
            "Reclaiming {} files of pool {} with worker {}",
            job.victims.len(),
            pool,
            job.worker.id
        );
        self.reclaims.insert(pool, job);
    }

    fn take_victim(&mut self, reqid: ReqId) -> Result<Option<Allocation>> {
        let allocation = self.catalog.update(reqid, |e| e.reservation.take())?;
        self.catalog.delete(reqid, false, &mut self.space)?;
        self.paths.remove_all(reqid);
        Ok(allocation.map(|mut a| {
            self.space.close_stream(&mut a);
            a
        }))
    }

    pub(crate) fn on_reclaim_report(&mut self, pool: &str, report: &WorkerReport) {
        let Some(allocation) = self
            .reclaims
            .get_mut(pool)
            .and_then(|job| job.victims.remove(&report.reqid))
        else {
            warn!("Reclaim of pool {} reported on unknown file {}", pool, report.reqid);
            return;
        };
        if report.outcome == FileOutcome::Removed {
            self.release(&allocation);
        } else {
            error!(
                "Reclaim could not remove {} ({}); its {} bytes stay accounted",
                allocation.path.display(),
                report.message.as_deref().unwrap_or("no reason given"),
                allocation.size
            );
        }
    }

    pub(crate) fn on_reclaim_exited(&mut self, pool: &str, code: i32) {
        let Some(job) = self.reclaims.remove(pool) else {
            return;
        };
        for allocation in job.victims.into_values() {
            if code == 0 {
                self.release(&allocation);
            } else {
                error!(
                    "Reclaim of pool {} exited with {}; {} keeps its {} bytes",
                    pool,
                    code,
                    allocation.path.display(),
                    allocation.size
                );
            }
        }
        info!("Reclaim of pool {} done (exit {})", pool, code);

        let parked: Vec<GroupId> = self
            .queue
            .iter()
            .filter(|g| g.waiting_space.as_deref() == Some(pool))
            .map(|g| g.id)
            .collect();
        for gid in parked {
            self.retry_group_space(gid);
        }
    }

    fn release(&mut self, allocation: &Allocation) {
        if let Err(e) = self
            .space
            .release(&allocation.filesystem, &allocation.path, allocation.size)
        {
            warn!("Could not release {}: {}", allocation.path.display(), e);
        }
    }

    /// Retry every parked group whose pool has no reclaim running
    fn retry_space(&mut self) {
        let parked: Vec<GroupId> = self
            .queue
            .iter()
            .filter(|g| {
                g.waiting_space
                    .as_ref()
                    .is_some_and(|pool| !self.reclaims.contains_key(pool))
            })
            .map(|g| g.id)
            .collect();
        for gid in parked {
            self.retry_group_space(gid);
        }
    }

    /// Try again to reserve the files of a parked group. A group that stays
    /// parked past the retry limit fails with ENOSPC.
    pub(crate) fn retry_group_space(&mut self, gid: GroupId) {
        let Some(group) = self.queue.get_mut(gid) else {
            return;
        };
        group.waiting_space = None;
        let parked: Vec<ReqId> = group
            .driving()
            .into_iter()
            .filter(|reqid| {
                self.catalog
                    .get(*reqid)
                    .is_some_and(|e| e.state.is_waiting_space())
            })
            .collect();
        for reqid in parked {
            if self.reserve_or_fail(gid, reqid) {
                self.space_granted(gid, reqid);
            }
        }

        let Some(group) = self.queue.get_mut(gid) else {
            return;
        };
        if group.waiting_space.is_none() {
            group.space_retries = 0;
            return;
        }
        group.space_retries += 1;
        if group.space_retries > self.config.gc.max_space_retries {
            warn!(
                "Group {} found no space after {} retries",
                gid, self.config.gc.max_space_retries
            );
            self.terminate_group(gid, StatusCode::NoSpace);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{CAPACITY, Harness, client, hsm_stage, recv_status, tape_stage};
    use tapestage_common::{Modifiers, ReqId, RequestKind, StatusCode};
    use tapestage_proto::worker::{FileOutcome, JobAction, WorkerReport};
    use tapestage_proto::{FileChangeRequest, Request, UpdateRequest};

    const HALF: u64 = CAPACITY / 2;

    async fn staged(h: &mut Harness, vid: &str, user_path: &str, size: u64) -> ReqId {
        let (client, mut rx) = client(1);
        h.request(client, tape_stage(vid, "1", user_path)).await;
        let spec = h.spec(h.launched() - 1);
        let reqid = spec.input.entries[0].reqid;
        h.report(spec.id, WorkerReport::success(reqid, FileOutcome::Staged, size))
            .await;
        h.exit(spec.id, 0).await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);
        ReqId::new(reqid)
    }

    #[tokio::test]
    async fn test_expire_removes_idle_staged_files() {
        let mut h = Harness::with(|config| config.gc.default_retention_secs = 0);
        let reqid = staged(&mut h, "T00001", "/u/a", 100).await;
        h.stager
            .catalog
            .update(reqid, |e| e.last_access_at -= 10)
            .unwrap();
        h.tick().await;
        assert!(h.stager.catalog.get(reqid).is_none());
        assert!(h.stager.paths.resolve("/u/a").is_none());
        assert_eq!(h.free("public"), CAPACITY);
    }

    #[tokio::test]
    async fn test_migration_delay_promotes_on_sweep() {
        let mut h = Harness::with(|config| config.gc.default_migration_delay_secs = 3600);
        let (c1, mut rx) = client(1);
        h.request(
            c1,
            hsm_stage(RequestKind::StageOut, "/ns/user/out", 0, "/u/out"),
        )
        .await;
        h.pump().await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);

        let (c2, mut rx) = client(1);
        h.request(
            c2,
            Request::Update(UpdateRequest {
                client: crate::testing::client_info(1),
                user_path: "/u/out".into(),
                actual_size: Some(500),
            }),
        )
        .await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);
        let reqid = h.stager.paths.resolve("/u/out").unwrap();
        let entry = h.stager.catalog.get(reqid).unwrap();
        assert_eq!(entry.kind(), RequestKind::StageWrite);
        assert!(entry.migrate_after.is_some());
        assert_eq!(h.stager.space.migration_pending("public"), 0);

        let (c3, mut rx) = client(1);
        h.request(
            c3,
            Request::FileChange(FileChangeRequest {
                client: crate::testing::client_info(1),
                user_path: "/u/out".into(),
                retention_secs: None,
                migration_delay_secs: Some(0),
            }),
        )
        .await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);
        h.tick().await;
        let entry = h.stager.catalog.get(reqid).unwrap();
        assert_eq!(entry.modifiers(), Modifiers::CAN_BE_MIGRATED);
        assert_eq!(h.stager.space.migration_pending("public"), 1);
    }

    #[tokio::test]
    async fn test_reclaim_frees_space_for_parked_request() {
        let mut h = Harness::with(|config| {
            config.daemon.default_file_size = HALF;
        });
        let old = staged(&mut h, "T00001", "/u/old", HALF).await;
        let newer = staged(&mut h, "T00002", "/u/newer", HALF).await;
        h.stager
            .catalog
            .update(old, |e| e.last_access_at -= 100)
            .unwrap();

        // the pool is full, so the third recall parks
        let (client, mut rx) = client(2);
        h.request(client, tape_stage("T00003", "1", "/u/third")).await;
        let launched = h.launched();
        assert_eq!(h.stager.queue.len(), 1);

        h.tick().await;
        assert_eq!(h.launched(), launched + 1);
        let reclaim = h.spec(launched);
        assert_eq!(reclaim.input.job.action, JobAction::Reclaim);
        assert_eq!(reclaim.input.entries.len(), 1);
        assert_eq!(reclaim.input.entries[0].reqid, old.get());
        assert!(h.stager.catalog.get(old).is_none());
        assert!(h.stager.catalog.get(newer).is_some());

        h.report(
            reclaim.id,
            WorkerReport::success(old.get(), FileOutcome::Removed, 0),
        )
        .await;
        h.exit(reclaim.id, 0).await;

        // the parked group got its space back and is dispatched next tick
        h.tick().await;
        let recall = h.spec(h.launched() - 1);
        assert_eq!(recall.input.job.action, JobAction::Recall);
        assert_eq!(recall.input.entries[0].user_path.as_deref(), Some("/u/third"));
        h.exit(recall.id, 0).await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_failed_reclaim_keeps_space_accounted() {
        let mut h = Harness::with(|config| {
            config.daemon.default_file_size = CAPACITY;
            config.gc.max_space_retries = 1;
        });
        staged(&mut h, "T00001", "/u/a", CAPACITY).await;
        let (client, mut rx) = client(2);
        h.request(client, tape_stage("T00002", "1", "/u/b")).await;

        h.tick().await;
        let reclaim = h.spec(h.launched() - 1);
        assert_eq!(reclaim.input.job.action, JobAction::Reclaim);
        h.report(
            reclaim.id,
            WorkerReport::failure(reclaim.input.entries[0].reqid, 1, "busy"),
        )
        .await;
        h.exit(reclaim.id, 1).await;
        assert_eq!(h.free("public"), 0);
        assert!(h.stager.catalog.iter().all(|e| e.state.is_waiting_space()));

        // nothing is left to reclaim, so the parked group runs out of retries
        h.tick().await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::NoSpace);
        assert!(h.stager.catalog.is_empty());
        assert!(h.stager.queue.is_empty());
    }
}
