//! Worker dispatch and admission control

use crate::coordinator::Stager;
use crate::waitq::GroupId;
use crate::worker::WorkerSpec;
use std::time::Duration;
use tapestage_common::config::{CommandConfig, WorkerConfig};
use tapestage_common::{
    Error, HsmSystem, Modifiers, ReqId, RequestKind, Result, StatusCode, Target,
};
use tapestage_proto::worker::{JobAction, JobInput, WorkerJob, WorkerKind};
use tracing::{debug, info, warn};

/// Worker program family for a target
#[must_use]
pub const fn worker_kind(target: &Target) -> WorkerKind {
    match target {
        Target::Tape(_) => WorkerKind::Tape,
        Target::Disk(_) => WorkerKind::Disk,
        Target::Hsm(hsm) => match hsm.system {
            HsmSystem::Native => WorkerKind::Hsm,
            HsmSystem::Foreign => WorkerKind::ForeignHsm,
        },
    }
}

#[must_use]
pub const fn command_for(workers: &WorkerConfig, kind: WorkerKind) -> &CommandConfig {
    match kind {
        WorkerKind::Tape => &workers.tape,
        WorkerKind::Disk => &workers.disk,
        WorkerKind::Hsm => &workers.hsm,
        WorkerKind::ForeignHsm => &workers.foreign_hsm,
        WorkerKind::Reclaim => &workers.reclaim,
    }
}

const fn job_action(kind: RequestKind) -> Option<JobAction> {
    match kind {
        RequestKind::StageIn => Some(JobAction::Recall),
        RequestKind::StageWrite => Some(JobAction::Write),
        RequestKind::StagePut => Some(JobAction::Migrate),
        _ => None,
    }
}

impl Stager {
    /// Check that one more descriptor can be spent on a worker.
    ///
    /// Connections, running workers and reclaims all hold one, and one is
    /// kept free for the listener.
    pub(crate) fn admit(&self) -> Result<()> {
        let in_use = self.connections + self.queue.running_workers() + self.reclaims.len();
        let limit = self.config.daemon.max_open_slots;
        if in_use + 1 >= limit {
            return Err(Error::TemporarilyUnavailable(format!(
                "{in_use} of {limit} slots in use"
            )));
        }
        Ok(())
    }

    pub(crate) fn worker_timeout(&self) -> Option<Duration> {
        self.config.workers.timeout_secs.map(Duration::from_secs)
    }

    /// Driving files of a group a worker can start on now
    fn ready_files(&self, gid: GroupId) -> Vec<(ReqId, String)> {
        let Some(group) = self.queue.get(gid) else {
            return Vec::new();
        };
        if job_action(group.kind).is_none()
            || group.worker.is_some()
            || group.waiting_space.is_some()
            || group.killed
            || group.retries >= self.config.workers.max_retries
        {
            return Vec::new();
        }
        group
            .pending()
            .filter(|f| f.waiting_on.is_none())
            .filter(|f| {
                self.catalog.get(f.subreqid).is_some_and(|e| {
                    !e.state.is_waiting_space()
                        && !e.modifiers().contains(Modifiers::WAITING_NAMESPACE)
                        && !(e.kind() == RequestKind::StageIn && e.state.is_staged())
                })
            })
            .map(|f| (f.subreqid, f.user_path.clone()))
            .collect()
    }

    /// A group out of attempts never gets another worker. Its driving files
    /// that no worker holds fail now. Returns true when the group is out of
    /// attempts.
    pub(crate) fn fail_exhausted(&mut self, gid: GroupId) -> bool {
        let Some(group) = self.queue.get(gid) else {
            return false;
        };
        if job_action(group.kind).is_none()
            || group.retries < self.config.workers.max_retries
        {
            return false;
        }
        if group.worker.is_some() {
            return true;
        }
        let stranded: Vec<ReqId> = group
            .pending()
            .filter(|f| f.waiting_on.is_none() && !f.dispatched)
            .map(|f| f.subreqid)
            .collect();
        for reqid in stranded {
            let still_pending = self
                .queue
                .get(gid)
                .is_some_and(|g| g.pending().any(|f| f.subreqid == reqid));
            if !still_pending {
                continue;
            }
            warn!("{} of group {} has no attempt left", reqid, gid);
            self.tell(gid, reqid, "no worker attempt left");
            self.fail_file(gid, reqid, StatusCode::SystemError);
        }
        if let Some(group) = self.queue.get_mut(gid)
            && group.driving().is_empty()
        {
            group.waiting_space = None;
        }
        true
    }

    /// Start a worker for every group that has work and a free slot
    pub(crate) async fn dispatch_ready(&mut self) {
        for gid in self.queue.ids() {
            self.fail_exhausted(gid);
        }
        for gid in self.queue.ids() {
            if self.admit().is_err() {
                debug!("No slot left, dispatch deferred");
                break;
            }
            self.dispatch_group(gid).await;
        }
    }

    /// Hand the ready files of a group to a new worker. Returns true when a
    /// worker was started.
    pub(crate) async fn dispatch_group(&mut self, gid: GroupId) -> bool {
        if self.fail_exhausted(gid) {
            return false;
        }
        let ready = self.ready_files(gid);
        if ready.is_empty() {
            return false;
        }
        if let Err(e) = self.admit() {
            debug!("Group {} stays queued: {}", gid, e);
            return false;
        }
        let Some((action, concat_off_fseq)) = self
            .queue
            .get(gid)
            .and_then(|g| job_action(g.kind).map(|a| (a, g.concat_off_fseq)))
        else {
            return false;
        };

        let entries: Vec<_> = ready
            .iter()
            .filter_map(|(reqid, path)| {
                self.catalog
                    .get(*reqid)
                    .map(|e| e.snapshot(Some(path.clone())))
            })
            .collect();
        let Some(first) = entries.first() else {
            return false;
        };
        let kind = worker_kind(&first.target);
        let id = self.next_worker_id();
        let spec = WorkerSpec {
            id,
            command: command_for(&self.config.workers, kind).clone(),
            input: JobInput {
                job: WorkerJob {
                    job_id: id.0,
                    kind,
                    action,
                    files: entries.len(),
                    concat_off_fseq,
                },
                entries,
            },
            timeout: self.worker_timeout(),
        };

        match self.launcher.launch(spec).await {
            Ok(handle) => {
                let Some(group) = self.queue.get_mut(gid) else {
                    return false;
                };
                for file in &mut group.files {
                    if ready.iter().any(|(reqid, _)| *reqid == file.subreqid) && file.is_pending() {
                        file.dispatched = true;
                        file.reported = false;
                    }
                }
                info!(
                    "Group {} ({}) handed {} files to {} worker {}",
                    gid,
                    group.kind,
                    ready.len(),
                    kind,
                    handle.id
                );
                group.worker = Some(handle);
                true
            }
            Err(e) => {
                let Some(group) = self.queue.get_mut(gid) else {
                    return false;
                };
                group.retries += 1;
                warn!(
                    "Could not start {} worker for group {} (attempt {}): {}",
                    kind, gid, group.retries, e
                );
                if group.retries >= self.config.workers.max_retries {
                    for (reqid, _) in ready {
                        self.fail_file(gid, reqid, e.status_code());
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, client, recv_status, tape_stage};
    use tapestage_proto::worker::{FileOutcome, WorkerReport};

    #[test]
    fn test_worker_kind_follows_target() {
        use tapestage_common::{DiskTarget, HsmTarget, StagePath};
        let disk = Target::Disk(DiskTarget {
            external_path: StagePath::new("/ext/a").unwrap(),
        });
        let foreign = Target::Hsm(HsmTarget {
            path: StagePath::new("/hpss/a").unwrap(),
            server: "hpss".into(),
            file_id: 0,
            file_class: 0,
            system: HsmSystem::Foreign,
        });
        assert_eq!(worker_kind(&disk), WorkerKind::Disk);
        assert_eq!(worker_kind(&foreign), WorkerKind::ForeignHsm);
    }

    #[tokio::test]
    async fn test_admission_holds_group_until_slot_frees() {
        let mut h = Harness::with(|config| config.daemon.max_open_slots = 3);
        h.stager
            .handle(crate::StagerEvent::ConnectionOpened)
            .await;

        let (first, mut first_rx) = client(1);
        h.request(first, tape_stage("T00001", "1", "/u/a")).await;
        let (second, mut second_rx) = client(2);
        h.request(second, tape_stage("T00002", "1", "/u/b")).await;

        // one connection plus one worker leaves no slot for the second group
        assert_eq!(h.launched(), 1);
        let gids = h.stager.queue.ids();
        assert_eq!(gids.len(), 2);
        let waiting = h.stager.queue.get(gids[1]).unwrap();
        assert!(waiting.worker.is_none());
        assert_eq!(waiting.retries, 0);

        let first_worker = h.spec(0).id;
        let reqid = h.spec(0).input.entries[0].reqid;
        h.report(first_worker, WorkerReport::success(reqid, FileOutcome::Staged, 10))
            .await;
        h.exit(first_worker, 0).await;
        assert_eq!(recv_status(&mut first_rx).await, StatusCode::Ok);

        h.tick().await;
        assert_eq!(h.launched(), 2);
        assert_eq!(h.spec(1).input.entries[0].user_path.as_deref(), Some("/u/b"));

        let second_worker = h.spec(1).id;
        h.exit(second_worker, 0).await;
        assert_eq!(recv_status(&mut second_rx).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_launch_failure_counts_as_attempt() {
        let mut h = Harness::with(|config| config.workers.max_retries = 2);
        h.launcher.fail_launches(true);
        let (client, mut rx) = client(1);
        h.request(client, tape_stage("T00001", "1", "/u/a")).await;
        assert_eq!(h.stager.catalog.len(), 1);

        h.tick().await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::SystemError);
        assert!(h.stager.catalog.is_empty());
        assert_eq!(h.free("public"), h.capacity("public"));
    }
}
