//! Stager core
//!
//! [`Stager`] owns the catalogs, the space allocator and the wait queue.
//! It runs as a single task: connections, workers and helper tasks post
//! [`StagerEvent`]s and the coordinator applies them one at a time, so no
//! state is shared behind locks.

use crate::event::StagerEvent;
use crate::namespace::NameServer;
use crate::waitq::{GroupId, Resolution, WaitQueue};
use crate::worker::{WorkerEvent, WorkerHandle, WorkerId, WorkerLauncher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tapestage_catalog::{
    CatalogStore, PathCatalog, RecallResult, StageCatalog, StageCatalogEntry, Transition, recover,
};
use tapestage_common::{
    AllocMode, Config, Error, ReqId, RequestKind, Result, StatusCode, Target, now_secs,
};
use tapestage_proto::worker::{FileOutcome, WorkerReport};
use tapestage_space::{Allocation, SpaceAllocator, SpaceRequest};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Key used for groups parked on space in any pool
pub const ANY_POOL: &str = "*";

/// A running reclaim worker and the files it was asked to remove
#[derive(Debug)]
pub struct ReclaimJob {
    pub worker: WorkerHandle,
    /// Reservations of the removed entries, keyed by their old request id
    pub victims: BTreeMap<u32, Allocation>,
}

pub struct Stager {
    pub(crate) config: Config,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) space: SpaceAllocator,
    pub(crate) catalog: StageCatalog,
    pub(crate) paths: PathCatalog,
    pub(crate) queue: WaitQueue,
    /// One reclaim per pool at most
    pub(crate) reclaims: BTreeMap<String, ReclaimJob>,
    pub(crate) launcher: Arc<dyn WorkerLauncher>,
    pub(crate) names: Arc<dyn NameServer>,
    pub(crate) events: mpsc::UnboundedSender<StagerEvent>,
    next_worker: u64,
    pub(crate) connections: usize,
    pub(crate) init_pending: bool,
    pub(crate) shutting_down: bool,
    orphans: Vec<PathBuf>,
}

impl Stager {
    /// Build the coordinator and recover the persisted catalog, if any.
    pub fn new(
        config: Config,
        launcher: Arc<dyn WorkerLauncher>,
        names: Arc<dyn NameServer>,
        store: Option<Arc<CatalogStore>>,
        events: mpsc::UnboundedSender<StagerEvent>,
    ) -> Result<Self> {
        let mut space = SpaceAllocator::new(&config.pools);
        let mut catalog = StageCatalog::new(config.daemon.max_reqid, store.clone());
        let mut paths = PathCatalog::new(store.clone());
        let mut orphans = Vec::new();

        if let Some(store) = &store {
            catalog.restore(store.load_entries()?, store.last_reqid()?);
            paths.restore(store.load_paths()?);
            let report = recover(&mut catalog, &mut paths, &mut space)?;
            info!(
                "Recovered {} entries ({} dropped, {} marked put-failed, {} dangling paths)",
                report.kept,
                report.removed.len(),
                report.put_failed.len(),
                report.dangling_paths
            );
            orphans = report.orphaned_files;
        }

        Ok(Self {
            config,
            config_path: None,
            space,
            catalog,
            paths,
            queue: WaitQueue::new(),
            reclaims: BTreeMap::new(),
            launcher,
            names,
            events,
            next_worker: 0,
            connections: 0,
            init_pending: false,
            shutting_down: false,
            orphans,
        })
    }

    /// File re-read by init requests
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    #[must_use]
    pub const fn paths(&self) -> &PathCatalog {
        &self.paths
    }

    #[must_use]
    pub const fn space(&self) -> &SpaceAllocator {
        &self.space
    }

    #[must_use]
    pub const fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    /// Shutdown was requested and nothing is left running
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shutting_down && self.queue.is_empty() && self.reclaims.is_empty()
    }

    /// Event loop. Returns once a shutdown has drained all work.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<StagerEvent>) {
        for path in std::mem::take(&mut self.orphans) {
            self.unlink_later(path);
        }

        let period = Duration::from_secs(self.config.daemon.sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Stager running: {} pools, {} entries, sweep every {:?}",
            self.space.pool_names().len(),
            self.catalog.len(),
            period
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                    self.reap_groups();
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("Event channel closed");
                        break;
                    }
                },
            }
            if self.is_finished() {
                info!("Shutdown complete");
                break;
            }
        }
    }

    /// Apply one event, then answer every group that has nothing left to do.
    pub async fn handle(&mut self, event: StagerEvent) {
        match event {
            StagerEvent::Request { client, request } => {
                self.handle_request(client, request).await;
            }
            StagerEvent::ConnectionOpened => self.connections += 1,
            StagerEvent::ConnectionClosed => {
                self.connections = self.connections.saturating_sub(1);
            }
            StagerEvent::Worker(WorkerEvent::Report { worker, report }) => {
                self.on_worker_report(worker, report);
            }
            StagerEvent::Worker(WorkerEvent::Exited { worker, code }) => {
                self.on_worker_exited(worker, code);
            }
            StagerEvent::SizeProbed {
                client,
                reqid,
                result,
            } => self.on_size_probed(&client, reqid, result),
            StagerEvent::NamespaceRegistered { reqid, identity } => {
                self.on_namespace_registered(reqid, identity);
            }
            StagerEvent::NamespaceFailed { reqid, error } => {
                self.on_namespace_failed(reqid, &error);
            }
            StagerEvent::ConfigReloaded { client, result } => {
                self.on_config_reloaded(&client, result);
            }
            StagerEvent::Tick => self.sweep().await,
            StagerEvent::Shutdown => self.begin_shutdown(true),
        }
        self.reap_groups();
    }

    pub(crate) const fn next_worker_id(&mut self) -> WorkerId {
        self.next_worker += 1;
        WorkerId(self.next_worker)
    }

    /// Retention of an idle staged file
    pub(crate) fn retention_of(&self, entry: &StageCatalogEntry) -> u64 {
        entry
            .retention_override
            .or_else(|| {
                entry
                    .target
                    .file_class()
                    .and_then(|id| self.config.file_class(id))
                    .and_then(|class| class.retention_secs)
            })
            .unwrap_or(self.config.gc.default_retention_secs)
    }

    /// Delay before a written HSM file may be migrated
    pub(crate) fn migration_delay_of(&self, entry: &StageCatalogEntry) -> u64 {
        entry
            .migration_delay_override
            .or_else(|| {
                entry
                    .target
                    .file_class()
                    .and_then(|id| self.config.file_class(id))
                    .and_then(|class| class.migration_delay_secs)
            })
            .unwrap_or(self.config.gc.default_migration_delay_secs)
    }

    pub(crate) fn unlink_later(&self, path: PathBuf) {
        tokio::spawn(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        });
    }

    /// Delete an entry, release its space and forget its user paths.
    /// Returns the user paths it had.
    pub(crate) fn discard_entry(&mut self, reqid: ReqId, unlink: bool) -> Result<Vec<String>> {
        let entry = self.catalog.delete(reqid, true, &mut self.space)?;
        let paths = self.paths.remove_all(reqid);
        if unlink && let Some(path) = entry.internal_path {
            self.unlink_later(PathBuf::from(path));
        }
        Ok(paths)
    }

    /// Reserve disk space for a file. Returns false when the group was
    /// parked until space frees up.
    pub(crate) fn reserve_space(&mut self, gid: GroupId, reqid: ReqId) -> Result<bool> {
        let entry = self.catalog.entry(reqid)?;
        let mode = if entry.kind() == RequestKind::StageIn {
            AllocMode::Read
        } else {
            AllocMode::Write
        };
        let size = entry.requested_size;
        let state = entry.state;
        let name = internal_name(entry);
        let pool = entry.pool.name().map(str::to_string);
        let request = pool.as_deref().map_or(SpaceRequest::Anywhere, SpaceRequest::Pool);

        match self.space.allocate(request, size, mode, &name) {
            Ok(allocation) => {
                self.catalog.update(reqid, |e| e.reserve(allocation))?;
                if state.is_waiting_space() {
                    self.catalog
                        .set_state(reqid, state.space_reserved()?, &mut self.space)?;
                }
                Ok(true)
            }
            Err(Error::InsufficientSpace {
                required,
                available,
                ..
            }) => {
                let key = pool.unwrap_or_else(|| ANY_POOL.to_string());
                if !state.is_waiting_space() {
                    self.catalog
                        .set_state(reqid, state.wait_for_space()?, &mut self.space)?;
                }
                info!(
                    "No room for {} in {} ({} bytes wanted, {} available), waiting",
                    reqid, key, required, available
                );
                if let Some(group) = self.queue.get_mut(gid) {
                    group.waiting_space = Some(key);
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve space, failing the file on anything but a space shortage.
    /// Returns true when the space is there.
    pub(crate) fn reserve_or_fail(&mut self, gid: GroupId, reqid: ReqId) -> bool {
        match self.reserve_space(gid, reqid) {
            Ok(reserved) => reserved,
            Err(e) => {
                error!("Could not reserve space for {}: {}", reqid, e);
                self.tell(gid, reqid, &e.to_string());
                self.fail_file(gid, reqid, e.status_code());
                false
            }
        }
    }

    /// Space arrived for a file. Write sessions are handed to the client now;
    /// recalls wait for dispatch.
    pub(crate) fn space_granted(&mut self, gid: GroupId, reqid: ReqId) {
        let Some(kind) = self.queue.get(gid).map(|g| g.kind) else {
            return;
        };
        if matches!(kind, RequestKind::StageOut | RequestKind::StageAlloc)
            && let Err(e) = self.open_write_session(gid, reqid)
        {
            error!("Could not hand out {}: {}", reqid, e);
            self.fail_file(gid, reqid, e.status_code());
        }
    }

    fn open_write_session(&mut self, gid: GroupId, reqid: ReqId) -> Result<()> {
        let entry = self.catalog.entry(reqid)?;
        let group = self
            .queue
            .get_mut(gid)
            .ok_or_else(|| Error::internal(format!("group {gid} vanished")))?;
        let user_path = group
            .file(reqid)
            .map(|f| f.user_path.clone())
            .ok_or_else(|| Error::internal(format!("{reqid} is not pending in {gid}")))?;
        group
            .client
            .symlink(entry.internal_path.clone().unwrap_or_default(), user_path.clone());
        group.client.entry(entry.snapshot(Some(user_path)));
        group.complete_file(reqid, StatusCode::Ok);
        Ok(())
    }

    /// Error line for one file of a group, unless the group is silent
    pub(crate) fn tell(&self, gid: GroupId, reqid: ReqId, message: &str) {
        if let Some(group) = self.queue.get(gid) {
            let path = group.file(reqid).map_or("", |f| f.user_path.as_str());
            if !group.silent {
                group.client.error(format!("{path}: {message}"));
            }
        }
    }

    /// Give up on a file: apply the failure transition and settle the
    /// files waiting on it.
    pub(crate) fn fail_file(&mut self, gid: GroupId, reqid: ReqId, code: StatusCode) {
        if let Some(entry) = self.catalog.get(reqid) {
            let result = match entry.state.failed() {
                Transition::Delete => self.discard_entry(reqid, true).map(drop),
                Transition::To(next) => self.catalog.set_state(reqid, next, &mut self.space),
            };
            if let Err(e) = result {
                error!("Could not fail entry {}: {}", reqid, e);
            }
        }
        if let Some(group) = self.queue.get_mut(gid) {
            group.complete_file(reqid, code);
        }
        info!("{} failed with {}", reqid, code);
        self.resolve(reqid, false);
    }

    /// Drop a file that waits on another entry
    pub(crate) fn drop_waiter(&mut self, gid: GroupId, subreqid: ReqId, code: StatusCode) {
        if self.catalog.get(subreqid).is_some()
            && let Err(e) = self.catalog.delete(subreqid, true, &mut self.space)
        {
            error!("Could not drop waiting entry {}: {}", subreqid, e);
        }
        if let Some(group) = self.queue.get_mut(gid) {
            group.complete_file(subreqid, code);
        }
    }

    /// Settle the files waiting on `driver`
    pub(crate) fn resolve(&mut self, driver: ReqId, success: bool) {
        match self.queue.resolve(driver, success) {
            Resolution::Succeeded(waiters) => {
                for (gid, subreqid) in waiters {
                    if let Err(e) = self.complete_waiter(gid, subreqid, driver) {
                        error!("Could not complete {} from {}: {}", subreqid, driver, e);
                        self.drop_waiter(gid, subreqid, e.status_code());
                    }
                }
            }
            Resolution::Rechained {
                promoted: Some((gid, subreqid)),
                followers,
            } => {
                info!(
                    "{} takes over from {} with {} followers",
                    subreqid,
                    driver,
                    followers.len()
                );
                self.promote_waiter(gid, subreqid);
            }
            Resolution::Rechained { promoted: None, .. } => {}
        }
    }

    fn complete_waiter(&mut self, gid: GroupId, subreqid: ReqId, driver: ReqId) -> Result<()> {
        let user_path = self
            .queue
            .get(gid)
            .and_then(|g| g.file(subreqid))
            .map(|f| f.user_path.clone())
            .ok_or_else(|| Error::internal(format!("{subreqid} is not pending in {gid}")))?;
        self.catalog.delete(subreqid, true, &mut self.space)?;
        self.paths.register(&user_path, driver);
        self.catalog.update(driver, StageCatalogEntry::touch)?;

        let entry = self.catalog.entry(driver)?;
        if let Some(group) = self.queue.get_mut(gid) {
            group.client.symlink(
                entry.internal_path.clone().unwrap_or_default(),
                user_path.clone(),
            );
            group.client.entry(entry.snapshot(Some(user_path)));
            if let Some(file) = group.file_mut(subreqid) {
                file.bytes_copied = entry.actual_size;
            }
            group.complete_file(subreqid, StatusCode::Ok);
        }
        Ok(())
    }

    /// A waiter whose driver failed becomes a driver itself
    fn promote_waiter(&mut self, gid: GroupId, subreqid: ReqId) {
        if let Err(e) = self.catalog.update(subreqid, |e| e.dependent = false) {
            error!("Waiting entry {} is gone: {}", subreqid, e);
            if let Some(group) = self.queue.get_mut(gid) {
                group.complete_file(subreqid, StatusCode::SystemError);
            }
            return;
        }
        if let Some(path) = self
            .queue
            .get(gid)
            .and_then(|g| g.file(subreqid))
            .map(|f| f.user_path.clone())
        {
            self.paths.register(&path, subreqid);
        }
        if self.fail_exhausted(gid) {
            return;
        }
        self.reserve_or_fail(gid, subreqid);
    }

    /// Fail every pending file of a group
    pub(crate) fn terminate_group(&mut self, gid: GroupId, code: StatusCode) {
        loop {
            let next = self.queue.get(gid).and_then(|g| {
                g.pending()
                    .next()
                    .map(|f| (f.subreqid, f.waiting_on.is_some()))
            });
            let Some((subreqid, waiting)) = next else {
                break;
            };
            if waiting {
                self.drop_waiter(gid, subreqid, code);
            } else {
                self.fail_file(gid, subreqid, code);
            }
        }
        if let Some(group) = self.queue.get_mut(gid) {
            group.waiting_space = None;
        }
    }

    /// Stop a group: its worker is interrupted, or its files fail right away
    pub(crate) fn kill_group(&mut self, gid: GroupId) {
        let Some(group) = self.queue.get_mut(gid) else {
            return;
        };
        group.killed = true;
        match group.worker.as_mut() {
            Some(worker) => {
                info!("Interrupting worker {} of group {}", worker.id, gid);
                worker.kill();
            }
            None => self.terminate_group(gid, StatusCode::Killed),
        }
    }

    pub(crate) fn begin_shutdown(&mut self, force: bool) {
        if !self.shutting_down {
            info!("Shutting down (force={})", force);
        }
        self.shutting_down = true;
        if force {
            for gid in self.queue.ids() {
                self.kill_group(gid);
            }
            for job in self.reclaims.values_mut() {
                job.worker.kill();
            }
        }
    }

    /// Send the final status of every finished group
    pub(crate) fn reap_groups(&mut self) {
        let finished: Vec<GroupId> = self
            .queue
            .iter()
            .filter(|g| g.is_finished())
            .map(|g| g.id)
            .collect();
        for gid in finished {
            if let Some(group) = self.queue.remove(gid) {
                let status = if group.killed {
                    StatusCode::Killed
                } else {
                    group.status
                };
                debug!("Group {} ({}) done with {}", gid, group.kind, status);
                group.client.finish(status);
            }
        }
    }

    fn on_worker_report(&mut self, worker: WorkerId, report: WorkerReport) {
        if let Some(pool) = self.reclaim_of_worker(worker) {
            self.on_reclaim_report(&pool, &report);
            return;
        }
        let Some(gid) = self.queue.group_of_worker(worker) else {
            warn!("Report from unknown worker {}", worker);
            return;
        };
        self.apply_report(gid, &report);
    }

    fn apply_report(&mut self, gid: GroupId, report: &WorkerReport) {
        let reqid = ReqId::new(report.reqid);
        let Some(group) = self.queue.get_mut(gid) else {
            return;
        };
        let kind = group.kind;
        let Some(file) = group.file_mut(reqid) else {
            warn!("Report on {} which is not pending in group {}", reqid, gid);
            return;
        };
        file.reported = true;
        file.bytes_copied = report.actual_size;
        file.bytes_expected = report.bytes_expected;

        let result = match (report.outcome, kind) {
            (FileOutcome::Failed, _) => {
                self.file_failed(gid, reqid, report);
                Ok(())
            }
            (
                FileOutcome::Staged | FileOutcome::Partial | FileOutcome::Truncated,
                RequestKind::StageIn,
            ) => self.recall_done(gid, reqid, report),
            (FileOutcome::Written | FileOutcome::Staged, RequestKind::StageWrite) => {
                self.write_done(gid, reqid, report)
            }
            (FileOutcome::Written | FileOutcome::Staged, RequestKind::StagePut) => {
                self.migration_done(gid, reqid)
            }
            (outcome, kind) => Err(Error::internal(format!(
                "unexpected {outcome:?} report for a {kind} request"
            ))),
        };
        if let Err(e) = result {
            error!("Could not apply report on {} in group {}: {}", reqid, gid, e);
            self.fail_file(gid, reqid, e.status_code());
        }
    }

    fn file_failed(&mut self, gid: GroupId, reqid: ReqId, report: &WorkerReport) {
        let code = match StatusCode::from_exit_code(report.code) {
            StatusCode::Ok => StatusCode::SystemError,
            code => code,
        };
        if let Some(message) = &report.message {
            self.tell(gid, reqid, message);
        }
        if code.is_retryable() {
            info!("{} failed with {}, will retry", reqid, code);
        } else {
            self.fail_file(gid, reqid, code);
        }
    }

    fn recall_done(&mut self, gid: GroupId, reqid: ReqId, report: &WorkerReport) -> Result<()> {
        let read_only = self.queue.get(gid).is_some_and(|g| g.read_only);
        let result = RecallResult {
            partial: report.outcome == FileOutcome::Partial,
            truncated: report.outcome == FileOutcome::Truncated,
            last_tape_file: report.last_tape_file,
            read_only,
        };
        self.catalog
            .reconcile(reqid, report.actual_size, &mut self.space)?;
        self.catalog.close_stream(reqid, &mut self.space)?;
        let next = self.catalog.entry(reqid)?.state.recall_done(result)?;
        self.catalog.set_state(reqid, next, &mut self.space)?;
        self.catalog.update(reqid, StageCatalogEntry::touch)?;

        let entry = self.catalog.entry(reqid)?;
        if let Some(group) = self.queue.get_mut(gid) {
            let user_path = group
                .file(reqid)
                .map(|f| f.user_path.clone())
                .unwrap_or_default();
            group.client.symlink(
                entry.internal_path.clone().unwrap_or_default(),
                user_path.clone(),
            );
            group.client.entry(entry.snapshot(Some(user_path)));
            group.complete_file(reqid, StatusCode::Ok);
        }
        info!("{} staged ({} bytes)", reqid, report.actual_size);
        self.resolve(reqid, true);
        Ok(())
    }

    fn write_done(&mut self, gid: GroupId, reqid: ReqId, report: &WorkerReport) -> Result<()> {
        self.catalog
            .reconcile(reqid, report.actual_size, &mut self.space)?;
        self.catalog.close_stream(reqid, &mut self.space)?;
        let entry = self.catalog.entry(reqid)?;
        let hsm = entry.target.is_hsm();
        let delay = self.migration_delay_of(entry);
        let next = entry.state.write_done(hsm, delay == 0)?;
        self.catalog.set_state(reqid, next, &mut self.space)?;
        if hsm && delay > 0 {
            let due = now_secs() + delay;
            self.catalog.update(reqid, |e| e.migrate_after = Some(due))?;
        }
        if let Some(group) = self.queue.get_mut(gid) {
            group.complete_file(reqid, StatusCode::Ok);
        }
        info!("{} written to its target", reqid);
        Ok(())
    }

    fn migration_done(&mut self, gid: GroupId, reqid: ReqId) -> Result<()> {
        self.catalog.close_stream(reqid, &mut self.space)?;
        let entry = self.catalog.entry(reqid)?;
        let (state, hsm) = (entry.state, entry.target.is_hsm());
        match state.put_done(hsm)? {
            Transition::Delete => {
                let paths = self.discard_entry(reqid, true)?;
                if let Some(group) = self.queue.get(gid) {
                    for path in paths {
                        group.client.remove_symlink(path);
                    }
                }
            }
            Transition::To(next) => self.catalog.set_state(reqid, next, &mut self.space)?,
        }
        if let Some(group) = self.queue.get_mut(gid) {
            group.complete_file(reqid, StatusCode::Ok);
        }
        info!("{} migrated", reqid);
        Ok(())
    }

    fn on_worker_exited(&mut self, worker: WorkerId, code: i32) {
        if let Some(pool) = self.reclaim_of_worker(worker) {
            self.on_reclaim_exited(&pool, code);
            return;
        }
        let Some(gid) = self.queue.group_of_worker(worker) else {
            debug!("Exit of unknown worker {}", worker);
            return;
        };
        let Some(group) = self.queue.get_mut(gid) else {
            return;
        };
        group.worker = None;
        if group.killed {
            info!("Worker {} of killed group {} exited", worker, gid);
            self.terminate_group(gid, StatusCode::Killed);
            return;
        }

        let kind = group.kind;
        if code == 0 {
            // A clean exit vouches for the files it did not report on
            let unreported: Vec<ReqId> = group
                .pending()
                .filter(|f| f.dispatched && !f.reported)
                .map(|f| f.subreqid)
                .collect();
            for reqid in unreported {
                let size = self.catalog.get(reqid).map_or(0, |e| e.requested_size);
                let outcome = if kind == RequestKind::StageIn {
                    FileOutcome::Staged
                } else {
                    FileOutcome::Written
                };
                debug!("Worker {} exited cleanly without reporting {}", worker, reqid);
                self.apply_report(gid, &WorkerReport::success(reqid.get(), outcome, size));
            }
        }

        let Some(group) = self.queue.get_mut(gid) else {
            return;
        };
        let leftover: Vec<ReqId> = group
            .pending()
            .filter(|f| f.dispatched)
            .map(|f| f.subreqid)
            .collect();
        for file in &mut group.files {
            file.dispatched = false;
            file.reported = false;
        }
        if leftover.is_empty() {
            return;
        }

        let status = StatusCode::from_exit_code(code);
        if code != 0 && !status.is_retryable() {
            info!("Worker {} of group {} failed with {}", worker, gid, status);
            for reqid in leftover {
                self.fail_file(gid, reqid, status);
            }
            return;
        }

        group.retries += 1;
        let max = self.config.workers.max_retries;
        if group.retries >= max {
            warn!(
                "Group {} gave up after {} attempts (last exit {})",
                gid, group.retries, code
            );
            let failure = if code == 0 {
                StatusCode::SystemError
            } else {
                status
            };
            for reqid in leftover {
                self.fail_file(gid, reqid, failure);
            }
            self.fail_exhausted(gid);
        } else {
            info!(
                "Worker {} of group {} exited with {}, attempt {} of {}",
                worker, gid, code, group.retries, max
            );
        }
    }

    pub(crate) fn reclaim_of_worker(&self, worker: WorkerId) -> Option<String> {
        self.reclaims
            .iter()
            .find(|(_, job)| job.worker.id == worker)
            .map(|(pool, _)| pool.clone())
    }
}

impl std::fmt::Debug for Stager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stager")
            .field("entries", &self.catalog.len())
            .field("paths", &self.paths.len())
            .field("groups", &self.queue.len())
            .field("reclaims", &self.reclaims.len())
            .field("connections", &self.connections)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

/// File name of an entry's disk copy inside its filesystem
pub(crate) fn internal_name(entry: &StageCatalogEntry) -> String {
    let base = match &entry.target {
        Target::Tape(tape) => {
            let file = match tape.fseq.number() {
                Some(n) => n.to_string(),
                None => tape
                    .fid
                    .as_ref()
                    .map_or_else(|| tape.fseq.to_string(), |fid| fid.as_str().to_string()),
            };
            format!("{}.{}", tape.vid, file)
        }
        Target::Disk(disk) => basename(disk.external_path.as_str()),
        Target::Hsm(hsm) => basename(hsm.path.as_str()),
    };
    format!("{}.{}", base, entry.reqid)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        CAPACITY, Harness, client, client_info, drain, hsm_stage, recv_status, tape_stage,
        tape_stage_files,
    };
    use tapestage_common::Modifiers;
    use tapestage_proto::worker::JobAction;
    use tapestage_proto::{AdminRequest, KillRequest, PutRequest, Reply, Request, UpdateRequest};

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn test_recall_links_user_path_when_staged() {
        let mut h = Harness::new();
        let (client, mut rx) = client(1);
        h.request(client, tape_stage("T00001", "3", "/u/f3")).await;
        assert_eq!(h.launched(), 1);
        let spec = h.spec(0);
        assert_eq!(spec.input.job.action, JobAction::Recall);
        let reqid = spec.input.entries[0].reqid;

        h.report(spec.id, WorkerReport::success(reqid, FileOutcome::Staged, MIB))
            .await;
        h.exit(spec.id, 0).await;

        let replies = drain(&mut rx);
        assert!(matches!(replies[0], Reply::UniqueId(_)));
        assert!(replies.iter().any(|r| matches!(
            r,
            Reply::CreateSymlink { user_path, internal_path }
                if user_path == "/u/f3" && internal_path.starts_with("/srv/stage/public/T00001.3.")
        )));
        assert_eq!(replies.last(), Some(&Reply::Status(StatusCode::Ok)));

        let entry = h.stager.catalog().get(ReqId::new(reqid)).unwrap();
        assert_eq!(entry.kind(), RequestKind::StageIn);
        assert_eq!(entry.modifiers(), Modifiers::STAGED);
        assert_eq!(entry.actual_size, MIB);
        assert_eq!(h.free("public"), CAPACITY - MIB);
        assert_eq!(h.stager.paths().resolve("/u/f3"), Some(ReqId::new(reqid)));
    }

    #[tokio::test]
    async fn test_duplicate_recalls_share_one_worker() {
        let mut h = Harness::new();
        let (first, mut first_rx) = client(1);
        let (second, mut second_rx) = client(2);
        h.request(first, tape_stage("T00001", "1", "/u/a")).await;
        h.request(second, tape_stage("T00001", "1", "/u/b")).await;
        assert_eq!(h.launched(), 1);
        assert_eq!(h.free("public"), CAPACITY - MIB);

        let spec = h.spec(0);
        let driver = spec.input.entries[0].reqid;
        h.report(spec.id, WorkerReport::success(driver, FileOutcome::Staged, MIB))
            .await;
        h.exit(spec.id, 0).await;

        assert_eq!(recv_status(&mut first_rx).await, StatusCode::Ok);
        assert_eq!(recv_status(&mut second_rx).await, StatusCode::Ok);
        assert_eq!(h.stager.catalog().len(), 1);
        assert_eq!(h.stager.paths().resolve("/u/b"), Some(ReqId::new(driver)));
        assert_eq!(h.launched(), 1);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_failed_recall() {
        let mut h = Harness::new();
        let (first, mut first_rx) = client(1);
        let (second, mut second_rx) = client(2);
        h.request(first, tape_stage("T00001", "1", "/u/a")).await;
        h.request(second, tape_stage("T00001", "1", "/u/b")).await;

        let spec = h.spec(0);
        let driver = spec.input.entries[0].reqid;
        h.report(spec.id, WorkerReport::failure(driver, 1, "tape not found"))
            .await;
        h.exit(spec.id, 1).await;
        assert_eq!(recv_status(&mut first_rx).await, StatusCode::UserError);
        assert!(h.stager.catalog().get(ReqId::new(driver)).is_none());

        h.tick().await;
        assert_eq!(h.launched(), 2);
        let retry = h.spec(1);
        let waiter = retry.input.entries[0].reqid;
        assert_ne!(waiter, driver);
        assert_eq!(retry.input.entries[0].user_path.as_deref(), Some("/u/b"));

        h.report(retry.id, WorkerReport::success(waiter, FileOutcome::Staged, MIB))
            .await;
        h.exit(retry.id, 0).await;
        assert_eq!(recv_status(&mut second_rx).await, StatusCode::Ok);
        assert_eq!(h.free("public"), CAPACITY - MIB);
    }

    #[tokio::test]
    async fn test_promoted_waiter_fails_when_group_is_out_of_attempts() {
        let mut h = Harness::new();
        let (first, mut first_rx) = client(1);
        let (second, mut second_rx) = client(2);
        h.request(first, tape_stage("T00001", "1", "/u/a")).await;
        h.request(
            second,
            tape_stage_files("T00001", "1,2", &["/u/b1", "/u/b2"]),
        )
        .await;
        assert_eq!(h.launched(), 2);
        let driver = h.spec(0);
        assert_eq!(h.spec(1).input.entries.len(), 1);
        assert_eq!(h.spec(1).input.entries[0].user_path.as_deref(), Some("/u/b2"));

        // the second group spends its attempts on file 2
        for attempt in 1..=3 {
            let spec = h.spec(attempt);
            h.exit(spec.id, 2).await;
            h.tick().await;
        }
        assert_eq!(h.launched(), 4);
        assert!(!drain(&mut second_rx).iter().any(|r| matches!(r, Reply::Status(_))));

        let reqid = driver.input.entries[0].reqid;
        h.report(driver.id, WorkerReport::failure(reqid, 1, "tape not found"))
            .await;
        h.exit(driver.id, 1).await;
        assert_eq!(recv_status(&mut first_rx).await, StatusCode::UserError);
        assert_eq!(recv_status(&mut second_rx).await, StatusCode::SystemError);

        for _ in 0..3 {
            h.tick().await;
        }
        assert_eq!(h.launched(), 4);
        assert!(h.stager.queue().is_empty());
        assert!(h.stager.catalog().is_empty());
        assert!(h.stager.paths().resolve("/u/b1").is_none());
        assert_eq!(h.free("public"), CAPACITY);
    }

    #[tokio::test]
    async fn test_promoted_waiter_runs_after_group_worker_finishes() {
        let mut h = Harness::new();
        let (first, mut first_rx) = client(1);
        let (second, mut second_rx) = client(2);
        h.request(first, tape_stage("T00001", "1", "/u/a")).await;
        h.request(
            second,
            tape_stage_files("T00001", "1,2", &["/u/b1", "/u/b2"]),
        )
        .await;
        let driver = h.spec(0);
        let busy = h.spec(1);

        let reqid = driver.input.entries[0].reqid;
        h.report(driver.id, WorkerReport::failure(reqid, 1, "tape not found"))
            .await;
        h.exit(driver.id, 1).await;
        assert_eq!(recv_status(&mut first_rx).await, StatusCode::UserError);

        // the group's worker still holds file 2, the promoted file waits
        h.tick().await;
        assert_eq!(h.launched(), 2);

        let file2 = busy.input.entries[0].reqid;
        h.report(busy.id, WorkerReport::success(file2, FileOutcome::Staged, MIB))
            .await;
        h.exit(busy.id, 0).await;
        h.tick().await;
        assert_eq!(h.launched(), 3);
        let takeover = h.spec(2);
        assert_eq!(takeover.input.entries.len(), 1);
        assert_eq!(takeover.input.entries[0].user_path.as_deref(), Some("/u/b1"));

        let file1 = takeover.input.entries[0].reqid;
        h.report(takeover.id, WorkerReport::success(file1, FileOutcome::Staged, MIB))
            .await;
        h.exit(takeover.id, 0).await;
        assert_eq!(recv_status(&mut second_rx).await, StatusCode::Ok);
        assert!(h.stager.queue().is_empty());
        assert_eq!(h.stager.catalog().len(), 2);
        assert_eq!(h.free("public"), CAPACITY - 2 * MIB);
    }

    #[tokio::test]
    async fn test_retries_stop_at_limit_and_release_once() {
        let mut h = Harness::new();
        let (client, mut rx) = client(1);
        h.request(client, tape_stage("T00001", "1", "/u/a")).await;

        for attempt in 0..3 {
            let spec = h.spec(attempt);
            h.exit(spec.id, 2).await;
            h.tick().await;
        }
        assert_eq!(h.launched(), 3);
        assert_eq!(recv_status(&mut rx).await, StatusCode::SystemError);
        assert!(h.stager.catalog().is_empty());
        assert_eq!(h.free("public"), CAPACITY);
    }

    #[tokio::test]
    async fn test_kill_interrupts_running_worker() {
        let mut h = Harness::new();
        let (owner, mut owner_rx) = client(7);
        h.request(owner, tape_stage("T00001", "1", "/u/a")).await;

        let (killer, mut killer_rx) = client(7);
        h.request(
            killer,
            Request::Kill(KillRequest {
                client: client_info(7),
                target_pid: 0,
                unique_id: 0,
            }),
        )
        .await;
        assert_eq!(recv_status(&mut killer_rx).await, StatusCode::Ok);
        assert!(h.launcher.was_killed(0));

        h.exit(h.spec(0).id, 9).await;
        assert_eq!(recv_status(&mut owner_rx).await, StatusCode::Killed);
        assert!(h.stager.catalog().is_empty());
        assert_eq!(h.free("public"), CAPACITY);
    }

    #[tokio::test]
    async fn test_written_hsm_file_migrates_and_leaves() {
        let mut h = Harness::new();
        let (client_a, mut rx) = client(1);
        h.request(
            client_a,
            hsm_stage(RequestKind::StageOut, "/ns/user/f", 2, "/u/f"),
        )
        .await;
        h.pump().await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);

        let (client_b, mut rx) = client(1);
        h.request(
            client_b,
            Request::Update(UpdateRequest {
                client: client_info(1),
                user_path: "/u/f".into(),
                actual_size: Some(500),
            }),
        )
        .await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::Ok);
        let reqid = h.stager.paths().resolve("/u/f").unwrap();
        let entry = h.stager.catalog().get(reqid).unwrap();
        assert_eq!(entry.kind(), RequestKind::StageWrite);
        assert_eq!(entry.modifiers(), Modifiers::CAN_BE_MIGRATED);
        assert_eq!(h.stager.space().migration_pending("public"), 1);
        assert_eq!(h.free("public"), CAPACITY - 500);

        let (client_c, mut rx) = client(1);
        h.request(
            client_c,
            Request::Put(PutRequest {
                client: client_info(1),
                user_paths: vec!["/u/f".into()],
                hsm_paths: Vec::new(),
            }),
        )
        .await;
        assert_eq!(h.launched(), 1);
        let spec = h.spec(0);
        assert_eq!(spec.input.job.action, JobAction::Migrate);
        h.report(spec.id, WorkerReport::success(reqid.get(), FileOutcome::Written, 500))
            .await;
        h.exit(spec.id, 0).await;

        let replies = drain(&mut rx);
        assert!(replies.contains(&Reply::RemoveSymlink {
            user_path: "/u/f".into()
        }));
        assert_eq!(replies.last(), Some(&Reply::Status(StatusCode::Ok)));
        assert!(h.stager.catalog().is_empty());
        assert_eq!(h.stager.space().migration_pending("public"), 0);
        assert_eq!(h.free("public"), CAPACITY);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_requests() {
        let mut h = Harness::new();
        let (root, mut root_rx) = crate::testing::root_client(1);
        h.request(
            root,
            Request::Shutdown(AdminRequest {
                client: client_info(1),
                force: false,
            }),
        )
        .await;
        assert_eq!(recv_status(&mut root_rx).await, StatusCode::Ok);

        let (client, mut rx) = client(2);
        h.request(client, tape_stage("T00001", "1", "/u/a")).await;
        assert_eq!(recv_status(&mut rx).await, StatusCode::NotActive);
        assert_eq!(h.launched(), 0);
        assert!(h.stager.is_finished());
    }

    #[test]
    fn test_internal_name_follows_target() {
        use tapestage_catalog::EntryState;
        use tapestage_common::{HsmSystem, HsmTarget, PoolAssignment, Requester, StagePath};
        let target = Target::Hsm(HsmTarget {
            path: StagePath::new("/ns/user/run42.dat").unwrap(),
            server: "ns01".into(),
            file_id: 9,
            file_class: 1,
            system: HsmSystem::Native,
        });
        let entry = StageCatalogEntry::new(
            ReqId::new(17),
            EntryState::initial(RequestKind::StageOut, false).unwrap(),
            target,
            PoolAssignment::NoPool,
            Requester::new("alice", "cms", 1001, 100),
            10,
        );
        assert_eq!(internal_name(&entry), "run42.dat.17");
    }
}
