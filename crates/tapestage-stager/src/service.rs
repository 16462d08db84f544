//! Client request handlers

use crate::client::ClientHandle;
use crate::coordinator::Stager;
use crate::event::StagerEvent;
use crate::fseq::unpack_fseq;
use crate::namespace::HsmIdentity;
use crate::waitq::{GroupId, WaitFileEntry};
use chrono::DateTime;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tapestage_catalog::{EntryState, StageCatalogEntry, Transition};
use tapestage_common::{
    AllocMode, Config, DiskTarget, Error, FileId, FileSeq, HsmSystem, HsmTarget, Label, Modifiers,
    PoolAssignment, PoolConstraint, ReqId, RequestKind, Requester, Result, StagePath, StatusCode,
    TapeTarget, Target, Vid, now_secs,
};
use tapestage_proto::{
    AdminRequest, ClearRequest, ClearSelector, ClientInfo, FileChangeRequest, GetRequest,
    HsmFileSpec, KillRequest, PutRequest, QueryRequest, Reply, Request, StageRequest, StageSource,
    TapeSpec, UpdateRequest,
};
use tracing::{debug, error, info, warn};

/// Where and how large the files of a stage request go
struct Placement {
    constraint: PoolConstraint,
    assignment: PoolAssignment,
    size: u64,
    requester: Requester,
}

struct PlannedFile {
    target: Target,
    user_path: String,
}

struct StagePlan {
    placement: Placement,
    concat_off: Option<u32>,
    files: Vec<PlannedFile>,
}

fn reject(client: &ClientHandle, error: &Error) {
    client.error(error.to_string());
    client.finish(error.status_code());
}

/// Owner of an entry, or root
fn may_modify(client: &ClientInfo, owner: &Requester) -> bool {
    client.requester.is_root() || client.requester.uid == owner.uid
}

fn format_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map_or_else(|| "-".to_string(), |t| t.format("%Y/%m/%d %H:%M:%S").to_string())
}

/// One line of a query listing for legacy clients
fn entry_line(entry: &StageCatalogEntry, user_path: Option<&str>) -> String {
    let state = if entry.modifiers().is_empty() {
        entry.kind().to_string()
    } else {
        format!("{}|{}", entry.kind(), entry.modifiers())
    };
    format!(
        "{:>6} {:<24} {} pool={} size={} actual={} accesses={} last={} {} {}",
        entry.reqid,
        state,
        entry.target,
        entry.pool,
        entry.requested_size,
        entry.actual_size,
        entry.nb_accesses,
        format_time(entry.last_access_at),
        entry.internal_path.as_deref().unwrap_or("-"),
        user_path.unwrap_or("-"),
    )
}

fn disk_target(path: &str) -> Result<Target> {
    Ok(Target::Disk(DiskTarget {
        external_path: StagePath::new(path)?,
    }))
}

fn hsm_target(file: &HsmFileSpec) -> Result<Target> {
    Ok(Target::Hsm(HsmTarget {
        path: StagePath::new(file.path.as_str())?,
        server: file.server.clone(),
        file_id: file.file_id,
        file_class: file.file_class,
        system: if file.foreign {
            HsmSystem::Foreign
        } else {
            HsmSystem::Native
        },
    }))
}

fn tape_targets(spec: &TapeSpec, kind: RequestKind) -> Result<(Vec<Target>, Option<u32>)> {
    let vid = Vid::new(spec.vid.as_str())?;
    let label = Label::new(if spec.label.is_empty() {
        "al"
    } else {
        spec.label.as_str()
    })?;
    let list = unpack_fseq(&spec.fseq)?;
    if list.concat_off.is_some() && kind != RequestKind::StageIn {
        return Err(Error::invalid_argument(
            "an open file sequence range is only valid for recalls",
        ));
    }
    if !spec.fids.is_empty() && spec.fids.len() != list.files.len() {
        return Err(Error::invalid_argument(format!(
            "{} file ids given for {} files",
            spec.fids.len(),
            list.files.len()
        )));
    }
    if spec.fids.is_empty() && list.files.contains(&FileSeq::ByFileId) {
        return Err(Error::invalid_argument("file sequence 'u' needs file ids"));
    }

    let targets = list
        .files
        .iter()
        .enumerate()
        .map(|(i, fseq)| {
            let fid = spec
                .fids
                .get(i)
                .map(|fid| FileId::new(fid.as_str()))
                .transpose()?;
            Ok(Target::Tape(TapeTarget {
                vid: vid.clone(),
                side: spec.side,
                fseq: *fseq,
                label: label.clone(),
                fid,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((targets, list.concat_off))
}

impl Stager {
    pub(crate) async fn handle_request(&mut self, client: ClientHandle, request: Request) {
        debug!(
            "{} from {}@{} pid {}",
            request.request_type().name(),
            client.info.requester.user,
            client.info.host,
            client.info.pid
        );
        match request {
            Request::Stage(req) => self.handle_stage(client, req).await,
            Request::Put(req) => self.handle_put(client, req).await,
            Request::Query(req) => self.handle_query(&client, &req),
            Request::Clear(req) => self.handle_clear(&client, &req),
            Request::Kill(req) => self.handle_kill(&client, &req),
            Request::Update(req) => self.handle_update(client, &req),
            Request::Init(req) => self.handle_init(client, &req),
            Request::Get(req) => self.handle_get(&client, &req),
            Request::FileChange(req) => self.handle_file_change(&client, &req),
            Request::Shutdown(req) => self.handle_shutdown(&client, &req),
            Request::Ping(_) => {
                client.info(format!("tapestage {}", env!("CARGO_PKG_VERSION")));
                client.finish(StatusCode::Ok);
            }
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.shutting_down {
            return Err(Error::NotActive("shutting down".into()));
        }
        if self.init_pending {
            return Err(Error::NotActive("configuration reload in progress".into()));
        }
        Ok(())
    }

    /// Pool constraint used to look for existing entries, and the pool new
    /// entries are assigned to. An empty pool matches any pooled entry and
    /// places new ones in the default pool of the request direction, or in
    /// no pool when none is configured.
    fn resolve_pool(&self, kind: RequestKind, pool: &str) -> Result<(PoolConstraint, PoolAssignment)> {
        match PoolConstraint::parse(pool)? {
            PoolConstraint::Named(name) if !self.space.has_pool(name.as_str()) => {
                Err(Error::UnknownPool(name.into_string()))
            }
            PoolConstraint::Named(name) => {
                Ok((PoolConstraint::Named(name.clone()), PoolAssignment::Named(name)))
            }
            PoolConstraint::NoPool => Ok((PoolConstraint::NoPool, PoolAssignment::NoPool)),
            PoolConstraint::Any => {
                let default = if matches!(kind, RequestKind::StageIn | RequestKind::StageCatalogued)
                {
                    self.config.daemon.default_pool_in.as_deref()
                } else {
                    self.config.daemon.default_pool_out.as_deref()
                };
                let assignment = match default.filter(|name| !name.is_empty()) {
                    Some(name) => match self.resolve_pool(kind, name)? {
                        (_, PoolAssignment::Named(name)) => PoolAssignment::Named(name),
                        _ => PoolAssignment::NoPool,
                    },
                    None => PoolAssignment::NoPool,
                };
                Ok((PoolConstraint::Any, assignment))
            }
        }
    }

    /// Validate a stage request completely before anything is touched
    fn plan_stage(&self, req: &StageRequest) -> Result<StagePlan> {
        if req.user_paths.is_empty() {
            return Err(Error::invalid_argument("no user path given"));
        }
        let (constraint, assignment) = self.resolve_pool(req.kind, &req.pool)?;
        let (targets, concat_off) = match (&req.source, req.kind) {
            (_, RequestKind::StagePut) => {
                return Err(Error::invalid_argument("migration takes a put request"));
            }
            (StageSource::None, RequestKind::StageAlloc) => (
                req.user_paths
                    .iter()
                    .map(|path| disk_target(path))
                    .collect::<Result<Vec<_>>>()?,
                None,
            ),
            (StageSource::None, kind) => {
                return Err(Error::invalid_argument(format!("{kind} needs a source")));
            }
            (_, RequestKind::StageAlloc) => {
                return Err(Error::invalid_argument("an allocation takes no source"));
            }
            (StageSource::Tape(spec), kind) => tape_targets(spec, kind)?,
            (StageSource::Disk { paths }, _) => (
                paths
                    .iter()
                    .map(|path| disk_target(path))
                    .collect::<Result<Vec<_>>>()?,
                None,
            ),
            (StageSource::Hsm { files }, _) => (
                files.iter().map(hsm_target).collect::<Result<Vec<_>>>()?,
                None,
            ),
        };
        if targets.len() != req.user_paths.len() {
            return Err(Error::invalid_argument(format!(
                "{} files but {} user paths",
                targets.len(),
                req.user_paths.len()
            )));
        }
        for path in &req.user_paths {
            StagePath::new(path.as_str())?;
        }

        let size = if req.size == 0 {
            self.config.daemon.default_file_size
        } else {
            req.size
        };
        Ok(StagePlan {
            placement: Placement {
                constraint,
                assignment,
                size,
                requester: req.client.requester.clone(),
            },
            concat_off,
            files: targets
                .into_iter()
                .zip(&req.user_paths)
                .map(|(target, user_path)| PlannedFile {
                    target,
                    user_path: user_path.clone(),
                })
                .collect(),
        })
    }

    async fn handle_stage(&mut self, client: ClientHandle, req: StageRequest) {
        if let Err(e) = self.check_active() {
            reject(&client, &e);
            return;
        }
        if client.api {
            client.send(Reply::UniqueId(client.unique_id));
        }
        let mut plan = match self.plan_stage(&req) {
            Ok(plan) => plan,
            Err(e) => {
                reject(&client, &e);
                return;
            }
        };
        plan.placement.requester = client.info.requester.clone();

        let gid = self.queue.enqueue(client, req.kind);
        if let Some(group) = self.queue.get_mut(gid) {
            group.silent = req.silent;
            group.read_only = req.read_only;
            group.concat_off_fseq = plan.concat_off;
        }
        info!(
            "{} of {} files for {} in pool {} (group {})",
            req.kind,
            plan.files.len(),
            plan.placement.requester.user,
            plan.placement.assignment,
            gid
        );

        let placement = plan.placement;
        for file in plan.files {
            let user_path = file.user_path.clone();
            let result = match req.kind {
                RequestKind::StageIn => self.stage_in_file(gid, &placement, file),
                RequestKind::StageOut => self.stage_out_file(gid, &placement, file),
                RequestKind::StageWrite => self.stage_write_file(gid, &placement, file),
                RequestKind::StageAlloc => self.stage_alloc_file(gid, &placement, file),
                RequestKind::StageCatalogued => {
                    self.stage_catalog_file(gid, &placement, file, req.read_only)
                }
                RequestKind::StagePut => Err(Error::invalid_argument("migration takes a put request")),
            };
            if let Err(e) = result {
                warn!("{}: {}", user_path, e);
                if let Some(group) = self.queue.get_mut(gid) {
                    group.client.error(format!("{user_path}: {e}"));
                    group.note(e.status_code());
                }
            }
        }
        self.dispatch_group(gid).await;
    }

    fn add_file(&mut self, gid: GroupId, file: WaitFileEntry) {
        if let Some(group) = self.queue.get_mut(gid) {
            group.add_file(file);
        }
    }

    fn stage_in_file(&mut self, gid: GroupId, placement: &Placement, file: PlannedFile) -> Result<()> {
        if let Some(hit) = self.catalog.find_match(&file.target, &placement.constraint) {
            let entry = self.catalog.entry(hit)?;
            if entry.state.holds_data() {
                return self.serve_hit(gid, hit, &file.user_path);
            }
            if entry.kind() == RequestKind::StageIn {
                return self.attach_waiter(gid, hit, placement, file);
            }
            return Err(Error::invalid_argument(format!(
                "{} is being written by request {}",
                file.target, hit
            )));
        }

        let state = EntryState::initial(RequestKind::StageIn, false)?;
        let continuation = matches!(
            &file.target,
            Target::Tape(TapeTarget {
                fseq: FileSeq::From(_),
                ..
            })
        );
        let reqid = self.catalog.create(|id| {
            let mut entry = StageCatalogEntry::new(
                id,
                state,
                file.target.clone(),
                placement.assignment.clone(),
                placement.requester.clone(),
                placement.size,
            );
            entry.concat_continuation = continuation;
            entry
        })?;
        self.paths.register(&file.user_path, reqid);
        self.add_file(gid, WaitFileEntry::new(reqid, file.user_path));
        self.reserve_or_fail(gid, reqid);
        Ok(())
    }

    /// Serve a recall from a file already on disk
    fn serve_hit(&mut self, gid: GroupId, hit: ReqId, user_path: &str) -> Result<()> {
        self.catalog.update(hit, StageCatalogEntry::touch)?;
        self.paths.register(user_path, hit);
        let entry = self.catalog.entry(hit)?;
        let group = self
            .queue
            .get_mut(gid)
            .ok_or_else(|| Error::internal(format!("group {gid} vanished")))?;
        group
            .client
            .symlink(entry.internal_path.clone().unwrap_or_default(), user_path);
        group.client.entry(entry.snapshot(Some(user_path.to_string())));
        let mut file = WaitFileEntry::new(hit, user_path);
        file.bytes_copied = entry.actual_size;
        file.outcome = Some(StatusCode::Ok);
        group.add_file(file);
        debug!("{} served from {}", user_path, hit);
        Ok(())
    }

    /// Ride along on a recall already in flight
    fn attach_waiter(
        &mut self,
        gid: GroupId,
        driver: ReqId,
        placement: &Placement,
        file: PlannedFile,
    ) -> Result<()> {
        let pool = self.catalog.entry(driver)?.pool.clone();
        let state = EntryState::initial(RequestKind::StageIn, false)?;
        let reqid = self.catalog.create(|id| {
            let mut entry = StageCatalogEntry::new(
                id,
                state,
                file.target,
                pool,
                placement.requester.clone(),
                placement.size,
            );
            entry.dependent = true;
            entry
        })?;
        self.add_file(gid, WaitFileEntry::new(reqid, file.user_path));
        self.queue.attach_dependent(gid, reqid, driver);
        info!("{} waits for the recall of {}", reqid, driver);
        Ok(())
    }

    fn stage_out_file(&mut self, gid: GroupId, placement: &Placement, file: PlannedFile) -> Result<()> {
        let hsm = file.target.as_hsm().cloned();
        if let Some(hit) = self.catalog.find_match(&file.target, &placement.constraint) {
            let Some(hsm) = hsm else {
                return Err(Error::invalid_argument(format!(
                    "{} is already staged as request {}",
                    file.target, hit
                )));
            };
            if self.queue.is_busy(hit) {
                return Err(Error::invalid_argument(format!(
                    "{} is in use by request {}",
                    file.target, hit
                )));
            }
            let entry = self.catalog.entry(hit)?;
            // The namespace already knows the file under its id
            let hsm = entry.target.as_hsm().cloned().unwrap_or(hsm);
            let state = entry.state;
            let reopened = state.reopen_for_write().map_err(|_| {
                Error::invalid_argument(format!(
                    "{} cannot be rewritten while {}",
                    file.target, state.kind
                ))
            })?;
            self.catalog
                .set_state(hit, reopened.wait_for_namespace()?, &mut self.space)?;
            let requester = placement.requester.clone();
            self.catalog.update(hit, |e| {
                e.requester = requester;
                e.migrate_after = None;
                e.touch();
            })?;
            self.paths.register(&file.user_path, hit);
            self.add_file(gid, WaitFileEntry::new(hit, file.user_path));
            info!("{} reopened for writing", hit);
            self.register_in_namespace(hit, hsm, placement.requester.clone());
            return Ok(());
        }

        let mut state = EntryState::initial(RequestKind::StageOut, false)?;
        if hsm.is_some() {
            state = state.wait_for_namespace()?;
        }
        let reqid = self.catalog.create(|id| {
            StageCatalogEntry::new(
                id,
                state,
                file.target.clone(),
                placement.assignment.clone(),
                placement.requester.clone(),
                placement.size,
            )
        })?;
        self.paths.register(&file.user_path, reqid);
        self.add_file(gid, WaitFileEntry::new(reqid, file.user_path));
        match hsm {
            Some(hsm) => self.register_in_namespace(reqid, hsm, placement.requester.clone()),
            None => {
                if self.reserve_or_fail(gid, reqid) {
                    self.space_granted(gid, reqid);
                }
            }
        }
        Ok(())
    }

    /// Record an existing disk file that will be copied to its target
    fn stage_write_file(&mut self, gid: GroupId, placement: &Placement, file: PlannedFile) -> Result<()> {
        if let Some(hit) = self.catalog.find_match(&file.target, &placement.constraint) {
            return Err(Error::invalid_argument(format!(
                "{} is already in the catalog as request {}",
                file.target, hit
            )));
        }
        if let Some(hit) = self.paths.resolve(&file.user_path) {
            return Err(Error::invalid_argument(format!(
                "{} is already used by request {}",
                file.user_path, hit
            )));
        }
        let state = EntryState::initial(RequestKind::StageWrite, false)?;
        let reqid = self.catalog.create(|id| {
            StageCatalogEntry::new(
                id,
                state,
                file.target.clone(),
                placement.assignment.clone(),
                placement.requester.clone(),
                placement.size,
            )
        })?;
        self.adopt_user_file(reqid, &file.user_path, placement.size, AllocMode::Write)?;
        self.paths.register(&file.user_path, reqid);
        self.add_file(gid, WaitFileEntry::new(reqid, file.user_path));
        Ok(())
    }

    /// The disk copy is the user's own file. When it sits on a pool
    /// filesystem its bytes are accounted there.
    fn adopt_user_file(&mut self, reqid: ReqId, path: &str, size: u64, mode: AllocMode) -> Result<()> {
        let adopted = self.space.adopt(Path::new(path), size, mode);
        self.catalog.update(reqid, |e| match adopted {
            Some(allocation) => e.reserve(allocation),
            None => e.internal_path = Some(path.to_string()),
        })
    }

    /// Register a file already on disk as staged
    fn stage_catalog_file(
        &mut self,
        gid: GroupId,
        placement: &Placement,
        file: PlannedFile,
        read_only: bool,
    ) -> Result<()> {
        if let Some(hit) = self.catalog.find_match(&file.target, &placement.constraint) {
            return Err(Error::invalid_argument(format!(
                "{} is already in the catalog as request {}",
                file.target, hit
            )));
        }
        if let Some(hit) = self.paths.resolve(&file.user_path) {
            return Err(Error::invalid_argument(format!(
                "{} is already used by request {}",
                file.user_path, hit
            )));
        }
        let state = if read_only {
            EntryState::checked(
                RequestKind::StageCatalogued,
                Modifiers::STAGED | Modifiers::READ_ONLY_STAGED,
            )?
        } else {
            EntryState::initial(RequestKind::StageCatalogued, false)?
        };
        let reqid = self.catalog.create(|id| {
            StageCatalogEntry::new(
                id,
                state,
                file.target.clone(),
                placement.assignment.clone(),
                placement.requester.clone(),
                placement.size,
            )
        })?;
        self.adopt_user_file(reqid, &file.user_path, placement.size, AllocMode::Read)?;
        let size = placement.size;
        self.catalog.update(reqid, |e| e.actual_size = size)?;
        self.paths.register(&file.user_path, reqid);

        let entry = self.catalog.entry(reqid)?;
        if let Some(group) = self.queue.get_mut(gid) {
            group.client.entry(entry.snapshot(Some(file.user_path.clone())));
            let mut done = WaitFileEntry::new(reqid, file.user_path);
            done.outcome = Some(StatusCode::Ok);
            group.add_file(done);
        }
        Ok(())
    }

    fn stage_alloc_file(&mut self, gid: GroupId, placement: &Placement, file: PlannedFile) -> Result<()> {
        if let Some(hit) = self.paths.resolve(&file.user_path) {
            return Err(Error::invalid_argument(format!(
                "{} is already allocated as request {}",
                file.user_path, hit
            )));
        }
        let state = EntryState::initial(RequestKind::StageAlloc, false)?;
        let reqid = self.catalog.create(|id| {
            StageCatalogEntry::new(
                id,
                state,
                file.target.clone(),
                placement.assignment.clone(),
                placement.requester.clone(),
                placement.size,
            )
        })?;
        self.paths.register(&file.user_path, reqid);
        self.add_file(gid, WaitFileEntry::new(reqid, file.user_path));
        if self.reserve_or_fail(gid, reqid) {
            self.space_granted(gid, reqid);
        }
        Ok(())
    }

    fn register_in_namespace(&self, reqid: ReqId, target: HsmTarget, requester: Requester) {
        let names = Arc::clone(&self.names);
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match names.register(&target, &requester).await {
                Ok(identity) => StagerEvent::NamespaceRegistered { reqid, identity },
                Err(error) => StagerEvent::NamespaceFailed { reqid, error },
            };
            let _ = events.send(event);
        });
    }

    pub(crate) fn on_namespace_registered(
        &mut self,
        reqid: ReqId,
        identity: HsmIdentity,
    ) {
        let Some(gid) = self.queue.group_of_subreq(reqid) else {
            debug!("Namespace answer for {} came after its request ended", reqid);
            return;
        };
        if let Err(e) = self.namespace_done(gid, reqid, identity) {
            error!("Could not continue {} after namespace registration: {}", reqid, e);
            self.tell(gid, reqid, &e.to_string());
            self.fail_file(gid, reqid, e.status_code());
        }
    }

    fn namespace_done(
        &mut self,
        gid: GroupId,
        reqid: ReqId,
        identity: HsmIdentity,
    ) -> Result<()> {
        self.catalog.update(reqid, |e| {
            if let Target::Hsm(hsm) = &mut e.target {
                hsm.file_id = identity.file_id;
                hsm.file_class = identity.file_class;
            }
        })?;
        let entry = self.catalog.entry(reqid)?;
        let (state, reserved) = (entry.state, entry.reservation.is_some());
        self.catalog
            .set_state(reqid, state.namespace_registered()?, &mut self.space)?;
        debug!("{} registered with file id {}", reqid, identity.file_id);
        if reserved || self.reserve_or_fail(gid, reqid) {
            self.space_granted(gid, reqid);
        }
        Ok(())
    }

    pub(crate) fn on_namespace_failed(&mut self, reqid: ReqId, error: &Error) {
        let Some(gid) = self.queue.group_of_subreq(reqid) else {
            return;
        };
        warn!("Namespace registration of {} failed: {}", reqid, error);
        self.tell(gid, reqid, &format!("namespace registration failed: {error}"));
        self.fail_file(gid, reqid, error.status_code());
    }

    async fn handle_put(&mut self, client: ClientHandle, req: PutRequest) {
        if let Err(e) = self.check_active() {
            reject(&client, &e);
            return;
        }
        if client.api {
            client.send(Reply::UniqueId(client.unique_id));
        }
        let mut selected: Vec<(ReqId, String)> = Vec::new();
        let mut missing: Vec<Error> = Vec::new();
        for path in &req.user_paths {
            match self.paths.resolve(path) {
                Some(reqid) => selected.push((reqid, path.clone())),
                None => missing.push(Error::NotFound(format!("{path} is not in the stager catalog"))),
            }
        }
        for path in &req.hsm_paths {
            let found = self.catalog.find_by_hsm_path(path);
            if found.is_empty() {
                missing.push(Error::NotFound(format!("{path} is not in the stager catalog")));
            }
            selected.extend(found.into_iter().map(|reqid| (reqid, path.clone())));
        }
        let mut seen = BTreeSet::new();
        selected.retain(|(reqid, _)| seen.insert(*reqid));
        if selected.is_empty() && missing.is_empty() {
            reject(&client, &Error::invalid_argument("nothing to migrate"));
            return;
        }

        let gid = self.queue.enqueue(client, RequestKind::StagePut);
        if let Some(group) = self.queue.get_mut(gid) {
            for e in &missing {
                group.client.error(e.to_string());
                group.note(e.status_code());
            }
        }
        for (reqid, path) in selected {
            if let Err(e) = self.start_put(gid, reqid, &path) {
                warn!("Put of {}: {}", path, e);
                if let Some(group) = self.queue.get_mut(gid) {
                    group.client.error(format!("{path}: {e}"));
                    group.note(e.status_code());
                }
            }
        }
        self.dispatch_group(gid).await;
    }

    fn start_put(&mut self, gid: GroupId, reqid: ReqId, path: &str) -> Result<()> {
        if self.queue.is_busy(reqid) {
            return Err(Error::invalid_argument(format!("request {reqid} is in use")));
        }
        let entry = self.catalog.entry(reqid)?;
        let allowed = self
            .queue
            .get(gid)
            .is_some_and(|g| may_modify(&g.client.info, &entry.requester));
        if !allowed {
            return Err(Error::PermissionDenied(format!("request {reqid} belongs to {}", entry.requester.user)));
        }
        let state = entry.state;
        let next = state.put_started().map_err(|_| {
            Error::invalid_argument(format!(
                "nothing to migrate for request {reqid} ({} {})",
                state.kind, state.modifiers
            ))
        })?;
        self.catalog.set_state(reqid, next, &mut self.space)?;
        self.catalog.update(reqid, |e| e.migrate_after = None)?;
        self.add_file(gid, WaitFileEntry::new(reqid, path));
        Ok(())
    }

    fn handle_update(&mut self, client: ClientHandle, req: &UpdateRequest) {
        let (reqid, internal) = match self.check_update(&client.info, &req.user_path) {
            Ok(found) => found,
            Err(e) => {
                reject(&client, &e);
                return;
            }
        };
        match (req.actual_size, internal) {
            (Some(size), _) => self.finish_write_session(&client, reqid, size),
            (None, Some(path)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = tokio::fs::metadata(&path).await.map(|m| m.len());
                    let _ = events.send(StagerEvent::SizeProbed {
                        client,
                        reqid,
                        result,
                    });
                });
            }
            (None, None) => reject(
                &client,
                &Error::internal(format!("request {reqid} has no disk copy")),
            ),
        }
    }

    fn check_update(&self, client: &ClientInfo, path: &str) -> Result<(ReqId, Option<String>)> {
        let reqid = self
            .paths
            .resolve(path)
            .ok_or_else(|| Error::NotFound(format!("{path} is not in the stager catalog")))?;
        let entry = self.catalog.entry(reqid)?;
        let open = matches!(entry.kind(), RequestKind::StageOut | RequestKind::StageAlloc)
            && entry.modifiers().is_empty();
        if !open {
            return Err(Error::invalid_argument(format!(
                "{path} is not open for writing ({} {})",
                entry.kind(),
                entry.modifiers()
            )));
        }
        if !may_modify(client, &entry.requester) {
            return Err(Error::PermissionDenied(format!(
                "{path} belongs to {}",
                entry.requester.user
            )));
        }
        Ok((reqid, entry.internal_path.clone()))
    }

    pub(crate) fn on_size_probed(
        &mut self,
        client: &ClientHandle,
        reqid: ReqId,
        result: std::io::Result<u64>,
    ) {
        match result {
            Ok(size) => self.finish_write_session(client, reqid, size),
            Err(e) => {
                warn!("Could not size the disk copy of {}: {}", reqid, e);
                reject(client, &Error::Io(e));
            }
        }
    }

    fn finish_write_session(&mut self, client: &ClientHandle, reqid: ReqId, size: u64) {
        match self.close_write_session(client, reqid, size) {
            Ok(status) => client.finish(status),
            Err(e) => {
                error!("Could not close the write session of {}: {}", reqid, e);
                reject(client, &e);
            }
        }
    }

    fn close_write_session(&mut self, client: &ClientHandle, reqid: ReqId, size: u64) -> Result<StatusCode> {
        self.catalog.reconcile(reqid, size, &mut self.space)?;
        self.catalog.close_stream(reqid, &mut self.space)?;
        if size == 0 {
            // Nothing was written: the entry goes away
            for path in self.discard_entry(reqid, true)? {
                client.remove_symlink(path);
            }
            info!("{} closed empty, removed", reqid);
            return Ok(StatusCode::Cleared);
        }

        let entry = self.catalog.entry(reqid)?;
        let hsm = entry.target.is_hsm();
        let delay = self.migration_delay_of(entry);
        match entry.state.write_session_done(hsm, delay == 0)? {
            Transition::To(next) => self.catalog.set_state(reqid, next, &mut self.space)?,
            Transition::Delete => {
                self.discard_entry(reqid, true)?;
                return Ok(StatusCode::Ok);
            }
        }
        if hsm && delay > 0 {
            let due = now_secs() + delay;
            self.catalog.update(reqid, |e| e.migrate_after = Some(due))?;
        }
        self.catalog.update(reqid, StageCatalogEntry::touch)?;
        let entry = self.catalog.entry(reqid)?;
        client.entry(entry.snapshot(self.paths.first_path(reqid)));
        info!("{} closed with {} bytes", reqid, size);
        Ok(StatusCode::Ok)
    }

    fn handle_query(&self, client: &ClientHandle, req: &QueryRequest) {
        let filter = &req.filter;
        let by_path = filter.path.as_deref().map(|p| self.paths.resolve(p));
        let matched: Vec<&StageCatalogEntry> = self
            .catalog
            .iter()
            .filter(|e| !e.dependent)
            .filter(|e| filter.pool.as_deref().is_none_or(|p| e.pool.name() == Some(p)))
            .filter(|e| filter.reqid.is_none_or(|id| e.reqid.get() == id))
            .filter(|e| by_path.is_none_or(|found| found == Some(e.reqid)))
            .filter(|e| {
                filter.vid.as_deref().is_none_or(|vid| {
                    e.target.as_tape().is_some_and(|t| t.vid.as_str() == vid)
                })
            })
            .collect();

        if matched.is_empty() && !req.stats {
            client.error("no entry matches the query");
            client.finish(StatusCode::UserError);
            return;
        }
        for entry in matched {
            let user_path = self.paths.first_path(entry.reqid);
            if client.api {
                client.entry(entry.snapshot(user_path));
            } else {
                client.info(entry_line(entry, user_path.as_deref()));
            }
        }
        if req.stats {
            for stats in self.space.stats() {
                client.info(format!(
                    "POOL {} CAPACITY {} FREE {} ({}%) FILESYSTEMS {} MIGRATION_PENDING {}",
                    stats.name,
                    stats.capacity,
                    stats.free,
                    stats.free.saturating_mul(100).checked_div(stats.capacity).unwrap_or(0),
                    stats.filesystems,
                    stats.migration_pending
                ));
            }
            client.info(format!(
                "QUEUE {} requests, {} workers, {} reclaims",
                self.queue.len(),
                self.queue.running_workers(),
                self.reclaims.len()
            ));
        }
        client.finish(StatusCode::Ok);
    }

    fn clear_matches(&self, selector: &ClearSelector) -> Result<Vec<ReqId>> {
        let matches: Vec<ReqId> = match selector {
            ClearSelector::Path(path) => self.paths.resolve(path).into_iter().collect(),
            ClearSelector::ReqId(id) => {
                let reqid = ReqId::new(*id);
                self.catalog.get(reqid).map(|e| e.reqid).into_iter().collect()
            }
            ClearSelector::Tape { vid, fseq } => {
                let numbers: Option<BTreeSet<u32>> = if fseq.is_empty() {
                    None
                } else {
                    Some(
                        unpack_fseq(fseq)?
                            .files
                            .into_iter()
                            .filter_map(FileSeq::number)
                            .collect(),
                    )
                };
                self.catalog
                    .iter()
                    .filter(|e| {
                        e.target.as_tape().is_some_and(|t| {
                            t.vid.as_str() == vid
                                && numbers.as_ref().is_none_or(|wanted| {
                                    t.fseq.number().is_some_and(|n| wanted.contains(&n))
                                })
                        })
                    })
                    .map(|e| e.reqid)
                    .collect()
            }
            ClearSelector::Pool(pool) => self
                .catalog
                .iter()
                .filter(|e| e.pool.name() == Some(pool.as_str()))
                .map(|e| e.reqid)
                .collect(),
        };
        Ok(matches
            .into_iter()
            .filter(|reqid| self.catalog.get(*reqid).is_some_and(|e| !e.dependent))
            .collect())
    }

    fn handle_clear(&mut self, client: &ClientHandle, req: &ClearRequest) {
        let matches = match self.clear_matches(&req.selector) {
            Ok(matches) => matches,
            Err(e) => {
                reject(client, &e);
                return;
            }
        };
        if matches.is_empty() {
            reject(client, &Error::NotFound("no entry matches".into()));
            return;
        }
        let mut status = StatusCode::Ok;
        for reqid in matches {
            if let Err(e) = self.clear_entry(client, reqid, req.force) {
                client.error(format!("request {reqid}: {e}"));
                status = status.worst(e.status_code());
            }
        }
        client.finish(status);
    }

    fn clear_entry(&mut self, client: &ClientHandle, reqid: ReqId, force: bool) -> Result<()> {
        let entry = self.catalog.entry(reqid)?;
        if !may_modify(&client.info, &entry.requester) {
            return Err(Error::PermissionDenied(format!(
                "request {reqid} belongs to {}",
                entry.requester.user
            )));
        }
        if self.queue.is_busy(reqid) {
            if !force {
                return Err(Error::invalid_argument(format!(
                    "request {reqid} is in use, clear it with force"
                )));
            }
            for gid in self.queue.groups_of_subreq(reqid) {
                if let Some(group) = self.queue.get_mut(gid) {
                    group.complete_file(reqid, StatusCode::Cleared);
                }
            }
            self.resolve(reqid, false);
        }
        for path in self.discard_entry(reqid, true)? {
            client.remove_symlink(path);
        }
        info!("Cleared {} for {}", reqid, client.info.requester.user);
        Ok(())
    }

    fn handle_kill(&mut self, client: &ClientHandle, req: &KillRequest) {
        let sender = &client.info;
        let targets: Vec<GroupId> = self
            .queue
            .iter()
            .filter(|g| {
                let owner = &g.client.info;
                let allowed = sender.requester.is_root()
                    || (owner.requester.uid == sender.requester.uid
                        && owner.requester.gid == sender.requester.gid);
                let matches = if req.unique_id != 0 {
                    g.client.unique_id == req.unique_id
                } else if req.target_pid == 0 {
                    g.client.same_process(sender)
                } else {
                    owner.pid == req.target_pid && owner.host == sender.host
                };
                allowed && matches
            })
            .map(|g| g.id)
            .collect();
        if targets.is_empty() {
            reject(client, &Error::NotFound("no matching request".into()));
            return;
        }
        for gid in targets {
            info!("Killing group {} for {}", gid, sender.requester.user);
            self.kill_group(gid);
        }
        client.finish(StatusCode::Ok);
    }

    fn handle_get(&mut self, client: &ClientHandle, req: &GetRequest) {
        let Some(reqid) = self.paths.resolve(&req.user_path) else {
            reject(
                client,
                &Error::NotFound(format!("{} is not in the stager catalog", req.user_path)),
            );
            return;
        };
        if let Err(e) = self.catalog.update(reqid, StageCatalogEntry::touch) {
            reject(client, &e);
            return;
        }
        if let Some(entry) = self.catalog.get(reqid) {
            if client.api {
                client.entry(entry.snapshot(Some(req.user_path.clone())));
            } else {
                client.info(entry_line(entry, Some(&req.user_path)));
            }
        }
        client.finish(StatusCode::Ok);
    }

    fn handle_file_change(&mut self, client: &ClientHandle, req: &FileChangeRequest) {
        match self.change_file(&client.info, req) {
            Ok(()) => client.finish(StatusCode::Ok),
            Err(e) => reject(client, &e),
        }
    }

    fn change_file(&mut self, client: &ClientInfo, req: &FileChangeRequest) -> Result<()> {
        if req.retention_secs.is_none() && req.migration_delay_secs.is_none() {
            return Err(Error::invalid_argument("nothing to change"));
        }
        let reqid = self.paths.resolve(&req.user_path).ok_or_else(|| {
            Error::NotFound(format!("{} is not in the stager catalog", req.user_path))
        })?;
        let entry = self.catalog.entry(reqid)?;
        if !may_modify(client, &entry.requester) {
            return Err(Error::PermissionDenied(format!(
                "{} belongs to {}",
                req.user_path, entry.requester.user
            )));
        }
        self.catalog.update(reqid, |e| {
            if let Some(retention) = req.retention_secs {
                e.retention_override = Some(retention);
            }
            if let Some(delay) = req.migration_delay_secs {
                e.migration_delay_override = Some(delay);
            }
        })?;

        let entry = self.catalog.entry(reqid)?;
        let waiting_migration = entry.kind() == RequestKind::StageWrite
            && entry.target.is_hsm()
            && !entry.state.counts_for_migration();
        if req.migration_delay_secs.is_some() && waiting_migration {
            let due = now_secs() + self.migration_delay_of(entry);
            self.catalog.update(reqid, |e| e.migrate_after = Some(due))?;
        }
        debug!("Changed retention/migration of {}", reqid);
        Ok(())
    }

    fn handle_init(&mut self, client: ClientHandle, _req: &AdminRequest) {
        if !client.info.requester.is_root() {
            reject(&client, &Error::PermissionDenied("init is reserved to root".into()));
            return;
        }
        if self.init_pending {
            reject(&client, &Error::NotActive("configuration reload in progress".into()));
            return;
        }
        let Some(path) = self.config_path.clone() else {
            self.space.reload(&self.config.pools);
            client.info("pools reset from the loaded configuration");
            client.finish(StatusCode::Ok);
            return;
        };
        self.init_pending = true;
        info!("Reloading configuration from {}", path.display());
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match tokio::fs::read_to_string(&path).await {
                Ok(text) => Config::from_toml_str(&text),
                Err(e) => Err(Error::configuration(format!("{}: {e}", path.display()))),
            };
            let _ = events.send(StagerEvent::ConfigReloaded { client, result });
        });
    }

    pub(crate) fn on_config_reloaded(&mut self, client: &ClientHandle, result: Result<Config>) {
        self.init_pending = false;
        match result {
            Ok(mut config) => {
                // Settings bound at startup stay as they are
                config.daemon.listen.clone_from(&self.config.daemon.listen);
                config.daemon.data_dir.clone_from(&self.config.daemon.data_dir);
                config.daemon.max_reqid = self.config.daemon.max_reqid;
                self.space.reload(&config.pools);
                self.config = config;
                info!("Configuration reloaded: {} pools", self.config.pools.len());
                client.finish(StatusCode::Ok);
            }
            Err(e) => {
                error!("Configuration reload failed: {}", e);
                reject(client, &e);
            }
        }
    }

    fn handle_shutdown(&mut self, client: &ClientHandle, req: &AdminRequest) {
        if !client.info.requester.is_root() {
            reject(client, &Error::PermissionDenied("shutdown is reserved to root".into()));
            return;
        }
        self.begin_shutdown(req.force);
        client.finish(StatusCode::Ok);
    }
}
