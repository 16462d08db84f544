//! Wait queue and dependency graph
//!
//! One [`RequestGroup`] per client call. Each file of the call is a
//! [`WaitFileEntry`] pointing at a catalog entry by id. A file that rides
//! along on a recall already in flight records the driving entry in
//! `waiting_on`; when the driver ends, [`WaitQueue::resolve`] tells the
//! coordinator which waiters to complete or re-chain.

use crate::client::ClientHandle;
use crate::worker::{WorkerHandle, WorkerId};
use std::collections::BTreeMap;
use std::fmt;
use tapestage_common::{ReqId, RequestKind, StatusCode};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// One file of a client call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitFileEntry {
    pub subreqid: ReqId,
    /// Entry whose recall this file waits for
    pub waiting_on: Option<ReqId>,
    pub user_path: String,
    pub bytes_copied: u64,
    pub bytes_expected: u64,
    /// Set once the file is terminal
    pub outcome: Option<StatusCode>,
    /// Part of the job given to the current worker
    pub dispatched: bool,
    /// The current worker sent a report for this file
    pub reported: bool,
}

impl WaitFileEntry {
    #[must_use]
    pub fn new(subreqid: ReqId, user_path: impl Into<String>) -> Self {
        Self {
            subreqid,
            waiting_on: None,
            user_path: user_path.into(),
            bytes_copied: 0,
            bytes_expected: 0,
            outcome: None,
            dispatched: false,
            reported: false,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Work done on behalf of one client call
#[derive(Debug)]
pub struct RequestGroup {
    pub id: GroupId,
    pub client: ClientHandle,
    pub kind: RequestKind,
    /// Worst outcome so far
    pub status: StatusCode,
    pub retries: u32,
    pub space_retries: u32,
    pub worker: Option<WorkerHandle>,
    /// Pool (or `*`) whose free space the group is parked on
    pub waiting_space: Option<String>,
    pub concat_off_fseq: Option<u32>,
    pub read_only: bool,
    pub silent: bool,
    pub killed: bool,
    pub files: Vec<WaitFileEntry>,
}

impl RequestGroup {
    #[must_use]
    pub fn new(id: GroupId, client: ClientHandle, kind: RequestKind) -> Self {
        Self {
            id,
            client,
            kind,
            status: StatusCode::Ok,
            retries: 0,
            space_retries: 0,
            worker: None,
            waiting_space: None,
            concat_off_fseq: None,
            read_only: false,
            silent: false,
            killed: false,
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, file: WaitFileEntry) {
        self.files.push(file);
    }

    #[must_use]
    pub fn file(&self, subreqid: ReqId) -> Option<&WaitFileEntry> {
        self.files
            .iter()
            .find(|f| f.subreqid == subreqid && f.is_pending())
    }

    pub fn file_mut(&mut self, subreqid: ReqId) -> Option<&mut WaitFileEntry> {
        self.files
            .iter_mut()
            .find(|f| f.subreqid == subreqid && f.is_pending())
    }

    /// Record the outcome of a pending file and fold it into the group status.
    /// Returns false when the file was not pending.
    pub fn complete_file(&mut self, subreqid: ReqId, status: StatusCode) -> bool {
        let Some(file) = self.file_mut(subreqid) else {
            return false;
        };
        file.outcome = Some(status);
        file.waiting_on = None;
        self.status = self.status.worst(status);
        true
    }

    /// Fold a status that belongs to no file (rejected file of the call)
    pub const fn note(&mut self, status: StatusCode) {
        self.status = self.status.worst(status);
    }

    pub fn pending(&self) -> impl Iterator<Item = &WaitFileEntry> {
        self.files.iter().filter(|f| f.is_pending())
    }

    /// Pending files that do not wait on another entry
    #[must_use]
    pub fn driving(&self) -> Vec<ReqId> {
        self.pending()
            .filter(|f| f.waiting_on.is_none())
            .map(|f| f.subreqid)
            .collect()
    }

    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.pending().filter(|f| f.waiting_on.is_some()).count()
    }

    /// Nothing left to do: every file is terminal, no worker, no space wait
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_none() && self.waiting_space.is_none() && self.pending().next().is_none()
    }
}

/// What [`WaitQueue::resolve`] decided for the waiters of a driving entry
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The driver holds the data; every waiter completes from it
    Succeeded(Vec<(GroupId, ReqId)>),
    /// The driver failed. The first waiter drives now and the followers
    /// were re-chained to it.
    Rechained {
        promoted: Option<(GroupId, ReqId)>,
        followers: Vec<(GroupId, ReqId)>,
    },
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    groups: BTreeMap<GroupId, RequestGroup>,
    next_id: u64,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a group for a client call. Files are added as they are processed.
    pub fn enqueue(&mut self, client: ClientHandle, kind: RequestKind) -> GroupId {
        self.next_id += 1;
        let id = GroupId(self.next_id);
        self.groups.insert(id, RequestGroup::new(id, client, kind));
        debug!("Enqueued group {} ({})", id, kind);
        id
    }

    #[must_use]
    pub fn get(&self, id: GroupId) -> Option<&RequestGroup> {
        self.groups.get(&id)
    }

    pub fn get_mut(&mut self, id: GroupId) -> Option<&mut RequestGroup> {
        self.groups.get_mut(&id)
    }

    pub fn remove(&mut self, id: GroupId) -> Option<RequestGroup> {
        self.groups.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestGroup> {
        self.groups.values()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Make a pending file wait for `driving`
    pub fn attach_dependent(&mut self, group: GroupId, subreqid: ReqId, driving: ReqId) -> bool {
        match self.groups.get_mut(&group).and_then(|g| g.file_mut(subreqid)) {
            Some(file) => {
                file.waiting_on = Some(driving);
                debug!("{} waits on {} in group {}", subreqid, driving, group);
                true
            }
            None => false,
        }
    }

    /// Pending files waiting on `driving`, in arrival order
    #[must_use]
    pub fn dependents_of(&self, driving: ReqId) -> Vec<(GroupId, ReqId)> {
        self.groups
            .values()
            .flat_map(|g| {
                g.pending()
                    .filter(move |f| f.waiting_on == Some(driving))
                    .map(move |f| (g.id, f.subreqid))
            })
            .collect()
    }

    /// Settle the waiters of a driving entry that just ended
    pub fn resolve(&mut self, driving: ReqId, success: bool) -> Resolution {
        let waiters = self.dependents_of(driving);
        if success {
            return Resolution::Succeeded(waiters);
        }
        let mut iter = waiters.into_iter();
        let Some(first) = iter.next() else {
            return Resolution::Rechained {
                promoted: None,
                followers: Vec::new(),
            };
        };
        if let Some(file) = self.groups.get_mut(&first.0).and_then(|g| g.file_mut(first.1)) {
            file.waiting_on = None;
        }
        let followers: Vec<(GroupId, ReqId)> = iter.collect();
        for (group, subreqid) in &followers {
            self.attach_dependent(*group, *subreqid, first.1);
        }
        debug!(
            "{} failed, {} drives now with {} followers",
            driving,
            first.1,
            followers.len()
        );
        Resolution::Rechained {
            promoted: Some(first),
            followers,
        }
    }

    #[must_use]
    pub fn group_of_worker(&self, worker: WorkerId) -> Option<GroupId> {
        self.groups
            .values()
            .find(|g| g.worker.as_ref().is_some_and(|w| w.id == worker))
            .map(|g| g.id)
    }

    /// Group holding a pending file for `subreqid`
    #[must_use]
    pub fn group_of_subreq(&self, subreqid: ReqId) -> Option<GroupId> {
        self.groups
            .values()
            .find(|g| g.file(subreqid).is_some())
            .map(|g| g.id)
    }

    /// Groups holding a pending file for `subreqid`
    #[must_use]
    pub fn groups_of_subreq(&self, subreqid: ReqId) -> Vec<GroupId> {
        self.groups
            .values()
            .filter(|g| g.file(subreqid).is_some())
            .map(|g| g.id)
            .collect()
    }

    /// Whether some pending file works on or waits for `reqid`
    #[must_use]
    pub fn is_busy(&self, reqid: ReqId) -> bool {
        self.groups.values().any(|g| {
            g.pending()
                .any(|f| f.subreqid == reqid || f.waiting_on == Some(reqid))
        })
    }

    /// Workers currently attached to groups
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.groups.values().filter(|g| g.worker.is_some()).count()
    }
}
