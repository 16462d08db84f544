//! Stage catalog entries

use crate::state::EntryState;
use serde::{Deserialize, Serialize};
use tapestage_common::{Modifiers, PoolAssignment, ReqId, RequestKind, Requester, Target, now_secs};
use tapestage_proto::EntrySnapshot;
use tapestage_space::Allocation;

/// One cached copy (or a copy being produced) of an external file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCatalogEntry {
    pub reqid: ReqId,
    pub state: EntryState,
    pub target: Target,
    pub pool: PoolAssignment,
    /// Path of the disk copy, set once space is reserved or a file adopted
    pub internal_path: Option<String>,
    pub requester: Requester,
    pub requested_size: u64,
    pub actual_size: u64,
    pub nb_accesses: u32,
    pub created_at: u64,
    pub last_access_at: u64,
    /// Waits on another entry of the same file and is never matched itself
    pub dependent: bool,
    pub retention_override: Option<u64>,
    pub migration_delay_override: Option<u64>,
    /// When a delayed HSM write becomes eligible for migration
    pub migrate_after: Option<u64>,
    /// Entry was created to continue a concatenated tape read
    pub concat_continuation: bool,
    /// Space held on a filesystem; taken exactly once when released
    pub reservation: Option<Allocation>,
}

impl StageCatalogEntry {
    #[must_use]
    pub fn new(
        reqid: ReqId,
        state: EntryState,
        target: Target,
        pool: PoolAssignment,
        requester: Requester,
        requested_size: u64,
    ) -> Self {
        let now = now_secs();
        Self {
            reqid,
            state,
            target,
            pool,
            internal_path: None,
            requester,
            requested_size,
            actual_size: 0,
            nb_accesses: 0,
            created_at: now,
            last_access_at: now,
            dependent: false,
            retention_override: None,
            migration_delay_override: None,
            migrate_after: None,
            concat_continuation: false,
            reservation: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.state.kind
    }

    #[must_use]
    pub const fn modifiers(&self) -> Modifiers {
        self.state.modifiers
    }

    /// Pool the reserved bytes are accounted in
    #[must_use]
    pub fn accounting_pool(&self) -> Option<&str> {
        self.reservation
            .as_ref()
            .map(|r| r.pool.as_str())
            .or_else(|| self.pool.name())
    }

    /// Attach a reservation and point the internal path at it
    pub fn reserve(&mut self, allocation: Allocation) {
        self.internal_path = Some(allocation.path.display().to_string());
        self.reservation = Some(allocation);
    }

    /// Record a client access
    pub fn touch(&mut self) {
        self.nb_accesses = self.nb_accesses.saturating_add(1);
        self.last_access_at = now_secs();
    }

    /// Flat view for replies and worker input
    #[must_use]
    pub fn snapshot(&self, user_path: Option<String>) -> EntrySnapshot {
        EntrySnapshot {
            reqid: self.reqid.get(),
            kind: self.state.kind,
            modifiers: self.state.modifiers,
            target: self.target.clone(),
            pool: self.pool.to_string(),
            internal_path: self.internal_path.clone(),
            user_path,
            requester: self.requester.clone(),
            requested_size: self.requested_size,
            actual_size: self.actual_size,
            nb_accesses: self.nb_accesses,
            created_at: self.created_at,
            last_access_at: self.last_access_at,
        }
    }
}
