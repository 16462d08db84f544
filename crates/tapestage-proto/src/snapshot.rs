//! Flat view of a catalog entry handed to clients and workers

use serde::{Deserialize, Serialize};
use tapestage_common::{Modifiers, RequestKind, Requester, Target};

/// Catalog entry as seen from outside the stager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub reqid: u32,
    pub kind: RequestKind,
    pub modifiers: Modifiers,
    pub target: Target,
    /// Pool name or `NOPOOL`
    pub pool: String,
    pub internal_path: Option<String>,
    /// First visible path registered for the entry
    pub user_path: Option<String>,
    pub requester: Requester,
    pub requested_size: u64,
    pub actual_size: u64,
    pub nb_accesses: u32,
    pub created_at: u64,
    pub last_access_at: u64,
}

impl EntrySnapshot {
    /// Whether the entry describes a file that is present in the disk cache
    #[must_use]
    pub const fn is_staged(&self) -> bool {
        self.modifiers.contains(Modifiers::STAGED)
    }
}
