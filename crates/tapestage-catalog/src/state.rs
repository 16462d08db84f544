//! Request state machine
//!
//! A catalog entry's state is its [`RequestKind`] together with a set of
//! [`Modifiers`]. Only the pairs listed in [`LEGAL_STATES`] may exist; every
//! transition below computes the next state and checks it against that
//! table before anything is stored.

use serde::{Deserialize, Serialize};
use tapestage_common::{Error, Modifiers, RequestKind, Result};

const NONE: Modifiers = Modifiers::empty();
const STAGED: Modifiers = Modifiers::STAGED;
const WS: Modifiers = Modifiers::WAITING_SPACE;
const WN: Modifiers = Modifiers::WAITING_NAMESPACE;
const CBM: Modifiers = Modifiers::CAN_BE_MIGRATED;
const PARTIAL: Modifiers = Modifiers::STAGED_PARTIAL;
const TRUNC: Modifiers = Modifiers::STAGED_TRUNCATED;
const LAST: Modifiers = Modifiers::LAST_TAPE_FILE;
const RO: Modifiers = Modifiers::READ_ONLY_STAGED;

/// Every (kind, modifier set) pair an entry may be in
pub const LEGAL_STATES: &[(RequestKind, Modifiers)] = &[
    (RequestKind::StageIn, NONE),
    (RequestKind::StageIn, WS),
    (RequestKind::StageIn, STAGED),
    (RequestKind::StageIn, STAGED.union(PARTIAL)),
    (RequestKind::StageIn, STAGED.union(TRUNC)),
    (RequestKind::StageIn, STAGED.union(LAST)),
    (RequestKind::StageIn, STAGED.union(PARTIAL).union(LAST)),
    (RequestKind::StageIn, STAGED.union(TRUNC).union(LAST)),
    (RequestKind::StageIn, STAGED.union(RO)),
    (RequestKind::StageIn, STAGED.union(RO).union(PARTIAL)),
    (RequestKind::StageIn, STAGED.union(RO).union(TRUNC)),
    (RequestKind::StageIn, STAGED.union(RO).union(LAST)),
    (RequestKind::StageOut, NONE),
    (RequestKind::StageOut, WS),
    (RequestKind::StageOut, WN),
    (RequestKind::StageOut, WN.union(WS)),
    (RequestKind::StageOut, Modifiers::PUT_FAILED),
    (RequestKind::StageWrite, NONE),
    (RequestKind::StageWrite, CBM),
    (RequestKind::StagePut, NONE),
    (RequestKind::StagePut, CBM),
    (RequestKind::StageAlloc, NONE),
    (RequestKind::StageAlloc, WS),
    (RequestKind::StageAlloc, STAGED),
    (RequestKind::StageCatalogued, STAGED),
    (RequestKind::StageCatalogued, STAGED.union(RO)),
];

/// Whether a (kind, modifiers) pair is in the whitelist
#[must_use]
pub fn is_legal(kind: RequestKind, modifiers: Modifiers) -> bool {
    LEGAL_STATES
        .iter()
        .any(|(k, m)| *k == kind && *m == modifiers)
}

/// How a recall ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecallResult {
    pub partial: bool,
    pub truncated: bool,
    pub last_tape_file: bool,
    pub read_only: bool,
}

/// State of a catalog entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryState {
    pub kind: RequestKind,
    pub modifiers: Modifiers,
}

/// Result of a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    To(EntryState),
    /// The entry leaves the catalog
    Delete,
}

impl EntryState {
    /// Initial state of a new entry
    pub fn initial(kind: RequestKind, waiting_space: bool) -> Result<Self> {
        let modifiers = match kind {
            RequestKind::StageCatalogued => STAGED,
            _ if waiting_space => WS,
            _ => NONE,
        };
        Self::checked(kind, modifiers)
    }

    /// Build a state, failing fast when the pair is not whitelisted
    pub fn checked(kind: RequestKind, modifiers: Modifiers) -> Result<Self> {
        if is_legal(kind, modifiers) {
            Ok(Self { kind, modifiers })
        } else {
            Err(Error::IllegalTransition {
                kind,
                modifiers: modifiers.to_string(),
            })
        }
    }

    fn with(self, modifiers: Modifiers) -> Result<Self> {
        Self::checked(self.kind, modifiers)
    }

    #[must_use]
    pub const fn is_staged(self) -> bool {
        self.modifiers.contains(STAGED)
    }

    #[must_use]
    pub const fn is_waiting_space(self) -> bool {
        self.modifiers.contains(WS)
    }

    /// The file content is complete on disk and can be served
    #[must_use]
    pub const fn holds_data(self) -> bool {
        match self.kind {
            RequestKind::StageIn | RequestKind::StageAlloc | RequestKind::StageCatalogued => {
                self.is_staged()
            }
            RequestKind::StageWrite | RequestKind::StagePut => true,
            RequestKind::StageOut => self.modifiers.contains(Modifiers::PUT_FAILED),
        }
    }

    /// Counted in its pool's migration-pending counter
    #[must_use]
    pub const fn counts_for_migration(self) -> bool {
        self.modifiers.contains(CBM) && !self.modifiers.contains(Modifiers::PUT_FAILED)
    }

    /// Space could not be reserved yet
    pub fn wait_for_space(self) -> Result<Self> {
        self.with(self.modifiers | WS)
    }

    /// Space was reserved after waiting
    pub fn space_reserved(self) -> Result<Self> {
        self.with(self.modifiers - WS)
    }

    /// An HSM stage-out waits for the namespace to register the file
    pub fn wait_for_namespace(self) -> Result<Self> {
        self.with(self.modifiers | WN)
    }

    pub fn namespace_registered(self) -> Result<Self> {
        self.with(self.modifiers - WN)
    }

    /// A recall worker finished a file
    pub fn recall_done(self, result: RecallResult) -> Result<Self> {
        if self.kind != RequestKind::StageIn {
            return Err(self.illegal());
        }
        let mut modifiers = STAGED;
        if result.partial {
            modifiers |= PARTIAL;
        } else if result.truncated {
            modifiers |= TRUNC;
        }
        if result.last_tape_file {
            modifiers |= LAST;
        }
        if result.read_only {
            modifiers |= RO;
        }
        // Read-only recalls cannot also carry both markers; keep the read-only flag
        if modifiers.contains(RO) && modifiers.contains(LAST) && (result.partial || result.truncated)
        {
            modifiers -= LAST;
        }
        self.with(modifiers)
    }

    /// The client closed its write session.
    ///
    /// `migrate_now` is true for HSM files whose migration delay is zero.
    pub fn write_session_done(self, hsm: bool, migrate_now: bool) -> Result<Transition> {
        match self.kind {
            RequestKind::StageOut => {
                let modifiers = if hsm && migrate_now { CBM } else { NONE };
                Self::checked(RequestKind::StageWrite, modifiers).map(Transition::To)
            }
            RequestKind::StageAlloc => self.with(STAGED).map(Transition::To),
            _ => Err(self.illegal()),
        }
    }

    /// A write worker finished copying an existing disk file to its target
    pub fn write_done(self, hsm: bool, migrate_now: bool) -> Result<Self> {
        if self.kind != RequestKind::StageWrite {
            return Err(self.illegal());
        }
        if hsm {
            self.with(if migrate_now { CBM } else { NONE })
        } else {
            Self::checked(RequestKind::StageIn, STAGED)
        }
    }

    /// The migration delay elapsed
    pub fn promote_for_migration(self) -> Result<Self> {
        if self.kind != RequestKind::StageWrite {
            return Err(self.illegal());
        }
        self.with(CBM)
    }

    /// A put request picked up a written file
    pub fn put_started(self) -> Result<Self> {
        match (self.kind, self.modifiers) {
            (RequestKind::StageWrite, m) => Self::checked(RequestKind::StagePut, m & CBM),
            (RequestKind::StageOut, m) if m == Modifiers::PUT_FAILED => {
                Self::checked(RequestKind::StagePut, NONE)
            }
            _ => Err(self.illegal()),
        }
    }

    /// Migration succeeded
    pub fn put_done(self, hsm: bool) -> Result<Transition> {
        if self.kind != RequestKind::StagePut {
            return Err(self.illegal());
        }
        if hsm {
            Ok(Transition::Delete)
        } else {
            Self::checked(RequestKind::StageIn, STAGED).map(Transition::To)
        }
    }

    /// A staged or written HSM file is opened again for writing
    pub fn reopen_for_write(self) -> Result<Self> {
        let reopenable = match self.kind {
            RequestKind::StageIn => self.is_staged(),
            RequestKind::StageWrite => true,
            RequestKind::StageOut => self.modifiers == Modifiers::PUT_FAILED,
            _ => false,
        };
        if !reopenable {
            return Err(self.illegal());
        }
        Self::checked(RequestKind::StageOut, NONE)
    }

    /// The work on this entry failed for good
    #[must_use]
    pub const fn failed(self) -> Transition {
        match self.kind {
            RequestKind::StageWrite | RequestKind::StagePut => Transition::To(Self {
                kind: RequestKind::StageOut,
                modifiers: Modifiers::PUT_FAILED,
            }),
            _ => Transition::Delete,
        }
    }

    fn illegal(self) -> Error {
        Error::IllegalTransition {
            kind: self.kind,
            modifiers: self.modifiers.to_string(),
        }
    }
}
