//! Tapestage Catalog - request and path catalogs
//!
//! ```text
//!   user path ──► PathCatalog ──► ReqId ──► StageCatalog ──► StageCatalogEntry
//!                                                               │
//!                                              state (kind + modifiers)
//!                                              reservation ──► SpaceAllocator
//! ```
//!
//! Both catalogs are owned by the coordinator. When a [`CatalogStore`] is
//! attached every mutation is written through to redb, and [`recover`]
//! brings the restored catalogs back to a consistent state at startup.

pub mod catalog;
pub mod entry;
pub mod paths;
pub mod recovery;
pub mod state;
pub mod store;
mod tables;

pub use catalog::StageCatalog;
pub use entry::StageCatalogEntry;
pub use paths::PathCatalog;
pub use recovery::{RecoveryReport, recover};
pub use state::{EntryState, LEGAL_STATES, RecallResult, Transition, is_legal};
pub use store::{CatalogStore, CatalogStoreError, CatalogStoreResult};
