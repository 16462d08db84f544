//! Redb table definitions for the persisted catalogs.

use redb::TableDefinition;

// Key: reqid, Value: bincode-encoded StageCatalogEntry
pub const STAGE_ENTRIES: TableDefinition<u32, &[u8]> = TableDefinition::new("stage_entries");
// Key: user-visible path, Value: reqid
pub const STAGE_PATHS: TableDefinition<&str, u32> = TableDefinition::new("stage_paths");
// Singletons such as the last assigned reqid
pub const STAGE_META: TableDefinition<&str, u64> = TableDefinition::new("stage_meta");

pub const META_LAST_REQID: &str = "last_reqid";
