//! Name server seam
//!
//! HSM stage-out registers the new file in the namespace before disk space
//! is handed out. Registration runs outside the coordinator and its result
//! comes back as a [`crate::StagerEvent`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tapestage_common::{HsmTarget, Requester, Result};

/// Identity the namespace gave a registered file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HsmIdentity {
    pub file_id: u64,
    pub file_class: u32,
}

#[async_trait]
pub trait NameServer: Send + Sync {
    /// Create (or truncate) `target` in the namespace on behalf of `requester`
    async fn register(&self, target: &HsmTarget, requester: &Requester) -> Result<HsmIdentity>;
}

/// Name server kept inside the daemon: file ids come from a counter
#[derive(Debug)]
pub struct LocalNameServer {
    next_id: AtomicU64,
}

impl LocalNameServer {
    #[must_use]
    pub const fn new(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
        }
    }
}

impl Default for LocalNameServer {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl NameServer for LocalNameServer {
    async fn register(&self, target: &HsmTarget, _requester: &Requester) -> Result<HsmIdentity> {
        // Files already known to the namespace keep their id
        let file_id = if target.file_id != 0 {
            target.file_id
        } else {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        };
        Ok(HsmIdentity {
            file_id,
            file_class: target.file_class,
        })
    }
}
