//! Tapestage Space - disk pool allocator
//!
//! Pools group filesystems that provide disk cache capacity. The allocator
//! hands out reservations (free space is taken before a byte is written),
//! gives them back, and reconciles them with the size that was actually
//! written. It also keeps the per pool migration-pending counters and the
//! garbage collection thresholds the sweep consults.
//!
//! ```text
//!        allocate ──► Pool ──► policy::select ──► Filesystem (free -= size)
//!        release  ──────────────────────────────► Filesystem (free += size)
//!        reconcile ─────────────────────────────► Filesystem (free ± delta, clamped)
//! ```

pub mod allocator;
pub mod policy;
pub mod pool;

pub use allocator::{Allocation, ReconcileOutcome, SpaceAllocator, SpaceRequest};
pub use pool::{Filesystem, Pool, PoolStats};
