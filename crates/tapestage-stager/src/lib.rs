//! Tapestage Stager - the staging coordinator
//!
//! A single coordinator task owns the catalogs, the space allocator and the
//! wait queue. Connection handlers, worker monitors and helper tasks never
//! touch that state; they post a [`StagerEvent`] and the coordinator applies
//! it.
//!
//! ```text
//!  connections ──┐
//!  workers ──────┼──► mpsc<StagerEvent> ──► Stager ──► replies per client
//!  sweep tick ───┘
//! ```

pub mod client;
pub mod coordinator;
pub mod dispatch;
pub mod event;
pub mod fseq;
pub mod namespace;
mod service;
mod sweep;
pub mod waitq;
pub mod worker;

#[cfg(test)]
mod testing;

pub use client::ClientHandle;
pub use coordinator::Stager;
pub use event::StagerEvent;
pub use fseq::{FseqList, unpack_fseq};
pub use namespace::{HsmIdentity, LocalNameServer, NameServer};
pub use waitq::{GroupId, WaitQueue};
pub use worker::{ProcessLauncher, WorkerEvent, WorkerHandle, WorkerId, WorkerLauncher, WorkerSpec};
