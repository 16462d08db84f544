//! Messages posted to the coordinator task

use crate::client::ClientHandle;
use crate::namespace::HsmIdentity;
use crate::worker::WorkerEvent;
use tapestage_common::{Config, Error, ReqId, Result};
use tapestage_proto::Request;

/// Everything that can wake the coordinator up
#[derive(Debug)]
pub enum StagerEvent {
    /// A decoded client request together with its reply sink
    Request {
        client: ClientHandle,
        request: Request,
    },
    /// A client connection took a descriptor slot
    ConnectionOpened,
    ConnectionClosed,
    Worker(WorkerEvent),
    /// Size of a written file, probed for an update callback
    SizeProbed {
        client: ClientHandle,
        reqid: ReqId,
        result: std::io::Result<u64>,
    },
    NamespaceRegistered {
        reqid: ReqId,
        identity: HsmIdentity,
    },
    NamespaceFailed {
        reqid: ReqId,
        error: Error,
    },
    /// Configuration file re-read for an init request
    ConfigReloaded {
        client: ClientHandle,
        result: Result<Config>,
    },
    /// Sweep outside the regular tick
    Tick,
    /// Stop accepting work and kill running workers
    Shutdown,
}
