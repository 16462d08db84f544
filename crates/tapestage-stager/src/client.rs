//! Reply side of a client call

use tapestage_common::StatusCode;
use tapestage_proto::{ClientInfo, EntrySnapshot, Reply};
use tokio::sync::mpsc;
use tracing::debug;

/// Where the coordinator sends the replies of one client call.
///
/// The connection task owns the receiving end and writes every reply to the
/// socket until the terminal status goes out.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub info: ClientInfo,
    pub magic: u32,
    pub api: bool,
    /// Correlation id handed to API clients, usable to kill the call
    pub unique_id: u64,
    replies: mpsc::UnboundedSender<Reply>,
}

impl ClientHandle {
    #[must_use]
    pub fn new(
        info: ClientInfo,
        magic: u32,
        api: bool,
        replies: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        let unique_id = uuid::Uuid::new_v4().as_u64_pair().0;
        Self {
            info,
            magic,
            api,
            unique_id,
            replies,
        }
    }

    /// Handle plus the receiver the connection task drains
    #[must_use]
    pub fn channel(info: ClientInfo, magic: u32, api: bool) -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(info, magic, api, tx), rx)
    }

    pub fn send(&self, reply: Reply) {
        if self.replies.send(reply).is_err() {
            debug!(
                "Client {}@{} pid {} went away",
                self.info.requester.user, self.info.host, self.info.pid
            );
        }
    }

    pub fn info(&self, line: impl Into<String>) {
        self.send(Reply::Info(line.into()));
    }

    pub fn error(&self, line: impl Into<String>) {
        self.send(Reply::Error(line.into()));
    }

    pub fn symlink(&self, internal_path: impl Into<String>, user_path: impl Into<String>) {
        self.send(Reply::CreateSymlink {
            internal_path: internal_path.into(),
            user_path: user_path.into(),
        });
    }

    pub fn remove_symlink(&self, user_path: impl Into<String>) {
        self.send(Reply::RemoveSymlink {
            user_path: user_path.into(),
        });
    }

    /// Entry frames are only understood by API clients
    pub fn entry(&self, snapshot: EntrySnapshot) {
        if self.api {
            self.send(Reply::Entry(Box::new(snapshot)));
        }
    }

    /// Terminal status; nothing may follow it
    pub fn finish(&self, status: StatusCode) {
        self.send(Reply::Status(status));
    }

    /// Whether `other` describes the same client process
    #[must_use]
    pub fn same_process(&self, other: &ClientInfo) -> bool {
        self.info.pid == other.pid
            && self.info.host == other.host
            && self.info.requester.uid == other.requester.uid
            && self.info.requester.gid == other.requester.gid
    }
}
