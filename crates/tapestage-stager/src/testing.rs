//! Test fixtures shared by the coordinator tests

use crate::client::ClientHandle;
use crate::coordinator::Stager;
use crate::event::StagerEvent;
use crate::namespace::LocalNameServer;
use crate::worker::{WorkerEvent, WorkerHandle, WorkerId, WorkerLauncher, WorkerSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tapestage_common::config::{FilesystemConfig, PoolConfig};
use tapestage_common::{Config, Error, Requester, RequestKind, Result, StatusCode};
use tapestage_proto::worker::WorkerReport;
use tapestage_proto::{
    ClientInfo, HsmFileSpec, MAGIC_V4, Reply, Request, StageRequest, StageSource, TapeSpec,
};
use tokio::sync::{mpsc, oneshot};

pub const CAPACITY: u64 = 10 * 1024 * 1024 * 1024;

/// Records launched workers instead of running them
#[derive(Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<WorkerSpec>>,
    kills: Mutex<Vec<oneshot::Receiver<()>>>,
    fail: AtomicBool,
}

impl FakeLauncher {
    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Whether the n-th launched worker was asked to stop
    pub fn was_killed(&self, index: usize) -> bool {
        self.kills
            .lock()
            .get_mut(index)
            .is_some_and(|rx| rx.try_recv().is_ok())
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Spawn("fake launcher refused".into()));
        }
        let (tx, rx) = oneshot::channel();
        let id = spec.id;
        self.launched.lock().push(spec);
        self.kills.lock().push(rx);
        Ok(WorkerHandle::new(id, Some(4242), Some(tx)))
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.daemon.default_pool_in = Some("public".into());
    config.daemon.default_pool_out = Some("public".into());
    config.daemon.default_file_size = 1024 * 1024;
    config.workers.max_retries = 3;
    config.pools = vec![PoolConfig {
        name: "public".into(),
        gc_start_threshold: 0,
        gc_stop_threshold: 0,
        read_policy: Default::default(),
        write_policy: Default::default(),
        filesystems: vec![FilesystemConfig {
            host: "disk01".into(),
            mount: "/srv/stage/public".into(),
            capacity: CAPACITY,
            free: None,
        }],
    }];
    config
}

pub struct Harness {
    pub stager: Stager,
    pub launcher: Arc<FakeLauncher>,
    pub events: mpsc::UnboundedReceiver<StagerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(adjust: impl FnOnce(&mut Config)) -> Self {
        let mut config = test_config();
        adjust(&mut config);
        let (tx, events) = mpsc::unbounded_channel();
        let launcher = Arc::new(FakeLauncher::default());
        let stager = Stager::new(
            config,
            launcher.clone(),
            Arc::new(LocalNameServer::new(1000)),
            None,
            tx,
        )
        .unwrap();
        Self {
            stager,
            launcher,
            events,
        }
    }

    pub async fn request(&mut self, client: ClientHandle, request: Request) {
        self.stager
            .handle(StagerEvent::Request { client, request })
            .await;
    }

    pub async fn report(&mut self, worker: WorkerId, report: WorkerReport) {
        self.stager
            .handle(StagerEvent::Worker(WorkerEvent::Report { worker, report }))
            .await;
    }

    pub async fn exit(&mut self, worker: WorkerId, code: i32) {
        self.stager
            .handle(StagerEvent::Worker(WorkerEvent::Exited { worker, code }))
            .await;
    }

    pub async fn tick(&mut self) {
        self.stager.handle(StagerEvent::Tick).await;
    }

    /// Apply the next event posted by a task the stager spawned
    pub async fn pump(&mut self) {
        let event = tokio::time::timeout(Duration::from_secs(1), self.events.recv())
            .await
            .expect("no event posted")
            .expect("event channel closed");
        self.stager.handle(event).await;
    }

    pub fn launched(&self) -> usize {
        self.launcher.launched.lock().len()
    }

    pub fn spec(&self, index: usize) -> WorkerSpec {
        self.launcher.launched.lock()[index].clone()
    }

    pub fn free(&self, pool: &str) -> u64 {
        self.stager.space().pool(pool).unwrap().free()
    }

    pub fn capacity(&self, pool: &str) -> u64 {
        self.stager.space().pool(pool).unwrap().capacity()
    }
}

pub fn client_info(pid: u32) -> ClientInfo {
    ClientInfo {
        requester: Requester::new("alice", "cms", 1001, 100),
        host: "node1".into(),
        pid,
    }
}

/// API client with its reply receiver
pub fn client(pid: u32) -> (ClientHandle, mpsc::UnboundedReceiver<Reply>) {
    ClientHandle::channel(client_info(pid), MAGIC_V4, true)
}

pub fn root_client(pid: u32) -> (ClientHandle, mpsc::UnboundedReceiver<Reply>) {
    let mut info = client_info(pid);
    info.requester = Requester::new("root", "root", 0, 0);
    ClientHandle::channel(info, MAGIC_V4, true)
}

pub fn stage(kind: RequestKind, pool: &str, source: StageSource, user_paths: &[&str]) -> Request {
    Request::Stage(StageRequest {
        kind,
        client: client_info(1),
        pool: pool.into(),
        size: 0,
        silent: false,
        read_only: false,
        source,
        user_paths: user_paths.iter().map(ToString::to_string).collect(),
    })
}

pub fn tape_stage(vid: &str, fseq: &str, user_path: &str) -> Request {
    tape_stage_files(vid, fseq, &[user_path])
}

pub fn tape_stage_files(vid: &str, fseq: &str, user_paths: &[&str]) -> Request {
    stage(
        RequestKind::StageIn,
        "",
        StageSource::Tape(TapeSpec {
            vid: vid.into(),
            side: 0,
            label: "al".into(),
            fseq: fseq.into(),
            fids: Vec::new(),
        }),
        user_paths,
    )
}

pub fn hsm_stage(kind: RequestKind, path: &str, file_class: u32, user_path: &str) -> Request {
    stage(
        kind,
        "",
        StageSource::Hsm {
            files: vec![HsmFileSpec {
                path: path.into(),
                server: "ns01".into(),
                file_id: 0,
                file_class,
                foreign: false,
            }],
        },
        &[user_path],
    )
}

/// Skip informational frames up to the terminal status
pub async fn recv_status(rx: &mut mpsc::UnboundedReceiver<Reply>) -> StatusCode {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Reply::Status(status))) => return status,
            Ok(Some(_)) => {}
            Ok(None) => panic!("reply channel closed"),
            Err(_) => panic!("no status received"),
        }
    }
}

/// Every frame currently queued for a client
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Reply>) -> Vec<Reply> {
    let mut replies = Vec::new();
    while let Ok(reply) = rx.try_recv() {
        replies.push(reply);
    }
    replies
}
