//! Worker processes
//!
//! A worker is an external program that performs the blocking part of a
//! job: tape mounts, copies, unlinks. The coordinator only talks to it
//! through the [`WorkerLauncher`] seam; reports and the exit come back as
//! [`WorkerEvent`]s on the coordinator channel.

use crate::event::StagerEvent;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tapestage_common::config::CommandConfig;
use tapestage_common::{Error, Result};
use tapestage_proto::worker::{JobInput, WorkerReport, decode_line};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Time a worker gets to exit after SIGINT before it is killed
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code used when a worker died from a signal
pub const SIGNALLED_EXIT_CODE: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Everything needed to start one worker
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub command: CommandConfig,
    pub input: JobInput,
    pub timeout: Option<Duration>,
}

/// Something a worker did, as seen by the coordinator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Report { worker: WorkerId, report: WorkerReport },
    Exited { worker: WorkerId, code: i32 },
}

/// Coordinator side of a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    #[must_use]
    pub const fn new(id: WorkerId, pid: Option<u32>, kill: Option<oneshot::Sender<()>>) -> Self {
        Self { id, pid, kill }
    }

    /// Ask the monitor to stop the worker. Returns false if already asked.
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker. Its reports and exit arrive later as events.
    async fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle>;
}

/// Runs workers as child processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    events: mpsc::UnboundedSender<StagerEvent>,
}

impl ProcessLauncher {
    #[must_use]
    pub const fn new(events: mpsc::UnboundedSender<StagerEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        let payload = spec
            .input
            .to_lines()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let mut child = Command::new(&spec.command.program)
            .args(&spec.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", spec.command.program.display())))?;

        let pid = child.id();
        info!(
            "Started {} worker {} (pid {:?}) for {} files",
            spec.input.job.kind, spec.id, pid, spec.input.job.files
        );
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let events = self.events.clone();
        tokio::spawn(monitor(
            spec.id,
            child,
            stdin,
            stdout,
            payload,
            kill_rx,
            spec.timeout,
            events,
        ));
        Ok(WorkerHandle::new(spec.id, pid, Some(kill_tx)))
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor(
    id: WorkerId,
    mut child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    payload: String,
    mut kill_rx: oneshot::Receiver<()>,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<StagerEvent>,
) {
    if let Some(mut stdin) = stdin {
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            warn!("Worker {} did not take its job: {}", id, e);
        }
        // closing stdin ends the job description
        drop(stdin);
    }

    let reports = read_reports(id, stdout, &events);
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(reports);
    tokio::pin!(deadline);

    let stop = tokio::select! {
        () = &mut reports => false,
        Ok(()) = &mut kill_rx => {
            info!("Killing worker {}", id);
            true
        }
        () = &mut deadline => {
            warn!("Worker {} exceeded its time limit", id);
            true
        }
    };
    if stop {
        interrupt(id, &mut child).await;
    }

    let code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(SIGNALLED_EXIT_CODE),
        Err(e) => {
            warn!("Could not reap worker {}: {}", id, e);
            SIGNALLED_EXIT_CODE
        }
    };
    debug!("Worker {} exited with {}", id, code);
    let _ = events.send(StagerEvent::Worker(WorkerEvent::Exited { worker: id, code }));
}

async fn read_reports(
    id: WorkerId,
    stdout: Option<ChildStdout>,
    events: &mpsc::UnboundedSender<StagerEvent>,
) {
    let Some(stdout) = stdout else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match decode_line::<WorkerReport>(&line) {
                Ok(report) => {
                    let _ = events.send(StagerEvent::Worker(WorkerEvent::Report {
                        worker: id,
                        report,
                    }));
                }
                Err(e) => warn!("Worker {} wrote an unreadable report: {}", id, e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Lost report channel of worker {}: {}", id, e);
                break;
            }
        }
    }
}

/// SIGINT first so the worker can release its drive, then SIGKILL
async fn interrupt(id: WorkerId, child: &mut Child) {
    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok())
        && let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGINT)
    {
        debug!("SIGINT to worker {} failed: {}", id, e);
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("Worker {} ignored SIGINT, killing it", id);
        if let Err(e) = child.start_kill() {
            warn!("Could not kill worker {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestage_proto::worker::{FileOutcome, JobAction, WorkerJob, WorkerKind};

    fn spec(script: &str, timeout: Option<Duration>) -> WorkerSpec {
        WorkerSpec {
            id: WorkerId(1),
            command: CommandConfig {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), script.into()],
            },
            input: JobInput {
                job: WorkerJob {
                    job_id: 1,
                    kind: WorkerKind::Disk,
                    action: JobAction::Recall,
                    files: 0,
                    concat_off_fseq: None,
                },
                entries: Vec::new(),
            },
            timeout,
        }
    }

    async fn next_worker_event(rx: &mut mpsc::UnboundedReceiver<StagerEvent>) -> WorkerEvent {
        match rx.recv().await {
            Some(StagerEvent::Worker(event)) => event,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_reports_then_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(tx);
        let script = r#"cat > /dev/null; echo '{"reqid":7,"outcome":"staged","actual_size":5}'; exit 0"#;
        launcher.launch(spec(script, None)).await.unwrap();

        let WorkerEvent::Report { report, .. } = next_worker_event(&mut rx).await else {
            panic!("expected a report");
        };
        assert_eq!(report.reqid, 7);
        assert_eq!(report.outcome, FileOutcome::Staged);
        assert_eq!(report.actual_size, 5);
        assert_eq!(
            next_worker_event(&mut rx).await,
            WorkerEvent::Exited {
                worker: WorkerId(1),
                code: 0
            }
        );
    }

    #[tokio::test]
    async fn test_exit_code_without_report() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(tx);
        launcher.launch(spec("exit 28", None)).await.unwrap();
        assert_eq!(
            next_worker_event(&mut rx).await,
            WorkerEvent::Exited {
                worker: WorkerId(1),
                code: 28
            }
        );
    }

    #[tokio::test]
    async fn test_kill_interrupts_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(tx);
        let mut handle = launcher.launch(spec("exec sleep 30", None)).await.unwrap();
        assert!(handle.pid.is_some());
        assert!(handle.kill());
        assert!(!handle.kill());
        assert_eq!(
            next_worker_event(&mut rx).await,
            WorkerEvent::Exited {
                worker: WorkerId(1),
                code: SIGNALLED_EXIT_CODE
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_stops_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(tx);
        launcher
            .launch(spec("exec sleep 30", Some(Duration::from_millis(100))))
            .await
            .unwrap();
        assert!(matches!(
            next_worker_event(&mut rx).await,
            WorkerEvent::Exited { code: SIGNALLED_EXIT_CODE, .. }
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(tx);
        let mut bad = spec("", None);
        bad.command.program = "/nonexistent/tapestage-mover".into();
        assert!(matches!(launcher.launch(bad).await, Err(Error::Spawn(_))));
    }
}
