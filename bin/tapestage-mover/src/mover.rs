//! Disk mover
//!
//! Copies files between their disk target and the stage pool, and removes
//! internal files for reclaim jobs. Any other target is a configuration
//! mistake and every file of the job fails.

use std::io;
use std::path::Path;
use tapestage_common::{StatusCode, Target};
use tapestage_proto::EntrySnapshot;
use tapestage_proto::worker::{FileOutcome, JobAction, JobInput, WorkerReport, encode_line};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const USER_ERROR: i32 = 1;
const SYSTEM_ERROR: i32 = 2;
const CONFIG_ERROR: i32 = 4;
const NO_SPACE: i32 = 28;

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => USER_ERROR,
        io::ErrorKind::StorageFull => NO_SPACE,
        _ => SYSTEM_ERROR,
    }
}

async fn copy(from: &Path, to: &Path) -> io::Result<u64> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await
}

async fn reclaim(entry: &EntrySnapshot) -> WorkerReport {
    let Some(path) = entry.internal_path.as_deref() else {
        return WorkerReport::success(entry.reqid, FileOutcome::Removed, 0);
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => WorkerReport::success(entry.reqid, FileOutcome::Removed, 0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} already gone", path);
            WorkerReport::success(entry.reqid, FileOutcome::Removed, 0)
        }
        Err(e) => WorkerReport::failure(entry.reqid, io_code(&e), format!("{path}: {e}")),
    }
}

async fn move_file(action: JobAction, entry: &EntrySnapshot) -> WorkerReport {
    if action == JobAction::Reclaim {
        return reclaim(entry).await;
    }
    let Target::Disk(disk) = &entry.target else {
        return WorkerReport::failure(
            entry.reqid,
            CONFIG_ERROR,
            format!("target {} is not a disk file", entry.target),
        );
    };
    let Some(internal) = entry.internal_path.as_deref() else {
        return WorkerReport::failure(entry.reqid, USER_ERROR, "no internal path");
    };
    let external = Path::new(disk.external_path.as_str());
    let internal = Path::new(internal);

    let (from, to, outcome) = match action {
        JobAction::Recall => (external, internal, FileOutcome::Staged),
        _ => (internal, external, FileOutcome::Written),
    };
    match copy(from, to).await {
        Ok(size) => {
            info!("{} -> {} ({} bytes)", from.display(), to.display(), size);
            WorkerReport::success(entry.reqid, outcome, size)
        }
        Err(e) => {
            warn!("{} -> {} failed: {}", from.display(), to.display(), e);
            WorkerReport::failure(
                entry.reqid,
                io_code(&e),
                format!("{} -> {}: {e}", from.display(), to.display()),
            )
        }
    }
}

/// Run every file of a job, writing one report line per file to `out`.
///
/// Returns the exit code of the job: the most severe failure code, or 0.
pub async fn run_job<W>(input: &JobInput, out: &mut W) -> io::Result<i32>
where
    W: AsyncWrite + Unpin,
{
    info!(
        "Job {}: {:?} of {} files",
        input.job.job_id, input.job.action, input.job.files
    );
    let mut worst = 0;
    for entry in &input.entries {
        let report = move_file(input.job.action, entry).await;
        if report.code != 0
            && StatusCode::from_exit_code(report.code).severity()
                > StatusCode::from_exit_code(worst).severity()
        {
            worst = report.code;
        }
        let line = encode_line(&report).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.write_all(line.as_bytes()).await?;
    }
    out.flush().await?;
    Ok(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestage_common::{
        DiskTarget, HsmSystem, HsmTarget, Modifiers, RequestKind, Requester, StagePath,
    };
    use tapestage_proto::worker::{WorkerJob, WorkerKind, decode_line};

    fn entry(reqid: u32, external: &Path, internal: &Path) -> EntrySnapshot {
        EntrySnapshot {
            reqid,
            kind: RequestKind::StageIn,
            modifiers: Modifiers::empty(),
            target: Target::Disk(DiskTarget {
                external_path: StagePath::new(external.to_string_lossy()).unwrap(),
            }),
            pool: "public".into(),
            internal_path: Some(internal.to_string_lossy().into_owned()),
            user_path: None,
            requester: Requester::new("alice", "cms", 1001, 100),
            requested_size: 0,
            actual_size: 0,
            nb_accesses: 1,
            created_at: 1,
            last_access_at: 1,
        }
    }

    fn job(action: JobAction, entries: Vec<EntrySnapshot>) -> JobInput {
        JobInput {
            job: WorkerJob {
                job_id: 1,
                kind: WorkerKind::Disk,
                action,
                files: entries.len(),
                concat_off_fseq: None,
            },
            entries,
        }
    }

    fn reports(out: &[u8]) -> Vec<WorkerReport> {
        std::str::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_recall_copies_into_pool() {
        let dir = tempfile::tempdir().unwrap();
        let external = dir.path().join("archive/run1.dat");
        std::fs::create_dir_all(external.parent().unwrap()).unwrap();
        std::fs::write(&external, b"0123456789").unwrap();
        let internal = dir.path().join("pool/run1.dat.1");

        let mut out = Vec::new();
        let code = run_job(&job(JobAction::Recall, vec![entry(1, &external, &internal)]), &mut out)
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(std::fs::read(&internal).unwrap(), b"0123456789");
        let reports = reports(&out);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, FileOutcome::Staged);
        assert_eq!(reports[0].actual_size, 10);
    }

    #[tokio::test]
    async fn test_migrate_writes_target() {
        let dir = tempfile::tempdir().unwrap();
        let internal = dir.path().join("pool/out.1");
        std::fs::create_dir_all(internal.parent().unwrap()).unwrap();
        std::fs::write(&internal, b"abc").unwrap();
        let external = dir.path().join("archive/deep/out");

        let mut out = Vec::new();
        let code = run_job(&job(JobAction::Migrate, vec![entry(4, &external, &internal)]), &mut out)
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(std::fs::read(&external).unwrap(), b"abc");
        assert_eq!(reports(&out)[0].outcome, FileOutcome::Written);
    }

    #[tokio::test]
    async fn test_missing_source_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::write(&good, b"x").unwrap();
        let input = job(
            JobAction::Recall,
            vec![
                entry(1, &dir.path().join("missing"), &dir.path().join("a")),
                entry(2, &good, &dir.path().join("b")),
            ],
        );

        let mut out = Vec::new();
        let code = run_job(&input, &mut out).await.unwrap();

        assert_eq!(code, USER_ERROR);
        let reports = reports(&out);
        assert_eq!(reports[0].outcome, FileOutcome::Failed);
        assert_eq!(reports[0].code, USER_ERROR);
        assert_eq!(reports[1].outcome, FileOutcome::Staged);
    }

    #[tokio::test]
    async fn test_reclaim_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::write(&present, b"x").unwrap();
        let input = job(
            JobAction::Reclaim,
            vec![
                entry(1, Path::new("/archive/a"), &present),
                entry(2, Path::new("/archive/b"), &dir.path().join("gone")),
            ],
        );

        let mut out = Vec::new();
        assert_eq!(run_job(&input, &mut out).await.unwrap(), 0);
        assert!(!present.exists());
        assert!(reports(&out).iter().all(|r| r.outcome == FileOutcome::Removed));
    }

    #[tokio::test]
    async fn test_hsm_target_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut hsm = entry(1, Path::new("/archive/a"), &dir.path().join("a"));
        hsm.target = Target::Hsm(HsmTarget {
            path: StagePath::new("/castor/cern.ch/a").unwrap(),
            server: "ns1".into(),
            file_id: 12,
            file_class: 0,
            system: HsmSystem::Native,
        });
        let mut out = Vec::new();
        assert_eq!(
            run_job(&job(JobAction::Recall, vec![hsm]), &mut out).await.unwrap(),
            CONFIG_ERROR
        );
    }
}
