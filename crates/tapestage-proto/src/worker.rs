//! Messages exchanged with worker processes
//!
//! A worker receives one [`WorkerJob`] line on stdin followed by one
//! [`EntrySnapshot`] line per file, then stdin is closed. It answers with
//! one [`WorkerReport`] line per file on stdout and exits. When it exits
//! without reporting, the stager uses the exit code for every file.

use crate::error::ProtoResult;
use crate::snapshot::EntrySnapshot;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

/// Which worker program runs a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Tape,
    Disk,
    Hsm,
    ForeignHsm,
    Reclaim,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tape => "tape",
            Self::Disk => "disk",
            Self::Hsm => "hsm",
            Self::ForeignHsm => "foreign_hsm",
            Self::Reclaim => "reclaim",
        };
        f.write_str(name)
    }
}

/// What the worker is asked to do with the files
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Copy from the target into the internal path
    Recall,
    /// Copy an existing disk file to its target
    Write,
    /// Migrate a written file to its target
    Migrate,
    /// Remove internal files to free space
    Reclaim,
}

/// First line sent to a worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub job_id: u64,
    pub kind: WorkerKind,
    pub action: JobAction,
    /// Number of entry lines that follow
    pub files: usize,
    /// Last file sequence to recall when reading a concatenated range
    #[serde(default)]
    pub concat_off_fseq: Option<u32>,
}

/// Outcome of one file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    /// Fully copied to disk
    Staged,
    /// Recall stopped before the end of the file
    Partial,
    /// File was truncated to the requested size
    Truncated,
    /// Write or migration finished
    Written,
    /// Internal file removed by a reclaim pass
    Removed,
    Failed,
}

/// Per file report written by a worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub reqid: u32,
    pub outcome: FileOutcome,
    #[serde(default)]
    pub actual_size: u64,
    /// Bytes the worker expected to copy, when known
    #[serde(default)]
    pub bytes_expected: u64,
    /// Exit-code style status for failures
    #[serde(default)]
    pub code: i32,
    /// The file is the last one on its tape
    #[serde(default)]
    pub last_tape_file: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl WorkerReport {
    #[must_use]
    pub const fn success(reqid: u32, outcome: FileOutcome, actual_size: u64) -> Self {
        Self {
            reqid,
            outcome,
            actual_size,
            bytes_expected: actual_size,
            code: 0,
            last_tape_file: false,
            message: None,
        }
    }

    #[must_use]
    pub fn failure(reqid: u32, code: i32, message: impl Into<String>) -> Self {
        Self {
            reqid,
            outcome: FileOutcome::Failed,
            actual_size: 0,
            bytes_expected: 0,
            code,
            last_tape_file: false,
            message: Some(message.into()),
        }
    }
}

/// Serialize one message as a JSON line, newline included
pub fn encode_line<T: Serialize>(value: &T) -> ProtoResult<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parse one JSON line
pub fn decode_line<T: DeserializeOwned>(line: &str) -> ProtoResult<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Everything a worker reads from stdin
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInput {
    pub job: WorkerJob,
    pub entries: Vec<EntrySnapshot>,
}

impl JobInput {
    /// Render the stdin payload of a job
    pub fn to_lines(&self) -> ProtoResult<String> {
        let mut out = encode_line(&self.job)?;
        for entry in &self.entries {
            out.push_str(&encode_line(entry)?);
        }
        Ok(out)
    }

    /// Parse the stdin payload of a job
    pub fn from_lines(text: &str) -> ProtoResult<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let first = lines
            .next()
            .ok_or_else(|| crate::error::ProtoError::Malformed("empty job input".into()))?;
        let job: WorkerJob = decode_line(first)?;
        let entries = lines.map(decode_line).collect::<ProtoResult<Vec<_>>>()?;
        if entries.len() != job.files {
            return Err(crate::error::ProtoError::Malformed(format!(
                "job announces {} files, got {}",
                job.files,
                entries.len()
            )));
        }
        Ok(Self { job, entries })
    }
}
