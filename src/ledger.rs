//! Receipt ledgers: one append-only TSV per stage run.
//!
//! Rows are written and synced one at a time, so an interrupted batch leaves
//! a ledger that lists exactly the attempts that finished.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::domain::{AssemblyName, AttemptStatus, Stage, StageState};
use crate::error::SubmitError;
use crate::workspace::{LEDGER_PREFIX, Workspace};

pub const LEDGER_COLUMNS: [&str; 4] = ["assembly_name", "status", "log_file", "timestamp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionAttempt {
    pub assembly_name: AssemblyName,
    pub stage: Stage,
    pub status: AttemptStatus,
    pub log_file: String,
    pub timestamp: String,
}

impl SubmissionAttempt {
    pub fn new(
        assembly_name: AssemblyName,
        stage: Stage,
        status: AttemptStatus,
        log_file: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            assembly_name,
            stage,
            status,
            log_file: log_file.into(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

pub struct ReceiptLedger {
    path: Utf8PathBuf,
    stage: Stage,
    writer: csv::Writer<File>,
    rows: usize,
}

impl ReceiptLedger {
    /// Creates `receipts/submission_receipts_<stage>_<timestamp>.tsv`. A name
    /// taken by an earlier run in the same second gets a `_<n>` suffix; an
    /// existing ledger is never opened for writing.
    pub fn create(
        workspace: &Workspace,
        stage: Stage,
        started: DateTime<Utc>,
    ) -> Result<Self, SubmitError> {
        let dir = workspace.receipts_dir();
        Workspace::ensure_dir(&dir)?;
        let base = format!(
            "{LEDGER_PREFIX}{}_{}",
            stage.as_str(),
            started.format("%Y%m%dT%H%M%S")
        );

        let mut counter = 0u32;
        let (path, file) = loop {
            let name = if counter == 0 {
                format!("{base}.tsv")
            } else {
                format!("{base}_{counter}.tsv")
            };
            let path = dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path.as_std_path())
            {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => counter += 1,
                Err(err) => {
                    return Err(SubmitError::Filesystem(format!("create {path}: {err}")));
                }
            }
        };

        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(file);
        let mut ledger = Self {
            path,
            stage,
            writer,
            rows: 0,
        };
        ledger.write_row(LEDGER_COLUMNS)?;
        tracing::info!(ledger = %ledger.path, "receipt ledger created");
        Ok(ledger)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Appends one attempt and pushes it to disk before returning.
    pub fn append(&mut self, attempt: &SubmissionAttempt) -> Result<(), SubmitError> {
        if attempt.stage != self.stage {
            return Err(SubmitError::Filesystem(format!(
                "{} attempt written to {} ledger",
                attempt.stage, self.stage
            )));
        }
        self.write_row([
            attempt.assembly_name.as_str(),
            attempt.status.as_str(),
            attempt.log_file.as_str(),
            attempt.timestamp.as_str(),
        ])?;
        self.rows += 1;
        Ok(())
    }

    fn write_row(&mut self, row: [&str; 4]) -> Result<(), SubmitError> {
        let to_fs = |err: std::io::Error| SubmitError::Filesystem(format!("ledger: {err}"));
        self.writer
            .write_record(row)
            .map_err(|err| SubmitError::Filesystem(format!("ledger: {err}")))?;
        self.writer.flush().map_err(to_fs)?;
        self.writer.get_ref().sync_data().map_err(to_fs)
    }
}

/// Stage encoded in a ledger file name.
pub fn ledger_stage(path: &Utf8Path) -> Option<Stage> {
    let rest = path.file_name()?.strip_prefix(LEDGER_PREFIX)?;
    Stage::ALL
        .into_iter()
        .find(|stage| rest.starts_with(&format!("{}_", stage.as_str())))
}

/// Reads every attempt of one ledger in file order. A torn last row (crash
/// mid-write) is skipped with a warning.
pub fn read_ledger(path: &Utf8Path) -> Result<Vec<SubmissionAttempt>, SubmitError> {
    let stage = ledger_stage(path)
        .ok_or_else(|| SubmitError::Filesystem(format!("not a receipt ledger: {path}")))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path.as_std_path())
        .map_err(|err| SubmitError::Table {
            path: path.as_std_path().to_path_buf(),
            message: err.to_string(),
        })?;

    let mut attempts = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|err| SubmitError::Table {
            path: path.as_std_path().to_path_buf(),
            message: err.to_string(),
        })?;
        let parsed = (|| {
            let name = row.get(0)?.parse::<AssemblyName>().ok()?;
            let status = row.get(1)?.parse::<AttemptStatus>().ok()?;
            Some(SubmissionAttempt {
                assembly_name: name,
                stage,
                status,
                log_file: row.get(2)?.to_string(),
                timestamp: row.get(3)?.to_string(),
            })
        })();
        match parsed {
            Some(attempt) => attempts.push(attempt),
            None => tracing::warn!(ledger = %path, row = index + 2, "skipping unreadable ledger row"),
        }
    }
    Ok(attempts)
}

/// All ledgers of a workspace, replayed oldest first.
#[derive(Debug, Default, Clone)]
pub struct LedgerHistory {
    attempts: Vec<SubmissionAttempt>,
    latest: BTreeMap<(AssemblyName, Stage), usize>,
}

impl LedgerHistory {
    pub fn load(workspace: &Workspace) -> Result<Self, SubmitError> {
        let mut history = Self::default();
        for path in workspace.list_ledgers()? {
            for attempt in read_ledger(&path)? {
                history.push(attempt);
            }
        }
        Ok(history)
    }

    pub fn push(&mut self, attempt: SubmissionAttempt) {
        let key = (attempt.assembly_name.clone(), attempt.stage);
        self.latest.insert(key, self.attempts.len());
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[SubmissionAttempt] {
        &self.attempts
    }

    pub fn latest(&self, name: &AssemblyName, stage: Stage) -> Option<&SubmissionAttempt> {
        self.latest
            .get(&(name.clone(), stage))
            .map(|index| &self.attempts[*index])
    }

    pub fn state(&self, name: &AssemblyName, stage: Stage) -> StageState {
        StageState::from(self.latest(name, stage).map(|attempt| attempt.status))
    }

    /// Latest attempt for every (assembly, stage) seen, ordered by assembly
    /// then stage.
    pub fn latest_all(&self) -> impl Iterator<Item = &SubmissionAttempt> {
        self.latest.values().map(|index| &self.attempts[*index])
    }
}
