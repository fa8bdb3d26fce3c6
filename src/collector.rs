use std::collections::BTreeMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{AssemblyName, PermanentAccession, ReceiptId, Stage};
use crate::ena::AccessionLookup;
use crate::error::SubmitError;
use crate::runner::{Pacer, last_attempt};
use crate::webin_output::{self, LogStatus};
use crate::workspace::Workspace;

pub const ACCESSION_COLUMNS: [&str; 5] = [
    "assembly_name",
    "receipt_id",
    "permanent_accession",
    "status",
    "errors",
];
pub const PENDING: &str = "PENDING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessionRecord {
    pub assembly_name: AssemblyName,
    pub receipt: Option<ReceiptId>,
    pub accession: Option<PermanentAccession>,
    pub status: LogStatus,
    pub errors: Vec<String>,
}

impl AccessionRecord {
    pub fn is_pending(&self) -> bool {
        self.receipt.is_some() && self.accession.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupFailure {
    pub assembly_name: AssemblyName,
    pub receipt: ReceiptId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessionReport {
    pub path: String,
    pub records: Vec<AccessionRecord>,
    pub logs_scanned: usize,
    pub lookups: usize,
    pub newly_resolved: Vec<AssemblyName>,
    pub lookup_failures: Vec<LookupFailure>,
    pub warnings: Vec<String>,
}

impl AccessionReport {
    pub fn resolved(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.accession.is_some())
            .count()
    }

    pub fn pending(&self) -> usize {
        self.records.iter().filter(|record| record.is_pending()).count()
    }

    pub fn without_receipt(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.receipt.is_none())
            .count()
    }
}

pub struct AccessionCollector<'a, L: AccessionLookup> {
    workspace: &'a Workspace,
    lookup: Option<&'a L>,
    pacer: &'a dyn Pacer,
    lookup_delay: Duration,
}

impl<'a, L: AccessionLookup> AccessionCollector<'a, L> {
    /// With `lookup` set, pending receipts are checked against the archive.
    pub fn new(
        workspace: &'a Workspace,
        lookup: Option<&'a L>,
        pacer: &'a dyn Pacer,
        lookup_delay: Duration,
    ) -> Self {
        Self {
            workspace,
            lookup,
            pacer,
            lookup_delay,
        }
    }

    pub fn collect(&self, sink: &dyn ProgressSink) -> Result<AccessionReport, SubmitError> {
        let started = Instant::now();
        let path = self.workspace.accessions_path();
        let existing = read_accessions(&path)?;

        sink.event(ProgressEvent {
            message: "phase=Collect; scanning submit logs".to_string(),
            elapsed: None,
        });
        let scanned = scan_logs(self.workspace)?;
        let logs_scanned = scanned.len();
        let (mut records, warnings) = merge(existing, scanned);
        for warning in &warnings {
            tracing::warn!("{warning}");
        }

        let mut lookups = 0usize;
        let mut newly_resolved = Vec::new();
        let mut lookup_failures = Vec::new();
        if let Some(lookup) = self.lookup {
            for record in records.values_mut() {
                let Some(receipt) = record.receipt.clone() else {
                    continue;
                };
                if record.accession.is_some() {
                    continue;
                }
                if lookups > 0 {
                    self.pacer.pause(self.lookup_delay);
                }
                lookups += 1;
                sink.event(ProgressEvent {
                    message: format!("phase=Lookup; {} ({receipt})", record.assembly_name),
                    elapsed: Some(started.elapsed()),
                });
                match lookup.lookup(&receipt) {
                    Ok(Some(accession)) => {
                        tracing::info!(
                            assembly = %record.assembly_name,
                            receipt = %receipt,
                            accession = %accession,
                            "permanent accession assigned"
                        );
                        record.accession = Some(accession);
                        newly_resolved.push(record.assembly_name.clone());
                    }
                    Ok(None) => {
                        tracing::info!(assembly = %record.assembly_name, receipt = %receipt, "still pending");
                    }
                    Err(err) => {
                        tracing::warn!(assembly = %record.assembly_name, receipt = %receipt, "lookup failed: {err}");
                        lookup_failures.push(LookupFailure {
                            assembly_name: record.assembly_name.clone(),
                            receipt,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        let records: Vec<AccessionRecord> = records.into_values().collect();
        Workspace::write_bytes_atomic(&path, &render_accessions(&records)?)?;
        let report = AccessionReport {
            path: path.to_string(),
            records,
            logs_scanned,
            lookups,
            newly_resolved,
            lookup_failures,
            warnings,
        };
        tracing::info!(
            resolved = report.resolved(),
            pending = report.pending(),
            without_receipt = report.without_receipt(),
            path = %path,
            "accession table written"
        );
        Ok(report)
    }
}

/// One record per `logs/submit/<name>.log`. The receipt is the newest one
/// anywhere in the log; status and errors come from the last attempt.
pub fn scan_logs(workspace: &Workspace) -> Result<BTreeMap<AssemblyName, AccessionRecord>, SubmitError> {
    let mut records = BTreeMap::new();
    for (name, path) in workspace.list_logs(Stage::Submit)? {
        let text = fs::read_to_string(path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(format!("read {path}: {err}")))?;
        let parsed = webin_output::parse(last_attempt(&text));
        let receipt = parsed.receipt.or_else(|| webin_output::find_receipt(&text));
        let status = if receipt.is_some() {
            LogStatus::Submitted
        } else {
            parsed.status
        };
        records.insert(
            name.clone(),
            AccessionRecord {
                assembly_name: name,
                receipt,
                accession: None,
                status,
                errors: parsed.errors,
            },
        );
    }
    Ok(records)
}

/// Folds freshly scanned logs into the previously written table. A recorded
/// permanent accession is never dropped, a recorded receipt is never
/// replaced, and rows without a log are kept.
pub fn merge(
    existing: BTreeMap<AssemblyName, AccessionRecord>,
    scanned: BTreeMap<AssemblyName, AccessionRecord>,
) -> (BTreeMap<AssemblyName, AccessionRecord>, Vec<String>) {
    let mut merged = existing;
    let mut warnings = Vec::new();
    for (name, fresh) in scanned {
        let Some(known) = merged.get_mut(&name) else {
            merged.insert(name, fresh);
            continue;
        };
        match (&known.receipt, &fresh.receipt) {
            (Some(old), Some(new)) if old != new => warnings.push(format!(
                "{name}: log reports receipt {new} but {old} is already recorded; keeping {old}"
            )),
            (None, Some(new)) => known.receipt = Some(new.clone()),
            _ => {}
        }
        if known.accession.is_none() {
            known.accession = fresh.accession;
        }
        known.status = if known.receipt.is_some() {
            LogStatus::Submitted
        } else {
            fresh.status
        };
        known.errors = fresh.errors;
    }
    (merged, warnings)
}

/// Previously written accession table; a missing file is an empty table.
pub fn read_accessions(path: &Utf8Path) -> Result<BTreeMap<AssemblyName, AccessionRecord>, SubmitError> {
    let mut records = BTreeMap::new();
    if !path.as_std_path().exists() {
        return Ok(records);
    }
    let table_error = |message: String| SubmitError::Table {
        path: path.as_std_path().to_path_buf(),
        message,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path.as_std_path())
        .map_err(|err| table_error(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| table_error(err.to_string()))?
        .clone();
    let column = |name: &str| headers.iter().position(|header| header == name);
    let (Some(name_at), Some(receipt_at), Some(accession_at)) = (
        column("assembly_name"),
        column("receipt_id"),
        column("permanent_accession"),
    ) else {
        return Err(SubmitError::Schema {
            table: path.to_string(),
            missing: vec!["assembly_name, receipt_id, permanent_accession".to_string()],
        });
    };
    let status_at = column("status");
    let errors_at = column("errors");

    for row in reader.records() {
        let row = row.map_err(|err| table_error(err.to_string()))?;
        let cell = |at: Option<usize>| at.and_then(|at| row.get(at)).unwrap_or("").trim();
        let Ok(name) = cell(Some(name_at)).parse::<AssemblyName>() else {
            continue;
        };
        let receipt = cell(Some(receipt_at)).parse::<ReceiptId>().ok();
        let accession = match cell(Some(accession_at)) {
            "" | PENDING => None,
            value => Some(value.parse::<PermanentAccession>()?),
        };
        let status = match cell(status_at) {
            "submitted" => LogStatus::Submitted,
            "failed" => LogStatus::Failed,
            _ if receipt.is_some() => LogStatus::Submitted,
            _ => LogStatus::Unknown,
        };
        let errors = cell(errors_at)
            .split(" | ")
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        records.insert(
            name.clone(),
            AccessionRecord {
                assembly_name: name,
                receipt,
                accession,
                status,
                errors,
            },
        );
    }
    Ok(records)
}

fn render_accessions(records: &[AccessionRecord]) -> Result<Vec<u8>, SubmitError> {
    let to_fs = |err: csv::Error| SubmitError::Filesystem(format!("accession table: {err}"));
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(Vec::new());
    writer.write_record(ACCESSION_COLUMNS).map_err(to_fs)?;
    for record in records {
        let errors = record
            .errors
            .iter()
            .map(|line| line.replace(['\t', '\n'], " "))
            .collect::<Vec<_>>()
            .join(" | ");
        writer
            .write_record([
                record.assembly_name.as_str(),
                record.receipt.as_ref().map(ReceiptId::as_str).unwrap_or(""),
                record
                    .accession
                    .as_ref()
                    .map(PermanentAccession::as_str)
                    .unwrap_or(PENDING),
                record.status.as_str(),
                errors.as_str(),
            ])
            .map_err(to_fs)?;
    }
    writer
        .into_inner()
        .map_err(|err| SubmitError::Filesystem(format!("accession table: {err}")))
}
