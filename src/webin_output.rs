//! Reading Webin-CLI free-text output.
//!
//! Everything this crate infers from service transcripts goes through this
//! module: the receipt accession, success/failure wording and the error lines
//! shown in run summaries. When the tool's wording changes, update the
//! pattern set here and bump [`PATTERN_SET_VERSION`].
//!
//! Pattern set history:
//! - v1: receipt `ERZ\d+`; success "has been completed", "successfully";
//!   failure "submission has failed", "validation failed"; error lines are
//!   any line containing "error" (case-insensitive).

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::domain::{PermanentAccession, ReceiptId};

pub const PATTERN_SET_VERSION: u32 = 1;

const MAX_ERROR_LINES: usize = 5;
const SUCCESS_MARKERS: &[&str] = &["has been completed", "successfully"];
const FAILURE_MARKERS: &[&str] = &["submission has failed", "validation failed"];
const ERROR_MARKER: &str = "error";

static RECEIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bERZ\d+\b").expect("receipt pattern"));
static ACCESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bGCA_\d+(\.\d+)?\b").expect("accession pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Submitted,
    Failed,
    Unknown,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Submitted => "submitted",
            LogStatus::Failed => "failed",
            LogStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedOutput {
    pub receipt: Option<ReceiptId>,
    pub status: LogStatus,
    pub errors: Vec<String>,
    pub pattern_set: u32,
}

pub fn parse(text: &str) -> ParsedOutput {
    let receipt = find_receipt(text);
    let lower = text.to_lowercase();
    let errors = error_lines(text);

    let succeeded = SUCCESS_MARKERS.iter().any(|marker| lower.contains(marker));
    let status = if receipt.is_some() || (succeeded && !reports_failure(text)) {
        LogStatus::Submitted
    } else if !errors.is_empty() || reports_failure(text) {
        LogStatus::Failed
    } else {
        LogStatus::Unknown
    };

    ParsedOutput {
        receipt,
        status,
        errors,
        pattern_set: PATTERN_SET_VERSION,
    }
}

/// Last receipt mentioned in the transcript; a re-submission appends a newer
/// one below the old one.
pub fn find_receipt(text: &str) -> Option<ReceiptId> {
    RECEIPT_RE
        .find_iter(text)
        .last()
        .and_then(|found| found.as_str().parse().ok())
}

pub fn reports_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    FAILURE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Up to five trimmed lines mentioning an error, in transcript order.
pub fn error_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.to_lowercase().contains(ERROR_MARKER))
        .take(MAX_ERROR_LINES)
        .map(str::to_string)
        .collect()
}

/// First permanent assembly accession found in free text (lookup payloads).
pub fn find_accession(text: &str) -> Option<PermanentAccession> {
    ACCESSION_RE
        .find_iter(text)
        .find_map(|found| found.as_str().parse().ok())
}
