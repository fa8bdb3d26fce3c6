use std::io::{self, Write};

use serde::Serialize;

use crate::app::{GenerateResult, ProgressEvent, ProgressSink, StatusResult};
use crate::collector::{AccessionReport, PENDING};
use crate::domain::{AssemblyName, StageState};
use crate::runner::StageReport;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_generate(result: &GenerateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_stage(report: &StageReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_collect(report: &AccessionReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress for terminal runs: every event becomes a debug-level trace line.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::debug!(elapsed_secs = elapsed.as_secs(), "{}", event.message)
            }
            None => tracing::debug!("{}", event.message),
        }
    }
}

/// Run summaries for people, written to stderr so stdout stays clean.
pub struct HumanOutput;

impl HumanOutput {
    pub fn print_generate(result: &GenerateResult) {
        let report = &result.manifests;
        let title = if report.dry_run {
            "manifest dry run"
        } else {
            "manifests"
        };
        eprintln!("{CYAN}kira-submit {title}{RESET}");
        eprintln!(
            "{GREEN}passed {}{RESET} / {RED}failed {}{RESET} / total {}",
            report.passed(),
            report.failed(),
            report.total()
        );
        for warning in &result.warnings {
            eprintln!("{YELLOW}  warning: {warning}{RESET}");
        }
        for outcome in report.failures() {
            eprintln!(
                "{RED}  {}: {}{RESET}",
                outcome.assembly_name,
                outcome.detail.as_deref().unwrap_or("failed")
            );
        }
        if !report.removed.is_empty() {
            let verb = if report.dry_run { "would remove" } else { "removed" };
            let names: Vec<&str> = report.removed.iter().map(AssemblyName::as_str).collect();
            eprintln!("{YELLOW}  {verb} stale manifests: {}{RESET}", names.join(", "));
        }
        if let Some(path) = &report.summary_path {
            eprintln!("  summary: {path}");
        }
    }

    pub fn print_stage(report: &StageReport) {
        eprintln!("{CYAN}kira-submit {}{RESET}", report.stage);
        eprintln!(
            "{GREEN}passed {}{RESET} / {RED}failed {}{RESET} / total {}",
            report.passed, report.failed, report.total
        );
        if !report.pending_skipped.is_empty() {
            eprintln!(
                "{YELLOW}  skipped (already passed): {}{RESET}",
                report.pending_skipped.len()
            );
        }
        for outcome in report.failures() {
            eprintln!("{RED}  {}: {}{RESET}", outcome.assembly_name, outcome.log_file);
            for reason in &outcome.reasons {
                eprintln!("{RED}      {reason}{RESET}");
            }
        }
        for outcome in &report.outcomes {
            if let Some(receipt) = &outcome.receipt {
                eprintln!("{GREEN}  {}: receipt {receipt}{RESET}", outcome.assembly_name);
            }
        }
        if let Some(ledger) = &report.ledger {
            eprintln!("  ledger: {ledger}");
        }
    }

    pub fn print_collect(report: &AccessionReport) {
        eprintln!("{CYAN}kira-submit accessions{RESET}");
        eprintln!(
            "{GREEN}resolved {}{RESET} / {YELLOW}pending {}{RESET} / no receipt {}",
            report.resolved(),
            report.pending(),
            report.without_receipt()
        );
        for warning in &report.warnings {
            eprintln!("{YELLOW}  warning: {warning}{RESET}");
        }
        for failure in &report.lookup_failures {
            eprintln!(
                "{YELLOW}  {} ({}): lookup failed, still {PENDING}: {}{RESET}",
                failure.assembly_name, failure.receipt, failure.message
            );
        }
        for record in report.records.iter().filter(|record| record.receipt.is_none()) {
            let reason = record.errors.first().map(String::as_str).unwrap_or("no receipt in log");
            eprintln!("{RED}  {}: {reason}{RESET}", record.assembly_name);
        }
        eprintln!("  table: {}", report.path);
    }

    pub fn print_status(result: &StatusResult) {
        eprintln!(
            "{CYAN}kira-submit status{RESET} ({}; {} ledgers, {} attempts)",
            result.output_dir, result.ledgers, result.attempts
        );
        for entry in &result.assemblies {
            eprintln!(
                "  {:<24} validate={:<13} test_submit={:<13} submit={:<13} {}",
                entry.assembly_name.as_str(),
                state_label(entry.validate),
                state_label(entry.test_submit),
                state_label(entry.submit),
                entry
                    .permanent_accession
                    .as_deref()
                    .or(entry.receipt_id.as_deref())
                    .unwrap_or("")
            );
        }
    }
}

fn state_label(state: StageState) -> &'static str {
    match state {
        StageState::NotAttempted => "not_attempted",
        StageState::Running => "running",
        StageState::Passed => "PASSED",
        StageState::Failed => "FAILED",
    }
}
