use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;

use kira_submit::app::{ProgressEvent, ProgressSink};
use kira_submit::collector::{AccessionCollector, AccessionReport, read_accessions};
use kira_submit::domain::{AssemblyName, PermanentAccession, ReceiptId, Stage};
use kira_submit::ena::AccessionLookup;
use kira_submit::error::SubmitError;
use kira_submit::runner::{ATTEMPT_HEADER, Pacer};
use kira_submit::webin_output::LogStatus;
use kira_submit::workspace::Workspace;

struct Quiet;

impl ProgressSink for Quiet {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Default)]
struct CountingPacer(Mutex<Vec<Duration>>);

impl Pacer for CountingPacer {
    fn pause(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}

/// Answers from a fixed receipt table; receipts not listed fail like an
/// unreachable service.
struct FixedLookup {
    answers: BTreeMap<String, Option<String>>,
    asked: Mutex<Vec<String>>,
}

impl FixedLookup {
    fn new(answers: &[(&str, Option<&str>)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(receipt, accession)| (receipt.to_string(), accession.map(str::to_string)))
                .collect(),
            asked: Mutex::new(Vec::new()),
        }
    }

    fn unreachable() -> Self {
        Self::new(&[])
    }
}

impl AccessionLookup for FixedLookup {
    fn lookup(&self, receipt: &ReceiptId) -> Result<Option<PermanentAccession>, SubmitError> {
        self.asked.lock().unwrap().push(receipt.to_string());
        match self.answers.get(receipt.as_str()) {
            Some(Some(accession)) => Ok(Some(accession.parse()?)),
            Some(None) => Ok(None),
            None => Err(SubmitError::LookupHttp("connection refused".to_string())),
        }
    }
}

fn workspace(temp: &tempfile::TempDir) -> Workspace {
    Workspace::new(Utf8PathBuf::from_path_buf(temp.path().join("out")).unwrap())
}

fn write_log(ws: &Workspace, name: &str, attempts: &[&str]) {
    let dir = ws.log_dir(Stage::Submit);
    fs::create_dir_all(&dir).unwrap();
    let text: String = attempts
        .iter()
        .map(|body| format!("{ATTEMPT_HEADER}\nstage: submit\nassembly: {name}\n{body}\n"))
        .collect();
    fs::write(ws.log_path(Stage::Submit, &name.parse().unwrap()), text).unwrap();
}

fn collect(ws: &Workspace, lookup: Option<&FixedLookup>) -> AccessionReport {
    let pacer = CountingPacer::default();
    AccessionCollector::new(ws, lookup, &pacer, Duration::from_millis(500))
        .collect(&Quiet)
        .unwrap()
}

fn row<'a>(report: &'a AccessionReport, name: &str) -> &'a kira_submit::collector::AccessionRecord {
    report
        .records
        .iter()
        .find(|record| record.assembly_name.as_str() == name)
        .unwrap()
}

const SUBMITTED: &str = "INFO : The submission has been completed successfully. \
     The following analysis accession was assigned to the submission: ERZ24681357";

#[test]
fn logs_become_rows_and_failures_keep_their_errors() {
    let temp = tempfile::tempdir().unwrap();
    let ws = workspace(&temp);
    write_log(&ws, "A", &[SUBMITTED]);
    write_log(
        &ws,
        "B",
        &["ERROR: Invalid value for COVERAGE\nERROR: The submission has failed"],
    );

    let report = collect(&ws, None::<&FixedLookup>);
    assert_eq!(report.logs_scanned, 2);
    assert_eq!(report.lookups, 0);

    let a = row(&report, "A");
    assert_eq!(a.receipt.as_ref().unwrap().as_str(), "ERZ24681357");
    assert!(a.accession.is_none());
    assert_eq!(a.status, LogStatus::Submitted);

    let b = row(&report, "B");
    assert!(b.receipt.is_none());
    assert_eq!(b.status, LogStatus::Failed);
    assert_eq!(b.errors.len(), 2);

    let text = fs::read_to_string(ws.accessions_path()).unwrap();
    assert!(text.starts_with("assembly_name\treceipt_id\tpermanent_accession\tstatus\terrors\n"));
    assert!(text.contains("A\tERZ24681357\tPENDING\tsubmitted\t\n"));
    assert!(text.contains(
        "B\t\tPENDING\tfailed\tERROR: Invalid value for COVERAGE | ERROR: The submission has failed\n"
    ));
}

#[test]
fn lookup_fills_pending_accessions() {
    let temp = tempfile::tempdir().unwrap();
    let ws = workspace(&temp);
    write_log(&ws, "A", &[SUBMITTED]);
    write_log(
        &ws,
        "C",
        &["INFO : submission completed. The following analysis accession was assigned to the submission: ERZ13579"],
    );
    let lookup = FixedLookup::new(&[
        ("ERZ24681357", Some("GCA_963000001.1")),
        ("ERZ13579", None),
    ]);

    let report = collect(&ws, Some(&lookup));
    assert_eq!(report.lookups, 2);
    assert_eq!(report.newly_resolved, vec!["A".parse::<AssemblyName>().unwrap()]);
    assert_eq!(
        row(&report, "A").accession.as_ref().unwrap().as_str(),
        "GCA_963000001.1"
    );
    assert!(row(&report, "C").is_pending());
    assert!(report.lookup_failures.is_empty());

    // Resolved rows are not asked about again.
    let again = FixedLookup::new(&[("ERZ13579", None)]);
    collect(&ws, Some(&again));
    assert_eq!(*again.asked.lock().unwrap(), vec!["ERZ13579".to_string()]);
}

#[test]
fn failed_lookup_never_loses_what_was_recorded() {
    let temp = tempfile::tempdir().unwrap();
    let ws = workspace(&temp);
    write_log(&ws, "A", &[SUBMITTED]);
    write_log(
        &ws,
        "B",
        &["INFO : completed. The following analysis accession was assigned to the submission: ERZ555"],
    );
    let lookup = FixedLookup::new(&[("ERZ24681357", Some("GCA_963000001.1"))]);
    collect(&ws, Some(&lookup));

    let report = collect(&ws, Some(&FixedLookup::unreachable()));
    assert_eq!(report.lookup_failures.len(), 1);
    assert_eq!(report.lookup_failures[0].receipt.as_str(), "ERZ555");
    assert_eq!(
        row(&report, "A").accession.as_ref().unwrap().as_str(),
        "GCA_963000001.1"
    );
    assert!(row(&report, "B").is_pending());

    let on_disk = read_accessions(&ws.accessions_path()).unwrap();
    assert_eq!(
        on_disk[&"A".parse::<AssemblyName>().unwrap()]
            .accession
            .as_ref()
            .unwrap()
            .as_str(),
        "GCA_963000001.1"
    );
}

#[test]
fn resubmission_keeps_first_receipt_and_reports_latest_errors() {
    let temp = tempfile::tempdir().unwrap();
    let ws = workspace(&temp);
    write_log(
        &ws,
        "A",
        &[SUBMITTED, "ERROR: The object being added already exists"],
    );

    let report = collect(&ws, None::<&FixedLookup>);
    let a = row(&report, "A");
    assert_eq!(a.receipt.as_ref().unwrap().as_str(), "ERZ24681357");
    assert_eq!(a.status, LogStatus::Submitted);
    assert_eq!(a.errors, vec!["ERROR: The object being added already exists"]);
}

#[test]
fn rows_without_a_log_survive_a_rescan() {
    let temp = tempfile::tempdir().unwrap();
    let ws = workspace(&temp);
    fs::create_dir_all(ws.root()).unwrap();
    fs::write(
        ws.accessions_path(),
        "assembly_name\treceipt_id\tpermanent_accession\tstatus\terrors\n\
         OLD\tERZ1\tGCA_000000001.1\tsubmitted\t\n",
    )
    .unwrap();
    write_log(&ws, "A", &[SUBMITTED]);

    let report = collect(&ws, None::<&FixedLookup>);
    assert_eq!(report.records.len(), 2);
    assert_eq!(
        row(&report, "OLD").accession.as_ref().unwrap().as_str(),
        "GCA_000000001.1"
    );
}
