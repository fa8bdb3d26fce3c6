use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8Path;

use kira_submit::app::{App, GenerateRequest};
use kira_submit::config::ResolvedConfig;
use kira_submit::credential::Credential;
use kira_submit::domain::{
    AssemblyName, AttemptStatus, PermanentAccession, ReceiptId, Stage, StageState,
};
use kira_submit::ena::AccessionLookup;
use kira_submit::error::SubmitError;
use kira_submit::fs_util::walk_files;
use kira_submit::ledger::{LedgerHistory, read_ledger};
use kira_submit::manifest::SequenceSource;
use kira_submit::output::JsonOutput;
use kira_submit::prompt::{ConfirmRequest, Operator};
use kira_submit::runner::{Pacer, PlanOptions, StagePlan};
use kira_submit::webin::{ServiceOutput, ServiceRequest, SubmissionService};
use kira_submit::workspace::Workspace;

const PASSWORD: &str = "correct-horse-battery";

#[derive(Default)]
struct ScriptedService {
    failing: BTreeSet<String>,
    calls: Mutex<Vec<(String, Stage)>>,
}

impl ScriptedService {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| name.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, Stage)> {
        self.calls.lock().unwrap().clone()
    }
}

impl SubmissionService for ScriptedService {
    fn run(
        &self,
        request: &ServiceRequest,
        credential: &Credential,
    ) -> Result<ServiceOutput, SubmitError> {
        assert_eq!(credential.username(), "Webin-12345");
        assert!(request.manifest.as_std_path().is_file());
        let mut calls = self.calls.lock().unwrap();
        calls.push((request.assembly.to_string(), request.stage));

        if self.failing.contains(request.assembly.as_str()) {
            return Ok(ServiceOutput {
                success: false,
                exit_code: Some(2),
                stdout: "INFO : Validating manifest\n".to_string(),
                stderr: "ERROR: Invalid COVERAGE value\nERROR: Unknown SAMPLE\n".to_string(),
            });
        }
        let stdout = match request.stage {
            Stage::Submit => format!(
                "INFO : The submission has been completed successfully. The following analysis accession was assigned to the submission: ERZ{}\n",
                100 + calls.len()
            ),
            _ => "INFO : The submission has been validated successfully.\n".to_string(),
        };
        Ok(ServiceOutput {
            success: true,
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

struct ScriptedOperator {
    password: &'static str,
    confirm: bool,
    confirmations: Mutex<Vec<ConfirmRequest>>,
}

impl ScriptedOperator {
    fn new(password: &'static str, confirm: bool) -> Self {
        Self {
            password,
            confirm,
            confirmations: Mutex::new(Vec::new()),
        }
    }
}

impl Operator for ScriptedOperator {
    fn read_secret(&self, _prompt: &str) -> Result<String, SubmitError> {
        Ok(self.password.to_string())
    }

    fn confirm(&self, request: &ConfirmRequest) -> Result<bool, SubmitError> {
        self.confirmations.lock().unwrap().push(request.clone());
        Ok(self.confirm)
    }
}

#[derive(Default)]
struct RecordingPacer {
    pauses: Mutex<Vec<Duration>>,
}

impl Pacer for RecordingPacer {
    fn pause(&self, duration: Duration) {
        self.pauses.lock().unwrap().push(duration);
    }
}

struct NoLookup;

impl AccessionLookup for NoLookup {
    fn lookup(&self, _receipt: &ReceiptId) -> Result<Option<PermanentAccession>, SubmitError> {
        Ok(None)
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    workspace: Workspace,
    metadata: std::path::PathBuf,
    fasta_dir: std::path::PathBuf,
}

fn fixture(rows: &[(&str, &str)]) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let fasta_dir = temp.path().join("fastas_in");
    fs::create_dir_all(&fasta_dir).unwrap();
    let mut table = String::from(
        "assembly_name\tbiosample_accession\tgenome_coverage\tassembly_methods\tsequencing_technologies\tfilename\n",
    );
    for (name, biosample) in rows {
        table.push_str(&format!(
            "{name}\t{biosample}\t85x\tSPAdes 3.15\tIllumina NovaSeq\t{name}.fasta\n"
        ));
        fs::write(fasta_dir.join(format!("{name}.fasta")), ">c1\nACGT\n").unwrap();
    }
    let metadata = temp.path().join("metadata.tsv");
    fs::write(&metadata, table).unwrap();
    let workspace = Workspace::from_std(&temp.path().join("out")).unwrap();
    Fixture {
        _temp: temp,
        workspace,
        metadata,
        fasta_dir,
    }
}

fn config() -> ResolvedConfig {
    let mut config = ResolvedConfig::default();
    config.webin.username = Some("Webin-12345".to_string());
    config
}

fn app<'a>(fixture: &Fixture, service: &'a ScriptedService) -> App<&'a ScriptedService, NoLookup> {
    App::new(fixture.workspace.clone(), config(), service, NoLookup)
}

fn generate(fixture: &Fixture, service: &ScriptedService) {
    let request = GenerateRequest {
        metadata: fixture.metadata.clone(),
        accessions: None,
        sequences: SequenceSource::Fasta(fixture.fasta_dir.clone()),
        study: Some("PRJEB12345".to_string()),
        dry_run: false,
    };
    app(fixture, service)
        .generate_manifests(&request, &JsonOutput)
        .unwrap();
}

fn name(value: &str) -> AssemblyName {
    value.parse().unwrap()
}

#[test]
fn incomplete_assembly_never_reaches_validation() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);
    assert!(fixture.workspace.manifest_path(&name("A")).exists());
    assert!(!fixture.workspace.manifest_path(&name("B")).exists());

    let operator = ScriptedOperator::new(PASSWORD, false);
    let report = app(&fixture, &service)
        .run_stage(
            Stage::Validate,
            &PlanOptions::default(),
            &operator,
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap();

    assert_eq!((report.passed, report.failed, report.total), (1, 0, 1));
    assert_eq!(service.calls(), vec![("A".to_string(), Stage::Validate)]);
    let ledger = read_ledger(Utf8Path::new(report.ledger.as_deref().unwrap())).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].assembly_name, name("A"));
    assert_eq!(ledger[0].status, AttemptStatus::Passed);
    assert!(operator.confirmations.lock().unwrap().is_empty());
}

#[test]
fn one_failure_does_not_stop_the_batch() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "SAMEA2"), ("C", "SAMEA3")]);
    let service = ScriptedService::failing(&["B"]);
    generate(&fixture, &service);

    let report = app(&fixture, &service)
        .run_stage(
            Stage::TestSubmit,
            &PlanOptions::default(),
            &ScriptedOperator::new(PASSWORD, false),
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap();

    assert_eq!((report.passed, report.failed, report.total), (2, 1, 3));
    assert!(!report.all_passed());
    let failure = report.failures().next().unwrap();
    assert_eq!(failure.assembly_name, name("B"));
    assert_eq!(failure.state, StageState::Failed);
    assert_eq!(
        failure.reasons,
        vec!["ERROR: Invalid COVERAGE value", "ERROR: Unknown SAMPLE"]
    );
    let log = fs::read_to_string(&failure.log_file).unwrap();
    assert!(log.contains("ERROR: Unknown SAMPLE"));
    assert!(log.contains("exit: 2"));

    let passed_log = fixture.workspace.log_path(Stage::TestSubmit, &name("A"));
    assert!(fs::read_to_string(passed_log.as_std_path()).unwrap().contains("validated successfully"));
}

#[test]
fn calls_are_paced_and_submit_waits_longest() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "SAMEA2"), ("C", "SAMEA3")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let test_pacer = RecordingPacer::default();
    app(&fixture, &service)
        .run_stage(
            Stage::TestSubmit,
            &PlanOptions::default(),
            &ScriptedOperator::new(PASSWORD, false),
            &test_pacer,
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(
        *test_pacer.pauses.lock().unwrap(),
        vec![Duration::from_secs(2); 2]
    );

    let mut config = config();
    config.webin.submit_delay = Duration::from_secs(1);
    let submit_pacer = RecordingPacer::default();
    App::new(fixture.workspace.clone(), config, &service, NoLookup)
        .run_stage(
            Stage::Submit,
            &PlanOptions::default(),
            &ScriptedOperator::new(PASSWORD, true),
            &submit_pacer,
            &JsonOutput,
        )
        .unwrap();
    let pauses = submit_pacer.pauses.lock().unwrap();
    assert_eq!(pauses.len(), 2);
    assert!(pauses.iter().all(|pause| *pause >= Duration::from_secs(10)));
}

#[test]
fn declined_submit_makes_no_calls() {
    let fixture = fixture(&[("A", "SAMEA1")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let operator = ScriptedOperator::new(PASSWORD, false);
    let err = app(&fixture, &service)
        .run_stage(
            Stage::Submit,
            &PlanOptions::default(),
            &operator,
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap_err();

    assert_matches!(err, SubmitError::ConfirmationDeclined);
    assert!(service.calls().is_empty());
    assert!(fixture.workspace.list_ledgers().unwrap().is_empty());
    let request = &operator.confirmations.lock().unwrap()[0];
    assert_eq!(request.assemblies, 1);
    assert_eq!(request.unverified, vec![name("A")]);
}

#[test]
fn empty_password_aborts_before_any_call() {
    let fixture = fixture(&[("A", "SAMEA1")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let err = app(&fixture, &service)
        .run_stage(
            Stage::Validate,
            &PlanOptions::default(),
            &ScriptedOperator::new("", false),
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(err, SubmitError::Credential(_));
    assert!(service.calls().is_empty());
}

#[test]
fn every_attempt_adds_one_row_and_password_is_never_written() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "SAMEA2")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);
    let app = app(&fixture, &service);
    let operator = ScriptedOperator::new(PASSWORD, true);
    let pacer = RecordingPacer::default();

    for stage in [Stage::Validate, Stage::Validate, Stage::TestSubmit, Stage::Submit] {
        app.run_stage(stage, &PlanOptions::default(), &operator, &pacer, &JsonOutput)
            .unwrap();
    }

    let history = LedgerHistory::load(&fixture.workspace).unwrap();
    let rows_for_a = history
        .attempts()
        .iter()
        .filter(|attempt| attempt.assembly_name == name("A"))
        .count();
    assert_eq!(rows_for_a, 4);
    assert_eq!(fixture.workspace.list_ledgers().unwrap().len(), 4);
    assert_eq!(history.state(&name("B"), Stage::Submit), StageState::Passed);

    let validate_log = fs::read_to_string(
        fixture
            .workspace
            .log_path(Stage::Validate, &name("A"))
            .as_std_path(),
    )
    .unwrap();
    assert_eq!(validate_log.matches("=== kira-submit attempt ===").count(), 2);

    for file in walk_files(fixture.workspace.root().as_std_path()).unwrap() {
        let bytes = fs::read(&file).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains(PASSWORD), "password leaked into {}", file.display());
    }
}

#[test]
fn resubmission_is_flagged_and_only_pending_skips_passed() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "SAMEA2")]);
    let service = ScriptedService::failing(&["B"]);
    generate(&fixture, &service);
    let app = app(&fixture, &service);
    let pacer = RecordingPacer::default();

    app.run_stage(
        Stage::Submit,
        &PlanOptions::default(),
        &ScriptedOperator::new(PASSWORD, true),
        &pacer,
        &JsonOutput,
    )
    .unwrap();

    let operator = ScriptedOperator::new(PASSWORD, true);
    app.run_stage(Stage::Submit, &PlanOptions::default(), &operator, &pacer, &JsonOutput)
        .unwrap();
    assert_eq!(
        operator.confirmations.lock().unwrap()[0].already_passed,
        vec![name("A")]
    );

    let pending_only = PlanOptions {
        only: Vec::new(),
        only_pending: true,
    };
    let report = app
        .run_stage(
            Stage::Submit,
            &pending_only,
            &ScriptedOperator::new(PASSWORD, true),
            &pacer,
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(report.pending_skipped, vec![name("A")]);
    assert_eq!(report.total, 1);
    assert_eq!(report.outcomes[0].assembly_name, name("B"));
}

#[test]
fn unknown_assembly_filter_is_refused() {
    let fixture = fixture(&[("A", "SAMEA1")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let options = PlanOptions {
        only: vec![name("Z")],
        only_pending: false,
    };
    let err = app(&fixture, &service)
        .run_stage(
            Stage::Validate,
            &options,
            &ScriptedOperator::new(PASSWORD, false),
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(err, SubmitError::UnknownAssembly(missing) if missing == "Z");
}

#[test]
fn submit_report_carries_receipts() {
    let fixture = fixture(&[("A", "SAMEA1")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let report = app(&fixture, &service)
        .run_stage(
            Stage::Submit,
            &PlanOptions::default(),
            &ScriptedOperator::new(PASSWORD, true),
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap();
    let receipt = report.outcomes[0].receipt.as_ref().unwrap();
    assert!(receipt.as_str().starts_with("ERZ"));
    assert!(Path::new(&report.outcomes[0].log_file).is_file());
}

#[test]
fn status_reports_latest_state_and_receipt() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "SAMEA2")]);
    let service = ScriptedService::failing(&["B"]);
    generate(&fixture, &service);
    let app = app(&fixture, &service);
    let pacer = RecordingPacer::default();
    let operator = ScriptedOperator::new(PASSWORD, true);

    app.run_stage(Stage::Validate, &PlanOptions::default(), &operator, &pacer, &JsonOutput)
        .unwrap();
    let only_a = PlanOptions {
        only: vec![name("A")],
        only_pending: false,
    };
    app.run_stage(Stage::Submit, &only_a, &operator, &pacer, &JsonOutput)
        .unwrap();
    app.collect_accessions(false, &pacer, &JsonOutput).unwrap();

    let status = app.status(&JsonOutput).unwrap();
    assert_eq!(status.ledgers, 2);
    assert_eq!(status.attempts, 3);
    let a = &status.assemblies[0];
    assert_eq!(a.assembly_name, name("A"));
    assert_eq!(
        (a.validate, a.test_submit, a.submit),
        (StageState::Passed, StageState::NotAttempted, StageState::Passed)
    );
    assert!(a.receipt_id.as_deref().unwrap().starts_with("ERZ"));
    assert_eq!(a.permanent_accession, None);
    let b = &status.assemblies[1];
    assert_eq!(b.validate, StageState::Failed);
    assert_eq!(b.submit, StageState::NotAttempted);
    assert!(b.has_manifest);
}

#[test]
fn manifest_of_a_record_that_stopped_passing_is_not_validated() {
    let fixture = fixture(&[("A", "SAMEA1"), ("B", "SAMEA2")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let table = fs::read_to_string(&fixture.metadata).unwrap();
    fs::write(&fixture.metadata, table.replace("\tSAMEA2\t", "\t\t")).unwrap();
    generate(&fixture, &service);

    let report = app(&fixture, &service)
        .run_stage(
            Stage::Validate,
            &PlanOptions::default(),
            &ScriptedOperator::new(PASSWORD, false),
            &RecordingPacer::default(),
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(service.calls(), vec![("A".to_string(), Stage::Validate)]);
}

#[test]
fn stage_plan_serializes_manifest_paths() {
    let fixture = fixture(&[("A", "SAMEA1")]);
    let service = ScriptedService::default();
    generate(&fixture, &service);

    let history = LedgerHistory::load(&fixture.workspace).unwrap();
    let plan = StagePlan::build(
        &fixture.workspace,
        Stage::Validate,
        &history,
        &PlanOptions::default(),
    )
    .unwrap();
    let json = serde_json::to_value(&plan).unwrap();
    let planned = &json["assemblies"][0];
    assert_eq!(planned["name"], "A");
    assert!(
        planned["manifest"]
            .as_str()
            .unwrap()
            .ends_with("manifest_A.txt")
    );
}
