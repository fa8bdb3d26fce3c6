use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::credential::Credential;
use crate::domain::{AssemblyName, AttemptStatus, ReceiptId, Stage, StageState};
use crate::error::SubmitError;
use crate::ledger::{LedgerHistory, ReceiptLedger, SubmissionAttempt};
use crate::prompt::{ConfirmRequest, Operator};
use crate::webin::{ServiceOutput, ServiceRequest, SubmissionService};
use crate::webin_output;
use crate::workspace::Workspace;

/// First line of every attempt block in a service log. Logs are appended to,
/// so one file holds the whole retry history of an assembly for a stage.
pub const ATTEMPT_HEADER: &str = "=== kira-submit attempt ===";

/// The block written by the most recent attempt in a service log.
pub fn last_attempt(log: &str) -> &str {
    match log.rfind(ATTEMPT_HEADER) {
        Some(start) => &log[start..],
        None => log,
    }
}

pub trait Pacer {
    fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            tracing::debug!(secs = duration.as_secs_f32(), "pausing before next call");
            thread::sleep(duration);
        }
    }
}

/// Proof that the operator agreed to a production submission.
#[derive(Debug)]
pub struct SubmitConfirmation {
    _private: (),
}

impl SubmitConfirmation {
    pub fn request(
        operator: &dyn Operator,
        request: &ConfirmRequest,
    ) -> Result<Self, SubmitError> {
        if operator.confirm(request)? {
            tracing::info!(assemblies = request.assemblies, "production submission confirmed");
            Ok(Self { _private: () })
        } else {
            tracing::warn!("production submission declined");
            Err(SubmitError::ConfirmationDeclined)
        }
    }
}

/// Permission to run one stage. A submit ticket needs a [`SubmitConfirmation`].
#[derive(Debug)]
pub struct StageTicket {
    stage: Stage,
}

impl StageTicket {
    pub fn validate() -> Self {
        Self {
            stage: Stage::Validate,
        }
    }

    pub fn test_submit() -> Self {
        Self {
            stage: Stage::TestSubmit,
        }
    }

    pub fn submit(_confirmation: SubmitConfirmation) -> Self {
        Self {
            stage: Stage::Submit,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Restrict the run to these assemblies; empty means all manifests.
    pub only: Vec<AssemblyName>,
    /// Leave out assemblies whose latest attempt of the stage passed.
    pub only_pending: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedAssembly {
    pub name: AssemblyName,
    pub manifest: Utf8PathBuf,
}

/// An earlier stage that has not passed for an assembly about to run.
#[derive(Debug, Clone, Serialize)]
pub struct StageGap {
    pub assembly: AssemblyName,
    pub stage: Stage,
    pub state: StageState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub stage: Stage,
    pub assemblies: Vec<PlannedAssembly>,
    pub pending_skipped: Vec<AssemblyName>,
    pub gaps: Vec<StageGap>,
    pub already_passed: Vec<AssemblyName>,
}

impl StagePlan {
    pub fn build(
        workspace: &Workspace,
        stage: Stage,
        history: &LedgerHistory,
        options: &PlanOptions,
    ) -> Result<Self, SubmitError> {
        let mut manifests = workspace.list_manifests()?;
        if !options.only.is_empty() {
            for name in &options.only {
                if !manifests.contains_key(name) {
                    return Err(SubmitError::UnknownAssembly(name.to_string()));
                }
            }
            let wanted: BTreeSet<&AssemblyName> = options.only.iter().collect();
            manifests.retain(|name, _| wanted.contains(name));
        }

        let mut plan = StagePlan {
            stage,
            assemblies: Vec::with_capacity(manifests.len()),
            pending_skipped: Vec::new(),
            gaps: Vec::new(),
            already_passed: Vec::new(),
        };
        for (name, manifest) in manifests {
            let passed = history.state(&name, stage) == StageState::Passed;
            if passed && options.only_pending {
                plan.pending_skipped.push(name);
                continue;
            }
            if passed {
                plan.already_passed.push(name.clone());
            }
            for earlier in stage.predecessors() {
                let state = history.state(&name, *earlier);
                if state != StageState::Passed {
                    plan.gaps.push(StageGap {
                        assembly: name.clone(),
                        stage: *earlier,
                        state,
                    });
                }
            }
            plan.assemblies.push(PlannedAssembly { name, manifest });
        }

        if plan.assemblies.is_empty() && plan.pending_skipped.is_empty() {
            tracing::warn!(dir = %workspace.root(), "no manifests found; run generate-manifests first");
        }
        if !plan.pending_skipped.is_empty() {
            tracing::info!(
                skipped = plan.pending_skipped.len(),
                "leaving out assemblies that already passed {stage}"
            );
        }
        for gap in &plan.gaps {
            tracing::warn!(
                assembly = %gap.assembly,
                "{} has not passed {} (state {:?})",
                stage,
                gap.stage,
                gap.state
            );
        }
        Ok(plan)
    }

    pub fn confirm_request(&self) -> ConfirmRequest {
        let unverified: BTreeSet<AssemblyName> =
            self.gaps.iter().map(|gap| gap.assembly.clone()).collect();
        ConfirmRequest {
            stage: self.stage,
            assemblies: self.assemblies.len(),
            already_passed: self.already_passed.clone(),
            unverified: unverified.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub assembly_name: AssemblyName,
    pub state: StageState,
    pub status: AttemptStatus,
    pub log_file: String,
    pub exit_code: Option<i32>,
    pub receipt: Option<ReceiptId>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub ledger: Option<String>,
    pub outcomes: Vec<AttemptOutcome>,
    pub pending_skipped: Vec<AssemblyName>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl StageReport {
    /// Report for a plan with no assembly left to run.
    pub fn nothing_to_do(plan: &StagePlan) -> Self {
        Self {
            stage: plan.stage,
            ledger: None,
            outcomes: Vec::new(),
            pending_skipped: plan.pending_skipped.clone(),
            passed: 0,
            failed: 0,
            total: 0,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &AttemptOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == AttemptStatus::Failed)
    }
}

pub struct StageRunner<'a, S: SubmissionService> {
    workspace: &'a Workspace,
    service: &'a S,
    pacer: &'a dyn Pacer,
    delay: Duration,
}

impl<'a, S: SubmissionService> StageRunner<'a, S> {
    /// `delay` is raised to the stage minimum if it is lower.
    pub fn new(
        workspace: &'a Workspace,
        service: &'a S,
        pacer: &'a dyn Pacer,
        delay: Duration,
    ) -> Self {
        Self {
            workspace,
            service,
            pacer,
            delay,
        }
    }

    /// Runs every planned assembly once, in name order. Failed calls are
    /// recorded and the batch moves on; only an unwritable ledger or log
    /// stops it.
    pub fn run(
        &self,
        ticket: StageTicket,
        plan: &StagePlan,
        credential: &Credential,
        sink: &dyn ProgressSink,
    ) -> Result<StageReport, SubmitError> {
        let stage = ticket.stage();
        if plan.stage != stage {
            return Err(SubmitError::InvalidStage(format!(
                "{} plan run with a {stage} ticket",
                plan.stage
            )));
        }
        let delay = self.delay.max(stage.min_delay());

        let mut report = StageReport::nothing_to_do(plan);
        if plan.assemblies.is_empty() {
            return Ok(report);
        }

        let mut ledger = ReceiptLedger::create(self.workspace, stage, Utc::now())?;
        report.ledger = Some(ledger.path().to_string());
        Workspace::ensure_dir(&self.workspace.log_dir(stage))?;

        let batch_started = Instant::now();
        for (index, planned) in plan.assemblies.iter().enumerate() {
            if index > 0 {
                self.pacer.pause(delay);
            }
            sink.event(ProgressEvent {
                message: format!(
                    "phase={stage}; [{}/{}] {}",
                    index + 1,
                    plan.assemblies.len(),
                    planned.name
                ),
                elapsed: Some(batch_started.elapsed()),
            });

            let outcome = self.attempt(stage, planned, credential)?;
            ledger.append(&SubmissionAttempt::new(
                outcome.assembly_name.clone(),
                stage,
                outcome.status,
                outcome.log_file.clone(),
                Utc::now(),
            ))?;
            match outcome.status {
                AttemptStatus::Passed => report.passed += 1,
                AttemptStatus::Failed => report.failed += 1,
            }
            report.outcomes.push(outcome);
        }
        report.total = report.outcomes.len();

        tracing::info!(
            stage = %stage,
            passed = report.passed,
            failed = report.failed,
            total = report.total,
            ledger = report.ledger.as_deref().unwrap_or_default(),
            "stage finished"
        );
        Ok(report)
    }

    fn attempt(
        &self,
        stage: Stage,
        planned: &PlannedAssembly,
        credential: &Credential,
    ) -> Result<AttemptOutcome, SubmitError> {
        let running = StageState::NotAttempted.begin()?;

        let output_dir = self.workspace.service_output_dir(stage, &planned.name);
        Workspace::ensure_dir(&output_dir)?;
        let request = ServiceRequest {
            stage,
            assembly: planned.name.clone(),
            manifest: planned.manifest.clone(),
            output_dir,
        };

        let started = Utc::now();
        let (output, start_error) = match self.service.run(&request, credential) {
            Ok(output) => (output, None),
            Err(err) => {
                tracing::error!(assembly = %planned.name, "{err}");
                (ServiceOutput::default(), Some(err.to_string()))
            }
        };
        let finished = Utc::now();

        let status = if output.success && start_error.is_none() {
            AttemptStatus::Passed
        } else {
            AttemptStatus::Failed
        };
        let log_file = self.workspace.log_path(stage, &planned.name);
        append_log(
            &log_file,
            &LogHeader {
                request: &request,
                started,
                finished,
                status,
                exit_code: output.exit_code,
                start_error: start_error.as_deref(),
            },
            &output,
        )?;

        let transcript = format!("{}\n{}", output.stdout, output.stderr);
        let mut reasons = webin_output::error_lines(&transcript);
        if status == AttemptStatus::Failed && reasons.is_empty() {
            reasons.push(match (&start_error, output.exit_code) {
                (Some(err), _) => err.clone(),
                (None, Some(code)) => format!("webin-cli exited with status {code}"),
                (None, None) => "webin-cli was terminated by a signal".to_string(),
            });
        }
        let receipt = match (stage, status) {
            (Stage::Submit, AttemptStatus::Passed) => webin_output::find_receipt(&transcript),
            _ => None,
        };
        let state = running.resolve(status)?;

        match status {
            AttemptStatus::Passed => tracing::info!(
                assembly = %planned.name,
                receipt = receipt.as_ref().map(ReceiptId::as_str).unwrap_or("-"),
                "{stage} passed"
            ),
            AttemptStatus::Failed => tracing::warn!(
                assembly = %planned.name,
                log = %log_file,
                "{stage} failed: {}",
                reasons.first().map(String::as_str).unwrap_or_default()
            ),
        }

        Ok(AttemptOutcome {
            assembly_name: planned.name.clone(),
            state,
            status,
            log_file: log_file.to_string(),
            exit_code: output.exit_code,
            receipt,
            reasons,
        })
    }
}

struct LogHeader<'r> {
    request: &'r ServiceRequest,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    status: AttemptStatus,
    exit_code: Option<i32>,
    start_error: Option<&'r str>,
}

fn append_log(path: &Utf8Path, header: &LogHeader<'_>, output: &ServiceOutput) -> Result<(), SubmitError> {
    let exit = match (header.start_error, header.exit_code) {
        (Some(err), _) => format!("not started ({err})"),
        (None, Some(code)) => code.to_string(),
        (None, None) => "signal".to_string(),
    };
    let block = format!(
        "{ATTEMPT_HEADER}\nstage: {}\nassembly: {}\nmanifest: {}\nstarted: {}\nfinished: {}\nexit: {exit}\nstatus: {}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        header.request.stage,
        header.request.assembly,
        header.request.manifest,
        header.started.to_rfc3339_opts(SecondsFormat::Secs, true),
        header.finished.to_rfc3339_opts(SecondsFormat::Secs, true),
        header.status,
        output.stdout.trim_end(),
        output.stderr.trim_end(),
    );

    let to_fs = |err: std::io::Error| SubmitError::Filesystem(format!("write {path}: {err}"));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .map_err(to_fs)?;
    file.write_all(block.as_bytes()).map_err(to_fs)?;
    file.sync_data().map_err(to_fs)
}
