use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::collector::{AccessionCollector, AccessionReport, read_accessions};
use crate::config::ResolvedConfig;
use crate::credential::Credential;
use crate::domain::{AssemblyName, Stage, StageState};
use crate::ena::AccessionLookup;
use crate::error::SubmitError;
use crate::ledger::LedgerHistory;
use crate::lock::OutputLock;
use crate::manifest::{ManifestBuilder, ManifestParams, ManifestReport, SequenceSource};
use crate::metadata::{MetadataLoader, ReferentialWarning};
use crate::prompt::Operator;
use crate::runner::{
    Pacer, PlanOptions, StagePlan, StageReport, StageRunner, StageTicket, SubmitConfirmation,
};
use crate::webin::SubmissionService;
use crate::workspace::Workspace;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub metadata: PathBuf,
    pub accessions: Option<PathBuf>,
    pub sequences: SequenceSource,
    pub study: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResult {
    pub warnings: Vec<ReferentialWarning>,
    pub manifests: ManifestReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub assembly_name: AssemblyName,
    pub has_manifest: bool,
    pub validate: StageState,
    pub test_submit: StageState,
    pub submit: StageState,
    pub receipt_id: Option<String>,
    pub permanent_accession: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub output_dir: String,
    pub ledgers: usize,
    pub attempts: usize,
    pub assemblies: Vec<StatusEntry>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Drives the pipeline over one output directory. `S` performs stage calls,
/// `L` answers accession lookups.
pub struct App<S: SubmissionService, L: AccessionLookup> {
    workspace: Workspace,
    config: ResolvedConfig,
    service: S,
    lookup: L,
}

impl<S: SubmissionService, L: AccessionLookup> App<S, L> {
    pub fn new(workspace: Workspace, config: ResolvedConfig, service: S, lookup: L) -> Self {
        Self {
            workspace,
            config,
            service,
            lookup,
        }
    }

    pub fn generate_manifests(
        &self,
        request: &GenerateRequest,
        sink: &dyn ProgressSink,
    ) -> Result<GenerateResult, SubmitError> {
        sink.event(ProgressEvent {
            message: format!("phase=Load; {}", request.metadata.display()),
            elapsed: None,
        });
        let loader = MetadataLoader::new(
            &self.config.metadata_columns,
            &self.config.accession_columns,
        );
        let loaded = loader.load(&request.metadata, request.accessions.as_deref())?;
        tracing::info!(assemblies = loaded.records.len(), "metadata loaded");

        let _lock = if request.dry_run {
            None
        } else {
            Some(OutputLock::acquire(&self.workspace)?)
        };
        let params = ManifestParams {
            study: request.study.clone(),
            source: request.sequences.clone(),
            assembly_type: self.config.manifest.assembly_type.clone(),
            name_prefix: self.config.manifest.name_prefix.clone(),
            annotated_name_suffix: self.config.manifest.annotated_name_suffix.clone(),
            strip_haplotype_suffix: self.config.manifest.strip_haplotype_suffix,
            dry_run: request.dry_run,
        };
        let manifests = ManifestBuilder::new(&self.workspace, &params).build_all(&loaded.records, sink)?;
        Ok(GenerateResult {
            warnings: loaded.warnings,
            manifests,
        })
    }

    /// Plans, gates and runs one stage over the manifests in the output
    /// directory. Confirmation (submit only) and the password are asked for
    /// before the first service call.
    pub fn run_stage(
        &self,
        stage: Stage,
        options: &PlanOptions,
        operator: &dyn Operator,
        pacer: &dyn Pacer,
        sink: &dyn ProgressSink,
    ) -> Result<StageReport, SubmitError> {
        let _lock = OutputLock::acquire(&self.workspace)?;
        sink.event(ProgressEvent {
            message: format!("phase=Plan; {stage}"),
            elapsed: None,
        });
        let history = LedgerHistory::load(&self.workspace)?;
        let plan = StagePlan::build(&self.workspace, stage, &history, options)?;
        if plan.assemblies.is_empty() {
            return Ok(StageReport::nothing_to_do(&plan));
        }

        let ticket = match stage {
            Stage::Validate => StageTicket::validate(),
            Stage::TestSubmit => StageTicket::test_submit(),
            Stage::Submit => StageTicket::submit(SubmitConfirmation::request(
                operator,
                &plan.confirm_request(),
            )?),
        };
        let credential = Credential::acquire(operator, self.config.webin.username.as_deref())?;

        let runner = StageRunner::new(
            &self.workspace,
            &self.service,
            pacer,
            self.config.webin.delay_for(stage),
        );
        runner.run(ticket, &plan, &credential, sink)
    }

    pub fn collect_accessions(
        &self,
        query: bool,
        pacer: &dyn Pacer,
        sink: &dyn ProgressSink,
    ) -> Result<AccessionReport, SubmitError> {
        let _lock = OutputLock::acquire(&self.workspace)?;
        let lookup = query.then_some(&self.lookup);
        AccessionCollector::new(&self.workspace, lookup, pacer, self.config.ena.lookup_delay)
            .collect(sink)
    }

    /// Latest state per assembly and stage, read from every ledger.
    pub fn status(&self, sink: &dyn ProgressSink) -> Result<StatusResult, SubmitError> {
        sink.event(ProgressEvent {
            message: "phase=Status; reading ledgers".to_string(),
            elapsed: None,
        });
        let history = LedgerHistory::load(&self.workspace)?;
        let manifests = self.workspace.list_manifests()?;
        let accessions = read_accessions(&self.workspace.accessions_path())?;

        let mut names: BTreeSet<AssemblyName> = manifests.keys().cloned().collect();
        names.extend(
            history
                .attempts()
                .iter()
                .map(|attempt| attempt.assembly_name.clone()),
        );
        names.extend(accessions.keys().cloned());

        let states = |name: &AssemblyName| -> BTreeMap<Stage, StageState> {
            Stage::ALL
                .into_iter()
                .map(|stage| (stage, history.state(name, stage)))
                .collect()
        };
        let assemblies = names
            .into_iter()
            .map(|name| {
                let state = states(&name);
                let accession = accessions.get(&name);
                StatusEntry {
                    has_manifest: manifests.contains_key(&name),
                    validate: state[&Stage::Validate],
                    test_submit: state[&Stage::TestSubmit],
                    submit: state[&Stage::Submit],
                    receipt_id: accession
                        .and_then(|record| record.receipt.as_ref())
                        .map(|receipt| receipt.to_string()),
                    permanent_accession: accession
                        .and_then(|record| record.accession.as_ref())
                        .map(|accession| accession.to_string()),
                    assembly_name: name,
                }
            })
            .collect();

        Ok(StatusResult {
            output_dir: self.workspace.root().to_string(),
            ledgers: self.workspace.list_ledgers()?.len(),
            attempts: history.attempts().len(),
            assemblies,
        })
    }
}
