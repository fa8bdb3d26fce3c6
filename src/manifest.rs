//! Webin-CLI manifest generation.
//!
//! One `manifest_<name>.txt` per assembly record, plus a
//! `manifest_summary.tsv` describing what happened to every record. Dry runs
//! go through the same validation and report the same failures, but write
//! nothing. After a real run the output directory holds manifests for exactly
//! the records that passed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::AssemblyName;
use crate::error::SubmitError;
use crate::fs_util;
use crate::metadata::AssemblyRecord;
use crate::workspace::Workspace;

const FASTA_EXTENSIONS: &[&str] = &[
    ".fasta", ".fa", ".fna", ".fsa", ".fasta.gz", ".fa.gz", ".fna.gz", ".fsa.gz",
];

pub const FLATFILE_SUFFIX: &str = ".embl.gz";
pub const CHROMOSOME_LIST_SUFFIX: &str = ".chromosome_list.tsv.gz";
pub const UNLOCALISED_LIST_SUFFIX: &str = ".unlocalised_list.tsv.gz";
const MOLECULE_TYPE: &str = "genomic DNA";

/// Directories holding gzipped EMBL flat files and chromosome lists, named
/// `<assembly>.embl.gz` and `<assembly>.chromosome_list.tsv.gz`.
#[derive(Debug, Clone)]
pub struct AnnotationDirs {
    pub flatfile_dir: PathBuf,
    pub chromosome_list_dir: PathBuf,
}

/// Where assembly sequences come from.
#[derive(Debug, Clone)]
pub enum SequenceSource {
    /// FASTA files, gzipped into `fastas/<name>/` of the output directory.
    Fasta(PathBuf),
    /// Annotated flat files, referenced where they are.
    Annotated(AnnotationDirs),
}

#[derive(Debug, Clone)]
pub struct ManifestParams {
    /// Study accession used when no accession link supplies a bioproject.
    pub study: Option<String>,
    pub source: SequenceSource,
    pub assembly_type: String,
    pub name_prefix: String,
    pub annotated_name_suffix: String,
    pub strip_haplotype_suffix: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub study: String,
    pub sample: String,
    pub assembly_name: String,
    pub assembly_type: String,
    pub coverage: String,
    pub program: String,
    pub platform: String,
    pub molecule_type: String,
    pub fasta: String,
    pub flatfile: String,
    pub chromosome_list: String,
    pub unlocalised_list: String,
}

impl Manifest {
    pub fn fields(&self) -> [(&'static str, &str); 12] {
        [
            ("STUDY", &self.study),
            ("SAMPLE", &self.sample),
            ("ASSEMBLYNAME", &self.assembly_name),
            ("ASSEMBLY_TYPE", &self.assembly_type),
            ("COVERAGE", &self.coverage),
            ("PROGRAM", &self.program),
            ("PLATFORM", &self.platform),
            ("MOLECULETYPE", &self.molecule_type),
            ("FASTA", &self.fasta),
            ("FLATFILE", &self.flatfile),
            ("CHROMOSOME_LIST", &self.chromosome_list),
            ("UNLOCALISED_LIST", &self.unlocalised_list),
        ]
    }

    /// `KEY<TAB>VALUE` lines; empty values are left out.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.fields() {
            if value.is_empty() {
                continue;
            }
            out.push_str(key);
            out.push('\t');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Written,
    Unchanged,
    DryRunOk,
    Failed,
}

impl ManifestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifestStatus::Written => "written",
            ManifestStatus::Unchanged => "unchanged",
            ManifestStatus::DryRunOk => "dry_run_ok",
            ManifestStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestFailure {
    IncompleteRecord,
    MissingSequence,
    MissingAnnotation,
    Staging,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestOutcome {
    pub assembly_name: AssemblyName,
    pub status: ManifestStatus,
    pub manifest: Option<String>,
    pub sequence: Option<String>,
    pub failure: Option<ManifestFailure>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestReport {
    pub dry_run: bool,
    pub outcomes: Vec<ManifestOutcome>,
    /// Manifests deleted (or, in a dry run, due for deletion) because their
    /// record failed or is gone from the metadata.
    pub removed: Vec<AssemblyName>,
    pub summary_path: Option<String>,
}

impl ManifestReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn passed(&self) -> usize {
        self.total() - self.failed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ManifestOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == ManifestStatus::Failed)
    }
}

/// Record fields checked and the input files located; nothing written yet.
struct Prepared {
    study: String,
    sample: String,
    coverage: String,
    program: String,
    platform: String,
    inputs: Inputs,
}

enum Inputs {
    Fasta(PathBuf),
    Annotated {
        flatfile: PathBuf,
        chromosome_list: PathBuf,
        unlocalised_list: Option<PathBuf>,
    },
}

impl Inputs {
    fn primary(&self) -> &Path {
        match self {
            Inputs::Fasta(path) => path,
            Inputs::Annotated { flatfile, .. } => flatfile,
        }
    }
}

pub struct ManifestBuilder<'a> {
    workspace: &'a Workspace,
    params: &'a ManifestParams,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(workspace: &'a Workspace, params: &'a ManifestParams) -> Self {
        Self { workspace, params }
    }

    pub fn build_all(
        &self,
        records: &BTreeMap<AssemblyName, AssemblyRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<ManifestReport, SubmitError> {
        let candidates = match &self.params.source {
            SequenceSource::Fasta(dir) => {
                require_dir(dir, "FASTA")?;
                fs_util::walk_files(dir)?
            }
            SequenceSource::Annotated(dirs) => {
                require_dir(&dirs.flatfile_dir, "flat file")?;
                require_dir(&dirs.chromosome_list_dir, "chromosome list")?;
                Vec::new()
            }
        };
        if !self.params.dry_run {
            self.workspace.ensure_root()?;
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records.values() {
            sink.event(ProgressEvent {
                message: format!("phase=Manifest; {}", record.name),
                elapsed: None,
            });
            let outcome = match self.build_one(record, &candidates) {
                Ok(outcome) => outcome,
                Err(err) if err.is_per_assembly() => {
                    tracing::warn!(assembly = %record.name, "skipped: {err}");
                    failed_outcome(record, &err)
                }
                Err(err) => return Err(err),
            };
            outcomes.push(outcome);
        }

        let removed = self.remove_stale(records, &outcomes)?;
        let mut report = ManifestReport {
            dry_run: self.params.dry_run,
            outcomes,
            removed,
            summary_path: None,
        };
        if !self.params.dry_run {
            let path = self.workspace.summary_path();
            Workspace::write_bytes_atomic(&path, &render_summary(&report)?)?;
            report.summary_path = Some(path.to_string());
        }
        tracing::info!(
            passed = report.passed(),
            failed = report.failed(),
            removed = report.removed.len(),
            total = report.total(),
            dry_run = self.params.dry_run,
            "manifest generation finished"
        );
        Ok(report)
    }

    /// Manifests of failed records and of assemblies missing from `records`
    /// would otherwise be picked up by the next stage run.
    fn remove_stale(
        &self,
        records: &BTreeMap<AssemblyName, AssemblyRecord>,
        outcomes: &[ManifestOutcome],
    ) -> Result<Vec<AssemblyName>, SubmitError> {
        let existing = self.workspace.list_manifests()?;
        let failed = outcomes
            .iter()
            .filter(|outcome| outcome.status == ManifestStatus::Failed)
            .map(|outcome| &outcome.assembly_name);
        let dropped = existing.keys().filter(|name| !records.contains_key(*name));
        let stale: Vec<AssemblyName> = failed
            .chain(dropped)
            .filter(|name| existing.contains_key(*name))
            .cloned()
            .collect();

        for name in &stale {
            if self.params.dry_run {
                tracing::warn!(assembly = %name, "manifest would be removed");
                continue;
            }
            Workspace::remove_if_present(&existing[name])?;
            tracing::warn!(assembly = %name, "removed stale manifest {}", existing[name]);
        }
        Ok(stale)
    }

    fn build_one(
        &self,
        record: &AssemblyRecord,
        candidates: &[PathBuf],
    ) -> Result<ManifestOutcome, SubmitError> {
        let prepared = self.prepare(record, candidates)?;
        let manifest_path = self.workspace.manifest_path(&record.name);

        if self.params.dry_run {
            tracing::info!(
                assembly = %record.name,
                sequence = %prepared.inputs.primary().display(),
                sample = %prepared.sample,
                study = %prepared.study,
                "dry run ok"
            );
            return Ok(ManifestOutcome {
                assembly_name: record.name.clone(),
                status: ManifestStatus::DryRunOk,
                manifest: Some(manifest_path.to_string()),
                sequence: Some(prepared.inputs.primary().display().to_string()),
                failure: None,
                detail: None,
            });
        }

        let mut manifest = Manifest {
            study: prepared.study,
            sample: prepared.sample,
            assembly_name: self.assembly_name(&record.name),
            assembly_type: self.params.assembly_type.clone(),
            coverage: prepared.coverage,
            program: prepared.program,
            platform: prepared.platform,
            ..Manifest::default()
        };
        let sequence = match prepared.inputs {
            Inputs::Fasta(source) => {
                let staged = self.stage_sequence(&record.name, &source).map_err(|err| {
                    SubmitError::Staging {
                        name: record.name.to_string(),
                        reason: err.to_string(),
                    }
                })?;
                manifest.fasta = staged.to_string();
                manifest.fasta.clone()
            }
            Inputs::Annotated {
                flatfile,
                chromosome_list,
                unlocalised_list,
            } => {
                manifest.molecule_type = MOLECULE_TYPE.to_string();
                manifest.flatfile = flatfile.display().to_string();
                manifest.chromosome_list = chromosome_list.display().to_string();
                manifest.unlocalised_list = unlocalised_list
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                manifest.flatfile.clone()
            }
        };
        let rendered = manifest.render();

        let unchanged = fs::read(manifest_path.as_std_path())
            .map(|existing| existing == rendered.as_bytes())
            .unwrap_or(false);
        let status = if unchanged {
            ManifestStatus::Unchanged
        } else {
            Workspace::write_bytes_atomic(&manifest_path, rendered.as_bytes())?;
            ManifestStatus::Written
        };
        tracing::info!(assembly = %record.name, status = status.as_str(), "manifest {}", manifest_path);

        Ok(ManifestOutcome {
            assembly_name: record.name.clone(),
            status,
            manifest: Some(manifest_path.to_string()),
            sequence: Some(sequence),
            failure: None,
            detail: None,
        })
    }

    fn assembly_name(&self, name: &AssemblyName) -> String {
        let prefix = &self.params.name_prefix;
        match &self.params.source {
            SequenceSource::Fasta(_) => format!("{prefix}{name}"),
            SequenceSource::Annotated(_) => {
                let base = if self.params.strip_haplotype_suffix {
                    strip_haplotype_suffix(name.as_str())
                } else {
                    name.as_str()
                };
                format!("{prefix}{base}{}", self.params.annotated_name_suffix)
            }
        }
    }

    /// Validation shared by real and dry runs.
    fn prepare(
        &self,
        record: &AssemblyRecord,
        candidates: &[PathBuf],
    ) -> Result<Prepared, SubmitError> {
        let study = record
            .bioproject
            .clone()
            .or_else(|| self.params.study.clone());

        let mut missing = Vec::new();
        let mut take = |value: Option<String>, field: &str| {
            value.unwrap_or_else(|| {
                missing.push(field.to_string());
                String::new()
            })
        };
        let study = take(study, "study");
        let sample = take(record.biosample.clone(), "biosample");
        let coverage = take(record.coverage.clone(), "coverage");
        let program = take(record.assembler.clone(), "assembler");
        let platform = take(record.platform.clone(), "platform");
        if !missing.is_empty() {
            return Err(SubmitError::IncompleteRecord {
                name: record.name.to_string(),
                fields: missing,
            });
        }

        let inputs = match &self.params.source {
            SequenceSource::Fasta(fasta_dir) => {
                Inputs::Fasta(self.locate_fasta(record, fasta_dir, candidates)?)
            }
            SequenceSource::Annotated(dirs) => locate_annotation(&record.name, dirs)?,
        };

        Ok(Prepared {
            study,
            sample,
            coverage,
            program,
            platform,
            inputs,
        })
    }

    fn locate_fasta(
        &self,
        record: &AssemblyRecord,
        fasta_dir: &Path,
        candidates: &[PathBuf],
    ) -> Result<PathBuf, SubmitError> {
        let missing = |reason: String| SubmitError::MissingSequence {
            name: record.name.to_string(),
            reason,
        };
        let sequence = record
            .sequence_file
            .as_deref()
            .and_then(|hint| find_sequence(fasta_dir, hint, candidates))
            .or_else(|| find_sequence(fasta_dir, record.name.as_str(), candidates))
            .ok_or_else(|| {
                missing(format!(
                    "sequence file not found in {} (hint={})",
                    fasta_dir.display(),
                    record.sequence_file.as_deref().unwrap_or("-")
                ))
            })?;
        check_readable(&sequence, "sequence file").map_err(missing)?;
        Ok(sequence)
    }

    /// Gzip (or copy, when already gzipped) the sequence file into
    /// `fastas/<name>/` and return the absolute staged path. An existing
    /// staged file is replaced unless its bytes already match.
    fn stage_sequence(
        &self,
        name: &AssemblyName,
        source: &Path,
    ) -> Result<Utf8PathBuf, SubmitError> {
        let file_name = source
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| {
                SubmitError::Filesystem(format!("non-utf8 sequence file: {}", source.display()))
            })?;
        let dir = self.workspace.fasta_staging_dir().join(name.as_str());
        Workspace::ensure_dir(&dir)?;

        if fs_util::is_gzip(source) {
            let dest = dir.join(file_name);
            if !fs_util::same_contents(source, dest.as_std_path())? {
                let source = Utf8PathBuf::from_path_buf(source.to_path_buf()).map_err(|_| {
                    SubmitError::Filesystem("non-utf8 sequence path".to_string())
                })?;
                Workspace::copy_file_atomic(&source, &dest)?;
                tracing::debug!(assembly = %name, "staged {dest}");
            }
            return absolute(&dest);
        }

        let dest = dir.join(format!("{file_name}.gz"));
        let temp = tempfile::Builder::new()
            .prefix(".kira-submit")
            .tempfile_in(dir.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        fs_util::gzip_file(source, temp.path())?;
        if fs_util::same_contents(temp.path(), dest.as_std_path())? {
            temp.close()
                .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        } else {
            temp.persist(dest.as_std_path())
                .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
            tracing::debug!(assembly = %name, "staged {dest}");
        }
        absolute(&dest)
    }
}

fn require_dir(dir: &Path, what: &str) -> Result<(), SubmitError> {
    if dir.is_dir() {
        return Ok(());
    }
    Err(SubmitError::Filesystem(format!(
        "{what} directory not found: {}",
        dir.display()
    )))
}

fn absolute(path: &camino::Utf8Path) -> Result<Utf8PathBuf, SubmitError> {
    let resolved = fs::canonicalize(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(format!("resolve {path}: {err}")))?;
    Utf8PathBuf::from_path_buf(resolved)
        .map_err(|_| SubmitError::Filesystem("non-utf8 staged path".to_string()))
}

/// The input must open and hold at least one byte.
fn check_readable(path: &Path, what: &str) -> Result<(), String> {
    let file = fs::File::open(path)
        .map_err(|err| format!("cannot read {what} {}: {err}", path.display()))?;
    let size = file
        .metadata()
        .map_err(|err| format!("cannot stat {what} {}: {err}", path.display()))?
        .len();
    if size == 0 {
        return Err(format!("{what} is empty: {}", path.display()));
    }
    Ok(())
}

/// `<flatfile_dir>/<name>.embl.gz` and `<chromosome_list_dir>/<name>.chromosome_list.tsv.gz`
/// are required; an unlocalised list next to the chromosome list is picked up
/// when present.
fn locate_annotation(name: &AssemblyName, dirs: &AnnotationDirs) -> Result<Inputs, SubmitError> {
    let resolve = |path: PathBuf, what: &str| -> Result<PathBuf, String> {
        if !path.is_file() {
            return Err(format!("{what} not found: {}", path.display()));
        }
        check_readable(&path, what)?;
        fs::canonicalize(&path).map_err(|err| format!("resolve {}: {err}", path.display()))
    };

    let flatfile = resolve(
        dirs.flatfile_dir.join(format!("{name}{FLATFILE_SUFFIX}")),
        "flat file",
    )
    .map_err(|reason| SubmitError::MissingSequence {
        name: name.to_string(),
        reason,
    })?;
    let chromosome_list = resolve(
        dirs.chromosome_list_dir
            .join(format!("{name}{CHROMOSOME_LIST_SUFFIX}")),
        "chromosome list",
    )
    .map_err(|reason| SubmitError::MissingAnnotation {
        name: name.to_string(),
        reason,
    })?;

    let unlocalised = dirs
        .chromosome_list_dir
        .join(format!("{name}{UNLOCALISED_LIST_SUFFIX}"));
    let unlocalised_list = if unlocalised.exists() {
        Some(
            resolve(unlocalised, "unlocalised list").map_err(|reason| {
                SubmitError::MissingAnnotation {
                    name: name.to_string(),
                    reason,
                }
            })?,
        )
    } else {
        None
    };

    Ok(Inputs::Annotated {
        flatfile,
        chromosome_list,
        unlocalised_list,
    })
}

/// `URI88H` and `URI88P` both become `URI88`.
pub fn strip_haplotype_suffix(name: &str) -> &str {
    match name.strip_suffix(['H', 'P']) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    }
}

fn failed_outcome(record: &AssemblyRecord, err: &SubmitError) -> ManifestOutcome {
    let failure = match err {
        SubmitError::IncompleteRecord { .. } => Some(ManifestFailure::IncompleteRecord),
        SubmitError::MissingSequence { .. } => Some(ManifestFailure::MissingSequence),
        SubmitError::MissingAnnotation { .. } => Some(ManifestFailure::MissingAnnotation),
        SubmitError::Staging { .. } => Some(ManifestFailure::Staging),
        _ => None,
    };
    ManifestOutcome {
        assembly_name: record.name.clone(),
        status: ManifestStatus::Failed,
        manifest: None,
        sequence: None,
        failure,
        detail: Some(err.to_string()),
    }
}

/// Locate a sequence file from a metadata hint: the exact relative path
/// first, then a unique name match carrying a FASTA extension, preferring an
/// exact stem match when several files contain the stem.
pub fn find_sequence(fasta_dir: &Path, hint: &str, candidates: &[PathBuf]) -> Option<PathBuf> {
    let hint = hint.trim();
    if hint.is_empty() {
        return None;
    }
    let exact = fasta_dir.join(hint);
    if exact.is_file() {
        return Some(exact);
    }

    let stem = sequence_stem(hint);
    if stem.is_empty() {
        return None;
    }
    for ext in FASTA_EXTENSIONS {
        let matches: Vec<&PathBuf> = candidates
            .iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(ext) && name.contains(stem))
                    .unwrap_or(false)
            })
            .collect();
        if matches.len() == 1 {
            return Some(matches[0].clone());
        }
        if matches.len() > 1 {
            let tight: Vec<&&PathBuf> = matches
                .iter()
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| sequence_stem(name) == stem)
                        .unwrap_or(false)
                })
                .collect();
            if tight.len() == 1 {
                return Some((*tight[0]).clone());
            }
        }
    }
    None
}

/// File name without directories, `.gz` and FASTA extension.
fn sequence_stem(hint: &str) -> &str {
    let name = hint.rsplit(['/', '\\']).next().unwrap_or(hint);
    let name = name.strip_suffix(".gz").unwrap_or(name);
    [".fasta", ".fna", ".fsa", ".fa"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
}

fn render_summary(report: &ManifestReport) -> Result<Vec<u8>, SubmitError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(Vec::new());
    writer
        .write_record(["assembly_name", "status", "manifest", "detail"])
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    for outcome in &report.outcomes {
        writer
            .write_record([
                outcome.assembly_name.as_str(),
                outcome.status.as_str(),
                outcome.manifest.as_deref().unwrap_or(""),
                outcome.detail.as_deref().unwrap_or(""),
            ])
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|err| SubmitError::Filesystem(err.to_string()))
}
