use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{AssemblyName, Stage};
use crate::error::SubmitError;

pub const MANIFEST_PREFIX: &str = "manifest_";
pub const MANIFEST_SUFFIX: &str = ".txt";
pub const LEDGER_PREFIX: &str = "submission_receipts_";

/// Layout of one output directory: manifests, staged sequences, service logs,
/// receipt ledgers and the accession table all live below `root`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_std(root: &std::path::Path) -> Result<Self, SubmitError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|_| SubmitError::Filesystem("non-utf8 output directory".to_string()))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn manifest_path(&self, name: &AssemblyName) -> Utf8PathBuf {
        self.root
            .join(format!("{MANIFEST_PREFIX}{}{MANIFEST_SUFFIX}", name.as_str()))
    }

    pub fn summary_path(&self) -> Utf8PathBuf {
        self.root.join("manifest_summary.tsv")
    }

    pub fn fasta_staging_dir(&self) -> Utf8PathBuf {
        self.root.join("fastas")
    }

    pub fn log_dir(&self, stage: Stage) -> Utf8PathBuf {
        self.root.join("logs").join(stage.as_str())
    }

    pub fn log_path(&self, stage: Stage, name: &AssemblyName) -> Utf8PathBuf {
        self.log_dir(stage).join(format!("{}.log", name.as_str()))
    }

    pub fn service_output_dir(&self, stage: Stage, name: &AssemblyName) -> Utf8PathBuf {
        self.root
            .join("webin")
            .join(stage.as_str())
            .join(name.as_str())
    }

    pub fn receipts_dir(&self) -> Utf8PathBuf {
        self.root.join("receipts")
    }

    pub fn accessions_path(&self) -> Utf8PathBuf {
        self.root.join("accessions.tsv")
    }

    pub fn lock_path(&self) -> Utf8PathBuf {
        self.root.join(".kira-submit.lock")
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), SubmitError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(format!("create {path}: {err}")))
    }

    pub fn ensure_root(&self) -> Result<(), SubmitError> {
        Self::ensure_dir(&self.root)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SubmitError> {
        let parent = path
            .parent()
            .ok_or_else(|| SubmitError::Filesystem("invalid destination path".to_string()))?;
        Self::ensure_dir(parent)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".kira-submit")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        std::io::Write::write_all(&mut temp, content)
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), SubmitError> {
        let parent = dest
            .parent()
            .ok_or_else(|| SubmitError::Filesystem("invalid destination path".to_string()))?;
        Self::ensure_dir(parent)?;
        let temp = tempfile::Builder::new()
            .prefix(".kira-submit")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| SubmitError::Filesystem(format!("copy {source}: {err}")))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Deletes a file if it exists.
    pub fn remove_if_present(path: &Utf8Path) -> Result<bool, SubmitError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(SubmitError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    /// Manifests present in the output directory, ordered by assembly name.
    pub fn list_manifests(&self) -> Result<BTreeMap<AssemblyName, Utf8PathBuf>, SubmitError> {
        let mut manifests = BTreeMap::new();
        for (stem, path) in list_files(&self.root)? {
            let Some(name) = stem
                .strip_prefix(MANIFEST_PREFIX)
                .and_then(|rest| rest.strip_suffix(MANIFEST_SUFFIX))
            else {
                continue;
            };
            match name.parse::<AssemblyName>() {
                Ok(name) => {
                    manifests.insert(name, path);
                }
                Err(_) => tracing::warn!(file = %path, "ignoring manifest with unusable name"),
            }
        }
        Ok(manifests)
    }

    /// Per-assembly service logs of one stage, ordered by assembly name.
    pub fn list_logs(&self, stage: Stage) -> Result<BTreeMap<AssemblyName, Utf8PathBuf>, SubmitError> {
        let mut logs = BTreeMap::new();
        for (file_name, path) in list_files(&self.log_dir(stage))? {
            let Some(stem) = file_name.strip_suffix(".log") else {
                continue;
            };
            if let Ok(name) = stem.parse::<AssemblyName>() {
                logs.insert(name, path);
            }
        }
        Ok(logs)
    }

    /// Every receipt ledger written so far, oldest first (names carry the run
    /// timestamp).
    pub fn list_ledgers(&self) -> Result<Vec<Utf8PathBuf>, SubmitError> {
        let mut ledgers: Vec<(String, Utf8PathBuf)> = list_files(&self.receipts_dir())?
            .into_iter()
            .filter(|(name, _)| name.starts_with(LEDGER_PREFIX) && name.ends_with(".tsv"))
            .collect();
        ledgers.sort_by(|a, b| ledger_sort_key(&a.0).cmp(&ledger_sort_key(&b.0)));
        Ok(ledgers.into_iter().map(|(_, path)| path).collect())
    }
}

/// `submission_receipts_<stage>_<timestamp>[_<n>].tsv` sorts by timestamp,
/// then by collision counter.
fn ledger_sort_key(file_name: &str) -> (String, u32) {
    let stem = file_name.trim_end_matches(".tsv");
    let after_prefix = stem.trim_start_matches(LEDGER_PREFIX);
    let timestamp_and_counter = Stage::ALL
        .iter()
        .find_map(|stage| after_prefix.strip_prefix(&format!("{}_", stage.as_str())))
        .unwrap_or(after_prefix);
    match timestamp_and_counter.split_once('_') {
        Some((timestamp, counter)) => (timestamp.to_string(), counter.parse().unwrap_or(0)),
        None => (timestamp_and_counter.to_string(), 0),
    }
}

fn list_files(dir: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, SubmitError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| SubmitError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
            continue;
        };
        if let Some(name) = path.file_name() {
            files.push((name.to_string(), path.clone()));
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let workspace = Workspace::new("out");
        let name: AssemblyName = "URI88H".parse().unwrap();

        assert_eq!(
            workspace.manifest_path(&name),
            Utf8PathBuf::from("out/manifest_URI88H.txt")
        );
        assert!(
            workspace
                .log_path(Stage::TestSubmit, &name)
                .ends_with("logs/test_submit/URI88H.log")
        );
        assert!(
            workspace
                .service_output_dir(Stage::Submit, &name)
                .ends_with("webin/submit/URI88H")
        );
    }

    #[test]
    fn ledgers_sort_by_timestamp_across_stages() {
        let mut names = vec![
            "submission_receipts_validate_20260102T101010.tsv".to_string(),
            "submission_receipts_submit_20260101T090000_1.tsv".to_string(),
            "submission_receipts_test_submit_20260101T090000.tsv".to_string(),
        ];
        names.sort_by(|a, b| ledger_sort_key(a).cmp(&ledger_sort_key(b)));
        assert_eq!(
            names,
            vec![
                "submission_receipts_test_submit_20260101T090000.tsv",
                "submission_receipts_submit_20260101T090000_1.tsv",
                "submission_receipts_validate_20260102T101010.tsv",
            ]
        );
    }

    #[test]
    fn list_manifests_sorted_and_filtered() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = Workspace::from_std(temp.path()).unwrap();
        for file in ["manifest_B.txt", "manifest_A.txt", "manifest_summary.tsv", "notes.txt"] {
            std::fs::write(temp.path().join(file), b"x").unwrap();
        }
        let names: Vec<String> = workspace
            .list_manifests()
            .unwrap()
            .keys()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
