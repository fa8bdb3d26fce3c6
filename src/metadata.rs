//! Metadata table loading and the join with the optional accession-mapping
//! table.
//!
//! Both tables may be TSV or CSV. Column names come from
//! [`MetadataColumns`]/[`AccessionColumns`] so upstream header drift is a
//! config change, not a code change.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::Serialize;

use crate::config::{AccessionColumns, MetadataColumns};
use crate::domain::AssemblyName;
use crate::error::SubmitError;

const SNIFF_BYTES: usize = 4096;
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyRecord {
    pub name: AssemblyName,
    pub biosample: Option<String>,
    pub bioproject: Option<String>,
    pub sra: Option<String>,
    pub coverage: Option<String>,
    pub assembler: Option<String>,
    pub platform: Option<String>,
    /// File name (or name fragment) of the sequence file in the FASTA
    /// directory.
    pub sequence_file: Option<String>,
    /// 1-based line in the metadata table.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessionLink {
    pub name: AssemblyName,
    pub bioproject: Option<String>,
    pub biosample: Option<String>,
    pub sra: Option<String>,
}

/// An accession-mapping row without a metadata row. The assembly cannot be
/// submitted and is left out of the loaded set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferentialWarning {
    pub name: AssemblyName,
    pub table: String,
}

impl fmt::Display for ReferentialWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is listed in {} but has no metadata row; excluded",
            self.name, self.table
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadedMetadata {
    pub records: BTreeMap<AssemblyName, AssemblyRecord>,
    pub warnings: Vec<ReferentialWarning>,
}

pub struct MetadataLoader<'a> {
    pub metadata_columns: &'a MetadataColumns,
    pub accession_columns: &'a AccessionColumns,
}

impl<'a> MetadataLoader<'a> {
    pub fn new(
        metadata_columns: &'a MetadataColumns,
        accession_columns: &'a AccessionColumns,
    ) -> Self {
        Self {
            metadata_columns,
            accession_columns,
        }
    }

    pub fn load(
        &self,
        metadata: &Path,
        accessions: Option<&Path>,
    ) -> Result<LoadedMetadata, SubmitError> {
        let records = self.load_records(metadata)?;
        tracing::info!(rows = records.len(), path = %metadata.display(), "loaded metadata");
        let links = match accessions {
            Some(path) => {
                let links = self.load_links(path)?;
                tracing::info!(rows = links.len(), path = %path.display(), "loaded accession map");
                links
            }
            None => BTreeMap::new(),
        };
        let table = accessions
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        Ok(join(records, links, &table))
    }

    pub fn load_records(
        &self,
        path: &Path,
    ) -> Result<BTreeMap<AssemblyName, AssemblyRecord>, SubmitError> {
        let table = Table::read(path)?;
        let columns = self.metadata_columns;
        table.require(&columns.required())?;

        let mut records = BTreeMap::<AssemblyName, AssemblyRecord>::new();
        for (line, row) in table.rows() {
            let raw_name = table.cell(row, &columns.assembly_name);
            if raw_name.is_empty() {
                continue;
            }
            let name: AssemblyName = raw_name.parse()?;
            if let Some(existing) = records.get(&name) {
                return Err(SubmitError::DuplicateKey {
                    table: path.display().to_string(),
                    name: name.to_string(),
                    first_row: existing.line,
                    second_row: line,
                });
            }
            let record = AssemblyRecord {
                name: name.clone(),
                biosample: non_empty(table.cell(row, &columns.biosample)),
                bioproject: None,
                sra: None,
                coverage: non_empty(&normalize_coverage(table.cell(row, &columns.coverage))),
                assembler: non_empty(&clean_field(table.cell(row, &columns.assembler))),
                platform: non_empty(&clean_field(table.cell(row, &columns.platform))),
                sequence_file: non_empty(table.cell(row, &columns.filename)),
                line,
            };
            records.insert(name, record);
        }
        Ok(records)
    }

    pub fn load_links(
        &self,
        path: &Path,
    ) -> Result<BTreeMap<AssemblyName, AccessionLink>, SubmitError> {
        let table = Table::read(path)?;
        let columns = self.accession_columns;
        table.require(&columns.required())?;

        let mut links = BTreeMap::<AssemblyName, (usize, AccessionLink)>::new();
        for (line, row) in table.rows() {
            let raw_name = table.cell(row, &columns.assembly_name);
            if raw_name.is_empty() {
                continue;
            }
            let name: AssemblyName = raw_name.parse()?;
            if let Some((first_row, _)) = links.get(&name) {
                return Err(SubmitError::DuplicateKey {
                    table: path.display().to_string(),
                    name: name.to_string(),
                    first_row: *first_row,
                    second_row: line,
                });
            }
            let link = AccessionLink {
                name: name.clone(),
                bioproject: non_empty(table.cell(row, &columns.bioproject)),
                biosample: non_empty(table.cell(row, &columns.biosample)),
                sra: non_empty(table.cell(row, &columns.sra)),
            };
            links.insert(name, (line, link));
        }
        Ok(links
            .into_iter()
            .map(|(name, (_, link))| (name, link))
            .collect())
    }
}

/// Overlay accession links onto metadata records. Non-empty link values win
/// over the metadata biosample; links without a record become warnings.
pub fn join(
    mut records: BTreeMap<AssemblyName, AssemblyRecord>,
    links: BTreeMap<AssemblyName, AccessionLink>,
    table: &str,
) -> LoadedMetadata {
    let mut warnings = Vec::new();
    for (name, link) in links {
        let Some(record) = records.get_mut(&name) else {
            let warning = ReferentialWarning {
                name,
                table: table.to_string(),
            };
            tracing::warn!("{warning}");
            warnings.push(warning);
            continue;
        };
        if link.biosample.is_some() {
            record.biosample = link.biosample;
        }
        record.bioproject = link.bioproject;
        record.sra = link.sra;
    }
    LoadedMetadata { records, warnings }
}

/// Rows of a delimited table with trimmed, header-addressed cells.
pub struct Table {
    path: PathBuf,
    col_map: HashMap<String, usize>,
    rows: Vec<(usize, StringRecord)>,
}

impl Table {
    pub fn read(path: &Path) -> Result<Self, SubmitError> {
        let bytes = fs::read(path).map_err(|err| SubmitError::Table {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let content = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes.as_slice());
        let delimiter = detect_delimiter(path, content);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| SubmitError::Table {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
            .iter()
            .map(String::from)
            .collect();

        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|err| SubmitError::Table {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            let line = record
                .position()
                .map(|pos| pos.line() as usize)
                .unwrap_or(idx + 2);
            rows.push((line, record));
        }

        let col_map = headers
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, idx))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            col_map,
            rows,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = (usize, &StringRecord)> {
        self.rows.iter().map(|(line, row)| (*line, row))
    }

    pub fn require(&self, columns: &[&str]) -> Result<(), SubmitError> {
        let missing: Vec<String> = columns
            .iter()
            .filter(|column| !self.col_map.contains_key(**column))
            .map(|column| column.to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(SubmitError::Schema {
            table: self.path.display().to_string(),
            missing,
        })
    }

    /// Cell under `column`, or `""` when the column or cell is absent.
    pub fn cell<'r>(&self, row: &'r StringRecord, column: &str) -> &'r str {
        self.col_map
            .get(column)
            .and_then(|idx| row.get(*idx))
            .unwrap_or("")
    }
}

fn detect_delimiter(path: &Path, content: &[u8]) -> u8 {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("csv") => b',',
        Some("tsv") => b'\t',
        _ => {
            let sample = &content[..content.len().min(SNIFF_BYTES)];
            let tabs = sample.iter().filter(|b| **b == b'\t').count();
            let commas = sample.iter().filter(|b| **b == b',').count();
            if tabs > commas { b'\t' } else { b',' }
        }
    }
}

/// NCBI exports list-valued cells as JSON (`[["SPAdes","3.15"]]`); flatten
/// them to `SPAdes 3.15`. Anything else is returned unchanged.
pub fn clean_field(value: &str) -> String {
    let trimmed = value.trim();
    if !trimmed.starts_with('[') {
        return trimmed.to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(parsed @ serde_json::Value::Array(_)) => {
            let mut parts = Vec::new();
            flatten_json(&parsed, &mut parts);
            parts.join(" ")
        }
        _ => trimmed.to_string(),
    }
}

fn flatten_json(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_json(item, out);
            }
        }
        serde_json::Value::String(text) => out.push(text.clone()),
        serde_json::Value::Null => {}
        other => out.push(other.to_string()),
    }
}

/// `85x` and `85X` become `85`.
pub fn normalize_coverage(value: &str) -> String {
    value.trim().trim_end_matches(['x', 'X']).trim().to_string()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
