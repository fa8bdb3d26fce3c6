use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SubmitError {
    #[error("{table} is missing required column(s): {}", missing.join(", "))]
    #[diagnostic(help("column names can be remapped in kira-submit.json"))]
    Schema { table: String, missing: Vec<String> },

    #[error("assembly name {name} appears more than once in {table} (rows {first_row} and {second_row})")]
    DuplicateKey {
        table: String,
        name: String,
        first_row: usize,
        second_row: usize,
    },

    #[error("failed to read table {path}: {message}")]
    Table { path: PathBuf, message: String },

    #[error("invalid assembly name: {0:?}")]
    InvalidAssemblyName(String),

    #[error("assembly {name} is missing required field(s): {}", fields.join(", "))]
    IncompleteRecord { name: String, fields: Vec<String> },

    #[error("assembly {name}: {reason}")]
    MissingSequence { name: String, reason: String },

    #[error("assembly {name}: {reason}")]
    MissingAnnotation { name: String, reason: String },

    #[error("assembly {name}: staging failed: {reason}")]
    Staging { name: String, reason: String },

    #[error("{stage} failed for {name}: {message}")]
    RemoteService {
        name: String,
        stage: String,
        message: String,
    },

    #[error("credential error: {0}")]
    Credential(String),

    #[error("submission was not confirmed")]
    ConfirmationDeclined,

    #[error("output directory is locked by another run: {0}")]
    #[diagnostic(help("remove the lock file if no other kira-submit process is running"))]
    Locked(PathBuf),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("unknown stage: {0}")]
    InvalidStage(String),

    #[error("unknown attempt status: {0}")]
    InvalidStatus(String),

    #[error("cannot move stage state {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown assembly: {0}")]
    UnknownAssembly(String),

    #[error("invalid receipt id: {0}")]
    InvalidReceiptId(String),

    #[error("invalid permanent accession: {0}")]
    InvalidAccession(String),

    #[error("ENA lookup failed: {0}")]
    LookupHttp(String),

    #[error("ENA returned status {status}: {message}")]
    LookupStatus { status: u16, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SubmitError {
    /// Errors that concern one assembly only; a batch keeps going past them.
    pub fn is_per_assembly(&self) -> bool {
        matches!(
            self,
            SubmitError::IncompleteRecord { .. }
                | SubmitError::MissingSequence { .. }
                | SubmitError::MissingAnnotation { .. }
                | SubmitError::Staging { .. }
                | SubmitError::RemoteService { .. }
        )
    }
}
