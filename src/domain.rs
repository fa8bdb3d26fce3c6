use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

/// Unique key of an assembly across the whole pipeline. It becomes part of
/// file names (`manifest_<name>.txt`, `logs/<stage>/<name>.log`), so it must
/// be a plain file-name component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssemblyName(String);

impl AssemblyName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssemblyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AssemblyName {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && !trimmed.starts_with('.')
            && !trimmed
                .chars()
                .any(|ch| matches!(ch, '/' | '\\' | '\0') || ch.is_control());
        if !is_valid {
            return Err(SubmitError::InvalidAssemblyName(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for AssemblyName {
    type Error = SubmitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AssemblyName> for String {
    fn from(value: AssemblyName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    TestSubmit,
    Submit,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Validate, Stage::TestSubmit, Stage::Submit];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::TestSubmit => "test_submit",
            Stage::Submit => "submit",
        }
    }

    /// Mode flags passed to Webin-CLI for this stage.
    pub fn mode_args(self) -> &'static [&'static str] {
        match self {
            Stage::Validate => &["-validate"],
            Stage::TestSubmit => &["-submit", "-test"],
            Stage::Submit => &["-submit"],
        }
    }

    /// Floor for the pause between two consecutive service calls.
    pub fn min_delay(self) -> Duration {
        match self {
            Stage::Validate => Duration::ZERO,
            Stage::TestSubmit => Duration::from_secs(2),
            Stage::Submit => Duration::from_secs(10),
        }
    }

    pub fn predecessors(self) -> &'static [Stage] {
        match self {
            Stage::Validate => &[],
            Stage::TestSubmit => &[Stage::Validate],
            Stage::Submit => &[Stage::Validate, Stage::TestSubmit],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "validate" => Ok(Stage::Validate),
            "test_submit" | "test-submit" | "test" => Ok(Stage::TestSubmit),
            "submit" => Ok(Stage::Submit),
            other => Err(SubmitError::InvalidStage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Passed,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Passed => "PASSED",
            AttemptStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PASSED" | "PASS" | "SUCCESS" => Ok(AttemptStatus::Passed),
            "FAILED" | "FAIL" => Ok(AttemptStatus::Failed),
            other => Err(SubmitError::InvalidStatus(other.to_string())),
        }
    }
}

/// Per-assembly state within one stage run.
///
/// `NotAttempted -> Running -> {Passed, Failed}`; any other move is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    NotAttempted,
    Running,
    Passed,
    Failed,
}

impl StageState {
    pub fn begin(self) -> Result<StageState, SubmitError> {
        match self {
            StageState::NotAttempted => Ok(StageState::Running),
            other => Err(other.refuse(StageState::Running)),
        }
    }

    pub fn resolve(self, status: AttemptStatus) -> Result<StageState, SubmitError> {
        let next = match status {
            AttemptStatus::Passed => StageState::Passed,
            AttemptStatus::Failed => StageState::Failed,
        };
        match self {
            StageState::Running => Ok(next),
            other => Err(other.refuse(next)),
        }
    }

    fn refuse(self, to: StageState) -> SubmitError {
        SubmitError::InvalidTransition {
            from: format!("{self:?}"),
            to: format!("{to:?}"),
        }
    }
}

impl From<Option<AttemptStatus>> for StageState {
    fn from(value: Option<AttemptStatus>) -> Self {
        match value {
            None => StageState::NotAttempted,
            Some(AttemptStatus::Passed) => StageState::Passed,
            Some(AttemptStatus::Failed) => StageState::Failed,
        }
    }
}

/// Interim analysis accession handed out right after a production submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(String);

impl ReceiptId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReceiptId {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let digits = normalized.strip_prefix("ERZ").unwrap_or("");
        if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(SubmitError::InvalidReceiptId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Durable assembly accession (`GCA_000000000.1`) assigned by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermanentAccession(String);

impl PermanentAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermanentAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PermanentAccession {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let rest = normalized.strip_prefix("GCA_").unwrap_or("");
        let (number, version) = match rest.split_once('.') {
            Some((number, version)) => (number, Some(version)),
            None => (rest, None),
        };
        let number_ok = !number.is_empty() && number.chars().all(|ch| ch.is_ascii_digit());
        let version_ok = version
            .map(|v| !v.is_empty() && v.chars().all(|ch| ch.is_ascii_digit()))
            .unwrap_or(true);
        if !number_ok || !version_ok {
            return Err(SubmitError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}
