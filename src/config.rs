use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Stage;
use crate::error::SubmitError;

pub const CONFIG_FILE_NAME: &str = "kira-submit.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub metadata_columns: Option<MetadataColumnsEntry>,
    #[serde(default)]
    pub accession_columns: Option<AccessionColumnsEntry>,
    #[serde(default)]
    pub webin: Option<WebinEntry>,
    #[serde(default)]
    pub ena: Option<EnaEntry>,
    #[serde(default)]
    pub manifest: Option<ManifestEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MetadataColumnsEntry {
    pub assembly_name: Option<String>,
    pub biosample: Option<String>,
    pub coverage: Option<String>,
    pub assembler: Option<String>,
    pub platform: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AccessionColumnsEntry {
    pub assembly_name: Option<String>,
    pub bioproject: Option<String>,
    pub biosample: Option<String>,
    pub sra: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WebinEntry {
    pub java: Option<String>,
    pub jar: Option<String>,
    pub context: Option<String>,
    pub username: Option<String>,
    pub test_submit_delay_secs: Option<u64>,
    pub submit_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EnaEntry {
    pub report_url: Option<String>,
    pub lookup_delay_millis: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ManifestEntry {
    pub assembly_type: Option<String>,
    pub name_prefix: Option<String>,
    pub annotated_name_suffix: Option<String>,
    pub strip_haplotype_suffix: Option<bool>,
}

/// Header names of the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataColumns {
    pub assembly_name: String,
    pub biosample: String,
    pub coverage: String,
    pub assembler: String,
    pub platform: String,
    pub filename: String,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        Self {
            assembly_name: "assembly_name".to_string(),
            biosample: "biosample_accession".to_string(),
            coverage: "genome_coverage".to_string(),
            assembler: "assembly_methods".to_string(),
            platform: "sequencing_technologies".to_string(),
            filename: "filename".to_string(),
        }
    }
}

impl MetadataColumns {
    pub fn required(&self) -> [&str; 6] {
        [
            &self.assembly_name,
            &self.biosample,
            &self.coverage,
            &self.assembler,
            &self.platform,
            &self.filename,
        ]
    }
}

/// Header names of the optional accession-mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessionColumns {
    pub assembly_name: String,
    pub bioproject: String,
    pub biosample: String,
    pub sra: String,
}

impl Default for AccessionColumns {
    fn default() -> Self {
        Self {
            assembly_name: "isolate_name".to_string(),
            bioproject: "BioProject".to_string(),
            biosample: "BioSample".to_string(),
            sra: "SRA".to_string(),
        }
    }
}

impl AccessionColumns {
    /// The SRA column is informational and may be absent.
    pub fn required(&self) -> [&str; 3] {
        [&self.assembly_name, &self.bioproject, &self.biosample]
    }
}

#[derive(Debug, Clone)]
pub struct WebinSettings {
    pub java: String,
    pub jar: PathBuf,
    pub context: String,
    pub username: Option<String>,
    pub test_submit_delay: Duration,
    pub submit_delay: Duration,
}

impl WebinSettings {
    /// Pause enforced between consecutive calls of a stage; never below
    /// [`Stage::min_delay`]. The submit pause always stays longer than the
    /// test-submit pause, whatever the configured values.
    pub fn delay_for(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Validate => Stage::Validate.min_delay(),
            Stage::TestSubmit => self.test_submit_delay.max(stage.min_delay()),
            Stage::Submit => {
                let above_test = self.delay_for(Stage::TestSubmit) + Duration::from_secs(1);
                self.submit_delay.max(stage.min_delay()).max(above_test)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnaSettings {
    pub report_url: String,
    pub lookup_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub assembly_type: String,
    pub name_prefix: String,
    /// Appended to ASSEMBLYNAME of annotated submissions, which must not
    /// reuse the name of an earlier unannotated one.
    pub annotated_name_suffix: String,
    /// Drop a trailing `H`/`P` haplotype marker from annotated names.
    pub strip_haplotype_suffix: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub metadata_columns: MetadataColumns,
    pub accession_columns: AccessionColumns,
    pub webin: WebinSettings,
    pub ena: EnaSettings,
    pub manifest: ManifestSettings,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        ConfigLoader::resolve_config(Config::default())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path, then `kira-submit.json` in the working directory, then
    /// the user config directory. Nothing found means built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SubmitError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };
        let Some(config_path) = config_path else {
            return Ok(ResolvedConfig::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SubmitError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SubmitError::ConfigParse(err.to_string()))?;
        tracing::debug!(path = %config_path.display(), "loaded config");

        Ok(Self::resolve_config(config))
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("kira-submit").join("config.json"))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> ResolvedConfig {
        let schema_version = config.schema_version.unwrap_or(1);

        let defaults = MetadataColumns::default();
        let metadata_columns = match config.metadata_columns {
            Some(entry) => MetadataColumns {
                assembly_name: entry.assembly_name.unwrap_or(defaults.assembly_name),
                biosample: entry.biosample.unwrap_or(defaults.biosample),
                coverage: entry.coverage.unwrap_or(defaults.coverage),
                assembler: entry.assembler.unwrap_or(defaults.assembler),
                platform: entry.platform.unwrap_or(defaults.platform),
                filename: entry.filename.unwrap_or(defaults.filename),
            },
            None => defaults,
        };

        let defaults = AccessionColumns::default();
        let accession_columns = match config.accession_columns {
            Some(entry) => AccessionColumns {
                assembly_name: entry.assembly_name.unwrap_or(defaults.assembly_name),
                bioproject: entry.bioproject.unwrap_or(defaults.bioproject),
                biosample: entry.biosample.unwrap_or(defaults.biosample),
                sra: entry.sra.unwrap_or(defaults.sra),
            },
            None => defaults,
        };

        let webin = config.webin.unwrap_or_default();
        let webin = WebinSettings {
            java: webin.java.unwrap_or_else(|| "java".to_string()),
            jar: PathBuf::from(webin.jar.unwrap_or_else(|| "webin-cli.jar".to_string())),
            context: webin.context.unwrap_or_else(|| "genome".to_string()),
            username: webin.username,
            test_submit_delay: webin
                .test_submit_delay_secs
                .map(Duration::from_secs)
                .unwrap_or_default()
                .max(Stage::TestSubmit.min_delay()),
            submit_delay: webin
                .submit_delay_secs
                .map(Duration::from_secs)
                .unwrap_or_default()
                .max(Stage::Submit.min_delay()),
        };

        let ena = config.ena.unwrap_or_default();
        let ena = EnaSettings {
            report_url: ena.report_url.unwrap_or_else(|| {
                "https://www.ebi.ac.uk/ena/submit/report/analyses".to_string()
            }),
            lookup_delay: Duration::from_millis(ena.lookup_delay_millis.unwrap_or(1000)),
        };

        let manifest = config.manifest.unwrap_or_default();
        let manifest = ManifestSettings {
            assembly_type: manifest
                .assembly_type
                .unwrap_or_else(|| "isolate".to_string()),
            name_prefix: manifest.name_prefix.unwrap_or_default(),
            annotated_name_suffix: manifest
                .annotated_name_suffix
                .unwrap_or_else(|| "_ann_v1".to_string()),
            strip_haplotype_suffix: manifest.strip_haplotype_suffix.unwrap_or(false),
        };

        ResolvedConfig {
            schema_version,
            metadata_columns,
            accession_columns,
            webin,
            ena,
            manifest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_delay_cannot_undercut_minimum() {
        let config: Config =
            serde_json::from_str(r#"{"webin": {"submit_delay_secs": 1}}"#).unwrap();
        let resolved = ConfigLoader::resolve_config(config);
        assert_eq!(
            resolved.webin.delay_for(Stage::Submit),
            Stage::Submit.min_delay()
        );
        assert_eq!(
            resolved.webin.delay_for(Stage::TestSubmit),
            Stage::TestSubmit.min_delay()
        );
    }

    #[test]
    fn submit_pause_stays_longer_than_test_submit_pause() {
        let config: Config = serde_json::from_str(
            r#"{"webin": {"submit_delay_secs": 1, "test_submit_delay_secs": 30}}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config);
        let test_submit = resolved.webin.delay_for(Stage::TestSubmit);
        let submit = resolved.webin.delay_for(Stage::Submit);
        assert_eq!(test_submit, Duration::from_secs(30));
        assert!(submit > test_submit);
        assert!(test_submit > resolved.webin.delay_for(Stage::Validate));
    }
}
