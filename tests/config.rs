use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use kira_submit::config::{Config, ConfigLoader, MetadataColumns};
use kira_submit::domain::Stage;
use kira_submit::error::SubmitError;

#[test]
fn empty_config_resolves_to_defaults() {
    let resolved = ConfigLoader::resolve_config(Config::default());
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.metadata_columns, MetadataColumns::default());
    assert_eq!(resolved.accession_columns.assembly_name, "isolate_name");
    assert_eq!(resolved.webin.java, "java");
    assert_eq!(resolved.webin.context, "genome");
    assert_eq!(resolved.webin.username, None);
    assert_eq!(resolved.manifest.assembly_type, "isolate");
    assert_eq!(resolved.manifest.name_prefix, "");
    assert_eq!(resolved.ena.lookup_delay, Duration::from_secs(1));
    assert_eq!(resolved.webin.delay_for(Stage::Validate), Duration::ZERO);
    assert_eq!(
        resolved.webin.delay_for(Stage::Submit),
        Stage::Submit.min_delay()
    );
}

#[test]
fn partial_column_entry_keeps_other_defaults() {
    let config: Config = serde_json::from_str(
        r#"{"schema_version": 1,
            "accession_columns": {"assembly_name": "sample_alias"},
            "webin": {"username": "Webin-42", "submit_delay_secs": 30},
            "manifest": {"name_prefix": "uri_"}}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve_config(config);
    assert_eq!(resolved.accession_columns.assembly_name, "sample_alias");
    assert_eq!(resolved.accession_columns.bioproject, "BioProject");
    assert_eq!(resolved.webin.username.as_deref(), Some("Webin-42"));
    assert_eq!(
        resolved.webin.delay_for(Stage::Submit),
        Duration::from_secs(30)
    );
    assert_eq!(resolved.manifest.name_prefix, "uri_");
}

#[test]
fn explicit_config_file_is_read() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-submit.json");
    fs::write(&path, r#"{"webin": {"jar": "/opt/webin/webin-cli-8.1.jar"}}"#).unwrap();
    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert!(resolved.webin.jar.ends_with("webin-cli-8.1.jar"));
}

#[test]
fn broken_config_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-submit.json");
    fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, SubmitError::ConfigParse(_));

    let missing = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(missing.to_str()).unwrap_err();
    assert_matches!(err, SubmitError::ConfigRead(_));
}

#[test]
fn long_test_submit_pause_pushes_submit_pause_above_it() {
    let config: Config = serde_json::from_str(
        r#"{"webin": {"test_submit_delay_secs": 45, "submit_delay_secs": 20}}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve_config(config);
    assert_eq!(
        resolved.webin.delay_for(Stage::TestSubmit),
        Duration::from_secs(45)
    );
    assert!(resolved.webin.delay_for(Stage::Submit) > Duration::from_secs(45));
}

#[test]
fn annotated_naming_defaults_and_overrides() {
    let resolved = ConfigLoader::resolve_config(Config::default());
    assert_eq!(resolved.manifest.annotated_name_suffix, "_ann_v1");
    assert!(!resolved.manifest.strip_haplotype_suffix);

    let config: Config = serde_json::from_str(
        r#"{"manifest": {"annotated_name_suffix": "_ann_v2", "strip_haplotype_suffix": true}}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve_config(config);
    assert_eq!(resolved.manifest.annotated_name_suffix, "_ann_v2");
    assert!(resolved.manifest.strip_haplotype_suffix);
}
