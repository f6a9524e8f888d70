use std::fs;

use assert_matches::assert_matches;
use tempfile::TempDir;

use dmri_preprocessing::config::{
    Config, ConfigLoader, ConfigOverrides, MergePolicy, ResolvedConfig,
};
use dmri_preprocessing::error::PrepError;

#[test]
fn file_values_apply_over_defaults() {
    let config: Config = serde_json::from_str(
        r#"{ "b0_threshold": 50, "merge_policy": "concatenate", "denoise_window": 0 }"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve_config(config, ConfigOverrides::default()).unwrap();
    assert_eq!(resolved.b0_threshold, 50);
    assert_eq!(resolved.merge_policy, MergePolicy::Concatenate);
    assert_eq!(resolved.denoise_extent(), None);
    assert_eq!(resolved.n_cpus, 1);
    assert_eq!(resolved.eddy_command, "eddy");
}

#[test]
fn cli_overrides_win_over_file() {
    let config: Config = serde_json::from_str(r#"{ "b0_threshold": 50, "n_cpus": 2 }"#).unwrap();
    let overrides = ConfigOverrides {
        b0_threshold: Some(20),
        n_cpus: Some(8),
        denoise_window: Some(7),
    };
    let resolved = ConfigLoader::resolve_config(config, overrides).unwrap();
    assert_eq!(resolved.b0_threshold, 20);
    assert_eq!(resolved.n_cpus, 8);
    assert_eq!(resolved.denoise_extent(), Some([7, 7, 7]));
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        r#"{ "n_cpus": 0 }"#,
        r#"{ "denoise_window": 4 }"#,
        r#"{ "mask_geometry_tolerance": 0.0 }"#,
        r#"{ "bet_fraction": 1.5 }"#,
        r#"{ "eddy_command": " " }"#,
    ];
    for case in cases {
        let config: Config = serde_json::from_str(case).unwrap();
        let err = ConfigLoader::resolve_config(config, ConfigOverrides::default()).unwrap_err();
        assert_matches!(err, PrepError::InvalidConfig(_), "{case}");
    }
}

#[test]
fn explicit_config_file_is_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prep.json");
    fs::write(&path, r#"{ "bet_fraction": 0.5, "application_name": "prep" }"#).unwrap();
    let resolved =
        ConfigLoader::resolve(path.to_str(), ConfigOverrides::default()).unwrap();
    assert_eq!(resolved.bet_fraction, 0.5);
    assert_eq!(resolved.application_name, "prep");
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str(), ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, PrepError::ConfigRead(_));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ b0_threshold: }").unwrap();
    let err = ConfigLoader::resolve(path.to_str(), ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, PrepError::ConfigParse(_));
}

#[test]
fn defaults_match_documented_values() {
    let defaults = ResolvedConfig::default();
    assert_eq!(defaults.b0_threshold, 100);
    assert_eq!(defaults.mask_geometry_tolerance, 1e-4);
    assert_eq!(defaults.bet_fraction, 0.3);
    assert_eq!(defaults.merge_policy, MergePolicy::Strict);
    assert_eq!(defaults.application_name, "dmri_preprocessing");
}
