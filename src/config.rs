use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PrepError;

pub const DEFAULT_CONFIG_FILE: &str = "dmri-prep.json";
pub const DEFAULT_APPLICATION_NAME: &str = "dmri_preprocessing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    #[default]
    Strict,
    Concatenate,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub b0_threshold: Option<u32>,
    #[serde(default)]
    pub n_cpus: Option<usize>,
    #[serde(default)]
    pub denoise_window: Option<u32>,
    #[serde(default)]
    pub mask_geometry_tolerance: Option<f64>,
    #[serde(default)]
    pub bet_fraction: Option<f64>,
    #[serde(default)]
    pub merge_policy: Option<MergePolicy>,
    #[serde(default)]
    pub eddy_command: Option<String>,
    #[serde(default)]
    pub application_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub b0_threshold: Option<u32>,
    pub n_cpus: Option<usize>,
    pub denoise_window: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub b0_threshold: u32,
    pub n_cpus: usize,
    pub denoise_window: u32,
    pub mask_geometry_tolerance: f64,
    pub bet_fraction: f64,
    pub merge_policy: MergePolicy,
    pub eddy_command: String,
    pub application_name: String,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            b0_threshold: 100,
            n_cpus: 1,
            denoise_window: 5,
            mask_geometry_tolerance: 1e-4,
            bet_fraction: 0.3,
            merge_policy: MergePolicy::Strict,
            eddy_command: "eddy".to_string(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }
}

impl ResolvedConfig {
    pub fn denoise_extent(&self) -> Option<[u32; 3]> {
        match self.denoise_window {
            0 => None,
            window => Some([window; 3]),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, PrepError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| PrepError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| PrepError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, PrepError> {
        let defaults = ResolvedConfig::default();
        let resolved = ResolvedConfig {
            b0_threshold: overrides
                .b0_threshold
                .or(config.b0_threshold)
                .unwrap_or(defaults.b0_threshold),
            n_cpus: overrides
                .n_cpus
                .or(config.n_cpus)
                .unwrap_or(defaults.n_cpus),
            denoise_window: overrides
                .denoise_window
                .or(config.denoise_window)
                .unwrap_or(defaults.denoise_window),
            mask_geometry_tolerance: config
                .mask_geometry_tolerance
                .unwrap_or(defaults.mask_geometry_tolerance),
            bet_fraction: config.bet_fraction.unwrap_or(defaults.bet_fraction),
            merge_policy: config.merge_policy.unwrap_or(defaults.merge_policy),
            eddy_command: config.eddy_command.unwrap_or(defaults.eddy_command),
            application_name: config
                .application_name
                .unwrap_or(defaults.application_name),
        };
        validate(&resolved)?;
        Ok(resolved)
    }
}

fn validate(config: &ResolvedConfig) -> Result<(), PrepError> {
    if config.n_cpus == 0 {
        return Err(PrepError::InvalidConfig(
            "n_cpus must be at least 1".to_string(),
        ));
    }
    if config.denoise_window != 0 && config.denoise_window % 2 == 0 {
        return Err(PrepError::InvalidConfig(format!(
            "denoise window must be odd or 0, got {}",
            config.denoise_window
        )));
    }
    if !(config.mask_geometry_tolerance > 0.0) {
        return Err(PrepError::InvalidConfig(
            "mask_geometry_tolerance must be positive".to_string(),
        ));
    }
    if !(config.bet_fraction > 0.0 && config.bet_fraction < 1.0) {
        return Err(PrepError::InvalidConfig(format!(
            "bet_fraction must lie in (0, 1), got {}",
            config.bet_fraction
        )));
    }
    if config.eddy_command.trim().is_empty() || config.application_name.trim().is_empty() {
        return Err(PrepError::InvalidConfig(
            "eddy_command and application_name must not be empty".to_string(),
        ));
    }
    Ok(())
}
