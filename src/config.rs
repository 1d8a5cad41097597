//! Run configuration.
//!
//! Values come from `offload.toml` (or the file given with `--config`);
//! command-line flags override them afterwards. Every field has a default,
//! so an absent file is the same as an empty one.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::gpu::{DeviceOptions, StagingStrategy};

pub const DEFAULT_CONFIG_FILE: &str = "offload.toml";

/// Steps per multi-step launch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: u32 = 4;

/// Password lines per device batch.
pub const DEFAULT_CORPUS_BATCH_LINES: usize = 1 << 18;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(p: PowerPreference) -> Self {
        match p {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Directory holding `<name>.wgsl` kernel sources.
    pub kernel_dir: PathBuf,
    /// Steps per launch of the multi-step kernel.
    pub batch_size: u32,
    /// Password lines per device batch.
    pub corpus_batch_lines: usize,
    /// Upload strategy; unset lets each workload pick its own.
    pub staging: Option<StagingStrategy>,
    pub power_preference: PowerPreference,
    /// Accept CPU-class (software) adapters.
    pub allow_software: bool,
    /// Overrides the `platform` column of the benchmark log.
    pub platform_label: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kernel_dir: PathBuf::from("kernels"),
            batch_size: DEFAULT_BATCH_SIZE,
            corpus_batch_lines: DEFAULT_CORPUS_BATCH_LINES,
            staging: None,
            power_preference: PowerPreference::default(),
            allow_software: false,
            platform_label: None,
        }
    }
}

impl RunConfig {
    /// Load `path`, or `offload.toml` in the working directory when `path`
    /// is `None` and that file exists, or the defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let config = Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.corpus_batch_lines == 0 {
            return Err(Error::Config("corpus_batch_lines must be at least 1".into()));
        }
        if self.corpus_batch_lines > u32::MAX as usize {
            return Err(Error::Config(
                "corpus_batch_lines must fit in 32 bits".into(),
            ));
        }
        Ok(())
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            power_preference: self.power_preference.into(),
            allow_software: self.allow_software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = RunConfig::parse("").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.corpus_batch_lines, 1 << 18);
        assert_eq!(config.kernel_dir, PathBuf::from("kernels"));
    }

    #[test]
    fn parses_all_fields() {
        let config = RunConfig::parse(
            r#"
kernel_dir = "/opt/offload/kernels"
batch_size = 8
corpus_batch_lines = 1024
staging = "pinned"
power_preference = "low-power"
allow_software = true
platform_label = "lab-gpu"
"#,
        )
        .unwrap();
        assert_eq!(config.kernel_dir, PathBuf::from("/opt/offload/kernels"));
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.corpus_batch_lines, 1024);
        assert_eq!(config.staging, Some(StagingStrategy::Pinned));
        assert_eq!(config.power_preference, PowerPreference::LowPower);
        assert!(config.allow_software);
        assert_eq!(config.platform_label.as_deref(), Some("lab-gpu"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = RunConfig::parse("batch_size = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = RunConfig::parse("batchsize = 2").unwrap_err();
        assert!(err.to_string().contains("batchsize"));
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offload.toml");
        std::fs::write(&path, "staging = \"copy-on-create\"\n").unwrap();
        let config = RunConfig::load(Some(&path)).unwrap();
        assert_eq!(config.staging, Some(StagingStrategy::CopyOnCreate));
    }

    #[test]
    fn load_missing_explicit_path_is_io_error() {
        let err = RunConfig::load(Some(Path::new("/nonexistent/offload.toml"))).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
