use crate::coverage::OutputFormat;
use crate::runner::EngineKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the project configuration file, looked up in the project
/// directory.
pub const CONFIG_FILE_NAME: &str = "fuzzwarden.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default)]
    pub engine: EngineKind,
    /// 0 means no limit.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub engine_args: Vec<String>,
    pub dictionary: Option<PathBuf>,
    #[serde(default)]
    pub seed_corpus_dirs: Vec<PathBuf>,
    #[serde(default = "default_use_sandbox")]
    pub use_sandbox: bool,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
}

/// minijail only exists on Linux.
pub fn default_use_sandbox() -> bool {
    cfg!(target_os = "linux")
}

pub fn default_metrics_interval_ms() -> u64 {
    1000
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            timeout_secs: 0,
            engine_args: Vec::new(),
            dictionary: None,
            seed_corpus_dirs: Vec::new(),
            use_sandbox: default_use_sandbox(),
            metrics_interval_ms: default_metrics_interval_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SandboxSettings {
    /// Same syntax as `$CIFUZZ_MINIJAIL_BINDINGS`, which it overrides.
    pub extra_bindings: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default)]
    pub output_format: OutputFormat,
    pub output_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    /// Overrides `$CIFUZZ_INSTALL_ROOT`.
    pub install_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzwardenConfig {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub tools: ToolSettings,
}

impl FuzzwardenConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `fuzzwarden.toml` from `project_dir`, or the defaults if the
    /// project has none.
    pub fn discover(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }
}
