use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "zkhydra.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    /// DSL name to the tools `--tools all` expands to.
    #[serde(default = "default_dsl")]
    pub dsl: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Seconds per tool run.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub file_logging: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            timeout: default_timeout(),
            log_level: default_log_level(),
            file_logging: false,
        }
    }
}

/// Where analyzers that ship as scripts live, and explicit binary paths.
#[derive(Debug, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_picus_dir")]
    pub picus_dir: PathBuf,
    #[serde(default = "default_ecneproject_dir")]
    pub ecneproject_dir: PathBuf,
    #[serde(default = "default_conscs_dir")]
    pub conscs_dir: PathBuf,
    /// Binary name to path, e.g. `circomspect = "/opt/bin/circomspect"`.
    #[serde(default)]
    pub binaries: BTreeMap<String, PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            picus_dir: default_picus_dir(),
            ecneproject_dir: default_ecneproject_dir(),
            conscs_dir: default_conscs_dir(),
            binaries: BTreeMap::new(),
        }
    }
}

impl ToolsConfig {
    /// Configured path for `name`, or the bare name for a `PATH` lookup.
    pub fn binary(&self, name: &str) -> String {
        self.binaries
            .get(name)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    }
}

// Defaults
fn default_output() -> PathBuf {
    PathBuf::from("output")
}
fn default_timeout() -> u64 {
    1800
}
fn default_log_level() -> String {
    "info".into()
}
fn default_dsl() -> BTreeMap<String, Vec<String>> {
    let circom = ["circomspect", "circom_civer", "picus", "ecneproject", "zkfuzz", "conscs"];
    BTreeMap::from([("circom".to_string(), circom.map(String::from).to_vec())])
}
fn dir_from_env(var: &str, fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}
fn default_picus_dir() -> PathBuf {
    dir_from_env("ZKHYDRA_PICUS_DIR", "tools/picus")
}
fn default_ecneproject_dir() -> PathBuf {
    dir_from_env("ZKHYDRA_ECNEPROJECT_DIR", "tools/ecneproject")
}
fn default_conscs_dir() -> PathBuf {
    dir_from_env("ZKHYDRA_CONSCS_DIR", "tools/conscs")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            dsl: default_dsl(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    /// An explicitly named file must load. Otherwise `zkhydra.toml` in the
    /// working directory is used when present, and defaults when not.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::load(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.timeout == 0 {
            return Err(Error::config("app.timeout must be greater than 0"));
        }
        if let Some((dsl, _)) = self.dsl.iter().find(|(_, tools)| tools.is_empty()) {
            return Err(Error::config(format!("dsl.{dsl} lists no tools")));
        }
        Ok(())
    }

    /// Expand a `--tools` value: `all` means every tool configured for `dsl`.
    pub fn tool_names(&self, requested: &str, dsl: &str) -> Vec<String> {
        if requested.trim().eq_ignore_ascii_case("all") {
            return self.dsl.get(dsl).cloned().unwrap_or_default();
        }
        requested
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}
