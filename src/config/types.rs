use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_KILL_GRACE_MS: u64 = 3_000;
pub const DEFAULT_MAX_TARGETS: usize = 256;

/// Pipeline definition file (YAML).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: PipelineSettings,
    pub stages: Vec<StageConfig>,
    /// Explicit skill definitions; these win over built-ins and the catalog.
    #[serde(default)]
    pub skills: BTreeMap<String, SkillConfig>,
}

/// Run defaults a pipeline may carry. Command-line flags override them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineSettings {
    pub propagate_assets: Option<bool>,
    pub max_targets: Option<usize>,
    pub cap_policy: Option<CapPolicy>,
    pub strict: Option<bool>,
    pub stop_on_error: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub destructive: bool,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SkillConfig {
    /// Program plus leading arguments, split shell-style.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional flags the skill accepts; all of them when omitted.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// What to do when propagation pushes the target set past `max_targets`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CapPolicy {
    /// Keep the first `max_targets` in canonical order and log the rest.
    #[default]
    Truncate,
    /// Abort the run.
    Fail,
}

/// Fully resolved run configuration, passed explicitly to every layer.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub rate: Option<u32>,
    pub workspace: Option<String>,
    pub scope_file: Option<PathBuf>,
    pub allow_destructive: bool,
    pub propagate_assets: bool,
    pub max_targets: Option<usize>,
    pub cap_policy: CapPolicy,
    pub strict: bool,
    pub stop_on_error: bool,
    pub echo_stdout: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            rate: None,
            workspace: None,
            scope_file: None,
            allow_destructive: false,
            propagate_assets: false,
            max_targets: Some(DEFAULT_MAX_TARGETS),
            cap_policy: CapPolicy::Truncate,
            strict: false,
            stop_on_error: false,
            echo_stdout: false,
        }
    }
}
