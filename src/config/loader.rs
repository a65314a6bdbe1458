use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::types::{PipelineConfig, RunOptions};
use crate::cli::args::Cli;
use crate::core::errors::PipelineError;

pub struct PipelineLoader;

impl PipelineLoader {
    /// Load and validate a pipeline definition file.
    pub fn load(path: &Path) -> Result<PipelineConfig> {
        if !path.exists() {
            return Err(PipelineError::MissingPipeline(path.to_path_buf()).into());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {:?}", path))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load pipeline: {:?}", path))?;

        tracing::info!(
            "Loaded pipeline {:?} with {} stages from {:?}",
            config.name,
            config.stages.len(),
            path
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<PipelineConfig> {
        let config: PipelineConfig =
            serde_yaml::from_str(content).context("Failed to parse pipeline YAML")?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &PipelineConfig) -> Result<(), PipelineError> {
        let invalid = |msg: String| -> Result<(), PipelineError> { Err(PipelineError::InvalidPipeline(msg)) };

        if config.stages.is_empty() {
            return invalid("pipeline must contain at least one stage".into());
        }

        let mut seen = HashSet::new();
        for stage in &config.stages {
            if stage.name.trim().is_empty() {
                return invalid("stage name cannot be empty".into());
            }
            if !seen.insert(stage.name.as_str()) {
                return invalid(format!("duplicate stage name {:?}", stage.name));
            }
            if stage.skills.is_empty() {
                return invalid(format!("stage {:?} lists no skills", stage.name));
            }
        }

        for (id, skill) in &config.skills {
            if skill.command.trim().is_empty() {
                return invalid(format!("skill {:?} command cannot be empty", id));
            }
            if skill.timeout_secs == Some(0) {
                return invalid(format!("skill {:?} timeout_secs must be greater than 0", id));
            }
        }

        if config.settings.timeout_secs == Some(0) {
            return invalid("settings.timeout_secs must be greater than 0".into());
        }
        if config.settings.max_targets == Some(0) {
            return invalid("settings.max_targets must be greater than 0".into());
        }

        Ok(())
    }
}

/// Merge command line, environment (already folded in by clap) and pipeline
/// settings into one [`RunOptions`]. The command line wins. Values from the
/// command line are held to the same limits as pipeline settings.
pub fn resolve_options(cli: &Cli, pipeline: &PipelineConfig) -> Result<RunOptions, PipelineError> {
    if cli.timeout == Some(0) {
        return Err(PipelineError::InvalidOption("--timeout must be greater than 0".into()));
    }
    if cli.max_targets == Some(0) {
        return Err(PipelineError::InvalidOption("--max-targets must be greater than 0".into()));
    }

    let settings = &pipeline.settings;
    let defaults = RunOptions::default();

    Ok(RunOptions {
        timeout: cli
            .timeout
            .or(settings.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        kill_grace: cli
            .kill_grace_ms
            .or(settings.kill_grace_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.kill_grace),
        rate: cli.rate.or(settings.rate),
        workspace: cli.workspace.clone(),
        scope_file: cli.scope_file.clone(),
        allow_destructive: cli.allow_destructive,
        propagate_assets: cli.propagate_assets || settings.propagate_assets.unwrap_or(false),
        max_targets: cli.max_targets.or(settings.max_targets).or(defaults.max_targets),
        cap_policy: cli.cap_policy.or(settings.cap_policy).unwrap_or_default(),
        strict: cli.strict || settings.strict.unwrap_or(false),
        stop_on_error: cli.stop_on_error || settings.stop_on_error.unwrap_or(false),
        echo_stdout: cli.stdout,
    })
}

/// Newline-delimited target list; `#` comments and blank lines are ignored.
pub fn load_targets_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open target file: {:?}", path))?;

    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
