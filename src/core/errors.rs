use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why one (skill, target) cell failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    pub skill: String,
    pub stage: String,
    pub target: String,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub duration_ms: u128,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.skill, self.target, self.reason)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit {})", code)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline definition not found: {0:?}")]
    MissingPipeline(PathBuf),

    #[error("invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("stage {stage:?} references unknown skill {skill:?}")]
    UnknownSkill { stage: String, skill: String },

    #[error("no valid targets after normalization and scope filtering")]
    NoTargets,

    #[error("stop_on_error: stage {stage:?} aborted by {error}")]
    Aborted { stage: String, error: ExecError },

    #[error("target cap of {max} exceeded in stage {stage:?} ({count} targets)")]
    CapExceeded { stage: String, max: usize, count: usize },

    #[error("run log error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
