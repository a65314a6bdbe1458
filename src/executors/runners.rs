use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::emitter::Emitter;
use crate::core::errors::ExecError;
use crate::core::record::Severity;
use crate::core::target::TargetDescriptor;

pub const TIMEOUT_NOTE: &str = "runner-timeout";
pub const ERROR_NOTE: &str = "runner-error";
pub const GATE_NOTE: &str = "runner-gate";
pub const PARSE_ERROR_NOTE: &str = "runner-parse-error";

/// Everything a skill gets to know about the cell it runs in.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub target: TargetDescriptor,
    pub stage: String,
    pub out_dir: PathBuf,
    pub scope_file: Option<PathBuf>,
    pub rate: Option<u32>,
    pub timeout: Duration,
    pub run_ts: String,
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub budget: Duration,
    pub kill_grace: Duration,
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Gate {
    pub destructive: bool,
    pub allowed: bool,
}

impl Gate {
    pub fn blocks(&self) -> bool {
        self.destructive && !self.allowed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeStatus {
    Completed,
    TimedOut,
    Failed(String),
}

/// What a skill variant reports once its invocation has resolved.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub status: InvokeStatus,
    pub exit_code: Option<i32>,
    pub parse_errors: usize,
    pub stderr_tail: String,
}

impl ExitInfo {
    pub fn completed() -> Self {
        Self::with_status(InvokeStatus::Completed)
    }

    pub fn timed_out() -> Self {
        Self::with_status(InvokeStatus::TimedOut)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::with_status(InvokeStatus::Failed(reason.into()))
    }

    fn with_status(status: InvokeStatus) -> Self {
        Self {
            status,
            exit_code: None,
            parse_errors: 0,
            stderr_tail: String::new(),
        }
    }
}

/// A unit of work runnable against one target. Implementations must respect
/// `limits.budget` and report expiry as [`InvokeStatus::TimedOut`].
#[async_trait]
pub trait Skill: Send + Sync {
    fn id(&self) -> &str;

    fn variant(&self) -> &'static str;

    /// Per-skill budget overriding the run default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn invoke(&self, ctx: &SkillContext, emitter: &Emitter, limits: &Limits) -> ExitInfo;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellStatus {
    Completed,
    TimedOut,
    Refused,
    Failed(ExecError),
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: CellStatus,
    pub emitted: usize,
    pub parse_errors: usize,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ExecOutcome {
    pub fn ok(&self) -> bool {
        self.status == CellStatus::Completed
    }
}

/// Run one skill against one target. Consumes the emitter so the record
/// stream closes when this returns.
pub async fn execute(
    skill: &dyn Skill,
    ctx: &SkillContext,
    limits: &Limits,
    gate: Gate,
    emitter: Emitter,
) -> ExecOutcome {
    let start = Instant::now();

    if gate.blocks() {
        emit_gate_note(&emitter, &ctx.stage).await;
        return ExecOutcome {
            status: CellStatus::Refused,
            emitted: 0,
            parse_errors: 0,
            exit_code: None,
            duration: start.elapsed(),
        };
    }

    tracing::debug!(
        "Executing {} skill {} on {} (budget {:?})",
        skill.variant(),
        skill.id(),
        ctx.target.normalized_target,
        limits.budget
    );

    let exit = skill.invoke(ctx, &emitter, limits).await;
    let duration = start.elapsed();

    let status = match exit.status {
        InvokeStatus::Completed => CellStatus::Completed,
        InvokeStatus::TimedOut => {
            tracing::warn!(
                "{} timed out on {} after {:?}",
                skill.id(),
                ctx.target.normalized_target,
                limits.budget
            );
            let mut data = Map::new();
            data.insert("skill".into(), Value::String(skill.id().to_string()));
            data.insert("budget_ms".into(), json!(limits.budget.as_millis() as u64));
            emitter
                .note(
                    TIMEOUT_NOTE,
                    Severity::Low,
                    format!("{} exceeded its {:?} budget", skill.id(), limits.budget),
                    data,
                )
                .await;
            CellStatus::TimedOut
        }
        InvokeStatus::Failed(reason) => {
            let error = ExecError {
                skill: skill.id().to_string(),
                stage: ctx.stage.clone(),
                target: ctx.target.normalized_target.clone(),
                reason,
                exit_code: exit.exit_code,
                stderr_tail: exit.stderr_tail.clone(),
                duration_ms: duration.as_millis(),
            };
            tracing::error!("Skill failed: {}", error);
            let data = match serde_json::to_value(&error) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            emitter
                .note(ERROR_NOTE, Severity::Low, error.to_string(), data)
                .await;
            CellStatus::Failed(error)
        }
    };

    ExecOutcome {
        status,
        emitted: emitter.emitted(),
        parse_errors: exit.parse_errors,
        exit_code: exit.exit_code,
        duration,
    }
}

pub async fn emit_gate_note(emitter: &Emitter, stage: &str) {
    let mut data = Map::new();
    data.insert("stage".into(), Value::String(stage.to_string()));
    emitter
        .note(
            GATE_NOTE,
            Severity::Info,
            format!("stage {} is destructive and --allow-destructive was not given; skipped", stage),
            data,
        )
        .await;
}
