use super::errors::ExecError;
use super::record::RecordKind;

/// Orchestrator progress, folded into [`super::state::RunState`].
#[derive(Debug, Clone)]
pub enum Event {
    StageStarted { stage: String, targets: usize },
    StageSkipped(String),
    StageFinished(String),
    RecordLogged { stage: String, kind: RecordKind },
    CellCompleted { stage: String },
    CellTimedOut { stage: String, skill: String, target: String },
    CellFailed(ExecError),
    TargetsAdded { stage: String, count: usize },
    TargetsDropped { stage: String, targets: Vec<String> },
    OutOfScope { stage: String, value: String },
}
