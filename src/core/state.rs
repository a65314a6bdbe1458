use super::errors::ExecError;
use super::events::Event;
use super::record::{now_iso, RecordKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub destructive: bool,
    pub status: StageStatus,
    pub targets: usize,
    pub cells: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub records: usize,
    pub assets: usize,
    pub findings: usize,
    pub notes: usize,
    pub targets_added: usize,
    pub targets_dropped: usize,
}

impl StageSummary {
    fn new(name: &str, destructive: bool) -> Self {
        Self {
            name: name.to_string(),
            destructive,
            status: StageStatus::Pending,
            targets: 0,
            cells: 0,
            completed: 0,
            timed_out: 0,
            failed: 0,
            records: 0,
            assets: 0,
            findings: 0,
            notes: 0,
            targets_added: 0,
            targets_dropped: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedOutCell {
    pub stage: String,
    pub skill: String,
    pub target: String,
}

/// Everything `summary.json` reports about one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub pipeline: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub initial_targets: Vec<String>,
    pub final_targets: Vec<String>,
    pub stages: Vec<StageSummary>,
    pub records: usize,
    pub failures: Vec<ExecError>,
    pub timeouts: Vec<TimedOutCell>,
    pub out_of_scope: Vec<String>,
    pub dropped_targets: Vec<String>,
    pub aborted: Option<String>,
}

impl RunState {
    pub fn new<'a, I>(run_id: &str, pipeline: &str, stages: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        Self {
            run_id: run_id.to_string(),
            pipeline: pipeline.to_string(),
            started_at: now_iso(),
            finished_at: None,
            initial_targets: vec![],
            final_targets: vec![],
            stages: stages
                .into_iter()
                .map(|(name, destructive)| StageSummary::new(name, destructive))
                .collect(),
            records: 0,
            failures: vec![],
            timeouts: vec![],
            out_of_scope: vec![],
            dropped_targets: vec![],
            aborted: None,
        }
    }

    pub fn on_event(&mut self, ev: Event) {
        match ev {
            Event::StageStarted { stage, targets } => {
                tracing::info!("Stage {} started with {} targets", stage, targets);
                if let Some(s) = self.stage_mut(&stage) {
                    s.status = StageStatus::Running;
                    s.targets = targets;
                }
            }
            Event::StageSkipped(stage) => {
                tracing::info!("Stage {} skipped", stage);
                if let Some(s) = self.stage_mut(&stage) {
                    s.status = StageStatus::Skipped;
                }
            }
            Event::StageFinished(stage) => {
                tracing::info!("Stage {} finished", stage);
                if let Some(s) = self.stage_mut(&stage) {
                    s.status = StageStatus::Completed;
                }
            }
            Event::RecordLogged { stage, kind } => {
                self.records += 1;
                if let Some(s) = self.stage_mut(&stage) {
                    s.records += 1;
                    match kind {
                        RecordKind::Asset => s.assets += 1,
                        RecordKind::Finding => s.findings += 1,
                        RecordKind::Note => s.notes += 1,
                    }
                }
            }
            Event::CellCompleted { stage } => {
                if let Some(s) = self.stage_mut(&stage) {
                    s.cells += 1;
                    s.completed += 1;
                }
            }
            Event::CellTimedOut { stage, skill, target } => {
                if let Some(s) = self.stage_mut(&stage) {
                    s.cells += 1;
                    s.timed_out += 1;
                }
                self.timeouts.push(TimedOutCell { stage, skill, target });
            }
            Event::CellFailed(error) => {
                if let Some(s) = self.stage_mut(&error.stage) {
                    s.cells += 1;
                    s.failed += 1;
                }
                self.failures.push(error);
            }
            Event::TargetsAdded { stage, count } => {
                tracing::info!("Stage {} added {} targets", stage, count);
                if let Some(s) = self.stage_mut(&stage) {
                    s.targets_added += count;
                }
            }
            Event::TargetsDropped { stage, targets } => {
                if let Some(s) = self.stage_mut(&stage) {
                    s.targets_dropped += targets.len();
                }
                self.dropped_targets.extend(targets);
            }
            Event::OutOfScope { stage, value } => {
                tracing::info!("Out of scope in {}: {}", stage, value);
                self.out_of_scope.push(value);
            }
        }
    }

    pub fn abort(&mut self, stage: &str, reason: String) {
        if let Some(s) = self.stage_mut(stage) {
            s.status = StageStatus::Aborted;
        }
        self.aborted = Some(reason);
    }

    pub fn finish(&mut self, final_targets: Vec<String>) {
        self.final_targets = final_targets;
        self.finished_at = Some(now_iso());
    }

    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.name == name)
    }

    fn stage_mut(&mut self, name: &str) -> Option<&mut StageSummary> {
        self.stages.iter_mut().find(|s| s.name == name)
    }
}
