use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::errors::PipelineError;
use super::events::Event;
use super::record::{synthetic_note, Record, RecordDefaults, RecordKind, Severity};
use super::scope::Scope;
use super::state::RunState;
use super::target::{self, TargetDescriptor, TargetSet};
use crate::config::{CapPolicy, RunOptions};
use crate::executors::runners::{emit_gate_note, TIMEOUT_NOTE};
use crate::executors::{execute, CellStatus, Emitter, ExecOutcome, Gate, Limits, Skill, SkillContext};
use crate::reporters::log::RunLog;
use crate::ui::progress::ProgressManager;

pub const SCOPE_NOTE: &str = "runner-scope";
pub const CAP_NOTE: &str = "runner-cap";
const SEED_STAGE: &str = "init";
const RUNNER_TOOL: &str = "skillcrawler";

/// One pipeline phase with its skills already resolved.
pub struct Stage {
    pub name: String,
    pub destructive: bool,
    pub skills: Vec<Arc<dyn Skill>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Gated,
    Executing,
    Propagating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Gated => "gated",
            Phase::Executing => "executing",
            Phase::Propagating => "propagating",
        };
        f.write_str(name)
    }
}

/// Drives stages × skills × targets one cell at a time and is the only writer
/// of the run log.
pub struct Orchestrator<'a> {
    options: &'a RunOptions,
    scope: &'a Scope,
    log: &'a mut RunLog,
    progress: &'a ProgressManager,
    evidence_dir: PathBuf,
    run_ts: String,
    targets: TargetSet,
    rejected: HashSet<String>,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        options: &'a RunOptions,
        scope: &'a Scope,
        log: &'a mut RunLog,
        progress: &'a ProgressManager,
        evidence_dir: &Path,
        run_ts: &str,
        state: RunState,
    ) -> Self {
        Self {
            options,
            scope,
            log,
            progress,
            evidence_dir: evidence_dir.to_path_buf(),
            run_ts: run_ts.to_string(),
            targets: TargetSet::default(),
            rejected: HashSet::new(),
            state,
        }
    }

    /// Run every stage in order. On error the state gathered so far is still
    /// available through [`Orchestrator::into_state`].
    pub async fn run(&mut self, stages: &[Stage], raw_targets: &[String]) -> Result<(), PipelineError> {
        self.seed(raw_targets)?;

        for stage in stages {
            self.enter(stage, Phase::Idle);

            self.enter(stage, Phase::Gated);
            if stage.destructive && !self.options.allow_destructive {
                tracing::warn!("Stage {} is destructive; skipping without --allow-destructive", stage.name);
                self.write_gate_note(&stage.name).await?;
                self.state.on_event(Event::StageSkipped(stage.name.clone()));
                continue;
            }

            self.enter(stage, Phase::Executing);
            self.state.on_event(Event::StageStarted {
                stage: stage.name.clone(),
                targets: self.targets.len(),
            });

            // The target set only changes between stages.
            let targets = self.targets.as_slice().to_vec();
            let mut assets = Vec::new();
            for skill in &stage.skills {
                for target in &targets {
                    let outcome = self.run_cell(stage, skill.as_ref(), target, &mut assets).await?;
                    if let CellStatus::Failed(error) = outcome.status {
                        if self.options.stop_on_error {
                            self.state.abort(&stage.name, error.to_string());
                            return Err(PipelineError::Aborted {
                                stage: stage.name.clone(),
                                error,
                            });
                        }
                    }
                }
            }

            if self.options.propagate_assets {
                self.enter(stage, Phase::Propagating);
                if let Err(e) = self.propagate(&stage.name, &assets) {
                    self.state.abort(&stage.name, e.to_string());
                    return Err(e);
                }
            }

            self.state.on_event(Event::StageFinished(stage.name.clone()));
        }

        Ok(())
    }

    pub fn targets(&self) -> &[TargetDescriptor] {
        self.targets.as_slice()
    }

    pub fn into_state(mut self) -> RunState {
        let finals = self
            .targets
            .as_slice()
            .iter()
            .map(|t| t.normalized_target.clone())
            .collect();
        self.state.finish(finals);
        self.state
    }

    fn enter(&self, stage: &Stage, phase: Phase) {
        tracing::debug!("Stage {} -> {}", stage.name, phase);
    }

    /// Canonicalize, scope-filter and cap the initial targets.
    fn seed(&mut self, raw_targets: &[String]) -> Result<(), PipelineError> {
        let mut admitted = Vec::new();
        for descriptor in target::canonicalize(raw_targets) {
            if self.scope.allows(&descriptor) {
                admitted.push(descriptor);
            } else {
                self.reject(SEED_STAGE, &descriptor)?;
            }
        }

        self.targets = TargetSet::new(admitted);
        self.enforce_cap(SEED_STAGE)?;

        if self.targets.is_empty() {
            return Err(PipelineError::NoTargets);
        }

        self.state.initial_targets = self
            .targets
            .as_slice()
            .iter()
            .map(|t| t.normalized_target.clone())
            .collect();
        tracing::info!("Starting with {} targets", self.targets.len());
        Ok(())
    }

    async fn run_cell(
        &mut self,
        stage: &Stage,
        skill: &dyn Skill,
        target: &TargetDescriptor,
        assets: &mut Vec<Record>,
    ) -> Result<ExecOutcome, PipelineError> {
        let budget = skill.timeout().unwrap_or(self.options.timeout);
        let out_dir = self.evidence_dir.join(&target.key);
        std::fs::create_dir_all(&out_dir)?;

        let ctx = SkillContext {
            target: target.clone(),
            stage: stage.name.clone(),
            out_dir,
            scope_file: self.options.scope_file.clone(),
            rate: self.options.rate,
            timeout: budget,
            run_ts: self.run_ts.clone(),
            workspace: self.options.workspace.clone(),
        };
        let limits = Limits {
            budget,
            kill_grace: self.options.kill_grace,
            strict: self.options.strict,
        };
        let gate = Gate {
            destructive: stage.destructive,
            allowed: self.options.allow_destructive,
        };
        let defaults = RecordDefaults::for_cell(
            skill.id(),
            &stage.name,
            &target.normalized_target,
            self.options.workspace.as_deref(),
        );

        self.progress.update(&format!(
            "[{}] {} -> {}",
            stage.name,
            skill.id(),
            target.normalized_target
        ));

        let (emitter, rx) = Emitter::channel(defaults);
        let (outcome, drained) = drain_while(
            execute(skill, &ctx, &limits, gate, emitter),
            rx,
            CellSink::new(&stage.name, &mut *self.log, &mut self.state, Some(assets)),
        )
        .await;
        drained?;

        match &outcome.status {
            CellStatus::Completed => self.state.on_event(Event::CellCompleted {
                stage: stage.name.clone(),
            }),
            CellStatus::TimedOut => self.state.on_event(Event::CellTimedOut {
                stage: stage.name.clone(),
                skill: skill.id().to_string(),
                target: target.normalized_target.clone(),
            }),
            CellStatus::Failed(error) => self.state.on_event(Event::CellFailed(error.clone())),
            CellStatus::Refused => {}
        }

        tracing::debug!(
            "{} on {} finished in {:?} (exit {:?}): {} records, {} parse errors",
            skill.id(),
            target.normalized_target,
            outcome.duration,
            outcome.exit_code,
            outcome.emitted,
            outcome.parse_errors
        );
        Ok(outcome)
    }

    /// Merge hosts and IPs surfaced by a stage's asset records into the
    /// working set. Running it twice on the same records changes nothing.
    fn propagate(&mut self, stage: &str, assets: &[Record]) -> Result<(), PipelineError> {
        let mut fresh = Vec::new();
        for descriptor in target::canonicalize(asset_candidates(assets)) {
            if self.targets.contains_key(&descriptor.key) {
                continue;
            }
            if !self.scope.allows(&descriptor) {
                self.reject(stage, &descriptor)?;
                continue;
            }
            fresh.push(descriptor);
        }

        let added = self.targets.merge(fresh);
        if added > 0 {
            self.state.on_event(Event::TargetsAdded {
                stage: stage.to_string(),
                count: added,
            });
        }
        self.enforce_cap(stage)
    }

    fn enforce_cap(&mut self, stage: &str) -> Result<(), PipelineError> {
        let Some(max) = self.options.max_targets else {
            return Ok(());
        };
        let count = self.targets.len();
        if count <= max {
            return Ok(());
        }

        match self.options.cap_policy {
            CapPolicy::Fail => Err(PipelineError::CapExceeded {
                stage: stage.to_string(),
                max,
                count,
            }),
            CapPolicy::Truncate => {
                let dropped: Vec<String> = self
                    .targets
                    .truncate(max)
                    .into_iter()
                    .map(|t| t.normalized_target)
                    .collect();
                tracing::warn!(
                    "Target set reached {} in stage {}; keeping the first {} and dropping {}",
                    count,
                    stage,
                    max,
                    dropped.len()
                );
                let mut data = Map::new();
                data.insert("max_targets".into(), json!(max));
                data.insert("dropped".into(), json!(dropped));
                self.write_note(
                    stage,
                    "",
                    CAP_NOTE,
                    Severity::Low,
                    format!("target cap {} reached; {} targets dropped", max, dropped.len()),
                    data,
                )?;
                self.state.on_event(Event::TargetsDropped {
                    stage: stage.to_string(),
                    targets: dropped,
                });
                Ok(())
            }
        }
    }

    fn reject(&mut self, stage: &str, descriptor: &TargetDescriptor) -> Result<(), PipelineError> {
        if !self.rejected.insert(descriptor.key.clone()) {
            return Ok(());
        }
        let mut data = Map::new();
        data.insert("value".into(), Value::String(descriptor.input.clone()));
        data.insert("key".into(), Value::String(descriptor.key.clone()));
        self.write_note(
            stage,
            &descriptor.normalized_target,
            SCOPE_NOTE,
            Severity::Info,
            format!("{} is out of scope", descriptor.normalized_target),
            data,
        )?;
        self.state.on_event(Event::OutOfScope {
            stage: stage.to_string(),
            value: descriptor.normalized_target.clone(),
        });
        Ok(())
    }

    fn write_note(
        &mut self,
        stage: &str,
        target: &str,
        tool: &str,
        severity: Severity,
        message: String,
        data: Map<String, Value>,
    ) -> Result<(), PipelineError> {
        let defaults =
            RecordDefaults::for_cell(RUNNER_TOOL, stage, target, self.options.workspace.as_deref());
        let record = synthetic_note(tool, severity, message, data, &defaults);
        self.log.append(&record)?;
        self.state.on_event(Event::RecordLogged {
            stage: stage.to_string(),
            kind: record.kind,
        });
        Ok(())
    }

    async fn write_gate_note(&mut self, stage: &str) -> Result<(), PipelineError> {
        let defaults =
            RecordDefaults::for_cell(RUNNER_TOOL, stage, "", self.options.workspace.as_deref());
        let (emitter, rx) = Emitter::channel(defaults);
        let ((), drained) = drain_while(
            async move { emit_gate_note(&emitter, stage).await },
            rx,
            CellSink::new(stage, &mut *self.log, &mut self.state, None),
        )
        .await;
        drained
    }
}

/// Where a cell's records end up: the run log, the state fold and, for
/// executing stages, the asset list used by propagation.
struct CellSink<'s> {
    stage: &'s str,
    log: &'s mut RunLog,
    state: &'s mut RunState,
    assets: Option<&'s mut Vec<Record>>,
    result: Result<(), PipelineError>,
    sealed: bool,
    discarded: usize,
}

impl<'s> CellSink<'s> {
    fn new(
        stage: &'s str,
        log: &'s mut RunLog,
        state: &'s mut RunState,
        assets: Option<&'s mut Vec<Record>>,
    ) -> Self {
        Self {
            stage,
            log,
            state,
            assets,
            result: Ok(()),
            sealed: false,
            discarded: 0,
        }
    }

    /// Log one record. Nothing is accepted after a timeout note, and after a
    /// write error records are dropped so the sending side never stalls.
    fn accept(&mut self, record: Record) {
        if self.sealed {
            self.discarded += 1;
            return;
        }
        if self.result.is_err() {
            return;
        }
        if let Err(e) = self.log.append(&record) {
            tracing::error!("Failed to append to run log: {}", e);
            self.result = Err(e);
            return;
        }
        self.state.on_event(Event::RecordLogged {
            stage: self.stage.to_string(),
            kind: record.kind,
        });
        if record.tool == TIMEOUT_NOTE {
            self.sealed = true;
        }
        if record.kind == RecordKind::Asset {
            if let Some(assets) = self.assets.as_deref_mut() {
                assets.push(record);
            }
        }
    }

    fn finish(self) -> Result<(), PipelineError> {
        if self.discarded > 0 {
            tracing::debug!(
                "Discarded {} records emitted after the cell in stage {} ended",
                self.discarded,
                self.stage
            );
        }
        self.result
    }
}

/// Run `work` while appending the records it produces. The cell ends when
/// `work` resolves: the channel is then closed, so emitter clones held by
/// stray tasks can no longer deliver, and only what is already buffered is
/// logged.
async fn drain_while<F: Future>(
    work: F,
    mut rx: mpsc::Receiver<Record>,
    mut sink: CellSink<'_>,
) -> (F::Output, Result<(), PipelineError>) {
    tokio::pin!(work);
    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            received = rx.recv() => match received {
                Some(record) => sink.accept(record),
                None => break (&mut work).await,
            },
        }
    };

    rx.close();
    while let Some(record) = rx.recv().await {
        sink.accept(record);
    }
    (output, sink.finish())
}

/// Host-like values an asset record surfaces: its `target`, `data.ip`
/// (string or list) and `data.hostnames` (list or string).
pub fn asset_candidates(assets: &[Record]) -> Vec<String> {
    let mut out = Vec::new();
    for record in assets.iter().filter(|r| r.kind == RecordKind::Asset) {
        if !record.target.trim().is_empty() {
            out.push(record.target.clone());
        }
        for field in ["ip", "hostnames"] {
            match record.data.get(field) {
                Some(Value::String(s)) => out.push(s.clone()),
                Some(Value::Array(items)) => out.extend(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                ),
                _ => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scope::ScopeEntry;
    use crate::core::state::StageStatus;
    use crate::executors::runners::GATE_NOTE;
    use crate::executors::{InProcessSkill, SkillHandler};
    use crate::reporters::log::read_records;
    use crate::skills::echo;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Emits `count` discovered hosts as one asset record per cell.
    struct Discover(usize);

    #[async_trait]
    impl SkillHandler for Discover {
        async fn run(&self, _ctx: SkillContext, emit: Emitter) -> anyhow::Result<()> {
            let hosts: Vec<String> = (0..self.0).map(|i| format!("h{:02}.example.com", i)).collect();
            emit.emit(json!({"type": "asset", "data": {"hostnames": hosts, "ip": "10.0.0.7"}}))
                .await
        }
    }

    struct Boom;

    #[async_trait]
    impl SkillHandler for Boom {
        async fn run(&self, _ctx: SkillContext, _emit: Emitter) -> anyhow::Result<()> {
            anyhow::bail!("tool crashed")
        }
    }

    fn in_process(id: &str, handler: impl SkillHandler) -> Arc<dyn Skill> {
        Arc::new(InProcessSkill::new(id, Arc::new(handler)))
    }

    fn stage(name: &str, destructive: bool, skills: Vec<Arc<dyn Skill>>) -> Stage {
        Stage {
            name: name.to_string(),
            destructive,
            skills,
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(200),
            ..RunOptions::default()
        }
    }

    struct Harness {
        dir: TempDir,
        log: RunLog,
        progress: ProgressManager,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let log = RunLog::create(&dir.path().join("records.jsonl"), false).unwrap();
            Self {
                dir,
                log,
                progress: ProgressManager::hidden(),
            }
        }

        async fn run(
            &mut self,
            options: &RunOptions,
            scope: &Scope,
            stages: &[Stage],
            targets: &[&str],
        ) -> (Result<(), PipelineError>, RunState, Vec<Record>) {
            let names: Vec<(&str, bool)> = stages.iter().map(|s| (s.name.as_str(), s.destructive)).collect();
            let state = RunState::new("run_test", "test", names);
            let raw: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
            let evidence = self.dir.path().join("evidence");

            let mut orchestrator = Orchestrator::new(
                options,
                scope,
                &mut self.log,
                &self.progress,
                &evidence,
                "20240101T000000Z",
                state,
            );
            let result = orchestrator.run(stages, &raw).await;
            let state = orchestrator.into_state();
            let records = read_records(&self.dir.path().join("records.jsonl")).unwrap();
            (result, state, records)
        }
    }

    #[tokio::test]
    async fn test_propagation_cap_keeps_first_in_canonical_order() {
        let mut options = options();
        options.propagate_assets = true;
        options.max_targets = Some(5);
        let stages = vec![stage("recon", false, vec![in_process("discover", Discover(20))])];

        let mut harness = Harness::new();
        let (result, state, records) = harness
            .run(&options, &Scope::default(), &stages, &["seed.example.com"])
            .await;
        result.unwrap();

        assert_eq!(
            state.final_targets,
            vec!["10.0.0.7", "h00.example.com", "h01.example.com", "h02.example.com", "h03.example.com"]
        );
        assert_eq!(state.dropped_targets.len(), 22 - 5);
        assert!(records.iter().any(|r| r.tool == CAP_NOTE));
    }

    #[tokio::test]
    async fn test_cap_fail_policy_aborts() {
        let mut options = options();
        options.propagate_assets = true;
        options.max_targets = Some(5);
        options.cap_policy = CapPolicy::Fail;
        let stages = vec![stage("recon", false, vec![in_process("discover", Discover(20))])];

        let mut harness = Harness::new();
        let (result, state, _) = harness
            .run(&options, &Scope::default(), &stages, &["seed.example.com"])
            .await;
        assert!(matches!(result, Err(PipelineError::CapExceeded { max: 5, count: 22, .. })));
        assert!(state.aborted.is_some());
    }

    #[tokio::test]
    async fn test_propagation_is_idempotent_and_scoped() {
        let options = RunOptions {
            propagate_assets: true,
            ..options()
        };
        let scope = Scope::new(vec!["example.com".parse::<ScopeEntry>().unwrap()]);
        let mut harness = Harness::new();
        let state = RunState::new("run_test", "test", [("recon", false)]);
        let evidence = harness.dir.path().join("evidence");
        let mut orchestrator = Orchestrator::new(
            &options,
            &scope,
            &mut harness.log,
            &harness.progress,
            &evidence,
            "20240101T000000Z",
            state,
        );
        orchestrator.seed(&["example.com".to_string()]).unwrap();

        let defaults = RecordDefaults::for_cell("discover", "recon", "example.com", None);
        let assets = vec![crate::core::record::normalize(
            json!({"type": "asset", "data": {"hostnames": ["a.example.com", "evil.test"], "ip": ["10.1.1.1"]}}),
            &defaults,
        )];

        orchestrator.propagate("recon", &assets).unwrap();
        let first: Vec<String> = orchestrator.targets().iter().map(|t| t.key.clone()).collect();
        orchestrator.propagate("recon", &assets).unwrap();
        let second: Vec<String> = orchestrator.targets().iter().map(|t| t.key.clone()).collect();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        let state = orchestrator.into_state();
        assert_eq!(state.out_of_scope, vec!["10.1.1.1", "evil.test"]);
    }

    #[tokio::test]
    async fn test_destructive_stage_is_gated_once() {
        let stages = vec![
            stage("exploit", true, vec![in_process("boom", Boom)]),
            stage("notes", false, vec![in_process(echo::ID, echo::Echo)]),
        ];

        let mut harness = Harness::new();
        let (result, state, records) = harness
            .run(&options(), &Scope::default(), &stages, &["a.example.com", "b.example.com"])
            .await;
        result.unwrap();

        let gates: Vec<&Record> = records.iter().filter(|r| r.tool == GATE_NOTE).collect();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].stage, "exploit");
        assert!(state.failures.is_empty());
        assert_eq!(state.stage("notes").unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_destructive_stage_runs_when_allowed() {
        let options = RunOptions {
            allow_destructive: true,
            ..options()
        };
        let stages = vec![stage("exploit", true, vec![in_process(echo::ID, echo::Echo)])];

        let mut harness = Harness::new();
        let (result, state, records) = harness
            .run(&options, &Scope::default(), &stages, &["a.example.com", "b.example.com"])
            .await;
        result.unwrap();

        assert!(records.iter().all(|r| r.tool != GATE_NOTE));
        assert_eq!(records.iter().filter(|r| r.tool == echo::ID).count(), 2);
        let exploit = state.stage("exploit").unwrap();
        assert_eq!(exploit.status, StageStatus::Completed);
        assert_eq!(exploit.completed, 2);
    }

    /// Hands an emitter clone to a worker task that outlives the handler.
    struct FanOut;

    #[async_trait]
    impl SkillHandler for FanOut {
        async fn run(&self, _ctx: SkillContext, emit: Emitter) -> anyhow::Result<()> {
            let worker = emit.clone();
            tokio::spawn(async move {
                worker.emit(json!({"type": "asset", "target": "early.example.com"})).await?;
                tokio::time::sleep(Duration::from_secs(30)).await;
                worker.emit(json!({"type": "asset", "target": "late.example.com"})).await
            });
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_in_process_timeout_ends_cell_despite_worker_emitters() {
        let fanout: Arc<dyn Skill> = Arc::new(
            InProcessSkill::new("fanout", Arc::new(FanOut)).with_timeout(Some(Duration::from_millis(200))),
        );
        let stages = vec![stage(
            "recon",
            false,
            vec![fanout, in_process(echo::ID, echo::Echo)],
        )];

        let mut harness = Harness::new();
        let (result, state, records) = tokio::time::timeout(
            Duration::from_secs(5),
            harness.run(&options(), &Scope::default(), &stages, &["example.com"]),
        )
        .await
        .expect("cell outlived its budget");
        result.unwrap();

        let tools: Vec<&str> = records.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, vec!["fanout", TIMEOUT_NOTE, echo::ID]);
        assert_eq!(records[0].target, "early.example.com");
        assert_eq!(state.timeouts.len(), 1);
    }

    #[tokio::test]
    async fn test_records_after_timeout_note_are_discarded() {
        let mut harness = Harness::new();
        let mut state = RunState::new("run_test", "test", [("recon", false)]);
        let (emitter, rx) = Emitter::channel(RecordDefaults::for_cell("fanout", "recon", "example.com", None));
        let straggler = emitter.clone();
        let late = emitter.clone();

        let work = async move {
            emitter
                .note(TIMEOUT_NOTE, Severity::Low, "budget exceeded", Map::new())
                .await;
            straggler.emit(json!({"type": "finding"})).await
        };
        let (sent, drained) = drain_while(
            work,
            rx,
            CellSink::new("recon", &mut harness.log, &mut state, None),
        )
        .await;
        sent.unwrap();
        drained.unwrap();

        assert!(late.emit(json!({"type": "finding"})).await.is_err());
        let records = read_records(&harness.dir.path().join("records.jsonl")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool, TIMEOUT_NOTE);
        assert_eq!(state.records, 1);
    }

    #[tokio::test]
    async fn test_failures_continue_unless_stop_on_error() {
        let stages = vec![
            stage("recon", false, vec![in_process("boom", Boom)]),
            stage("notes", false, vec![in_process(echo::ID, echo::Echo)]),
        ];

        let mut harness = Harness::new();
        let (result, state, _) = harness
            .run(&options(), &Scope::default(), &stages, &["example.com"])
            .await;
        result.unwrap();
        assert_eq!(state.failures.len(), 1);
        assert_eq!(state.stage("notes").unwrap().completed, 1);

        let options = RunOptions {
            stop_on_error: true,
            ..options()
        };
        let mut harness = Harness::new();
        let (result, state, _) = harness
            .run(&options, &Scope::default(), &stages, &["example.com"])
            .await;
        match result {
            Err(PipelineError::Aborted { stage, error }) => {
                assert_eq!(stage, "recon");
                assert!(error.reason.contains("tool crashed"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(state.stage("notes").unwrap().cells, 0);
    }

    #[tokio::test]
    async fn test_no_targets_in_scope_is_fatal() {
        let scope = Scope::new(vec!["example.org".parse::<ScopeEntry>().unwrap()]);
        let stages = vec![stage("notes", false, vec![in_process(echo::ID, echo::Echo)])];

        let mut harness = Harness::new();
        let (result, state, records) = harness
            .run(&options(), &scope, &stages, &["example.com", "  "])
            .await;
        assert!(matches!(result, Err(PipelineError::NoTargets)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool, SCOPE_NOTE);
        assert_eq!(state.stage("notes").unwrap().cells, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_spawned_skill_keeps_partial_output() {
        use crate::executors::SpawnedSkill;

        let script = r#"printf '{"type":"finding","severity":"high"}\n'; printf 'not json\n'; sleep 30"#;
        let slow: Arc<dyn Skill> = Arc::new(
            SpawnedSkill::new("slow", "sh", vec!["-c".into(), script.into(), "slow".into()])
                .with_timeout(Some(Duration::from_millis(500))),
        );
        let stages = vec![stage(
            "recon",
            false,
            vec![slow, in_process(echo::ID, echo::Echo)],
        )];

        let mut harness = Harness::new();
        let (result, state, records) = harness
            .run(&options(), &Scope::default(), &stages, &["example.com"])
            .await;
        result.unwrap();

        let tools: Vec<&str> = records.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, vec!["slow", TIMEOUT_NOTE, echo::ID]);
        assert_eq!(records[0].kind, RecordKind::Finding);
        assert_eq!(state.timeouts.len(), 1);
        assert_eq!(state.stage("recon").unwrap().completed, 1);
    }

    #[test]
    fn test_asset_candidates() {
        let defaults = RecordDefaults::for_cell("dns", "recon", "example.com", None);
        let records = vec![
            crate::core::record::normalize(
                json!({"type": "asset", "data": {"ip": "10.0.0.1", "hostnames": ["a.example.com", 7]}}),
                &defaults,
            ),
            crate::core::record::normalize(json!({"type": "finding", "data": {"ip": "10.9.9.9"}}), &defaults),
        ];
        assert_eq!(
            asset_candidates(&records),
            vec!["example.com", "10.0.0.1", "a.example.com"]
        );
    }
}
