use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use super::emitter::Emitter;
use super::runners::{ExitInfo, Limits, Skill, SkillContext};

/// Native skill entry point. Handlers must stay cooperative (no blocking
/// calls) so a timed-out run can be aborted.
#[async_trait]
pub trait SkillHandler: Send + Sync + 'static {
    async fn run(&self, ctx: SkillContext, emit: Emitter) -> Result<()>;
}

pub struct InProcessSkill {
    id: String,
    handler: Arc<dyn SkillHandler>,
    timeout: Option<Duration>,
}

impl InProcessSkill {
    pub fn new(id: impl Into<String>, handler: Arc<dyn SkillHandler>) -> Self {
        Self {
            id: id.into(),
            handler,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Skill for InProcessSkill {
    fn id(&self) -> &str {
        &self.id
    }

    fn variant(&self) -> &'static str {
        "in-process"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(&self, ctx: &SkillContext, emitter: &Emitter, limits: &Limits) -> ExitInfo {
        let handler = Arc::clone(&self.handler);
        let task_ctx = ctx.clone();
        let task_emitter = emitter.clone();

        // Own task so a panicking handler surfaces as a JoinError.
        let task = tokio::spawn(async move { handler.run(task_ctx, task_emitter).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(limits.budget, task).await {
            Ok(Ok(Ok(()))) => ExitInfo::completed(),
            Ok(Ok(Err(e))) => ExitInfo::failed(format!("{:#}", e)),
            Ok(Err(join)) if join.is_panic() => {
                ExitInfo::failed(format!("skill panicked: {}", panic_message(join.into_panic())))
            }
            Ok(Err(join)) => ExitInfo::failed(join.to_string()),
            Err(_) => {
                abort.abort();
                ExitInfo::timed_out()
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{Record, RecordDefaults};
    use crate::core::target;
    use crate::executors::runners::{execute, CellStatus, Gate, TIMEOUT_NOTE};
    use serde_json::json;

    enum Behaviour {
        EmitTwo,
        EmitThenHang,
        Fail,
        Panic,
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl SkillHandler for Scripted {
        async fn run(&self, ctx: SkillContext, emit: Emitter) -> Result<()> {
            match self.0 {
                Behaviour::EmitTwo => {
                    emit.emit(json!({"type": "asset", "target": ctx.target.host})).await?;
                    emit.emit(json!({"type": "finding", "severity": "high"})).await?;
                    Ok(())
                }
                Behaviour::EmitThenHang => {
                    emit.emit(json!({"type": "note", "evidence": "started"})).await?;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
                Behaviour::Fail => anyhow::bail!("lookup refused"),
                Behaviour::Panic => panic!("handler exploded"),
            }
        }
    }

    fn context() -> SkillContext {
        SkillContext {
            target: target::parse("example.com"),
            stage: "recon".into(),
            out_dir: std::env::temp_dir(),
            scope_file: None,
            rate: Some(10),
            timeout: Duration::from_millis(200),
            run_ts: "20240101T000000Z".into(),
            workspace: None,
        }
    }

    async fn run(behaviour: Behaviour) -> (CellStatus, Vec<Record>) {
        let skill = InProcessSkill::new("scripted", Arc::new(Scripted(behaviour)));
        let ctx = context();
        let limits = Limits {
            budget: Duration::from_millis(200),
            kill_grace: Duration::from_millis(50),
            strict: false,
        };
        let (emitter, mut rx) =
            Emitter::channel(RecordDefaults::for_cell("scripted", "recon", "example.com", None));
        let collect = async {
            let mut records = Vec::new();
            while let Some(record) = rx.recv().await {
                records.push(record);
            }
            records
        };
        let (outcome, records) =
            tokio::join!(execute(&skill, &ctx, &limits, Gate::default(), emitter), collect);
        (outcome.status, records)
    }

    #[tokio::test]
    async fn test_records_stream_through() {
        let (status, records) = run(Behaviour::EmitTwo).await;
        assert_eq!(status, CellStatus::Completed);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].target, "example.com");
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let (status, records) = run(Behaviour::EmitThenHang).await;
        assert_eq!(status, CellStatus::TimedOut);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].evidence, vec!["started"]);
        assert_eq!(records[1].tool, TIMEOUT_NOTE);
    }

    #[tokio::test]
    async fn test_handler_error_is_recorded() {
        let (status, _) = run(Behaviour::Fail).await;
        assert!(matches!(status, CellStatus::Failed(ref e) if e.reason.contains("lookup refused")));
    }

    #[tokio::test]
    async fn test_panic_does_not_escape() {
        let (status, _) = run(Behaviour::Panic).await;
        assert!(matches!(status, CellStatus::Failed(ref e) if e.reason.contains("handler exploded")));
    }
}
