use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

use super::emitter::Emitter;
use super::lines::{Line, LineSplitter, ParsedLine};
use super::runners::{ExitInfo, InvokeStatus, Limits, Skill, SkillContext, PARSE_ERROR_NOTE};
use crate::core::record::Severity;

const READ_CHUNK: usize = 8192;
const STDERR_TAIL_LINES: usize = 10;

/// Which optional flags the child understands. `--target` is always passed;
/// the environment always carries every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkillInputs {
    pub out_dir: bool,
    pub scope_file: bool,
    pub rate: bool,
    pub timeout: bool,
}

impl SkillInputs {
    pub fn all() -> Self {
        Self {
            out_dir: true,
            scope_file: true,
            rate: true,
            timeout: true,
        }
    }

    pub fn target_only() -> Self {
        Self {
            out_dir: false,
            scope_file: false,
            rate: false,
            timeout: false,
        }
    }

    /// Build from declared input names such as `target, out-dir, rate`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inputs = Self::target_only();
        for name in names {
            match name.as_ref().trim().replace('_', "-").as_str() {
                "out-dir" => inputs.out_dir = true,
                "scope-file" | "scope" => inputs.scope_file = true,
                "rate" => inputs.rate = true,
                "timeout" => inputs.timeout = true,
                _ => {}
            }
        }
        inputs
    }
}

/// Skill run as a child process speaking the line-delimited record protocol
/// on stdout.
#[derive(Debug, Clone)]
pub struct SpawnedSkill {
    id: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    inputs: SkillInputs,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl SpawnedSkill {
    pub fn new(id: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args,
            env: BTreeMap::new(),
            inputs: SkillInputs::all(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_inputs(mut self, inputs: SkillInputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn build_command(&self, ctx: &SkillContext) -> Command {
        let timeout_secs = ctx.timeout.as_secs().max(1).to_string();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--target")
            .arg(&ctx.target.normalized_target);
        if self.inputs.out_dir {
            cmd.arg("--out-dir").arg(&ctx.out_dir);
        }
        if let (true, Some(scope)) = (self.inputs.scope_file, &ctx.scope_file) {
            cmd.arg("--scope-file").arg(scope);
        }
        if let (true, Some(rate)) = (self.inputs.rate, ctx.rate) {
            cmd.arg("--rate").arg(rate.to_string());
        }
        if self.inputs.timeout {
            cmd.arg("--timeout").arg(&timeout_secs);
        }

        cmd.env("SKILLCRAWLER_TARGET", &ctx.target.normalized_target)
            .env("SKILLCRAWLER_TARGET_HOST", &ctx.target.host)
            .env("SKILLCRAWLER_TARGET_KEY", &ctx.target.key)
            .env("SKILLCRAWLER_STAGE", &ctx.stage)
            .env("SKILLCRAWLER_OUT_DIR", &ctx.out_dir)
            .env("SKILLCRAWLER_RUN_TS", &ctx.run_ts)
            .env("SKILLCRAWLER_TIMEOUT", &timeout_secs);
        if let Some(scope) = &ctx.scope_file {
            cmd.env("SKILLCRAWLER_SCOPE_FILE", scope);
        }
        if let Some(rate) = ctx.rate {
            cmd.env("SKILLCRAWLER_RATE", rate.to_string());
        }
        if let Some(workspace) = &ctx.workspace {
            cmd.env("SKILLCRAWLER_WORKSPACE", workspace);
        }
        cmd.envs(&self.env);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a timeout can take down the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[derive(Debug, Default)]
struct StreamStats {
    parse_errors: usize,
}

#[async_trait]
impl Skill for SpawnedSkill {
    fn id(&self) -> &str {
        &self.id
    }

    fn variant(&self) -> &'static str {
        "spawned"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(&self, ctx: &SkillContext, emitter: &Emitter, limits: &Limits) -> ExitInfo {
        tracing::debug!("Spawning {} {:?} for {}", self.program, self.args, ctx.target.normalized_target);

        let mut child = match self.build_command(ctx).spawn() {
            Ok(child) => child,
            Err(e) => return ExitInfo::failed(format!("failed to spawn {}: {}", self.program, e)),
        };
        let pid = child.id();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            terminate(&mut child, pid, limits.kill_grace).await;
            return ExitInfo::failed("child stdio was not captured");
        };

        let mut stats = StreamStats::default();
        let mut stderr_tail: VecDeque<String> = VecDeque::new();

        let finished = timeout(limits.budget, async {
            let (pumped, ()) = tokio::join!(
                pump_stdout(stdout, emitter, &mut stats, limits.strict),
                drain_stderr(stderr, &mut stderr_tail, &self.id),
            );
            pumped?;
            child.wait().await.context("failed to wait for skill process")
        })
        .await;

        let mut exit = match finished {
            Ok(Ok(status)) if status.success() => ExitInfo::completed(),
            Ok(Ok(status)) => {
                let mut exit = ExitInfo::failed(format!("process exited with {}", status));
                exit.exit_code = status.code();
                exit
            }
            Ok(Err(e)) => {
                terminate(&mut child, pid, limits.kill_grace).await;
                ExitInfo::failed(format!("{:#}", e))
            }
            Err(_) => {
                terminate(&mut child, pid, limits.kill_grace).await;
                ExitInfo::timed_out()
            }
        };

        if limits.strict && stats.parse_errors > 0 && exit.status == InvokeStatus::Completed {
            exit.status = InvokeStatus::Failed(format!("{} malformed record line(s)", stats.parse_errors));
        }
        exit.parse_errors = stats.parse_errors;
        exit.stderr_tail = Vec::from(stderr_tail).join("\n");
        exit
    }
}

async fn pump_stdout(
    mut stdout: ChildStdout,
    emitter: &Emitter,
    stats: &mut StreamStats,
    strict: bool,
) -> Result<()> {
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = stdout.read(&mut buf).await.context("failed to read skill stdout")?;
        if n == 0 {
            break;
        }
        for line in splitter.push(&buf[..n]) {
            handle_line(line, emitter, stats, strict).await?;
        }
    }

    if let Some(tail) = splitter.finish() {
        handle_line(tail, emitter, stats, strict).await?;
    }
    Ok(())
}

async fn handle_line(line: Line, emitter: &Emitter, stats: &mut StreamStats, strict: bool) -> Result<()> {
    match line.parse() {
        ParsedLine::Blank => Ok(()),
        ParsedLine::Record(value) => emitter.emit(value).await,
        ParsedLine::Malformed(raw) => {
            stats.parse_errors += 1;
            if strict {
                let mut data = Map::new();
                data.insert("line".into(), Value::String(raw.chars().take(512).collect()));
                emitter
                    .note(PARSE_ERROR_NOTE, Severity::Low, "malformed record line", data)
                    .await;
            } else {
                tracing::debug!("Dropping malformed record line: {:.120}", raw);
            }
            Ok(())
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, tail: &mut VecDeque<String>, skill: &str) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("[{}] {}", skill, line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// SIGTERM the process group, wait out the grace window, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if timeout(grace, child.wait()).await.is_err() {
        tracing::warn!("Skill process {:?} ignored SIGTERM, killing", pid);
    }

    // Leftover group members may outlive the leader.
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::record::{Record, RecordDefaults, RecordKind};
    use crate::core::target;
    use crate::executors::runners::{execute, CellStatus, ExecOutcome, Gate, TIMEOUT_NOTE};
    use std::time::Instant;

    fn sh(script: &str) -> SpawnedSkill {
        // trailing arg becomes $0 so "$*" sees only the injected flags
        SpawnedSkill::new("sh-skill", "sh", vec!["-c".into(), script.into(), "sh-skill".into()])
    }

    fn context() -> SkillContext {
        SkillContext {
            target: target::parse("https://example.com/app"),
            stage: "ping".into(),
            out_dir: std::env::temp_dir(),
            scope_file: None,
            rate: Some(5),
            timeout: Duration::from_millis(500),
            run_ts: "20240101T000000Z".into(),
            workspace: Some("acme".into()),
        }
    }

    async fn run(skill: SpawnedSkill, budget_ms: u64, strict: bool) -> (ExecOutcome, Vec<Record>) {
        let ctx = context();
        let limits = Limits {
            budget: Duration::from_millis(budget_ms),
            kill_grace: Duration::from_millis(200),
            strict,
        };
        let (emitter, mut rx) =
            Emitter::channel(RecordDefaults::for_cell("sh-skill", "ping", "https://example.com/app", None));
        let collect = async {
            let mut records = Vec::new();
            while let Some(record) = rx.recv().await {
                records.push(record);
            }
            records
        };
        tokio::join!(execute(&skill, &ctx, &limits, Gate::default(), emitter), collect)
    }

    #[tokio::test]
    async fn test_records_from_stdout() {
        let script = r#"printf '{"type":"asset","data":{"ip":"10.0.0.1"}}\n{"type":"fin'; printf 'ding","severity":"med"}'"#;
        let (outcome, records) = run(sh(script), 5_000, false).await;
        assert!(outcome.ok(), "{:?}", outcome.status);
        assert_eq!(outcome.emitted, 2);
        assert_eq!(records[0].kind, RecordKind::Asset);
        assert_eq!(records[1].kind, RecordKind::Finding);
        assert_eq!(records[1].severity, Severity::Medium);
        assert_eq!(records[1].target, "https://example.com/app");
    }

    #[tokio::test]
    async fn test_valid_then_malformed_then_timeout() {
        let script = r#"echo '{"type":"asset","target":"a.example.com"}'; echo 'not json'; sleep 10"#;
        let started = Instant::now();
        let (outcome, records) = run(sh(script), 500, false).await;

        assert_eq!(outcome.status, CellStatus::TimedOut);
        assert_eq!(outcome.parse_errors, 1);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].target, "a.example.com");
        assert_eq!(records[1].tool, TIMEOUT_NOTE);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_then_killed() {
        let script = r#"trap '' TERM; echo '{"type":"note"}'; while true; do sleep 1; done"#;
        let started = Instant::now();
        let (outcome, records) = run(sh(script), 300, false).await;
        assert_eq!(outcome.status, CellStatus::TimedOut);
        assert_eq!(records.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_strict_mode_flags_malformed_lines() {
        let script = r#"echo '{"type":"note"}'; echo 'garbage'"#;
        let (outcome, records) = run(sh(script), 5_000, true).await;
        assert!(matches!(outcome.status, CellStatus::Failed(ref e) if e.reason.contains("malformed")));
        let tools: Vec<&str> = records.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, vec!["sh-skill", PARSE_ERROR_NOTE, "runner-error"]);
    }

    #[tokio::test]
    async fn test_overlong_line_counts_as_malformed() {
        let script = r#"head -c 2097152 /dev/zero | tr '\0' 'x'; echo; echo '{"type":"note"}'"#;
        let (outcome, records) = run(sh(script), 5_000, false).await;
        assert!(outcome.ok(), "{:?}", outcome.status);
        assert_eq!(outcome.parse_errors, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Note);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure_with_stderr_tail() {
        let script = r#"echo 'resolver unreachable' >&2; exit 3"#;
        let (outcome, _) = run(sh(script), 5_000, false).await;
        match outcome.status {
            CellStatus::Failed(e) => {
                assert_eq!(e.exit_code, Some(3));
                assert!(e.stderr_tail.contains("resolver unreachable"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let skill = SpawnedSkill::new("missing", "/nonexistent/skill-binary", vec![]);
        let (outcome, records) = run(skill, 1_000, false).await;
        assert!(matches!(outcome.status, CellStatus::Failed(_)));
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_arguments_and_environment() {
        let script = r#"printf '{"type":"note","data":{"argv":"%s","env":"%s","ws":"%s"}}\n' "$*" "$SKILLCRAWLER_TARGET_HOST" "$SKILLCRAWLER_WORKSPACE""#;
        let skill = sh(script).with_inputs(SkillInputs::from_names(["target", "rate"]));
        let (outcome, records) = run(skill, 5_000, false).await;
        assert!(outcome.ok());
        let data = &records[0].data;
        assert_eq!(data["argv"], "--target https://example.com/app --rate 5");
        assert_eq!(data["env"], "example.com");
        assert_eq!(data["ws"], "acme");
    }
}
