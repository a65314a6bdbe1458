use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::CapPolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = "skillcrawler", version, about = "Scope-aware staged reconnaissance pipeline runner")]
pub struct Cli {
    /// Target host, IP, CIDR or URL (repeatable)
    #[arg(short = 't', long = "target", value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Newline-delimited file of targets
    #[arg(long = "targets-file", value_name = "FILE")]
    pub targets_file: Option<PathBuf>,

    /// Pipeline definition (YAML)
    #[arg(short = 'p', long = "pipeline", value_name = "FILE")]
    pub pipeline: PathBuf,

    /// Allow-list of hosts, wildcards, IPs, CIDRs and URL prefixes
    #[arg(short = 's', long = "scope-file", value_name = "FILE")]
    pub scope_file: Option<PathBuf>,

    /// Root directory for run artifacts
    #[arg(long = "runs-dir", value_name = "DIR", default_value = "runs")]
    pub runs_dir: PathBuf,

    /// Directory searched for script skills
    #[arg(long = "skills-dir", value_name = "DIR", default_value = "skills")]
    pub skills_dir: PathBuf,

    /// Run stages marked destructive
    #[arg(long = "allow-destructive", action = ArgAction::SetTrue)]
    pub allow_destructive: bool,

    /// Feed hosts and IPs from asset records into later stages
    #[arg(long = "propagate-assets", action = ArgAction::SetTrue)]
    pub propagate_assets: bool,

    /// Upper bound on the working target set
    #[arg(long = "max-targets", value_name = "N")]
    pub max_targets: Option<usize>,

    /// What to do when the target set outgrows --max-targets
    #[arg(long = "cap-policy", value_enum)]
    pub cap_policy: Option<CapPolicy>,

    /// Treat malformed skill output as a failure
    #[arg(long = "strict", action = ArgAction::SetTrue)]
    pub strict: bool,

    /// Abort the run on the first failed skill
    #[arg(long = "stop-on-error", action = ArgAction::SetTrue)]
    pub stop_on_error: bool,

    /// Per-skill wall-clock budget in seconds
    #[arg(long = "timeout", value_name = "SECS", env = "SKILLCRAWLER_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Grace window between SIGTERM and SIGKILL in milliseconds
    #[arg(long = "kill-grace", value_name = "MS")]
    pub kill_grace_ms: Option<u64>,

    /// Requests per second hint passed to skills
    #[arg(long = "rate", value_name = "N", env = "SKILLCRAWLER_RATE")]
    pub rate: Option<u32>,

    /// Workspace label stamped on every record
    #[arg(long = "workspace", value_name = "NAME", env = "SKILLCRAWLER_WORKSPACE")]
    pub workspace: Option<String>,

    /// Also echo records to stdout as JSON lines
    #[arg(long = "stdout", action = ArgAction::SetTrue)]
    pub stdout: bool,

    /// Verbose human output
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Debug logs (implies verbose)
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    pub debug: bool,
}
