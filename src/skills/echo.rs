use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::executors::{Emitter, SkillContext, SkillHandler};

pub const ID: &str = "builtin/echo";

/// Emits one note describing the cell. Useful for dry runs of a pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

#[async_trait]
impl SkillHandler for Echo {
    async fn run(&self, ctx: SkillContext, emit: Emitter) -> Result<()> {
        emit.emit(json!({
            "type": "note",
            "target": ctx.target.normalized_target,
            "evidence": format!(
                "{} target {} in stage {}",
                ctx.target.kind.as_str(),
                ctx.target.normalized_target,
                ctx.stage
            ),
            "data": {
                "key": ctx.target.key,
                "host": ctx.target.host,
                "out_dir": ctx.out_dir.to_string_lossy(),
                "run_ts": ctx.run_ts,
            },
        }))
        .await
    }
}
