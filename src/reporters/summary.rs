use crate::core::{models::RunDirs, state::RunState};
use crate::utils::fs::atomic_write;
use anyhow::Result;

pub fn write_json_summary(state: &RunState, dirs: &RunDirs) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    atomic_write(&dirs.summary_file, json.as_bytes())?;
    tracing::info!("Summary written to {:?}", dirs.summary_file);
    Ok(())
}
