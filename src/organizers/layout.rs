use crate::core::models::RunDirs;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Create `<runs_dir>/<run_id>/evidence`. A run id that is already taken gets
/// a numeric suffix so two runs never share a directory.
pub fn prepare_run_dirs(runs_dir: &Path, run_id: &str) -> Result<RunDirs> {
    fs::create_dir_all(runs_dir)
        .with_context(|| format!("Failed to create runs directory: {:?}", runs_dir))?;

    let mut id = run_id.to_string();
    let mut attempt = 1;
    let root = loop {
        let candidate = runs_dir.join(&id);
        match fs::create_dir(&candidate) {
            Ok(()) => break candidate,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                id = format!("{}-{}", run_id, attempt);
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create directory: {:?}", candidate));
            }
        }
    };

    let dirs = RunDirs {
        run_id: id,
        evidence: root.join("evidence"),
        log_file: root.join("records.jsonl"),
        summary_file: root.join("summary.json"),
        root,
    };

    fs::create_dir_all(&dirs.evidence)
        .with_context(|| format!("Failed to create directory: {:?}", dirs.evidence))?;
    verify_writable(&dirs.root)?;

    tracing::info!("Run directory: {:?}", dirs.root);
    Ok(dirs)
}

fn verify_writable(path: &Path) -> Result<()> {
    let test_file = path.join(".write_test");
    fs::write(&test_file, b"test")
        .with_context(|| format!("Directory not writable: {:?}", path))?;
    fs::remove_file(&test_file)
        .with_context(|| format!("Failed to remove test file: {:?}", test_file))?;
    Ok(())
}
