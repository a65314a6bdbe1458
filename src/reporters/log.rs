use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::errors::PipelineError;
use crate::core::record::Record;

/// Append-only JSON-lines record log. Every line is flushed as it is written
/// so a crash never loses an appended record.
pub struct RunLog {
    file: File,
    path: PathBuf,
    count: usize,
    echo_stdout: bool,
}

impl RunLog {
    pub fn create(path: &Path, echo_stdout: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open run log: {:?}", path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            count: 0,
            echo_stdout,
        })
    }

    pub fn append(&mut self, record: &Record) -> Result<(), PipelineError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        // One write per line keeps lines whole even if a later write fails.
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        if self.echo_stdout {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
        }
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a run log back. Lines that fail to parse are reported, not skipped.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("Failed to open run log: {:?}", path))?;
    BufReader::new(file)
        .lines()
        .enumerate()
        .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|(idx, line)| {
            let line = line.with_context(|| format!("Failed to read {:?}", path))?;
            serde_json::from_str(&line)
                .with_context(|| format!("Invalid record on line {} of {:?}", idx + 1, path))
        })
        .collect()
}
