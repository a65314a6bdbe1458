use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::record::{self, Record, RecordDefaults, Severity};

pub const EMIT_BUFFER: usize = 256;

/// Sending half of a cell's record stream. The stream is complete once every
/// clone has been dropped.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::Sender<Record>,
    defaults: Arc<RecordDefaults>,
    emitted: Arc<AtomicUsize>,
}

impl Emitter {
    pub fn channel(defaults: RecordDefaults) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(EMIT_BUFFER);
        let emitter = Self {
            tx,
            defaults: Arc::new(defaults),
            emitted: Arc::new(AtomicUsize::new(0)),
        };
        (emitter, rx)
    }

    /// Normalize and forward one skill-produced value.
    pub async fn emit(&self, raw: Value) -> Result<()> {
        let record = record::normalize(raw, &self.defaults);
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow!("record stream closed"))?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Runner-authored note; not counted as skill output.
    pub async fn note(
        &self,
        tool: &str,
        severity: Severity,
        message: impl Into<String>,
        data: Map<String, Value>,
    ) {
        let record = record::synthetic_note(tool, severity, message, data, &self.defaults);
        if self.tx.send(record).await.is_err() {
            tracing::warn!("Dropping {} note: record stream closed", tool);
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }
}
