//! Best-effort audit trail of fetched mappings and finished migrations.
//!
//! Sinks are written from background tasks; a failing sink is logged and
//! never affects the operation that produced the event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use semconv_store::SchemaVersion;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::coordinator::{AbortReason, JobState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    MappingFetched {
        from: SchemaVersion,
        to: SchemaVersion,
        revision: u64,
        renames: usize,
        attempts: u32,
        at: DateTime<Utc>,
    },
    MigrationFinished {
        job_id: Uuid,
        from: SchemaVersion,
        to: SchemaVersion,
        state: JobState,
        scanned: u64,
        migrated: u64,
        skipped: u64,
        failed: u64,
        reason: Option<AbortReason>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Error)]
#[error("audit sink error: {0}")]
pub struct SinkError(pub String);

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError>;
}

/// Write `event` to `sink` on a background task.
pub(crate) fn emit(sink: &Arc<dyn AuditSink>, event: AuditEvent) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        if let Err(e) = sink.record(event).await {
            tracing::warn!(err = %e, "failed to record audit event");
        }
    });
}

/// Logs every event as a structured `info` line on the `semconv::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(&event).map_err(|e| SinkError(e.to_string()))?;
        tracing::info!(target: "semconv::audit", event = %json);
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl AuditSink for NullSink {
    async fn record(&self, _event: AuditEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps events in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}
