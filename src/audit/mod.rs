//! Append-only audit trail for key and credential operations.
//!
//! One JSON object per line:
//!
//! ```text
//! {"timestamp":"2026-10-14T09:12:44.120Z","eventType":"encrypt","success":true,"metadata":{"keyVersion":"2026-01"}}
//! ```
//!
//! Metadata is for identifiers only (key versions, format versions, paths,
//! error classes). Key bytes and token values never go in here.

mod sink;

pub use sink::{AuditError, AuditSink, FileAuditSink, MemoryAuditSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Auditable operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    KeyRegistered,
    KeyPromoted,
    Encrypt,
    Decrypt,
    Rotate,
    Migrate,
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub success: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            success,
            metadata: Map::new(),
        }
    }

    /// Adds a metadata field. Callers pass identifiers, never secrets.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Handle used by the registry and store to emit events.
///
/// Cheap to clone. A failing sink is logged and never fails the operation
/// being audited.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Appends to a JSON-lines file, creating it if needed.
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self::new(Arc::new(FileAuditSink::new(path.as_ref())))
    }

    /// Keeps events in memory. Returns the sink so tests can read them back.
    pub fn memory() -> (Self, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        (Self::new(sink.clone()), sink)
    }

    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.sink.append(&event) {
            warn!(
                event_type = ?event.event_type,
                error = %e,
                "Failed to append audit event"
            );
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}
