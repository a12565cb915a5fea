//! Audit trail of gated calls
//!
//! Every call that reaches the gate produces exactly one [`AuditRecord`],
//! written after the handler finished (or after the call was rejected).

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use super::{Identity, Operation};

/// Result of a gated call as seen by the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler ran and reported success
    Success,
    /// Handler ran and reported failure
    Failure,
    /// Gate refused the call; the handler never ran
    Rejected(tonic::Code),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failure => f.write_str("error"),
            Outcome::Rejected(code) => write!(f, "rejected ({code:?})"),
        }
    }
}

/// One audited call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Operation requested
    pub operation: Operation,
    /// Caller identity; absent when authentication failed
    pub identity: Option<Identity>,
    /// Wall-clock time the call reached the gate
    pub started_at: DateTime<Utc>,
    /// Time from gate entry to handler completion
    pub duration: Duration,
    /// How the call ended
    pub outcome: Outcome,
}

/// Destination of audit records
pub trait AuditSink: Send + Sync {
    /// Append one record
    fn record(&self, record: AuditRecord);
}

/// Writes audit records as `tracing` events on the `kubicd::audit` target
///
/// Records are emitted one at a time so concurrent calls never interleave
/// within a line.
#[derive(Debug, Default)]
pub struct TracingAuditSink {
    lock: Mutex<()>,
}

impl TracingAuditSink {
    /// Create a sink
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let identity = record.identity.as_ref().map_or("-", Identity::as_str);
        info!(
            target: "kubicd::audit",
            operation = %record.operation,
            identity,
            started_at = %record.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms = record.duration.as_millis() as u64,
            outcome = %record.outcome,
            "call completed"
        );
    }
}

/// Keeps records in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

#[cfg(test)]
impl MemoryAuditSink {
    pub(crate) fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}
