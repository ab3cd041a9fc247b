//! The contract every storage backend implements.
//!
//! The runner talks to backends exclusively through [`MigrationHandler`]:
//! one list query, per-step apply/rollback dispatches, and a finalize call
//! per direction that makes (or deletes) the durable record. Handlers are
//! keyed by service name and must answer synchronously.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::script::ScriptExecutor;

/// Sink for human-readable handler progress messages.
///
/// Handed to handlers at run start and never interpreted by the engine.
pub trait ProgressSink: Send {
    /// Emit one progress line.
    fn line(&mut self, message: &str);
}

/// Shared handle to the progress sink for the current run.
pub type SharedSink = Arc<Mutex<dyn ProgressSink + Send>>;

/// Sink that discards all messages.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn line(&mut self, _message: &str) {}
}

/// One migration a service reports as applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedEntry {
    /// Creation time recorded with the migration.
    pub created: i64,
    /// Step indices recorded for the migration.
    pub steps: BTreeSet<u32>,
}

/// Everything a service reports from the list query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedMigrations {
    /// Applied migrations keyed by `module:file` name.
    pub entries: BTreeMap<String, AppliedEntry>,
    /// Baseline below which migrations are assumed pre-applied.
    pub watermark: Option<i64>,
}

impl AppliedMigrations {
    /// Record a step for a migration, creating the entry on first sight.
    pub fn record(&mut self, name: &str, created: i64, step: u32) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert(AppliedEntry {
                created,
                steps: BTreeSet::new(),
            });
        if step > 0 {
            entry.steps.insert(step);
        }
    }
}

/// Request to execute one apply step.
#[derive(Debug)]
pub struct ApplyStep<'a> {
    /// Migration name (`module:file`).
    pub migration: &'a str,
    /// Step index (always positive).
    pub step: u32,
    /// Step kind tag (`sql`, `csv`, `script`, or backend-specific).
    pub kind: &'a str,
    /// Script body, already trimmed.
    pub code: &'a str,
    /// Decoded query-string arguments from the action value.
    pub args: &'a BTreeMap<String, String>,
    /// Migration creation time.
    pub created: i64,
    /// Digest of the script body under the validation key.
    pub signature: &'a str,
    /// Executor for `script` steps, verifying signatures before invocation.
    pub executor: &'a ScriptExecutor<'a>,
}

/// Request to durably record an applied migration with its rollback bundle.
#[derive(Debug)]
pub struct FinalizeApply<'a> {
    /// Migration name.
    pub migration: &'a str,
    /// Migration creation time.
    pub created: i64,
    /// Applied timestamp from the runner's monotonic clock.
    pub applied: i64,
    /// Signed records to persist, step 0 (the definition body) included.
    pub records: &'a [RollbackRecord],
}

/// Request to execute one rollback step.
#[derive(Debug)]
pub struct RollbackStep<'a> {
    /// Migration name.
    pub migration: &'a str,
    /// Step index (always positive).
    pub step: u32,
    /// In-memory record for compensating rollback of a migration whose
    /// bundle was never finalized; absent for ordinary rollback, where the
    /// handler loads its stored record instead.
    pub record: Option<&'a RollbackRecord>,
    /// Executor for stored scripts, verifying signatures before invocation.
    pub executor: &'a ScriptExecutor<'a>,
}

/// Kind tag for SQL step bodies.
pub const KIND_SQL: &str = "sql";
/// Kind tag for CSV import step bodies.
pub const KIND_CSV: &str = "csv";
/// Kind tag for host-executed script steps.
pub const KIND_SCRIPT: &str = "script";
/// Kind tag of the step-0 record holding the definition file body.
pub const KIND_DEFINITION: &str = "ini";

/// Signed reversal material for one step of one migration.
///
/// Produced by the engine at apply time, persisted by the handler, and
/// never mutated afterwards; rollback consumes and deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Migration name.
    pub migration: String,
    /// Step index; step 0 holds the definition body itself.
    pub step: u32,
    /// Step kind tag.
    pub kind: String,
    /// JSON-serialized results of the paired apply step, if any.
    pub args: Option<String>,
    /// Script body that reverses the step.
    pub code: String,
    /// Keyed digest over the record fields.
    pub signature: String,
}

/// A pluggable storage backend.
///
/// Implementations persist applied-migration records for one named service
/// and execute the step kinds they understand. All calls are synchronous;
/// internal concurrency is the handler's business.
pub trait MigrationHandler {
    /// Service name this handler answers for.
    fn service_name(&self) -> &str;

    /// Run-start hook; receives the shared progress sink.
    fn on_init(&mut self, sink: SharedSink) -> Result<(), HandlerError>;

    /// Run-end hook; called unconditionally, including after errors.
    fn on_free(&mut self);

    /// Report every migration currently recorded as applied.
    fn list_applied(&mut self) -> Result<AppliedMigrations, HandlerError>;

    /// Execute one apply step. Returned values become the serialized
    /// arguments of the paired rollback record.
    fn apply_step(&mut self, step: &ApplyStep<'_>) -> Result<Option<serde_json::Value>, HandlerError>;

    /// Durably record an applied migration, transactionally if possible.
    fn finalize_apply(&mut self, finalize: &FinalizeApply<'_>) -> Result<(), HandlerError>;

    /// Execute one rollback step from the stored record.
    fn rollback_step(&mut self, step: &RollbackStep<'_>) -> Result<(), HandlerError>;

    /// Delete the durable record of a migration.
    fn finalize_rollback(&mut self, migration: &str) -> Result<(), HandlerError>;
}
