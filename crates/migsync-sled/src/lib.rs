//! Embedded sled storage backend for migsync.
//!
//! Keeps applied-migration records rkyv-encoded in a dedicated tree,
//! keyed `record:{name}:{step}`, and finalizes each migration with one
//! atomic batch. Only `script` steps execute on this backend.

use rkyv::{Archive, Deserialize, Serialize};

use migsync_core::{
    AppliedMigrations, ApplyStep, FinalizeApply, HandlerError, MigrationHandler, RollbackRecord,
    RollbackStep, SharedSink, KIND_SCRIPT,
};

/// Service name this handler answers for unless overridden.
pub const DEFAULT_SERVICE: &str = "migsync.sled";

/// Tree holding migration records.
pub const TREE_NAME: &str = "migsync:records";

/// Record kind marking a permanent-baseline entry.
const KIND_PERMANENT: &str = "permanent";

const KEY_PREFIX: &str = "record:";

/// One persisted step record.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct StoredRecord {
    migration: String,
    step: u32,
    kind: String,
    created: i64,
    applied: i64,
    args: Option<String>,
    code: String,
    signature: String,
}

impl StoredRecord {
    fn to_bytes(&self) -> Result<Vec<u8>, HandlerError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| HandlerError::Storage(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, HandlerError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| HandlerError::Storage(e.to_string()))
    }

    fn into_rollback(self) -> RollbackRecord {
        RollbackRecord {
            migration: self.migration,
            step: self.step,
            kind: self.kind,
            args: self.args,
            code: self.code,
            signature: self.signature,
        }
    }
}

fn record_key(migration: &str, step: u32) -> Vec<u8> {
    format!("{KEY_PREFIX}{migration}:{step}").into_bytes()
}

fn storage(error: sled::Error) -> HandlerError {
    HandlerError::Storage(error.to_string())
}

/// Storage backend keeping applied-migration records in a sled tree.
pub struct SledHandler {
    service_name: String,
    db: sled::Db,
    tree: sled::Tree,
    sink: Option<SharedSink>,
}

impl SledHandler {
    /// Open the records tree on an existing database.
    pub fn open(db: &sled::Db) -> Result<Self, HandlerError> {
        let tree = db.open_tree(TREE_NAME).map_err(storage)?;
        Ok(Self {
            service_name: DEFAULT_SERVICE.to_string(),
            db: db.clone(),
            tree,
            sink: None,
        })
    }

    /// Open (or create) a database at `path`.
    pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self, HandlerError> {
        let db = sled::open(path).map_err(storage)?;
        Self::open(&db)
    }

    /// Answer for a different service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    fn report(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.lock().line(message);
        }
    }

    fn stored_record(
        &self,
        migration: &str,
        step: u32,
    ) -> Result<Option<StoredRecord>, HandlerError> {
        match self.tree.get(record_key(migration, step)).map_err(storage)? {
            Some(bytes) => Ok(Some(StoredRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl MigrationHandler for SledHandler {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn on_init(&mut self, sink: SharedSink) -> Result<(), HandlerError> {
        self.sink = Some(sink);
        Ok(())
    }

    fn on_free(&mut self) {
        self.sink = None;
        if let Err(error) = self.db.flush() {
            tracing::warn!(error = %error, "flush failed");
        }
    }

    fn list_applied(&mut self) -> Result<AppliedMigrations, HandlerError> {
        let mut listing = AppliedMigrations::default();
        for item in self.tree.scan_prefix(KEY_PREFIX.as_bytes()) {
            let (_, bytes) = item.map_err(storage)?;
            let record = StoredRecord::from_bytes(&bytes)?;
            listing.record(&record.migration, record.created, record.step);
            if record.kind == KIND_PERMANENT {
                listing.watermark = Some(
                    listing
                        .watermark
                        .map_or(record.created, |w| w.max(record.created)),
                );
            }
        }
        Ok(listing)
    }

    fn apply_step(
        &mut self,
        step: &ApplyStep<'_>,
    ) -> Result<Option<serde_json::Value>, HandlerError> {
        match step.kind {
            KIND_SCRIPT => step.executor.run_fresh(
                step.migration,
                step.step,
                step.code,
                step.args,
                step.signature,
            ),
            other => Err(HandlerError::UnsupportedKind {
                kind: other.to_string(),
            }),
        }
    }

    fn finalize_apply(&mut self, finalize: &FinalizeApply<'_>) -> Result<(), HandlerError> {
        let mut batch = sled::Batch::default();
        for record in finalize.records {
            let stored = StoredRecord {
                migration: record.migration.clone(),
                step: record.step,
                kind: record.kind.clone(),
                created: finalize.created,
                applied: finalize.applied,
                args: record.args.clone(),
                code: record.code.clone(),
                signature: record.signature.clone(),
            };
            batch.insert(record_key(&record.migration, record.step), stored.to_bytes()?);
        }
        self.tree.apply_batch(batch).map_err(storage)?;

        tracing::debug!(migration = %finalize.migration, records = finalize.records.len(), "batch written");
        self.report(&format!(
            "stored {} record(s) for \"{}\"",
            finalize.records.len(),
            finalize.migration
        ));
        Ok(())
    }

    fn rollback_step(&mut self, step: &RollbackStep<'_>) -> Result<(), HandlerError> {
        if let Some(record) = step.record {
            // Compensating rollback: nothing was persisted yet.
            if record.kind != KIND_SCRIPT {
                return Err(HandlerError::UnsupportedKind {
                    kind: record.kind.clone(),
                });
            }
            step.executor.run_stored(record)?;
            return Ok(());
        }

        let Some(stored) = self.stored_record(step.migration, step.step)? else {
            return Ok(());
        };
        if stored.kind != KIND_SCRIPT {
            return Err(HandlerError::UnsupportedKind { kind: stored.kind });
        }
        // A failed verification leaves the record in place.
        step.executor.run_stored(&stored.into_rollback())?;
        self.tree
            .remove(record_key(step.migration, step.step))
            .map_err(storage)?;
        Ok(())
    }

    fn finalize_rollback(&mut self, migration: &str) -> Result<(), HandlerError> {
        self.tree.remove(record_key(migration, 0)).map_err(storage)?;
        self.report(&format!("dropped record for \"{migration}\""));
        Ok(())
    }
}
