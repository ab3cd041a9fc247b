//! File-based ledger backend for migsync.
//!
//! Persists one signed record file per applied step under a
//! `.migrations/` directory inside the configured storage path. Record
//! files carry `key: value` header lines (newlines escaped as `[LF]` /
//! `[CR]`), a blank separator line, and the raw script body. Only
//! `script` steps execute on this backend; everything it stores is
//! signature-checked before a rollback script runs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use migsync_core::{
    AppliedMigrations, ApplyStep, FinalizeApply, HandlerError, MigrationHandler, RollbackRecord,
    RollbackStep, SharedSink, KIND_SCRIPT,
};

/// Service name this handler answers for unless overridden.
pub const DEFAULT_SERVICE: &str = "migsync.files-storage";

/// Directory holding record files, inside the storage path.
const MIGRATION_FOLDER: &str = ".migrations";

/// Record kind marking a permanent-baseline entry.
const KIND_PERMANENT: &str = "permanent";

const KEY_NAME: &str = "name";
const KEY_STEP: &str = "step";
const KEY_TYPE: &str = "type";
const KEY_CREATED: &str = "created_at";
const KEY_APPLIED: &str = "applied_at";
const KEY_ARGUMENTS: &str = "arguments";
const KEY_SIGNATURE: &str = "signature";

/// Storage backend keeping applied-migration records as plain files.
pub struct FilesHandler {
    service_name: String,
    storage_path: PathBuf,
    sink: Option<SharedSink>,
}

impl FilesHandler {
    /// Create a handler storing records under `storage_path`.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            service_name: DEFAULT_SERVICE.to_string(),
            storage_path: storage_path.into(),
            sink: None,
        }
    }

    /// Answer for a different service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// The configured storage path.
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn migrations_path(&self) -> PathBuf {
        self.storage_path.join(MIGRATION_FOLDER)
    }

    /// Record file path: a digest of the sanitized `migration.step` name,
    /// so arbitrary migration names stay filesystem-safe.
    fn record_path(&self, migration: &str, step: u32) -> PathBuf {
        let sanitized: String = migration
            .replace(':', ".")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(format!("{sanitized}.{step}").as_bytes());
        self.migrations_path().join(hex::encode(hasher.finalize()))
    }

    fn report(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.lock().line(message);
        }
    }

    fn check_storage(&self) -> Result<(), HandlerError> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(HandlerError::Unavailable(
                "storage path is empty".to_string(),
            ));
        }
        if !self.storage_path.is_dir() {
            return Err(HandlerError::Unavailable(format!(
                "storage path \"{}\" is not a directory",
                self.storage_path.display()
            )));
        }
        Ok(())
    }

    fn write_record_file(
        &self,
        path: &Path,
        record: &RollbackRecord,
        created: i64,
        applied: i64,
    ) -> io::Result<()> {
        let mut text = String::new();
        push_header(&mut text, KEY_NAME, &record.migration);
        push_header(&mut text, KEY_STEP, &record.step.to_string());
        push_header(&mut text, KEY_TYPE, &record.kind);
        push_header(&mut text, KEY_CREATED, &migsync_core::format_unix(created));
        push_header(&mut text, KEY_APPLIED, &migsync_core::format_unix(applied));
        if let Some(args) = &record.args {
            push_header(&mut text, KEY_ARGUMENTS, args);
        }
        push_header(&mut text, KEY_SIGNATURE, &record.signature);
        text.push('\n');
        text.push_str(record.code.trim());

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        let mut file = options.open(path)?;
        io::Write::write_all(&mut file, text.as_bytes())
    }

    fn read_record_file(path: &Path) -> io::Result<(BTreeMap<String, String>, String)> {
        let text = fs::read_to_string(path)?;
        let mut headers = BTreeMap::new();
        let mut script = String::new();
        let mut lines = text.lines();
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_string(), unescape(value.trim()));
            }
        }
        let rest: Vec<&str> = lines.collect();
        if !rest.is_empty() {
            script = rest.join("\n");
        }
        Ok((headers, script))
    }

    fn stored_record(&self, migration: &str, step: u32) -> Result<Option<RollbackRecord>, HandlerError> {
        let path = self.record_path(migration, step);
        if !path.is_file() {
            return Ok(None);
        }
        let (headers, script) = Self::read_record_file(&path)?;
        Ok(Some(RollbackRecord {
            migration: migration.to_string(),
            step,
            kind: headers.get(KEY_TYPE).cloned().unwrap_or_default(),
            args: headers.get(KEY_ARGUMENTS).cloned(),
            code: script,
            signature: headers.get(KEY_SIGNATURE).cloned().unwrap_or_default(),
        }))
    }
}

fn push_header(text: &mut String, key: &str, value: &str) {
    text.push_str(key);
    text.push_str(": ");
    text.push_str(&value.replace('\r', "[CR]").replace('\n', "[LF]"));
    text.push('\n');
}

fn unescape(value: &str) -> String {
    value.replace("[LF]", "\n").replace("[CR]", "\r")
}

impl MigrationHandler for FilesHandler {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn on_init(&mut self, sink: SharedSink) -> Result<(), HandlerError> {
        self.sink = Some(sink);
        Ok(())
    }

    fn on_free(&mut self) {
        self.sink = None;
    }

    fn list_applied(&mut self) -> Result<AppliedMigrations, HandlerError> {
        self.check_storage()?;

        let mut listing = AppliedMigrations::default();
        let dir = self.migrations_path();
        if !dir.is_dir() {
            return Ok(listing);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok((headers, _)) = Self::read_record_file(&entry.path()) else {
                continue;
            };
            let (Some(name), Some(created), Some(step)) = (
                headers.get(KEY_NAME),
                headers.get(KEY_CREATED).and_then(|v| migsync_core::parse_created(v)),
                headers.get(KEY_STEP).and_then(|v| v.parse::<u32>().ok()),
            ) else {
                continue;
            };
            listing.record(name, created, step);
            if headers.get(KEY_TYPE).map(String::as_str) == Some(KIND_PERMANENT) {
                listing.watermark = Some(listing.watermark.map_or(created, |w| w.max(created)));
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
        fs::create_dir_all(self.migrations_path())?;

        let mut written = Vec::new();
        for record in finalize.records {
            let path = self.record_path(&record.migration, record.step);
            if let Err(error) =
                self.write_record_file(&path, record, finalize.created, finalize.applied)
            {
                // No transaction to lean on: undo the files written so far.
                for path in &written {
                    let _ = fs::remove_file(path);
                }
                return Err(HandlerError::Storage(format!(
                    "cannot write record for \"{}\" step {}: {error}",
                    record.migration, record.step
                )));
            }
            written.push(path);
        }

        tracing::debug!(migration = %finalize.migration, records = finalize.records.len(), "records written");
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

        let Some(record) = self.stored_record(step.migration, step.step)? else {
            return Ok(());
        };
        if record.kind != KIND_SCRIPT {
            return Err(HandlerError::UnsupportedKind {
                kind: record.kind.clone(),
            });
        }
        // A failed verification leaves the record file in place.
        step.executor.run_stored(&record)?;
        fs::remove_file(self.record_path(step.migration, step.step))?;
        Ok(())
    }

    fn finalize_rollback(&mut self, migration: &str) -> Result<(), HandlerError> {
        let path = self.record_path(migration, 0);
        if path.is_file() {
            fs::remove_file(path)?;
        }
        self.report(&format!("dropped record for \"{migration}\""));
        Ok(())
    }
}
