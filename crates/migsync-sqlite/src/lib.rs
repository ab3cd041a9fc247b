//! SQLite storage backend for migsync.
//!
//! Records applied migrations in a dedicated table, one row per step,
//! with the definition body as row `:0`. Executes `sql` step bodies and
//! `csv` bulk imports (with chained-insert-id placeholders) inside
//! transactions; `script` steps go through the engine's executor. Stored
//! rollback scripts are signature-verified before they run, and a failed
//! verification leaves the row in place.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection};

use migsync_core::{
    parse_csv, AppliedMigrations, ApplyStep, CellValue, FinalizeApply, HandlerError, IdStack,
    MigrationHandler, RollbackRecord, RollbackStep, SharedSink, KIND_CSV, KIND_SCRIPT, KIND_SQL,
};

/// Service name this handler answers for unless overridden.
pub const DEFAULT_SERVICE: &str = "migsync.sqlite";

/// Migrations table created on first finalize.
pub const DEFAULT_TABLE: &str = "z_migsync_migrations";

/// Record kind marking a permanent-baseline entry.
const KIND_PERMANENT: &str = "permanent";

/// Storage backend keeping applied-migration records in SQLite.
pub struct SqliteHandler {
    service_name: String,
    table: String,
    conn: Connection,
    id_stack: IdStack,
    sink: Option<SharedSink>,
}

impl SqliteHandler {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HandlerError> {
        let conn = Connection::open(path).map_err(storage)?;
        Ok(Self::with_connection(conn))
    }

    /// Open an in-memory database (used by tests and dry runs).
    pub fn open_in_memory() -> Result<Self, HandlerError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Ok(Self::with_connection(conn))
    }

    /// Wrap an existing connection.
    pub fn with_connection(conn: Connection) -> Self {
        Self {
            service_name: DEFAULT_SERVICE.to_string(),
            table: DEFAULT_TABLE.to_string(),
            conn,
            id_stack: IdStack::new(),
            sink: None,
        }
    }

    /// Answer for a different service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Use a different migrations table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    fn report(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.lock().line(message);
        }
    }

    fn table_exists(&self) -> Result<bool, HandlerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .map_err(storage)?;
        stmt.exists(params![self.table]).map_err(storage)
    }

    fn ensure_table(&self) -> Result<(), HandlerError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                created TEXT NOT NULL,
                applied TEXT NOT NULL,
                script TEXT,
                options TEXT,
                signature TEXT NOT NULL
            )",
            self.table
        );
        self.conn.execute_batch(&sql).map_err(storage)
    }

    fn stored_record(
        &self,
        migration: &str,
        step: u32,
    ) -> Result<Option<RollbackRecord>, HandlerError> {
        if !self.table_exists()? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT type, options, script, signature FROM {} WHERE name = ?1",
            self.table
        );
        let mut stmt = self.conn.prepare(&sql).map_err(storage)?;
        let mut rows = stmt
            .query_map(params![format!("{migration}:{step}")], |row| {
                Ok(RollbackRecord {
                    migration: migration.to_string(),
                    step,
                    kind: row.get(0)?,
                    args: row.get(1)?,
                    code: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    signature: row.get(3)?,
                })
            })
            .map_err(storage)?;
        rows.next().transpose().map_err(storage)
    }

    fn delete_record(&self, migration: &str, step: u32) -> Result<(), HandlerError> {
        if !self.table_exists()? {
            return Ok(());
        }
        let sql = format!("DELETE FROM {} WHERE name = ?1", self.table);
        self.conn
            .execute(&sql, params![format!("{migration}:{step}")])
            .map_err(storage)?;
        Ok(())
    }

    fn execute_sql(&mut self, code: &str) -> Result<(), HandlerError> {
        let tx = self.conn.transaction().map_err(storage)?;
        tx.execute_batch(code).map_err(storage)?;
        tx.commit().map_err(storage)
    }

    /// Import an embedded CSV body, resolving `$`-placeholders against the
    /// id stack. Returns the target table followed by the generated ids.
    fn import_csv(&mut self, step: &ApplyStep<'_>) -> Result<serde_json::Value, HandlerError> {
        let table = step
            .args
            .get("table")
            .ok_or_else(|| HandlerError::Storage("csv step requires a table argument".to_string()))?
            .clone();
        check_identifier(&table)?;
        let parsed = parse_csv(step.code).map_err(HandlerError::Storage)?;
        for column in &parsed.columns {
            check_identifier(column)?;
        }

        let placeholders: Vec<String> = (1..=parsed.columns.len())
            .map(|i| format!("?{i}"))
            .collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            parsed.columns.join(", "),
            placeholders.join(", ")
        );

        let mut ids: Vec<Option<i64>> = Vec::new();
        let mut skipped = 0usize;
        let tx = self.conn.transaction().map_err(storage)?;
        {
            let mut stmt = tx.prepare(&sql).map_err(storage)?;
            'records: for record in &parsed.records {
                let mut values: Vec<rusqlite::types::Value> = Vec::new();
                for index in 0..parsed.columns.len() {
                    let cell = record.get(index).map_or("", String::as_str);
                    match self.id_stack.resolve(cell) {
                        CellValue::Literal(text) => {
                            values.push(rusqlite::types::Value::Text(text.to_string()));
                        }
                        CellValue::Id(id) => values.push(rusqlite::types::Value::Integer(id)),
                        CellValue::Missing => {
                            skipped += 1;
                            continue 'records;
                        }
                    }
                }
                stmt.execute(params_from_iter(values)).map_err(storage)?;
                ids.push(Some(tx.last_insert_rowid()));
            }
        }
        tx.commit().map_err(storage)?;

        if skipped > 0 {
            self.report(&format!("skipped {skipped} record(s) with unresolved ids"));
        }
        let mut results = vec![serde_json::Value::String(table)];
        results.extend(
            ids.iter()
                .flatten()
                .map(|id| serde_json::Value::from(*id)),
        );
        self.id_stack.push_frame(ids);
        Ok(serde_json::Value::Array(results))
    }
}

fn storage(error: rusqlite::Error) -> HandlerError {
    HandlerError::Storage(error.to_string())
}

/// Table and column names interpolate into SQL text; keep them to plain
/// identifiers.
fn check_identifier(name: &str) -> Result<(), HandlerError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(HandlerError::Storage(format!(
            "invalid identifier \"{name}\""
        )))
    }
}

impl MigrationHandler for SqliteHandler {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn on_init(&mut self, sink: SharedSink) -> Result<(), HandlerError> {
        self.sink = Some(sink);
        self.id_stack.clear();
        Ok(())
    }

    fn on_free(&mut self) {
        self.sink = None;
        self.id_stack.clear();
    }

    fn list_applied(&mut self) -> Result<AppliedMigrations, HandlerError> {
        let mut listing = AppliedMigrations::default();
        if !self.table_exists()? {
            return Ok(listing);
        }

        let sql = format!("SELECT name, type, created FROM {}", self.table);
        let mut stmt = self.conn.prepare(&sql).map_err(storage)?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(storage)?;

        for row in rows {
            let (name, kind, created) = row.map_err(storage)?;
            let Some((migration, step)) = name.rsplit_once(':') else {
                continue;
            };
            let (Some(created), Ok(step)) =
                (migsync_core::parse_created(&created), step.parse::<u32>())
            else {
                continue;
            };
            listing.record(migration, created, step);
            if kind == KIND_PERMANENT {
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
            KIND_SQL => {
                self.execute_sql(step.code)?;
                Ok(None)
            }
            KIND_CSV => Ok(Some(self.import_csv(step)?)),
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
        self.ensure_table()?;

        let result = (|| {
            let sql = format!(
                "INSERT INTO {} (name, type, created, applied, script, options, signature)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                self.table
            );
            let tx = self.conn.transaction().map_err(storage)?;
            {
                let mut stmt = tx.prepare(&sql).map_err(storage)?;
                for record in finalize.records {
                    stmt.execute(params![
                        format!("{}:{}", record.migration, record.step),
                        record.kind,
                        migsync_core::format_unix(finalize.created),
                        migsync_core::format_unix(finalize.applied),
                        record.code,
                        record.args,
                        record.signature,
                    ])
                    .map_err(storage)?;
                }
            }
            tx.commit().map_err(storage)
        })();

        self.id_stack.clear();
        if result.is_ok() {
            tracing::debug!(migration = %finalize.migration, records = finalize.records.len(), "rows written");
            self.report(&format!(
                "stored {} row(s) for \"{}\"",
                finalize.records.len(),
                finalize.migration
            ));
        }
        result
    }

    fn rollback_step(&mut self, step: &RollbackStep<'_>) -> Result<(), HandlerError> {
        if let Some(record) = step.record {
            // Compensating rollback: the bundle was never finalized.
            match record.kind.as_str() {
                KIND_SQL => {
                    step.executor.verify_record(record)?;
                    self.execute_sql(&record.code)
                }
                KIND_SCRIPT => step.executor.run_stored(record).map(|_| ()),
                other => Err(HandlerError::UnsupportedKind {
                    kind: other.to_string(),
                }),
            }
        } else {
            let Some(record) = self.stored_record(step.migration, step.step)? else {
                return Ok(());
            };
            // A failed verification leaves the row in place.
            match record.kind.as_str() {
                KIND_SQL => {
                    step.executor.verify_record(&record)?;
                    self.execute_sql(&record.code)?;
                }
                KIND_SCRIPT => {
                    step.executor.run_stored(&record)?;
                }
                other => {
                    return Err(HandlerError::UnsupportedKind {
                        kind: other.to_string(),
                    });
                }
            }
            self.delete_record(step.migration, step.step)
        }
    }

    fn finalize_rollback(&mut self, migration: &str) -> Result<(), HandlerError> {
        self.delete_record(migration, 0)?;
        self.report(&format!("dropped row for \"{migration}\""));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use migsync_core::{ScriptExecutor, Signer};

    fn executor(signer: &Signer) -> ScriptExecutor<'_> {
        ScriptExecutor::new(signer, None)
    }

    fn apply<'a>(
        migration: &'a str,
        step: u32,
        kind: &'a str,
        code: &'a str,
        args: &'a BTreeMap<String, String>,
        signature: &'a str,
        exec: &'a ScriptExecutor<'a>,
    ) -> ApplyStep<'a> {
        ApplyStep {
            migration,
            step,
            kind,
            code,
            args,
            created: 1_577_836_800,
            signature,
            executor: exec,
        }
    }

    fn signed_sql_record(signer: &Signer, migration: &str, step: u32, code: &str) -> RollbackRecord {
        let mut record = RollbackRecord {
            migration: migration.to_string(),
            step,
            kind: KIND_SQL.to_string(),
            args: None,
            code: code.to_string(),
            signature: String::new(),
        };
        record.signature = signer.sign_record(&record);
        record
    }

    fn finalize<'a>(migration: &'a str, records: &'a [RollbackRecord]) -> FinalizeApply<'a> {
        FinalizeApply {
            migration,
            created: 1_577_836_800,
            applied: 1_600_000_000,
            records,
        }
    }

    fn count(handler: &SqliteHandler, sql: &str) -> i64 {
        handler
            .conn
            .query_row(sql, params![], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_sql_step_executes_in_transaction() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        let args = BTreeMap::new();

        handler
            .apply_step(&apply(
                "app:001",
                1,
                KIND_SQL,
                "CREATE TABLE t (id INTEGER PRIMARY KEY, label TEXT);
                 INSERT INTO t (label) VALUES ('a');",
                &args,
                "",
                &exec,
            ))
            .unwrap();
        assert_eq!(count(&handler, "SELECT COUNT(*) FROM t"), 1);
    }

    #[test]
    fn test_finalize_then_list_roundtrip() {
        let signer = Signer::new("key");
        let mut handler = SqliteHandler::open_in_memory().unwrap();

        let records = vec![
            signed_sql_record(&signer, "app:001", 0, "[migration]"),
            signed_sql_record(&signer, "app:001", 1, "DROP TABLE t"),
            signed_sql_record(&signer, "app:001", 2, "DROP TABLE u"),
        ];
        handler.finalize_apply(&finalize("app:001", &records)).unwrap();

        let listing = handler.list_applied().unwrap();
        let entry = &listing.entries["app:001"];
        assert_eq!(entry.created, 1_577_836_800);
        assert_eq!(entry.steps.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_empty_database_lists_nothing() {
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        let listing = handler.list_applied().unwrap();
        assert!(listing.entries.is_empty());
        assert!(listing.watermark.is_none());
    }

    #[test]
    fn test_rollback_executes_stored_sql_and_deletes_row() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        handler.execute_sql("CREATE TABLE t (id INTEGER)").unwrap();

        let records = vec![
            signed_sql_record(&signer, "app:001", 0, "[migration]"),
            signed_sql_record(&signer, "app:001", 1, "DROP TABLE t"),
        ];
        handler.finalize_apply(&finalize("app:001", &records)).unwrap();

        handler
            .rollback_step(&RollbackStep {
                migration: "app:001",
                step: 1,
                record: None,
                executor: &exec,
            })
            .unwrap();

        // The table is gone and so is the step row.
        assert_eq!(
            count(
                &handler,
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'"
            ),
            0
        );
        let listing = handler.list_applied().unwrap();
        assert!(listing.entries["app:001"].steps.is_empty());

        handler.finalize_rollback("app:001").unwrap();
        assert!(handler.list_applied().unwrap().entries.is_empty());
    }

    #[test]
    fn test_tampered_row_fails_and_survives() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();

        let records = vec![signed_sql_record(&signer, "app:001", 1, "DROP TABLE t")];
        handler.finalize_apply(&finalize("app:001", &records)).unwrap();
        handler
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET script = 'DROP TABLE users' WHERE name = 'app:001:1'",
                    DEFAULT_TABLE
                ),
                params![],
            )
            .unwrap();

        let result = handler.rollback_step(&RollbackStep {
            migration: "app:001",
            step: 1,
            record: None,
            executor: &exec,
        });
        assert!(matches!(
            result,
            Err(HandlerError::SignatureMismatch { step: 1, .. })
        ));
        // The row is kept as evidence.
        assert_eq!(
            count(
                &handler,
                &format!("SELECT COUNT(*) FROM {DEFAULT_TABLE} WHERE name = 'app:001:1'")
            ),
            1
        );
    }

    #[test]
    fn test_compensating_rollback_uses_memory_record() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        handler.execute_sql("CREATE TABLE t (id INTEGER)").unwrap();

        let record = signed_sql_record(&signer, "app:001", 1, "DROP TABLE t");
        handler
            .rollback_step(&RollbackStep {
                migration: "app:001",
                step: 1,
                record: Some(&record),
                executor: &exec,
            })
            .unwrap();
        assert_eq!(
            count(
                &handler,
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'"
            ),
            0
        );
    }

    #[test]
    fn test_csv_import_chains_generated_ids() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        handler
            .execute_sql(
                "CREATE TABLE parents (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE children (id INTEGER PRIMARY KEY, parent_id INTEGER, name TEXT);",
            )
            .unwrap();

        let mut parent_args = BTreeMap::new();
        parent_args.insert("table".to_string(), "parents".to_string());
        let result = handler
            .apply_step(&apply(
                "app:001",
                1,
                KIND_CSV,
                "name\nalpha\nbeta\n",
                &parent_args,
                "",
                &exec,
            ))
            .unwrap()
            .unwrap();
        let results = result.as_array().unwrap();
        assert_eq!(results[0], serde_json::json!("parents"));
        assert_eq!(results.len(), 3);

        let mut child_args = BTreeMap::new();
        child_args.insert("table".to_string(), "children".to_string());
        handler
            .apply_step(&apply(
                "app:001",
                2,
                KIND_CSV,
                "parent_id, name\n$1, first-child\n$2, second-child\n$9, orphan\n",
                &child_args,
                "",
                &exec,
            ))
            .unwrap();

        // The orphan referenced a missing id and was skipped.
        assert_eq!(count(&handler, "SELECT COUNT(*) FROM children"), 2);
        let linked: i64 = handler
            .conn
            .query_row(
                "SELECT COUNT(*) FROM children c JOIN parents p ON c.parent_id = p.id",
                params![],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(linked, 2);
    }

    #[test]
    fn test_csv_requires_table_argument() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        let args = BTreeMap::new();

        let result = handler.apply_step(&apply("app:001", 1, KIND_CSV, "a\n1\n", &args, "", &exec));
        assert!(matches!(result, Err(HandlerError::Storage(_))));
    }

    #[test]
    fn test_finalize_is_atomic() {
        let signer = Signer::new("key");
        let mut handler = SqliteHandler::open_in_memory().unwrap();

        // Duplicate row names make the second insert fail; nothing may
        // survive from the first.
        let records = vec![
            signed_sql_record(&signer, "app:001", 1, "DROP TABLE a"),
            signed_sql_record(&signer, "app:001", 1, "DROP TABLE b"),
        ];
        let result = handler.finalize_apply(&finalize("app:001", &records));
        assert!(result.is_err());
        assert_eq!(
            count(&handler, &format!("SELECT COUNT(*) FROM {DEFAULT_TABLE}")),
            0
        );
    }

    #[test]
    fn test_permanent_row_sets_watermark() {
        let signer = Signer::new("key");
        let mut handler = SqliteHandler::open_in_memory().unwrap();

        let mut record = signed_sql_record(&signer, "app:base", 0, "");
        record.kind = KIND_PERMANENT.to_string();
        record.signature = signer.sign_record(&record);
        let records = vec![record];
        handler.finalize_apply(&finalize("app:base", &records)).unwrap();

        let listing = handler.list_applied().unwrap();
        assert_eq!(listing.watermark, Some(1_577_836_800));
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        let signer = Signer::new("key");
        let exec = executor(&signer);
        let mut handler = SqliteHandler::open_in_memory().unwrap();
        let args = BTreeMap::new();

        let result = handler.apply_step(&apply("app:001", 1, "lua", "x()", &args, "", &exec));
        assert!(matches!(result, Err(HandlerError::UnsupportedKind { .. })));
    }
}
