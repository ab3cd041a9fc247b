//! The reconciliation runner.
//!
//! Drives one run end to end: discovery, desired/actual diff, rollback
//! execution, apply execution with compensating rollback on failure, and
//! observer notification at every state transition. Single-threaded by
//! contract; callers serialize concurrent invocations externally.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::{self, Catalog, ModuleMap};
use crate::diff::{PlannedMigration, SyncPlan};
use crate::error::Error;
use crate::handler::{
    AppliedMigrations, ApplyStep, FinalizeApply, MigrationHandler, NullSink, RollbackRecord,
    RollbackStep, SharedSink, KIND_DEFINITION, KIND_SCRIPT,
};
use crate::observer::{Notification, RunObserver, RunState};
use crate::script::{check_syntax, ScriptExecutor, ScriptHook};
use crate::signature::Signer;
use crate::stats::RunStats;
use crate::time::MonotonicClock;

/// Execution modes sharing the run pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Status,
    Migrate,
}

/// Per-service rollback bundle assembled while applying one migration.
type Bundle = BTreeMap<String, BTreeMap<u32, RollbackRecord>>;

/// Synchronizes migration definitions with every registered backend.
pub struct MigrationRunner {
    project_root: PathBuf,
    environment: String,
    signer: Signer,
    handlers: BTreeMap<String, Box<dyn MigrationHandler>>,
    observers: Vec<Box<dyn RunObserver>>,
    hook: Option<Box<dyn ScriptHook>>,
    sink: SharedSink,
    break_requested: Arc<AtomicBool>,
    state: RunState,
    stats: RunStats,
    current: Option<String>,
    clock: MonotonicClock,
}

impl MigrationRunner {
    /// Create a runner for a project root and validation key.
    pub fn new(project_root: impl Into<PathBuf>, validation_key: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            environment: catalog::DEFAULT_ENVIRONMENT.to_string(),
            signer: Signer::new(validation_key),
            handlers: BTreeMap::new(),
            observers: Vec::new(),
            hook: None,
            sink: Arc::new(Mutex::new(NullSink)),
            break_requested: Arc::new(AtomicBool::new(false)),
            state: RunState::Initialized,
            stats: RunStats::default(),
            current: None,
            clock: MonotonicClock::new(),
        }
    }

    /// Set the environment string filters match against.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the progress sink handed to handlers at run start.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Register the hook that executes `script` steps.
    pub fn with_script_hook(mut self, hook: Box<dyn ScriptHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Register a storage backend under its service name.
    pub fn register_handler(&mut self, handler: Box<dyn MigrationHandler>) {
        let service = handler.service_name().to_string();
        self.handlers.insert(service, handler);
    }

    /// Attach an observer; notified synchronously on every transition.
    pub fn attach(&mut self, observer: Box<dyn RunObserver>) {
        self.observers.push(observer);
    }

    /// Flag checked between migrations for cooperative interruption.
    pub fn break_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.break_requested)
    }

    /// Current state of the run state machine.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Counters of the most recent run.
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// The configured environment string.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Read-only run: discovery, diff, and notification, no mutation.
    pub fn status(&mut self) -> RunStats {
        self.execute(RunMode::Status)
    }

    /// Full reconciliation run: rollback then apply.
    pub fn migrate(&mut self) -> RunStats {
        self.execute(RunMode::Migrate)
    }

    /// Scaffold a new definition file at the project root (or `directory`).
    ///
    /// Fails if any discovered module already has a definition with this
    /// base name.
    pub fn create(
        &mut self,
        name: &str,
        service: Option<&str>,
        directory: Option<&Path>,
    ) -> Result<PathBuf, Error> {
        let catalog = self.catalog();
        let modules = catalog.discover()?;
        let taken = modules
            .definitions()
            .into_iter()
            .any(|(existing, _)| existing.split(':').nth(1) == Some(name));
        if taken {
            return Err(Error::DefinitionExists {
                name: name.to_string(),
            });
        }
        let directory = directory.unwrap_or(&self.project_root).to_path_buf();
        catalog.create(&directory, name, service)
    }

    fn catalog(&self) -> Catalog {
        Catalog::new(&self.project_root)
            .with_environment(&self.environment)
            .with_services(self.handlers.keys().cloned())
    }

    fn execute(&mut self, mode: RunMode) -> RunStats {
        self.stats.reset();
        self.current = None;
        self.break_requested.store(false, Ordering::SeqCst);

        let sink = Arc::clone(&self.sink);
        let mut init_errors = Vec::new();
        for (service, handler) in &mut self.handlers {
            if let Err(error) = handler.on_init(Arc::clone(&sink)) {
                init_errors.push(Error::from_handler(service, error));
            }
        }
        for error in &init_errors {
            self.notify_error(error);
        }

        match self.run_pipeline(mode) {
            Ok(()) => self.set_state(RunState::Complete),
            Err(Error::Interrupted) => self.set_state(RunState::Break),
            Err(error) => {
                self.notify_error(&error);
                self.set_state(RunState::Complete);
            }
        }

        for handler in self.handlers.values_mut() {
            handler.on_free();
        }
        self.current = None;
        self.state = RunState::Initialized;
        self.stats
    }

    fn run_pipeline(&mut self, mode: RunMode) -> Result<(), Error> {
        self.set_state(RunState::Fired);

        let catalog = self.catalog();
        let modules = catalog.discover()?;
        let (desired, parse_errors) = catalog.parse(&modules);
        self.stats.total = desired.total;
        for error in &parse_errors {
            self.notify_error(error);
        }
        self.set_state(RunState::FindMigrations);

        let mut actual = BTreeMap::new();
        let services: Vec<String> = desired.services.keys().cloned().collect();
        for service in services {
            match self.dispatch_list(&service) {
                Ok(listing) => match validate_listing(&service, listing, &modules) {
                    Ok(filtered) => {
                        actual.insert(service, filtered);
                    }
                    Err(error) => self.notify_error(&error),
                },
                Err(error) => self.notify_error(&error),
            }
        }

        let plan = SyncPlan::compute(&desired, &actual);
        self.stats.for_rollback = plan.rollback.len() as u32;
        self.stats.for_commit = plan.apply.len() as u32;
        self.set_state(RunState::MigrationsAsked);

        match mode {
            RunMode::Status => {
                for name in &plan.satisfied {
                    self.current = Some(name.clone());
                    self.set_state(RunState::MigrationStored);
                }
                for migration in &plan.rollback {
                    self.current = Some(migration.name.clone());
                    self.set_state(RunState::MigrationRollback);
                }
                for migration in &plan.apply {
                    self.current = Some(migration.name.clone());
                    self.set_state(RunState::MigrationApply);
                }
            }
            RunMode::Migrate => {
                // Errors in discovery or diff abort mutation; the run
                // still completes and reports.
                if self.stats.errors == 0 {
                    self.run_rollback(&plan.rollback, None)?;
                    self.run_apply(&plan.apply, &modules)?;
                }
            }
        }
        self.current = None;
        Ok(())
    }

    fn run_rollback(
        &mut self,
        migrations: &[PlannedMigration],
        bundle: Option<&Bundle>,
    ) -> Result<(), Error> {
        for migration in migrations {
            self.check_break()?;
            self.current = Some(migration.name.clone());
            self.set_state(RunState::MigrationRollback);
            let mut failed = false;

            for (step, service) in &migration.steps {
                let record = bundle
                    .and_then(|b| b.get(service))
                    .and_then(|records| records.get(step));
                if let Err(error) =
                    self.dispatch_rollback_step(service, &migration.name, *step, record)
                {
                    failed = true;
                    self.notify_error(&error);
                }
            }

            for service in &migration.services {
                if let Err(error) = self.dispatch_finalize_rollback(service, &migration.name) {
                    failed = true;
                    self.notify_error(&error);
                }
            }

            if !failed {
                self.stats.rejected += 1;
                tracing::info!(migration = %migration.name, "rolled back");
            }
        }
        Ok(())
    }

    fn run_apply(
        &mut self,
        migrations: &[PlannedMigration],
        modules: &ModuleMap,
    ) -> Result<(), Error> {
        for migration in migrations {
            self.check_break()?;
            self.current = Some(migration.name.clone());
            self.set_state(RunState::MigrationApply);

            // Re-read the definition fresh: content may have changed since
            // discovery.
            let resolved = match modules
                .definition_path(&migration.name)
                .ok_or_else(|| Error::MalformedDefinition {
                    name: migration.name.clone(),
                    section: catalog::definition::SECTION_MIGRATION.to_string(),
                })
                .and_then(|path| catalog::resolve_actions(&migration.name, path))
            {
                Ok(resolved) => resolved,
                Err(error) => {
                    self.notify_error(&error);
                    return Ok(());
                }
            };

            let mut failed = false;
            let mut any_ran = false;
            let mut compensation_steps: Vec<(u32, String)> = Vec::new();
            let mut bundle: Bundle = BTreeMap::new();

            for (step, service) in &migration.steps {
                let Some(action) = resolved.apply.get(step) else {
                    self.notify_error(&Error::MalformedDefinition {
                        name: migration.name.clone(),
                        section: catalog::definition::SECTION_ACTIONS.to_string(),
                    });
                    failed = true;
                    break;
                };

                if action.kind == KIND_SCRIPT {
                    if let Err(detail) = check_syntax(&action.code) {
                        self.notify_error(&Error::ScriptSyntax {
                            name: migration.name.clone(),
                            step: *step,
                            detail,
                        });
                        failed = true;
                        break;
                    }
                }

                let signature = self.signer.sign(&action.code);
                match self.dispatch_apply_step(
                    service,
                    &migration.name,
                    *step,
                    action,
                    resolved.created,
                    &signature,
                ) {
                    Ok(result) => {
                        any_ran = true;
                        if let Some(script) =
                            resolved.rollback.get(service).and_then(|m| m.get(step))
                        {
                            let args = result.map(|value| value.to_string());
                            let mut record = RollbackRecord {
                                migration: migration.name.clone(),
                                step: *step,
                                kind: script.kind.clone(),
                                args,
                                code: script.code.trim().to_string(),
                                signature: String::new(),
                            };
                            record.signature = self.signer.sign_record(&record);
                            bundle
                                .entry(service.clone())
                                .or_default()
                                .insert(*step, record);
                            compensation_steps.push((*step, service.clone()));
                        }
                    }
                    Err(error) => {
                        self.notify_error(&error);
                        failed = true;
                        break;
                    }
                }
            }

            if !failed {
                for service in &migration.services {
                    let applied = self.clock.next();
                    let mut records = Vec::new();
                    let mut definition_record = RollbackRecord {
                        migration: migration.name.clone(),
                        step: 0,
                        kind: KIND_DEFINITION.to_string(),
                        args: None,
                        code: resolved.body.clone(),
                        signature: String::new(),
                    };
                    definition_record.signature = self.signer.sign(&resolved.body);
                    records.push(definition_record);
                    if let Some(service_bundle) = bundle.get(service) {
                        records.extend(service_bundle.values().cloned());
                    }

                    let finalize = FinalizeApply {
                        migration: &migration.name,
                        created: resolved.created,
                        applied,
                        records: &records,
                    };
                    if let Err(error) = self.dispatch_finalize_apply(service, &finalize) {
                        failed = true;
                        self.notify_error(&error);
                    }
                }
            }

            if failed {
                let services: BTreeSet<String> =
                    migration.steps.iter().map(|(_, s)| s.clone()).collect();
                let compensation = PlannedMigration {
                    name: migration.name.clone(),
                    time: migration.time,
                    steps: compensation_steps.into_iter().rev().collect(),
                    services: services.into_iter().collect(),
                };
                tracing::warn!(migration = %migration.name, "apply failed, compensating");
                self.run_rollback(&[compensation], Some(&bundle))?;
                // No best-effort continuation: later migrations may depend
                // on this one's side effects.
                return Ok(());
            } else if any_ran {
                self.stats.applied += 1;
                tracing::info!(migration = %migration.name, "applied");
            }
        }
        Ok(())
    }

    fn dispatch_list(&mut self, service: &str) -> Result<AppliedMigrations, Error> {
        match self.handlers.get_mut(service) {
            Some(handler) => handler
                .list_applied()
                .map_err(|error| Error::from_handler(service, error)),
            None => Err(Error::ContractViolation {
                service: service.to_string(),
                detail: "no handler registered for service".to_string(),
            }),
        }
    }

    fn dispatch_apply_step(
        &mut self,
        service: &str,
        migration: &str,
        step: u32,
        action: &catalog::ActionStep,
        created: i64,
        signature: &str,
    ) -> Result<Option<serde_json::Value>, Error> {
        let executor = ScriptExecutor::new(&self.signer, self.hook.as_deref());
        let request = ApplyStep {
            migration,
            step,
            kind: &action.kind,
            code: &action.code,
            args: &action.args,
            created,
            signature,
            executor: &executor,
        };
        match self.handlers.get_mut(service) {
            Some(handler) => handler
                .apply_step(&request)
                .map_err(|error| Error::from_handler(service, error)),
            None => Err(Error::ContractViolation {
                service: service.to_string(),
                detail: "no handler registered for service".to_string(),
            }),
        }
    }

    fn dispatch_finalize_apply(
        &mut self,
        service: &str,
        finalize: &FinalizeApply<'_>,
    ) -> Result<(), Error> {
        match self.handlers.get_mut(service) {
            Some(handler) => handler
                .finalize_apply(finalize)
                .map_err(|error| Error::from_handler(service, error)),
            None => Err(Error::ContractViolation {
                service: service.to_string(),
                detail: "no handler registered for service".to_string(),
            }),
        }
    }

    fn dispatch_rollback_step(
        &mut self,
        service: &str,
        migration: &str,
        step: u32,
        record: Option<&RollbackRecord>,
    ) -> Result<(), Error> {
        let executor = ScriptExecutor::new(&self.signer, self.hook.as_deref());
        let request = RollbackStep {
            migration,
            step,
            record,
            executor: &executor,
        };
        match self.handlers.get_mut(service) {
            Some(handler) => handler
                .rollback_step(&request)
                .map_err(|error| Error::from_handler(service, error)),
            None => Err(Error::ContractViolation {
                service: service.to_string(),
                detail: "no handler registered for service".to_string(),
            }),
        }
    }

    fn dispatch_finalize_rollback(&mut self, service: &str, migration: &str) -> Result<(), Error> {
        match self.handlers.get_mut(service) {
            Some(handler) => handler
                .finalize_rollback(migration)
                .map_err(|error| Error::from_handler(service, error)),
            None => Err(Error::ContractViolation {
                service: service.to_string(),
                detail: "no handler registered for service".to_string(),
            }),
        }
    }

    fn check_break(&self) -> Result<(), Error> {
        if self.break_requested.load(Ordering::SeqCst) {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.deliver(state, None);
    }

    /// Report one error: bump the counter, notify observers with the
    /// transient error state, and leave the machine state untouched.
    fn notify_error(&mut self, error: &Error) {
        self.stats.errors += 1;
        tracing::warn!(error = %error, "run error");
        let message = error.to_string();
        self.deliver(RunState::Error, Some(&message));
    }

    fn deliver(&mut self, state: RunState, error: Option<&str>) {
        let notification = Notification {
            state,
            stats: self.stats,
            migration: self.current.as_deref(),
            error,
        };
        for observer in &mut self.observers {
            observer.notify(&notification);
        }
    }
}

/// Validate a service listing: every name must be `module:file` shaped,
/// and names of undiscovered modules are dropped. One ill-formed entry
/// rejects the whole listing.
fn validate_listing(
    service: &str,
    listing: AppliedMigrations,
    modules: &ModuleMap,
) -> Result<AppliedMigrations, Error> {
    let mut filtered = AppliedMigrations {
        entries: BTreeMap::new(),
        watermark: listing.watermark,
    };
    for (name, entry) in listing.entries {
        if !valid_migration_name(&name) {
            return Err(Error::ContractViolation {
                service: service.to_string(),
                detail: format!("ill-formed migration name \"{name}\" in listing"),
            });
        }
        let module = name.split(':').next().unwrap_or("");
        if modules.contains(module) {
            filtered.entries.insert(name, entry);
        }
    }
    Ok(filtered)
}

fn valid_migration_name(name: &str) -> bool {
    let Some((module, file)) = name.split_once(':') else {
        return false;
    };
    segment_ok(module, &['-', '.', '/', '_']) && segment_ok(file, &['-', '.', '_'])
}

fn segment_ok(segment: &str, separators: &[char]) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || separators.contains(&c))
        && segment.starts_with(|c: char| c.is_ascii_alphanumeric())
        && segment.ends_with(|c: char| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_migration_names() {
        assert!(valid_migration_name("app:001"));
        assert!(valid_migration_name("vendor/lib:setup-2.1"));
        assert!(!valid_migration_name("noseparator"));
        assert!(!valid_migration_name(":file"));
        assert!(!valid_migration_name("mod:"));
        assert!(!valid_migration_name("mod:-file"));
        assert!(!valid_migration_name("mod:fi le"));
    }

    #[test]
    fn test_validate_listing_drops_unknown_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("module.json"), r#"{"name": "app"}"#).unwrap();
        std::fs::write(
            dir.path().join("001.ini"),
            "[migration]\ncreated = 2020-01-01 00:00:00\n\n[actions]\na1 = db:sql>SELECT 1\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("m")).unwrap();
        std::fs::rename(dir.path().join("001.ini"), dir.path().join("m/001.ini")).unwrap();
        let modules = catalog::discover(dir.path()).unwrap();

        let mut listing = AppliedMigrations::default();
        listing.record("app:001", 100, 1);
        listing.record("gone:002", 100, 1);
        let filtered = validate_listing("db", listing, &modules).unwrap();
        assert!(filtered.entries.contains_key("app:001"));
        assert!(!filtered.entries.contains_key("gone:002"));
    }

    #[test]
    fn test_validate_listing_rejects_ill_formed_names() {
        let modules = ModuleMap::default();
        let mut listing = AppliedMigrations::default();
        listing.record("not a name", 100, 1);
        assert!(matches!(
            validate_listing("db", listing, &modules),
            Err(Error::ContractViolation { .. })
        ));
    }

    #[test]
    fn test_create_scaffold_and_collision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("module.json"), r#"{"name": "app"}"#).unwrap();
        let mut runner = MigrationRunner::new(dir.path(), "key");
        let path = runner.create("first", Some("db"), None).unwrap();
        assert!(path.exists());

        assert!(matches!(
            runner.create("first", None, None),
            Err(Error::DefinitionExists { .. })
        ));
    }

    #[test]
    fn test_state_starts_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MigrationRunner::new(dir.path(), "key");
        assert_eq!(runner.state(), RunState::Initialized);
    }
}
