//! migsync core - migration discovery, diffing, and reconciliation.
//!
//! This crate is the orchestration engine: it discovers migration
//! definitions across a module tree, computes the desired state per
//! storage service, diffs it against what each service reports as
//! applied, and drives the ordered rollback/apply protocol with signed
//! rollback bundles. Storage backends plug in through the
//! [`MigrationHandler`] contract; the CLI (or any front-end) observes run
//! progress through [`RunObserver`].

pub mod catalog;
pub mod csv;
pub mod diff;
pub mod error;
pub mod handler;
pub mod observer;
pub mod runner;
pub mod script;
pub mod signature;
pub mod stats;
pub mod time;

// Catalog types
pub use catalog::{
    Catalog, DesiredEntry, DesiredState, Module, ModuleMap, ResolvedMigration, ServiceDesired,
    DEFAULT_ENVIRONMENT, MODULE_MANIFEST,
};

// Diff types
pub use diff::{PlannedMigration, SyncPlan};

// Error types
pub use error::{Error, HandlerError};

// Handler contract
pub use handler::{
    AppliedEntry, AppliedMigrations, ApplyStep, FinalizeApply, MigrationHandler, NullSink,
    ProgressSink, RollbackRecord, RollbackStep, SharedSink, KIND_CSV, KIND_DEFINITION,
    KIND_SCRIPT, KIND_SQL,
};

// Observer contract
pub use observer::{Notification, RunObserver, RunState};

// Runner
pub use runner::MigrationRunner;

// Scripts
pub use script::{check_syntax, ScriptCall, ScriptExecutor, ScriptHook};

// Signatures
pub use signature::Signer;

// Statistics
pub use stats::RunStats;

// Time helpers
pub use time::{format_unix, now_unix, parse_created, MonotonicClock, DATE_TIME_FORMAT};

// CSV import helpers
pub use csv::{parse_csv, CellValue, CsvTable, IdStack};
