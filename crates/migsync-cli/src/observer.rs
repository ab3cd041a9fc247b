//! Console rendering of runner state transitions.

use migsync_core::{Notification, ProgressSink, RunObserver, RunState};

/// Which command is running; status and migrate render differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// `migsync status`: listings of stored/rollback/apply migrations.
    Status,
    /// `migsync migrate`: per-migration progress lines.
    Migrate,
}

/// Observer printing run progress to stdout.
pub struct ConsoleObserver {
    mode: RenderMode,
    verbose: bool,
    last: Option<RunState>,
}

impl ConsoleObserver {
    /// Create an observer for the given command.
    pub fn new(mode: RenderMode, verbose: bool) -> Self {
        Self {
            mode,
            verbose,
            last: None,
        }
    }

    fn heading(&self, state: RunState, text: &str) {
        if self.last != Some(state) {
            println!();
            println!("{text}");
        }
    }
}

impl RunObserver for ConsoleObserver {
    fn notify(&mut self, notification: &Notification<'_>) {
        let name = notification.migration.unwrap_or("");
        match (self.mode, notification.state) {
            (_, RunState::Error) => {
                eprintln!("  error: {}", notification.error.unwrap_or("unknown"));
            }
            (RenderMode::Status, RunState::Fired) => {
                println!("Current state of migrations...");
            }
            (RenderMode::Status, RunState::MigrationStored) => {
                self.heading(RunState::MigrationStored, "List of applied migrations:");
                println!(" - \"{name}\"");
            }
            (RenderMode::Status, RunState::MigrationRollback) => {
                self.heading(RunState::MigrationRollback, "List of migrations for rollback:");
                println!(" - \"{name}\"");
            }
            (RenderMode::Status, RunState::MigrationApply) => {
                self.heading(RunState::MigrationApply, "List of migrations to perform:");
                println!(" - \"{name}\"");
            }
            (RenderMode::Migrate, RunState::Fired) => {
                if self.verbose {
                    println!("Searching migrations...");
                }
            }
            (RenderMode::Migrate, RunState::FindMigrations) => {
                if self.verbose {
                    println!("  definition files found: {}", notification.stats.total);
                }
            }
            (RenderMode::Migrate, RunState::MigrationsAsked) => {
                if self.verbose {
                    println!(
                        "  migrations for rollback: {}",
                        notification.stats.for_rollback
                    );
                    println!("  migrations for commit: {}", notification.stats.for_commit);
                }
            }
            (RenderMode::Migrate, RunState::MigrationRollback) => {
                println!("Rollback migration \"{name}\"");
            }
            (RenderMode::Migrate, RunState::MigrationApply) => {
                println!("Apply migration \"{name}\"");
            }
            (RenderMode::Migrate, RunState::Break) => {
                println!("Interrupted.");
            }
            _ => {}
        }
        self.last = Some(notification.state);
    }
}

/// Progress sink printing handler messages indented.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn line(&mut self, message: &str) {
        println!("  {message}");
    }
}
