//! Run states and the observer notification contract.

use crate::stats::RunStats;

/// States of the runner state machine.
///
/// `Error` is transient: it is delivered to observers with a message and
/// the prior state is restored immediately afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Idle between runs.
    Initialized,
    /// A run has started.
    Fired,
    /// Discovery and parsing finished.
    FindMigrations,
    /// Actual state queried and diffed.
    MigrationsAsked,
    /// An already-satisfied migration is being reported (status mode).
    MigrationStored,
    /// A migration is being rolled back.
    MigrationRollback,
    /// A migration is being applied.
    MigrationApply,
    /// A single error is being reported.
    Error,
    /// The run finished.
    Complete,
    /// The run was cooperatively interrupted.
    Break,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Initialized => write!(f, "initialized"),
            RunState::Fired => write!(f, "fired"),
            RunState::FindMigrations => write!(f, "find_migrations"),
            RunState::MigrationsAsked => write!(f, "migrations_asked"),
            RunState::MigrationStored => write!(f, "migration_stored"),
            RunState::MigrationRollback => write!(f, "migration_rollback"),
            RunState::MigrationApply => write!(f, "migration_apply"),
            RunState::Error => write!(f, "error"),
            RunState::Complete => write!(f, "complete"),
            RunState::Break => write!(f, "break"),
        }
    }
}

/// Snapshot delivered to observers after every state transition.
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    /// The state being entered (or [`RunState::Error`] transiently).
    pub state: RunState,
    /// Counter snapshot at the time of the transition.
    pub stats: RunStats,
    /// Migration currently being processed, if any.
    pub migration: Option<&'a str>,
    /// Error message, present only for [`RunState::Error`].
    pub error: Option<&'a str>,
}

/// Receives state transitions from the runner, synchronously.
pub trait RunObserver {
    /// Called after every state transition.
    fn notify(&mut self, notification: &Notification<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::MigrationRollback.to_string(), "migration_rollback");
        assert_eq!(RunState::Complete.to_string(), "complete");
    }
}
