//! Engine and handler error types.

use thiserror::Error;

/// Errors recorded during a reconciliation run.
///
/// None of these escape the public entry points: the runner accumulates
/// them, reports each to observers via the transient error state, and
/// finishes the run with a non-zero error count.
#[derive(Debug, Error)]
pub enum Error {
    /// A definition file is missing a required section or value.
    #[error("definition \"{name}\" does not have section \"{section}\" or section is invalid")]
    MalformedDefinition {
        /// Migration name (`module:file`) or file path when unresolved.
        name: String,
        /// The section that is missing or invalid.
        section: String,
    },

    /// Filter conditions reference each other without ever resolving.
    #[error("definition \"{name}\" has recursion in filter conditions")]
    FilterRecursion {
        /// One of the unresolved definitions.
        name: String,
    },

    /// A filters section contains an unrecognized filter key.
    #[error("definition \"{name}\" has unknown filter \"{filter}\"")]
    UnknownFilter {
        /// Migration name.
        name: String,
        /// The unrecognized filter key.
        filter: String,
    },

    /// A service did not answer a query or returned ill-formed data.
    #[error("service \"{service}\" violated the handler contract: {detail}")]
    ContractViolation {
        /// The offending service name.
        service: String,
        /// What went wrong.
        detail: String,
    },

    /// An embedded script failed the pre-execution syntax check.
    #[error("script syntax error in \"{name}\" step {step}: {detail}")]
    ScriptSyntax {
        /// Migration name.
        name: String,
        /// Step index.
        step: u32,
        /// Description of the imbalance.
        detail: String,
    },

    /// A stored signature did not match the recomputed digest.
    #[error("signature mismatch for \"{migration}\" step {step}")]
    SignatureMismatch {
        /// Migration name.
        migration: String,
        /// Step index.
        step: u32,
    },

    /// An opaque error surfaced by a storage backend.
    #[error("service \"{service}\" reported: {source}")]
    Handler {
        /// The reporting service name.
        service: String,
        /// The backend error.
        source: HandlerError,
    },

    /// A migration name or scaffold target already exists.
    #[error("migration \"{name}\" already exists")]
    DefinitionExists {
        /// The colliding name.
        name: String,
    },

    /// Filesystem error during discovery or scaffolding.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cooperatively interrupted between migrations.
    #[error("run interrupted")]
    Interrupted,
}

impl Error {
    /// Wrap a backend error, promoting signature mismatches to their own
    /// error kind so they are never reported as opaque handler failures.
    pub fn from_handler(service: &str, error: HandlerError) -> Self {
        match error {
            HandlerError::SignatureMismatch { migration, step } => {
                Error::SignatureMismatch { migration, step }
            }
            other => Error::Handler {
                service: service.to_string(),
                source: other,
            },
        }
    }
}

/// Errors a storage backend can report through the handler contract.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A stored script failed signature verification.
    #[error("signature mismatch for \"{migration}\" step {step}")]
    SignatureMismatch {
        /// Migration name.
        migration: String,
        /// Step index.
        step: u32,
    },

    /// The backend does not execute steps of this kind.
    #[error("unsupported step kind \"{kind}\"")]
    UnsupportedKind {
        /// The offending kind tag.
        kind: String,
    },

    /// The backend storage is missing or misconfigured.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A storage-layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A host script hook failed.
    #[error("script error: {0}")]
    Script(String),

    /// A script step was dispatched but no script hook is registered.
    #[error("no script hook registered")]
    NoScriptHook,
}
