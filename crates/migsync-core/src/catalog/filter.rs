//! Filter predicates on definition files.
//!
//! A filter value is a condition string of OR-separated clauses, each an
//! AND of atoms, each atom optionally negated with a leading `not `. The
//! filter key names what the atoms test: the configured environment, a
//! discovered module, a registered service, or another migration's
//! inclusion (the self-referential case that drives re-queuing).

use std::collections::BTreeSet;

use crate::catalog::scan::ModuleMap;
use crate::error::Error;

/// Recognized filter keys.
const FILTER_ENVIRONMENT: &str = "environment";
const FILTER_MODULE: &str = "module";
const FILTER_SERVICE: &str = "service";
const FILTER_MIGRATION: &str = "migration";

/// Result of evaluating a file's filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Every filter matched; the file contributes desired state.
    Include,
    /// Some filter failed; the file is skipped silently.
    Exclude,
    /// A `migration` atom references a file still in the queue.
    Defer,
}

/// Inputs the filter kinds test against.
#[derive(Debug)]
pub struct FilterContext<'a> {
    /// The configured environment string.
    pub environment: &'a str,
    /// Discovered modules.
    pub modules: &'a ModuleMap,
    /// Services registered for this run.
    pub services: &'a BTreeSet<String>,
    /// Migrations still waiting in the parse queue.
    pub pending: &'a BTreeSet<String>,
    /// Migrations already resolved as included.
    pub resolved: &'a BTreeSet<String>,
}

/// Evaluate every filter of a definition, in file order.
///
/// `name` is the migration being filtered (used to qualify bare
/// `migration` references with its module). An unrecognized filter key is
/// an error on the file.
pub fn evaluate(
    name: &str,
    filters: &[(String, String)],
    context: &FilterContext<'_>,
) -> Result<FilterOutcome, Error> {
    for (key, condition) in filters {
        match evaluate_condition(name, key, condition, context)? {
            FilterOutcome::Include => {}
            other => return Ok(other),
        }
    }
    Ok(FilterOutcome::Include)
}

fn evaluate_condition(
    name: &str,
    key: &str,
    condition: &str,
    context: &FilterContext<'_>,
) -> Result<FilterOutcome, Error> {
    let mut deferred = false;

    for clause in condition.split(" or ") {
        let mut clause_holds = true;
        for atom in clause.split(" and ") {
            let atom = atom.trim();
            let (negated, value) = match atom.strip_prefix("not ") {
                Some(rest) => (true, rest.trim()),
                None => (false, atom),
            };
            match evaluate_atom(name, key, value, context)? {
                AtomValue::Defer => deferred = true,
                AtomValue::Bool(truth) => {
                    if truth == negated {
                        clause_holds = false;
                    }
                }
            }
        }
        if clause_holds && !deferred {
            return Ok(FilterOutcome::Include);
        }
    }

    if deferred {
        Ok(FilterOutcome::Defer)
    } else {
        Ok(FilterOutcome::Exclude)
    }
}

enum AtomValue {
    Bool(bool),
    Defer,
}

fn evaluate_atom(
    name: &str,
    key: &str,
    value: &str,
    context: &FilterContext<'_>,
) -> Result<AtomValue, Error> {
    match key {
        FILTER_ENVIRONMENT => Ok(AtomValue::Bool(wildcard_match(value, context.environment))),
        FILTER_MODULE => Ok(AtomValue::Bool(
            context.modules.contains(value)
                || context.modules.names().any(|m| wildcard_match(value, m)),
        )),
        FILTER_SERVICE => Ok(AtomValue::Bool(context.services.contains(value))),
        FILTER_MIGRATION => {
            let target = qualify(name, value);
            if context.pending.contains(&target) {
                return Ok(AtomValue::Defer);
            }
            Ok(AtomValue::Bool(context.resolved.contains(&target)))
        }
        other => Err(Error::UnknownFilter {
            name: name.to_string(),
            filter: other.to_string(),
        }),
    }
}

/// Qualify a bare migration reference with the referencing file's module.
fn qualify(name: &str, reference: &str) -> String {
    if reference.contains(':') {
        reference.to_string()
    } else {
        let module = name.split(':').next().unwrap_or("");
        format!("{module}:{reference}")
    }
}

/// Case-insensitive wildcard match where `%` matches any run of
/// characters.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();
    let segments: Vec<&str> = pattern.split('%').collect();

    if segments.len() == 1 {
        return pattern == value;
    }

    let mut rest = value.as_str();
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(segment) {
                Some(after) => rest = after,
                None => return false,
            }
        } else if index == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with `%` (or was all `%`): any remainder matches.
    true
}
