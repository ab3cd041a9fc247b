//! Migration discovery and desired-state assembly.
//!
//! The catalog walks the project tree for modules and definition files,
//! evaluates filters with forward-reference deferral, and yields the
//! desired state per service. It also re-resolves action bodies at apply
//! time and scaffolds new definition files.

pub mod definition;
pub mod filter;
pub mod ini;
pub mod scan;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::time::{format_unix, now_unix};

pub use definition::{
    resolve_actions, ActionStep, Definition, Direction, RawAction, ResolvedMigration,
    RollbackScript,
};
pub use filter::{FilterContext, FilterOutcome};
pub use scan::{discover, Module, ModuleMap, DEFINITION_EXTENSION, MODULE_MANIFEST};

/// Environment used when none is configured.
pub const DEFAULT_ENVIRONMENT: &str = "production.main";

/// Desired state of one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceDesired {
    /// Desired migrations keyed by name.
    pub entries: BTreeMap<String, DesiredEntry>,
    /// Baseline watermark from permanent definitions.
    pub watermark: Option<i64>,
}

/// Desired state of one migration on one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredEntry {
    /// Creation time from the definition.
    pub created: i64,
    /// Apply-step indices this service owns (empty = finalize only).
    pub steps: BTreeSet<u32>,
}

/// Desired state across all services, as parsed this run.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    /// Per-service desired migrations.
    pub services: BTreeMap<String, ServiceDesired>,
    /// Definition files counted (malformed files subtracted).
    pub total: u32,
}

impl DesiredState {
    fn raise_watermark(&mut self, service: &str, created: i64) {
        let entry = self.services.entry(service.to_string()).or_default();
        entry.watermark = Some(entry.watermark.map_or(created, |w| w.max(created)));
    }
}

/// Discovery and parsing front-end, configured once per run.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    environment: String,
    services: BTreeSet<String>,
}

impl Catalog {
    /// Create a catalog rooted at the project directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            services: BTreeSet::new(),
        }
    }

    /// Set the environment string filters match against.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the services registered for this run (for `service` filters).
    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Project root this catalog scans.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the project tree for modules and definition files.
    pub fn discover(&self) -> io::Result<ModuleMap> {
        scan::discover(&self.root)
    }

    /// Evaluate filters and assemble desired state per service.
    ///
    /// Files are processed queue-style: a `migration` filter referencing a
    /// file still in the queue re-queues the referencing file instead of
    /// failing. When a full pass makes no progress the remaining head of
    /// the queue is reported as a filter-recursion error and parsing
    /// stops. All other per-file errors are accumulated and parsing
    /// continues.
    pub fn parse(&self, modules: &ModuleMap) -> (DesiredState, Vec<Error>) {
        let mut queue: VecDeque<(String, PathBuf)> = modules.definitions().into_iter().collect();
        let mut desired = DesiredState {
            total: queue.len() as u32,
            ..DesiredState::default()
        };
        let mut errors = Vec::new();
        let mut resolved = BTreeSet::new();
        let mut budget = queue.len();

        while let Some((name, path)) = queue.pop_front() {
            let definition = match Definition::load(&name, &path) {
                Ok(definition) => definition,
                Err(error) => {
                    desired.total -= 1;
                    errors.push(error);
                    budget = queue.len();
                    continue;
                }
            };

            let pending: BTreeSet<String> = queue.iter().map(|(n, _)| n.clone()).collect();
            let context = FilterContext {
                environment: &self.environment,
                modules,
                services: &self.services,
                pending: &pending,
                resolved: &resolved,
            };

            match filter::evaluate(&name, &definition.filters, &context) {
                Err(error) => {
                    desired.total -= 1;
                    errors.push(error);
                    budget = queue.len();
                }
                Ok(FilterOutcome::Defer) => {
                    if budget == 0 {
                        errors.push(Error::FilterRecursion { name });
                        break;
                    }
                    budget -= 1;
                    queue.push_back((name, path));
                }
                Ok(FilterOutcome::Exclude) => {
                    tracing::debug!(migration = %name, "excluded by filters");
                    budget = queue.len();
                }
                Ok(FilterOutcome::Include) => {
                    budget = queue.len();
                    if definition.permanent {
                        match definition.service.as_deref() {
                            Some(service) => desired.raise_watermark(service, definition.created),
                            None => {
                                desired.total -= 1;
                                errors.push(Error::MalformedDefinition {
                                    name: name.clone(),
                                    section: definition::SECTION_MIGRATION.to_string(),
                                });
                                continue;
                            }
                        }
                    } else {
                        for action in &definition.actions {
                            let service =
                                desired.services.entry(action.service.clone()).or_default();
                            let entry =
                                service
                                    .entries
                                    .entry(name.clone())
                                    .or_insert(DesiredEntry {
                                        created: definition.created,
                                        steps: BTreeSet::new(),
                                    });
                            if action.direction == Direction::Apply {
                                entry.steps.insert(action.step);
                            }
                        }
                    }
                    resolved.insert(name);
                }
            }
        }

        tracing::debug!(
            services = desired.services.len(),
            total = desired.total,
            errors = errors.len(),
            "parse finished"
        );
        (desired, errors)
    }

    /// Scaffold a new definition file under `directory`.
    ///
    /// Refuses to overwrite an existing file.
    pub fn create(
        &self,
        directory: &Path,
        name: &str,
        service: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let name = name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::MalformedDefinition {
                name: name.to_string(),
                section: "name".to_string(),
            });
        }

        let path = directory.join(format!("{name}.{DEFINITION_EXTENSION}"));
        if path.exists() {
            return Err(Error::DefinitionExists {
                name: name.to_string(),
            });
        }

        let service_line = match service {
            Some(service) => format!("service = {service}\n"),
            None => "; service = \n".to_string(),
        };
        let template = format!(
            "[migration]\ncreated = {created}\n{service_line}\n[filters]\n; environment = production.%\n\n[actions]\n; a1 = sql>CREATE TABLE example (id INTEGER PRIMARY KEY)\n; r1 = sql>DROP TABLE example\n",
            created = format_unix(now_unix()),
        );
        fs::write(&path, template)?;
        tracing::info!(path = %path.display(), "definition scaffolded");
        Ok(path)
    }
}
