//! Definition file parsing and action resolution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::ini::{truthy, IniDocument};
use crate::error::Error;
use crate::time::parse_created;

/// Section and key names of the definition format.
pub const SECTION_MIGRATION: &str = "migration";
/// Filters section name.
pub const SECTION_FILTERS: &str = "filters";
/// Actions section name.
pub const SECTION_ACTIONS: &str = "actions";
/// Creation timestamp key.
pub const KEY_CREATED: &str = "created";
/// Target-service override key.
pub const KEY_SERVICE: &str = "service";
/// Permanent-baseline flag key.
pub const KEY_PERMANENT: &str = "permanent";

/// Direction of an action step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `a<step>` keys.
    Apply,
    /// `r<step>` keys.
    Rollback,
}

/// One raw `a<step>`/`r<step>` entry, service resolved, target unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAction {
    /// Apply or rollback.
    pub direction: Direction,
    /// Step index (always positive).
    pub step: u32,
    /// Owning service.
    pub service: String,
    /// `path-or-inline` part of the action value.
    pub target: String,
}

/// A parsed definition file, before filters are evaluated.
#[derive(Debug, Clone)]
pub struct Definition {
    /// Migration name (`module:file`).
    pub name: String,
    /// Path of the definition file.
    pub path: PathBuf,
    /// Creation time.
    pub created: i64,
    /// Definition-level service override.
    pub service: Option<String>,
    /// Whether this definition only contributes a permanent baseline.
    pub permanent: bool,
    /// Filter key/condition pairs in file order.
    pub filters: Vec<(String, String)>,
    /// Action entries in file order.
    pub actions: Vec<RawAction>,
}

impl Definition {
    /// Load and validate a definition file.
    ///
    /// A missing/invalid `created` value or an empty `[actions]` section is
    /// a malformed-definition error; action keys that are neither
    /// `a<step>` nor `r<step>` with a positive index are ignored.
    pub fn load(name: &str, path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let document = IniDocument::parse(&text);

        let created = document
            .get(SECTION_MIGRATION, KEY_CREATED)
            .and_then(parse_created)
            .ok_or_else(|| Error::MalformedDefinition {
                name: name.to_string(),
                section: SECTION_MIGRATION.to_string(),
            })?;

        let raw_actions = document.section(SECTION_ACTIONS);
        if raw_actions.is_empty() {
            return Err(Error::MalformedDefinition {
                name: name.to_string(),
                section: SECTION_ACTIONS.to_string(),
            });
        }

        let service = document
            .get(SECTION_MIGRATION, KEY_SERVICE)
            .map(str::to_string);
        let permanent = document
            .get(SECTION_MIGRATION, KEY_PERMANENT)
            .is_some_and(truthy);

        let mut actions = Vec::new();
        for (key, value) in raw_actions {
            let Some((direction, step)) = parse_action_key(key) else {
                continue;
            };
            let Some((owner, target)) = split_service(service.as_deref(), value) else {
                continue;
            };
            actions.push(RawAction {
                direction,
                step,
                service: owner,
                target,
            });
        }

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            created,
            service,
            permanent,
            filters: document
                .section(SECTION_FILTERS)
                .iter()
                .cloned()
                .collect(),
            actions,
        })
    }
}

fn parse_action_key(key: &str) -> Option<(Direction, u32)> {
    let direction = match key.bytes().next()? {
        b'a' => Direction::Apply,
        b'r' => Direction::Rollback,
        _ => return None,
    };
    let step: u32 = key[1..].parse().ok()?;
    (step > 0).then_some((direction, step))
}

/// Resolve the owning service of an action value.
///
/// With a definition-level service the whole value is the target;
/// otherwise the value must carry a `service:` prefix.
fn split_service(default: Option<&str>, value: &str) -> Option<(String, String)> {
    match default {
        Some(service) => Some((service.to_string(), value.to_string())),
        None => value
            .split_once(':')
            .map(|(service, target)| (service.to_string(), target.to_string())),
    }
}

/// One fully-resolved apply step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionStep {
    /// Owning service.
    pub service: String,
    /// Step kind tag.
    pub kind: String,
    /// Script body, trimmed.
    pub code: String,
    /// Decoded query-string arguments.
    pub args: BTreeMap<String, String>,
}

/// One resolved rollback script (arguments are attached at apply time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackScript {
    /// Step kind tag.
    pub kind: String,
    /// Script body, trimmed (empty when the referenced file is absent).
    pub code: String,
}

/// A definition re-read at apply time with all action bodies loaded.
#[derive(Debug, Clone)]
pub struct ResolvedMigration {
    /// Migration name.
    pub name: String,
    /// Creation time as re-read.
    pub created: i64,
    /// Trimmed definition file body (persisted as the step-0 record).
    pub body: String,
    /// Apply steps by index.
    pub apply: BTreeMap<u32, ActionStep>,
    /// Rollback scripts by service, then step.
    pub rollback: BTreeMap<String, BTreeMap<u32, RollbackScript>>,
}

/// Re-read a definition fresh and resolve every action body.
///
/// Inline bodies follow a `kind>` delimiter; anything else is a file
/// reference relative to the definition file, with the kind inferred from
/// the extension and optional query-string arguments. A missing apply
/// file is a malformed-definition error; a missing rollback file yields
/// an empty body.
pub fn resolve_actions(name: &str, path: &Path) -> Result<ResolvedMigration, Error> {
    let definition = Definition::load(name, path)?;
    let text = fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut apply = BTreeMap::new();
    let mut rollback: BTreeMap<String, BTreeMap<u32, RollbackScript>> = BTreeMap::new();

    for action in &definition.actions {
        match action.direction {
            Direction::Apply => {
                let (kind, code, args) = resolve_target(name, dir, &action.target, true)?;
                apply.insert(
                    action.step,
                    ActionStep {
                        service: action.service.clone(),
                        kind,
                        code,
                        args,
                    },
                );
            }
            Direction::Rollback => {
                let (kind, code, _) = resolve_target(name, dir, &action.target, false)?;
                rollback
                    .entry(action.service.clone())
                    .or_default()
                    .insert(action.step, RollbackScript { kind, code });
            }
        }
    }

    Ok(ResolvedMigration {
        name: definition.name,
        created: definition.created,
        body: text.trim().to_string(),
        apply,
        rollback,
    })
}

#[allow(clippy::type_complexity)]
fn resolve_target(
    name: &str,
    dir: &Path,
    target: &str,
    required: bool,
) -> Result<(String, String, BTreeMap<String, String>), Error> {
    if let Some(pos) = target.find('>') {
        let kind = target[..pos].trim().to_string();
        let code = target[pos + 1..].trim().to_string();
        return Ok((kind, code, BTreeMap::new()));
    }

    let (file, query) = match target.split_once('?') {
        Some((file, query)) => (file, Some(query)),
        None => (target, None),
    };
    let kind = file
        .rfind('.')
        .map_or_else(|| file.to_string(), |pos| file[pos + 1..].to_string());
    let args = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    match fs::read_to_string(dir.join(file)) {
        Ok(code) => Ok((kind, code.trim().to_string(), args)),
        Err(_) if !required => Ok((kind, String::new(), args)),
        Err(_) => Err(Error::MalformedDefinition {
            name: name.to_string(),
            section: SECTION_ACTIONS.to_string(),
        }),
    }
}
