//! Project-tree discovery: module boundaries and definition files.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// File that declares a module boundary and supplies its name.
pub const MODULE_MANIFEST: &str = "module.json";

/// Extension of migration definition files.
pub const DEFINITION_EXTENSION: &str = "ini";

/// Section a candidate file must contain to count as a definition.
const MIGRATION_SECTION_MARKER: &str = "[migration]";

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
}

/// One discovered module and its definition files.
#[derive(Debug, Clone)]
pub struct Module {
    /// Manifest-declared module name.
    pub name: String,
    /// Directory containing the manifest.
    pub root: PathBuf,
    /// Definition files keyed by base name (without extension).
    pub definitions: BTreeMap<String, PathBuf>,
}

/// Modules discovered in one run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: BTreeMap<String, Module>,
}

impl ModuleMap {
    /// Whether a module with this name was discovered.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Iterate discovered module names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Iterate modules.
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Number of definition files across all modules.
    pub fn definition_count(&self) -> usize {
        self.modules.values().map(|m| m.definitions.len()).sum()
    }

    /// Path of a definition addressed as `module:file`.
    pub fn definition_path(&self, migration: &str) -> Option<&Path> {
        let (module, file) = migration.split_once(':')?;
        self.modules
            .get(module)?
            .definitions
            .get(file)
            .map(PathBuf::as_path)
    }

    /// Every definition as `(module:file, path)`, sorted by name.
    pub fn definitions(&self) -> Vec<(String, PathBuf)> {
        let mut all = Vec::new();
        for module in self.modules.values() {
            for (base, path) in &module.definitions {
                all.push((format!("{}:{}", module.name, base), path.clone()));
            }
        }
        all
    }
}

/// Walk the project tree and resolve every definition file to its owning
/// module.
///
/// A definition is any `*.ini` file containing a `[migration]` section; it
/// belongs to the nearest ancestor directory holding a [`MODULE_MANIFEST`].
/// Files with no owning manifest inside the project root are ignored, as
/// are dot-directories.
pub fn discover(root: &Path) -> io::Result<ModuleMap> {
    let mut candidates = Vec::new();
    collect_candidates(root, &mut candidates)?;

    let mut map = ModuleMap::default();
    for path in candidates {
        let Some((module_root, name)) = find_module(root, &path) else {
            tracing::debug!(path = %path.display(), "definition file has no owning module");
            continue;
        };
        let Some(base) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        map.modules
            .entry(name.clone())
            .or_insert_with(|| Module {
                name,
                root: module_root,
                definitions: BTreeMap::new(),
            })
            .definitions
            .insert(base.to_string(), path.clone());
    }

    tracing::debug!(
        modules = map.modules.len(),
        definitions = map.definition_count(),
        "discovery finished"
    );
    Ok(map)
}

fn collect_candidates(dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_candidates(&path, found)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(DEFINITION_EXTENSION) {
            if let Ok(text) = fs::read_to_string(&path) {
                if text.contains(MIGRATION_SECTION_MARKER) {
                    found.push(path);
                }
            }
        }
    }
    Ok(())
}

/// Walk upward from a definition file until a manifest is found, stopping
/// at the project root.
fn find_module(root: &Path, definition: &Path) -> Option<(PathBuf, String)> {
    let mut dir = definition.parent()?;
    loop {
        let manifest = dir.join(MODULE_MANIFEST);
        if manifest.is_file() {
            let text = fs::read_to_string(&manifest).ok()?;
            let parsed: Manifest = serde_json::from_str(&text).ok()?;
            return Some((dir.to_path_buf(), parsed.name));
        }
        if dir == root {
            return None;
        }
        dir = dir.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn definition(created: &str) -> String {
        format!("[migration]\ncreated = {created}\n\n[actions]\na1 = db:sql>SELECT 1\n")
    }

    #[test]
    fn test_discover_resolves_modules() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("module.json"), r#"{"name": "app"}"#);
        write(
            &root.join("migrations/001.ini"),
            &definition("2020-01-01 00:00:00"),
        );
        write(
            &root.join("vendor/lib/module.json"),
            r#"{"name": "vendor/lib"}"#,
        );
        write(
            &root.join("vendor/lib/setup.ini"),
            &definition("2020-01-02 00:00:00"),
        );

        let map = discover(root).unwrap();
        assert!(map.contains("app"));
        assert!(map.contains("vendor/lib"));
        assert_eq!(map.definition_count(), 2);
        assert!(map.definition_path("app:001").is_some());
        assert!(map.definition_path("vendor/lib:setup").is_some());
        assert!(map.definition_path("app:missing").is_none());
    }

    #[test]
    fn test_nested_manifest_takes_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("module.json"), r#"{"name": "outer"}"#);
        write(&root.join("inner/module.json"), r#"{"name": "inner"}"#);
        write(
            &root.join("inner/m/001.ini"),
            &definition("2020-01-01 00:00:00"),
        );

        let map = discover(root).unwrap();
        assert!(map.definition_path("inner:001").is_some());
        assert!(!map.contains("outer"));
    }

    #[test]
    fn test_ini_without_migration_section_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("module.json"), r#"{"name": "app"}"#);
        write(&root.join("config.ini"), "[settings]\nkey = value\n");

        let map = discover(root).unwrap();
        assert_eq!(map.definition_count(), 0);
    }

    #[test]
    fn test_file_without_manifest_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("001.ini"), &definition("2020-01-01 00:00:00"));

        let map = discover(root).unwrap();
        assert_eq!(map.definition_count(), 0);
    }

    #[test]
    fn test_dot_directories_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("module.json"), r#"{"name": "app"}"#);
        write(
            &root.join(".hidden/001.ini"),
            &definition("2020-01-01 00:00:00"),
        );

        let map = discover(root).unwrap();
        assert_eq!(map.definition_count(), 0);
    }
}
