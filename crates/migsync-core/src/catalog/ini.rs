//! Minimal section/key reader for definition files.
//!
//! Only what the definition format needs: `[section]` headers,
//! `key = value` pairs, `;`/`#` comment lines, and optional surrounding
//! quotes on values. Right-hand sides are otherwise kept verbatim so
//! inline script bodies (`sql>CREATE TABLE ...`) survive untouched.

use std::collections::BTreeMap;

/// Parsed sections: section name → key → raw value.
///
/// Keys within a section keep insertion order via a vector as well, since
/// action ordering is meaningful.
#[derive(Debug, Default, Clone)]
pub struct IniDocument {
    sections: BTreeMap<String, Vec<(String, String)>>,
}

impl IniDocument {
    /// Parse a definition file body.
    pub fn parse(text: &str) -> Self {
        let mut sections: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        let mut current = String::new();

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            if let Some(name) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                current = name.trim().to_lowercase();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let Some(eq) = trimmed.find('=') else {
                continue;
            };
            if current.is_empty() {
                continue;
            }
            let key = trimmed[..eq].trim().to_string();
            let value = unquote(trimmed[eq + 1..].trim());
            if !key.is_empty() {
                sections
                    .entry(current.clone())
                    .or_default()
                    .push((key, value));
            }
        }

        Self { sections }
    }

    /// Whether a section is present (even if empty).
    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Key/value pairs of a section in file order.
    pub fn section(&self, name: &str) -> &[(String, String)] {
        self.sections.get(name).map_or(&[], Vec::as_slice)
    }

    /// First value of a key within a section.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn unquote(value: &str) -> String {
    let stripped = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
        });
    stripped.unwrap_or(value).to_string()
}

/// Interpret an INI-style boolean value.
pub fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
