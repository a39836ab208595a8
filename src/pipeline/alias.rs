//! Alias resolution — collapses known aliases onto one canonical company.
//!
//! [`CanonicalName`] can only be built by [`resolve_alias`], and storage's
//! company find-or-create accepts nothing else. An unresolved name therefore
//! cannot reach persistence.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

/// Case-insensitive alias → canonical company table.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

impl AliasTable {
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        let entries = aliases
            .into_iter()
            .map(|(alias, canonical)| (normalize_key(&alias), collapse_whitespace(&canonical)))
            .filter(|(alias, canonical)| !alias.is_empty() && !canonical.is_empty())
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&normalize_key(name)).map(String::as_str)
    }
}

/// A company name that has been through alias resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalName(String);

impl CanonicalName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Look `name` up in the alias table: a hit yields the canonical target, a
/// miss yields the (whitespace-normalized) name itself. Returns `None` only
/// for an empty name.
pub fn resolve_alias(name: &str, aliases: &AliasTable) -> Option<CanonicalName> {
    let cleaned = collapse_whitespace(name);
    if cleaned.is_empty() {
        return None;
    }
    let canonical = aliases
        .get(&cleaned)
        .map(str::to_string)
        .unwrap_or(cleaned);
    Some(CanonicalName(canonical))
}

fn normalize_key(name: &str) -> String {
    collapse_whitespace(name).to_lowercase()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AliasTable {
        AliasTable::new(BTreeMap::from([
            ("CGI".to_string(), "CGI Inc.".to_string()),
            ("Alphabet".to_string(), "Google".to_string()),
        ]))
    }

    #[test]
    fn alias_hit_returns_canonical() {
        let name = resolve_alias("CGI", &table()).unwrap();
        assert_eq!(name.as_str(), "CGI Inc.");
    }

    #[test]
    fn alias_lookup_is_case_insensitive() {
        for variant in ["cgi", "Cgi", "  CGI  "] {
            assert_eq!(resolve_alias(variant, &table()).unwrap().as_str(), "CGI Inc.");
        }
    }

    #[test]
    fn alias_miss_keeps_name() {
        let name = resolve_alias("Dragos", &table()).unwrap();
        assert_eq!(name.as_str(), "Dragos");
    }

    #[test]
    fn whitespace_is_normalized() {
        let name = resolve_alias("Palo   Alto\tNetworks", &table()).unwrap();
        assert_eq!(name.as_str(), "Palo Alto Networks");
    }

    #[test]
    fn empty_name_has_no_canonical() {
        assert!(resolve_alias("   ", &table()).is_none());
    }

    #[test]
    fn canonical_target_is_not_realiased() {
        // A canonical name maps to itself when it is not an alias key.
        let name = resolve_alias("CGI Inc.", &table()).unwrap();
        assert_eq!(name.as_str(), "CGI Inc.");
    }
}
