//! Pattern store — externally configured rule data, compiled once per load.
//!
//! The JSON document is parsed into a [`PatternDocument`], then compiled into
//! an immutable [`PatternStore`]. Components receive `&PatternStore`; a
//! reload builds a complete new store and swaps the `Arc` under
//! [`PatternHandle`], so a run never observes a partial update.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::PatternError;
use crate::pipeline::alias::AliasTable;
use crate::pipeline::types::Label;

/// Order in which label regex tables are evaluated.
pub const LABEL_RULE_ORDER: [Label; 5] = [
    Label::Rejection,
    Label::InterviewInvite,
    Label::JobApplication,
    Label::HeadHunter,
    Label::Noise,
];

const DEFAULT_INVALID_COMPANIES: &[&str] = &[
    "resume",
    "import",
    "cv",
    "intro",
    "introduction",
    "re",
    "fwd",
    "fw",
    "application",
    "applications",
    "your application",
    "interview",
    "reminder",
    "update",
    "invitation",
    "action required",
    "hiring team",
    "talent acquisition",
    "recruiting",
    "careers",
    "jobs",
    "us",
    "our team",
    "the team",
    "the company",
    "important",
    "urgent",
    "fyi",
    "hi",
    "hello",
    "thanks",
    "thank you",
    "congratulations",
    "follow up",
    "following up",
    "new message",
];

/// Trailing abbreviations whose period belongs to the name.
const NAME_ABBREVIATIONS: &[&str] = &["inc.", "corp.", "co.", "ltd.", "llc.", "s.a.", "n.v."];

const DEFAULT_REFERRAL_MARKERS: &[&str] = &[
    r"\bintroduc(?:e|es|ed|ing|tion)\b",
    r"\breferr(?:al|ed|ing)\b",
    r"\bconnect(?:ing)? you\b",
];

const DEFAULT_GENERIC_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "protonmail.com",
    "proton.me",
];

const DEFAULT_COMPANY_PATTERNS: &[&str] = &[
    r"\b(?i:applying to|applied to|application to|applying at|application with|interest in joining)\s+(?P<company>[A-Z][\w&'\-]*(?:[ \t]+[A-Z][\w&'\-]*){0,3})",
    r"\b(?i:position|role|opportunity|opening)\s+(?i:at|with)\s+(?P<company>[A-Z][\w&'\-]*(?:[ \t]+[A-Z][\w&'\-]*){0,3})",
    r"\b(?i:on behalf of|the team at)\s+(?P<company>[A-Z][\w&'\-]*(?:[ \t]+[A-Z][\w&'\-]*){0,3})",
];

const DEFAULT_FOLLOW_UP_CUES: &[&str] = &[
    r"\bfollow(?:ing)?[- ]up\b",
    r"\bget back to you\b",
    r"\bhear (?:back )?from us\b",
    r"\bnext steps?\b",
    r"\breview(?:ing)? your application\b",
];

// ── Document ────────────────────────────────────────────────────────

/// A subject marker tied to a label, e.g. "Application received".
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectMarker {
    pub label: Label,
    pub pattern: String,
}

/// Pattern document as written on disk. Every key is optional; list keys
/// with built-in defaults fall back to them when empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatternDocument {
    /// Canonical company names (whitelist).
    pub known: Vec<String>,
    pub domain_to_company: BTreeMap<String, String>,
    /// Alias → canonical company.
    pub aliases: BTreeMap<String, String>,
    pub ats_domains: Vec<String>,
    pub headhunter_domains: Vec<String>,
    /// Free-mail domains never used as a correlation key.
    pub generic_domains: Vec<String>,
    /// Ignore phrases (case-insensitive regex fragments).
    pub ignore: Vec<String>,
    /// Label regex tables (case-insensitive), matched against subject and body.
    pub labels: BTreeMap<Label, Vec<String>>,
    /// Explicit ATS subject markers, highest-priority label rules.
    pub ats_subject_markers: Vec<SubjectMarker>,
    /// Body regexes for resolution tier 4. A `company` group holds the capture.
    pub company_patterns: Vec<String>,
    /// Captures rejected as company names, compared case-insensitively.
    pub invalid_companies: Vec<String>,
    pub referral_markers: Vec<String>,
    pub follow_up_cues: Vec<String>,
}

// ── Compiled store ──────────────────────────────────────────────────

/// A whitelist entry with its verbatim-occurrence matcher.
#[derive(Debug, Clone)]
pub struct KnownCompany {
    pub name: String,
    /// Case-insensitive, bounded by non-word characters. Group 1 is the name.
    pub matcher: Regex,
}

#[derive(Debug, Clone)]
pub struct SubjectRule {
    pub label: Label,
    pub regex: Regex,
}

/// Immutable, compiled snapshot of the pattern document.
#[derive(Debug, Clone)]
pub struct PatternStore {
    pub known: Vec<KnownCompany>,
    known_lookup: HashMap<String, usize>,
    domain_to_company: HashMap<String, String>,
    pub aliases: AliasTable,
    ats_domains: HashSet<String>,
    headhunter_domains: HashSet<String>,
    generic_domains: HashSet<String>,
    pub ignore: Vec<Regex>,
    /// Label tables in evaluation order.
    pub labels: Vec<(Label, Vec<Regex>)>,
    pub ats_subject_markers: Vec<SubjectRule>,
    pub company_patterns: Vec<Regex>,
    invalid_companies: HashSet<String>,
    pub referral_markers: Vec<Regex>,
    pub follow_up_cues: Vec<Regex>,
}

impl PatternStore {
    /// Parse and compile a JSON pattern document.
    pub fn from_json(json: &str) -> Result<Self, PatternError> {
        let doc: PatternDocument = serde_json::from_str(json)?;
        Self::compile(doc)
    }

    /// Read, parse and compile a pattern file.
    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let json = std::fs::read_to_string(path).map_err(|e| PatternError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let store = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            known = store.known.len(),
            domains = store.domain_to_company.len(),
            aliases = store.aliases.len(),
            "Pattern store loaded"
        );
        Ok(store)
    }

    /// Compile a parsed document.
    pub fn compile(doc: PatternDocument) -> Result<Self, PatternError> {
        let known = doc
            .known
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(|name| {
                let pattern = format!(r"(?i)(?:^|\W)({})(?:\W|$)", regex::escape(name));
                Ok(KnownCompany {
                    name: name.to_string(),
                    matcher: compile_one("known", &pattern)?,
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;

        let known_lookup = known
            .iter()
            .enumerate()
            .map(|(i, k)| (k.name.to_lowercase(), i))
            .collect();

        let domain_to_company = doc
            .domain_to_company
            .into_iter()
            .map(|(domain, company)| (normalize_domain(&domain), company.trim().to_string()))
            .filter(|(domain, company)| !domain.is_empty() && !company.is_empty())
            .collect();

        if let Some(label) = doc.labels.keys().find(|l| !LABEL_RULE_ORDER.contains(l)) {
            return Err(PatternError::UnruledLabel(label.to_string()));
        }

        let labels = LABEL_RULE_ORDER
            .iter()
            .map(|label| {
                let patterns = doc.labels.get(label).map(Vec::as_slice).unwrap_or(&[]);
                let key = format!("labels.{label}");
                Ok((*label, compile_all(&key, patterns.iter().map(String::as_str), true)?))
            })
            .collect::<Result<Vec<_>, PatternError>>()?;

        let ats_subject_markers = doc
            .ats_subject_markers
            .iter()
            .map(|m| {
                Ok(SubjectRule {
                    label: m.label,
                    regex: compile_one("ats_subject_markers", &format!("(?i){}", m.pattern))?,
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;

        let ignore = compile_all("ignore", doc.ignore.iter().map(String::as_str), true)?;

        let has_label_rules = !ats_subject_markers.is_empty()
            || !ignore.is_empty()
            || labels.iter().any(|(_, rules)| !rules.is_empty());
        if !has_label_rules {
            return Err(PatternError::Empty);
        }

        let company_patterns = compile_all(
            "company_patterns",
            or_default(&doc.company_patterns, DEFAULT_COMPANY_PATTERNS),
            false,
        )?;
        let referral_markers = compile_all(
            "referral_markers",
            or_default(&doc.referral_markers, DEFAULT_REFERRAL_MARKERS),
            true,
        )?;
        let follow_up_cues = compile_all(
            "follow_up_cues",
            or_default(&doc.follow_up_cues, DEFAULT_FOLLOW_UP_CUES),
            true,
        )?;

        let invalid_companies = or_default(&doc.invalid_companies, DEFAULT_INVALID_COMPANIES)
            .map(|s| s.trim().to_lowercase())
            .collect();
        let generic_domains = or_default(&doc.generic_domains, DEFAULT_GENERIC_DOMAINS)
            .map(normalize_domain)
            .collect();

        Ok(Self {
            known,
            known_lookup,
            domain_to_company,
            aliases: AliasTable::new(doc.aliases),
            ats_domains: doc.ats_domains.iter().map(|d| normalize_domain(d)).collect(),
            headhunter_domains: doc
                .headhunter_domains
                .iter()
                .map(|d| normalize_domain(d))
                .collect(),
            generic_domains,
            ignore,
            labels,
            ats_subject_markers,
            company_patterns,
            invalid_companies,
            referral_markers,
            follow_up_cues,
        })
    }

    /// Whitelist entry equal (case-insensitively) to `name`.
    pub fn known_company(&self, name: &str) -> Option<&str> {
        self.known_lookup
            .get(&name.trim().to_lowercase())
            .map(|&i| self.known[i].name.as_str())
    }

    /// Company mapped to `domain` or its nearest parent domain.
    pub fn company_for_domain(&self, domain: &str) -> Option<&str> {
        domain_suffixes(domain).find_map(|d| self.domain_to_company.get(d).map(String::as_str))
    }

    /// The ATS domain entry covering `domain`, if any.
    pub fn ats_domain<'a>(&self, domain: &'a str) -> Option<&'a str> {
        domain_suffixes(domain).find(|d| self.ats_domains.contains(*d))
    }

    pub fn is_headhunter_domain(&self, domain: &str) -> bool {
        domain_suffixes(domain).any(|d| self.headhunter_domains.contains(d))
    }

    pub fn is_generic_domain(&self, domain: &str) -> bool {
        domain_suffixes(domain).any(|d| self.generic_domains.contains(d))
    }

    /// Captures that must never become company names.
    pub fn is_invalid_company(&self, name: &str) -> bool {
        self.invalid_companies.contains(&name.trim().to_lowercase())
    }

    /// Tidy a captured company name and reject denylisted captures.
    ///
    /// Collapses whitespace, trims surrounding punctuation and a possessive
    /// `'s`, keeps the period of a trailing `Inc.`-style abbreviation.
    pub fn clean_company(&self, raw: &str) -> Option<String> {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut name = collapsed
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '.' && c != '&' && c != ')')
            .trim_end_matches("'s")
            .to_string();
        let lower = name.to_lowercase();
        if name.ends_with('.') && !NAME_ABBREVIATIONS.iter().any(|a| lower.ends_with(a)) {
            name = name.trim_end_matches('.').to_string();
        }
        let name = name.trim();
        if name.is_empty() || self.is_invalid_company(name) {
            return None;
        }
        Some(name.to_string())
    }

    pub fn has_referral_marker(&self, text: &str) -> bool {
        self.referral_markers.iter().any(|r| r.is_match(text))
    }
}

/// Lowercase, trim, and drop a leading `@` or `www.`.
pub fn normalize_domain(domain: &str) -> String {
    let d = domain.trim().trim_start_matches('@').to_lowercase();
    d.strip_prefix("www.").map(str::to_string).unwrap_or(d)
}

/// `a.b.example.com`, `b.example.com`, `example.com`. Stops at two labels.
pub fn domain_suffixes(domain: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(domain).filter(|d| !d.is_empty());
    std::iter::from_fn(move || {
        let current = rest?;
        rest = current
            .split_once('.')
            .map(|(_, tail)| tail)
            .filter(|tail| tail.contains('.'));
        Some(current)
    })
}

fn or_default<'a>(
    configured: &'a [String],
    defaults: &'static [&'static str],
) -> Box<dyn Iterator<Item = &'a str> + 'a> {
    if configured.is_empty() {
        Box::new(defaults.iter().copied())
    } else {
        Box::new(configured.iter().map(String::as_str))
    }
}

fn compile_one(key: &str, pattern: &str) -> Result<Regex, PatternError> {
    Regex::new(pattern).map_err(|e| PatternError::InvalidRegex {
        key: key.to_string(),
        pattern: pattern.to_string(),
        source: e,
    })
}

fn compile_all<'a>(
    key: &str,
    patterns: impl Iterator<Item = &'a str>,
    case_insensitive: bool,
) -> Result<Vec<Regex>, PatternError> {
    patterns
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            if case_insensitive {
                compile_one(key, &format!("(?i){p}"))
            } else {
                compile_one(key, p)
            }
        })
        .collect()
}

// ── Snapshot handle ─────────────────────────────────────────────────

/// Shared handle to the current pattern snapshot.
///
/// Readers clone the `Arc` once per run. `reload` compiles the new document
/// completely before swapping, so a failed reload leaves the old snapshot in
/// place.
pub struct PatternHandle {
    path: Option<PathBuf>,
    current: RwLock<Arc<PatternStore>>,
}

impl PatternHandle {
    pub fn new(store: PatternStore) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(store)),
        }
    }

    /// Load from a file; later `reload` calls re-read the same file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PatternError> {
        let path = path.into();
        let store = PatternStore::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(store)),
        })
    }

    pub fn snapshot(&self) -> Arc<PatternStore> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new snapshot.
    pub fn replace(&self, store: PatternStore) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(store);
    }

    /// Re-read the backing file. Without a file this is a no-op.
    pub fn reload(&self) -> Result<(), PatternError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let store = PatternStore::load(path)?;
        self.replace(store);
        info!(path = %path.display(), "Pattern store reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "known": ["CGI Inc.", "Dragos"],
        "domain_to_company": {"cgi.com": "CGI", "@Dragos.com": "Dragos"},
        "aliases": {"CGI": "CGI Inc."},
        "ats_domains": ["greenhouse.io"],
        "headhunter_domains": ["randstad.com"],
        "ignore": ["newsletter"],
        "labels": {"rejection": ["unfortunately"]}
    }"#;

    #[test]
    fn compiles_document() {
        let store = PatternStore::from_json(DOC).unwrap();
        assert_eq!(store.known.len(), 2);
        assert_eq!(store.known_company("cgi inc."), Some("CGI Inc."));
        assert_eq!(store.company_for_domain("cgi.com"), Some("CGI"));
        assert_eq!(store.company_for_domain("dragos.com"), Some("Dragos"));
        assert_eq!(store.labels[0].0, Label::Rejection);
        assert_eq!(store.labels[0].1.len(), 1);
    }

    #[test]
    fn domain_lookup_walks_parents() {
        let store = PatternStore::from_json(DOC).unwrap();
        assert_eq!(store.company_for_domain("mail.cgi.com"), Some("CGI"));
        assert_eq!(store.ats_domain("us.greenhouse.io"), Some("greenhouse.io"));
        assert!(store.is_headhunter_domain("randstad.com"));
        assert!(store.company_for_domain("com").is_none());
    }

    #[test]
    fn defaults_fill_empty_lists() {
        let store = PatternStore::from_json(DOC).unwrap();
        assert!(store.is_invalid_company("Resume"));
        assert!(store.is_invalid_company("CV"));
        assert!(store.is_generic_domain("gmail.com"));
        assert!(store.has_referral_marker("I wanted to introduce you"));
        assert!(!store.company_patterns.is_empty());
    }

    #[test]
    fn clean_company_trims_and_denies() {
        let store = PatternStore::from_json(DOC).unwrap();
        assert_eq!(store.clean_company("  Acme   Corp. ").as_deref(), Some("Acme Corp."));
        assert_eq!(store.clean_company("Globex.").as_deref(), Some("Globex"));
        assert_eq!(store.clean_company("Initech's").as_deref(), Some("Initech"));
        assert_eq!(store.clean_company("\"Hooli\",").as_deref(), Some("Hooli"));
        assert!(store.clean_company("Resume").is_none());
        assert!(store.clean_company(" - ").is_none());
    }

    #[test]
    fn empty_document_is_rejected() {
        let result = PatternStore::from_json(r#"{"known": ["Acme"]}"#);
        assert!(matches!(result, Err(PatternError::Empty)));
    }

    #[test]
    fn fallback_label_cannot_have_rules() {
        let result = PatternStore::from_json(
            r#"{"labels": {"rejection": ["unfortunately"], "other": ["hello"]}}"#,
        );
        match result {
            Err(PatternError::UnruledLabel(label)) => assert_eq!(label, "other"),
            other => panic!("Expected UnruledLabel, got {other:?}"),
        }
    }

    #[test]
    fn invalid_regex_names_the_key() {
        let result = PatternStore::from_json(r#"{"ignore": ["(unclosed"]}"#);
        match result {
            Err(PatternError::InvalidRegex { key, .. }) => assert_eq!(key, "ignore"),
            other => panic!("Expected InvalidRegex, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            PatternStore::from_json("{not json"),
            Err(PatternError::Parse(_))
        ));
    }

    #[test]
    fn known_matcher_respects_boundaries() {
        let store = PatternStore::from_json(DOC).unwrap();
        let dragos = store.known.iter().find(|k| k.name == "Dragos").unwrap();
        assert!(dragos.matcher.is_match("Interview with DRAGOS tomorrow"));
        assert!(!dragos.matcher.is_match("Dragoslav says hi"));
        let cgi = store.known.iter().find(|k| k.name == "CGI Inc.").unwrap();
        assert!(cgi.matcher.is_match("Welcome to CGI Inc. careers"));
    }

    #[test]
    fn domain_suffixes_stop_at_two_labels() {
        let parts: Vec<&str> = domain_suffixes("a.b.example.com").collect();
        assert_eq!(parts, vec!["a.b.example.com", "b.example.com", "example.com"]);
        assert_eq!(domain_suffixes("").count(), 0);
    }

    #[test]
    fn handle_reload_swaps_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{DOC}").unwrap();

        let handle = PatternHandle::load(file.path()).unwrap();
        let before = handle.snapshot();
        assert_eq!(before.known.len(), 2);

        std::fs::write(file.path(), r#"{"known": ["Acme"], "ignore": ["promo"]}"#).unwrap();
        handle.reload().unwrap();

        let after = handle.snapshot();
        assert_eq!(after.known.len(), 1);
        // The old snapshot is untouched.
        assert_eq!(before.known.len(), 2);
    }

    #[test]
    fn failed_reload_keeps_old_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{DOC}").unwrap();
        let handle = PatternHandle::load(file.path()).unwrap();

        std::fs::write(file.path(), "{broken").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().known.len(), 2);
    }
}
