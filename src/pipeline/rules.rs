//! Ordered rules engine for label and company candidates.
//!
//! Rules form one flat table evaluated top to bottom in four bands:
//! - `ats_subject.*` explicit ATS subject markers
//! - `colon_prefix` "Company: …" subjects (company candidate only)
//! - `headhunter_domain`, then `label.<label>#n` regex tables
//! - `ignore#n` phrases → noise, skipped for correlated messages
//!
//! The label search and the company search each stop at their first hit.
//! A regex with a named `company` group also yields a company candidate.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::pipeline::patterns::PatternStore;
use crate::pipeline::types::{Label, RawMessage};

pub const ATS_SUBJECT_CONFIDENCE: f32 = 0.95;
pub const COLON_PREFIX_CONFIDENCE: f32 = 0.90;
pub const HEADHUNTER_DOMAIN_CONFIDENCE: f32 = 0.85;
pub const LABEL_REGEX_CONFIDENCE: f32 = 0.85;
pub const IGNORE_CONFIDENCE: f32 = 0.90;

/// `Company: rest of subject`, after any reply/forward prefixes.
static COLON_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?i:re|fwd?|aw|sv|tr)\s*:\s*)*(?P<company>[A-Z0-9][^:]{0,59}?)\s*:\s*\S")
        .expect("valid regex")
});

/// Which message field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Subject,
    SenderDomain,
    /// Subject and body.
    Content,
}

/// What a matching rule contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Label(Label),
    /// Company candidate only.
    Company,
    /// Ignore phrase: `noise`.
    Ignore,
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    /// Sender domain listed under `headhunter_domains`.
    HeadhunterDomain,
}

/// One entry of the rule table.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub field: RuleField,
    pub action: RuleAction,
    pub confidence: f32,
    matcher: Matcher,
}

impl Rule {
    fn regex(id: String, field: RuleField, action: RuleAction, confidence: f32, regex: Regex) -> Self {
        Self {
            id,
            field,
            action,
            confidence,
            matcher: Matcher::Regex(regex),
        }
    }

    fn has_company_group(&self) -> bool {
        match &self.matcher {
            Matcher::Regex(regex) => regex.capture_names().flatten().any(|n| n == "company"),
            Matcher::HeadhunterDomain => false,
        }
    }
}

/// A label produced by a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub rule_id: String,
    pub label: Label,
    pub confidence: f32,
}

/// A company name captured by a rule, already cleaned and denylist-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyHit {
    pub rule_id: String,
    pub name: String,
    pub confidence: f32,
}

/// Result of evaluating one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub label: Option<RuleHit>,
    pub company: Option<CompanyHit>,
    /// Ignore rules were not consulted because the message is correlated.
    pub ignore_skipped: bool,
}

/// Rule table compiled from one pattern snapshot.
pub struct RuleEngine<'a> {
    patterns: &'a PatternStore,
    rules: Vec<Rule>,
}

impl<'a> RuleEngine<'a> {
    /// Build the ordered rule table for a snapshot.
    pub fn new(patterns: &'a PatternStore) -> Self {
        let mut rules = Vec::new();

        for (i, marker) in patterns.ats_subject_markers.iter().enumerate() {
            rules.push(Rule::regex(
                format!("ats_subject.{}#{i}", marker.label),
                RuleField::Subject,
                RuleAction::Label(marker.label),
                ATS_SUBJECT_CONFIDENCE,
                marker.regex.clone(),
            ));
        }

        rules.push(Rule::regex(
            "colon_prefix".into(),
            RuleField::Subject,
            RuleAction::Company,
            COLON_PREFIX_CONFIDENCE,
            COLON_PREFIX.clone(),
        ));

        rules.push(Rule {
            id: "headhunter_domain".into(),
            field: RuleField::SenderDomain,
            action: RuleAction::Label(Label::HeadHunter),
            confidence: HEADHUNTER_DOMAIN_CONFIDENCE,
            matcher: Matcher::HeadhunterDomain,
        });

        for (label, regexes) in &patterns.labels {
            for (i, regex) in regexes.iter().enumerate() {
                rules.push(Rule::regex(
                    format!("label.{label}#{i}"),
                    RuleField::Content,
                    RuleAction::Label(*label),
                    LABEL_REGEX_CONFIDENCE,
                    regex.clone(),
                ));
            }
        }

        for (i, regex) in patterns.ignore.iter().enumerate() {
            rules.push(Rule::regex(
                format!("ignore#{i}"),
                RuleField::Content,
                RuleAction::Ignore,
                IGNORE_CONFIDENCE,
                regex.clone(),
            ));
        }

        Self { patterns, rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate a message against the table.
    ///
    /// `correlated` messages skip the ignore band entirely.
    pub fn evaluate(&self, message: &RawMessage, correlated: bool) -> RuleOutcome {
        let content = message.classifier_text();
        let mut outcome = RuleOutcome::default();

        for rule in &self.rules {
            if outcome.label.is_some() && outcome.company.is_some() {
                break;
            }
            if rule.action == RuleAction::Ignore && correlated {
                outcome.ignore_skipped = true;
                continue;
            }

            let wants_label = outcome.label.is_none() && rule.action != RuleAction::Company;
            let wants_company = outcome.company.is_none()
                && (rule.action == RuleAction::Company || rule.has_company_group());
            if !wants_label && !wants_company {
                continue;
            }

            let text = match rule.field {
                RuleField::Subject => message.subject.as_str(),
                RuleField::SenderDomain => message.sender_domain.as_str(),
                RuleField::Content => content.as_str(),
            };

            let captured = match &rule.matcher {
                Matcher::HeadhunterDomain => {
                    if text.is_empty() || !self.patterns.is_headhunter_domain(text) {
                        continue;
                    }
                    None
                }
                Matcher::Regex(regex) => {
                    let Some(caps) = regex.captures(text) else {
                        continue;
                    };
                    caps.name("company").map(|m| m.as_str().to_string())
                }
            };

            if wants_company
                && let Some(name) = captured.and_then(|raw| self.patterns.clean_company(&raw))
            {
                debug!(rule = %rule.id, company = %name, "Company candidate from rule");
                outcome.company = Some(CompanyHit {
                    rule_id: rule.id.clone(),
                    name,
                    confidence: rule.confidence,
                });
            }

            if wants_label {
                let label = match rule.action {
                    RuleAction::Label(label) => label,
                    RuleAction::Ignore => Label::Noise,
                    RuleAction::Company => continue,
                };
                debug!(
                    id = %message.id,
                    rule = %rule.id,
                    label = %label,
                    "Message matched label rule"
                );
                outcome.label = Some(RuleHit {
                    rule_id: rule.id.clone(),
                    label,
                    confidence: rule.confidence,
                });
            }
        }

        outcome
    }
}
