//! Shared types for the message classification pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

// ── Canonical message ───────────────────────────────────────────────

/// Canonical form of an inbound message, produced by the metadata extractor.
///
/// Immutable once built; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Provider message id (Message-ID header or provider id).
    pub id: String,
    /// Sender address, lowercased. May be empty.
    pub sender: String,
    /// Sender domain, lowercased. Empty when the address is malformed.
    pub sender_domain: String,
    pub subject: String,
    /// Plaintext body (derived from HTML when no text part exists).
    pub body: String,
    /// Original HTML body, if any.
    pub html: Option<String>,
    /// Headers keyed by lowercased name.
    pub headers: BTreeMap<String, String>,
    pub thread_id: String,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Subject and body joined, the text handed to the statistical model.
    pub fn classifier_text(&self) -> String {
        format!("{}\n{}", self.subject, self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ── Labels ──────────────────────────────────────────────────────────

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    JobApplication,
    InterviewInvite,
    Rejection,
    HeadHunter,
    Noise,
    Other,
}

impl Label {
    pub const ALL: [Label; 6] = [
        Label::JobApplication,
        Label::InterviewInvite,
        Label::Rejection,
        Label::HeadHunter,
        Label::Noise,
        Label::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobApplication => "job_application",
            Self::InterviewInvite => "interview_invite",
            Self::Rejection => "rejection",
            Self::HeadHunter => "head_hunter",
            Self::Noise => "noise",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown label '{s}'"))
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Where a label came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationSource {
    /// A rule fired; carries the rule identifier.
    Rule(String),
    /// The statistical classifier won the merge.
    Model,
    /// Neither rules nor model produced anything.
    Abstain,
}

impl fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(id) => write!(f, "rule:{id}"),
            Self::Model => f.write_str("model"),
            Self::Abstain => f.write_str("abstain"),
        }
    }
}

impl Serialize for ClassificationSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Final label decision for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: Label,
    pub confidence: f32,
    pub source: ClassificationSource,
    /// Override identifiers, in the order they were applied.
    pub overrides: Vec<String>,
    /// Label before the first override, if any override fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_override_label: Option<Label>,
}

impl ClassificationResult {
    pub fn new(label: Label, confidence: f32, source: ClassificationSource) -> Self {
        Self {
            label,
            confidence: confidence.clamp(0.0, 1.0),
            source,
            overrides: Vec::new(),
            pre_override_label: None,
        }
    }

    /// Both rules and model abstained: `other` at zero confidence.
    pub fn abstain() -> Self {
        Self::new(Label::Other, 0.0, ClassificationSource::Abstain)
    }

    /// Replace the label, appending to the audit trail. The source is kept.
    pub fn apply_override(&mut self, id: &str, label: Label) {
        if self.pre_override_label.is_none() {
            self.pre_override_label = Some(self.label);
        }
        self.overrides.push(id.to_string());
        self.label = label;
    }
}

// ── Company resolution ──────────────────────────────────────────────

/// Company resolution tier, ordered by trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionTier {
    None = 0,
    Whitelist = 1,
    Domain = 2,
    Statistical = 3,
    BodyRegex = 4,
}

impl ResolutionTier {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Whitelist),
            2 => Some(Self::Domain),
            3 => Some(Self::Statistical),
            4 => Some(Self::BodyRegex),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Whitelist => "whitelist",
            Self::Domain => "domain",
            Self::Statistical => "statistical",
            Self::BodyRegex => "body_regex",
        }
    }
}

impl Serialize for ResolutionTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// Which company a message concerns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyResolution {
    /// Name as extracted, before alias lookup. Empty on abstention.
    pub raw_name: String,
    /// Alias-resolved canonical name. Empty on abstention.
    pub canonical: String,
    pub tier: ResolutionTier,
    pub confidence: f32,
    /// Company taken from a correlated prior message.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub inherited: bool,
    /// Display-only "via <ATS>" hint when nothing else resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ats_fallback: Option<String>,
}

impl CompanyResolution {
    pub fn abstain() -> Self {
        Self {
            raw_name: String::new(),
            canonical: String::new(),
            tier: ResolutionTier::None,
            confidence: 0.0,
            inherited: false,
            ats_fallback: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.canonical.is_empty()
    }
}

// ── Status dates ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateKind {
    Response,
    Rejection,
    Interview,
    FollowUp,
}

/// Extracted status dates, zero or more per kind. Sorted and de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StatusDates(BTreeMap<DateKind, Vec<DateTime<Utc>>>);

impl StatusDates {
    pub fn push(&mut self, kind: DateKind, at: DateTime<Utc>) {
        let dates = self.0.entry(kind).or_default();
        if let Err(pos) = dates.binary_search(&at) {
            dates.insert(pos, at);
        }
    }

    pub fn get(&self, kind: DateKind) -> &[DateTime<Utc>] {
        self.0.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateKind, &DateTime<Utc>)> {
        self.0
            .iter()
            .flat_map(|(kind, dates)| dates.iter().map(move |d| (*kind, d)))
    }
}

// ── Correlation ─────────────────────────────────────────────────────

/// What a prior message was matched on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum CorrelationKey {
    Sender(String),
    SenderDomain(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender(s) => write!(f, "sender:{s}"),
            Self::SenderDomain(d) => write!(f, "sender_domain:{d}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CorrelationDecision {
    /// No prior message inside the window.
    New { window_days: i64 },
    /// Follow-up to an existing conversation.
    Existing {
        key: CorrelationKey,
        prior_message_id: String,
        /// Age of the most recent prior message, in whole days.
        age_days: i64,
        /// Canonical company of the prior message, inherited by this one.
        #[serde(skip_serializing_if = "Option::is_none")]
        company: Option<String>,
        prior_label: Label,
        window_days: i64,
    },
}

impl CorrelationDecision {
    pub fn is_correlated(&self) -> bool {
        matches!(self, Self::Existing { .. })
    }

    pub fn inherited_company(&self) -> Option<&str> {
        match self {
            Self::Existing { company, .. } => company.as_deref(),
            Self::New { .. } => None,
        }
    }
}

// ── Decision record ─────────────────────────────────────────────────

/// Debug-mode audit of how a decision was reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionTrace {
    pub label_rule: Option<String>,
    pub company_rule: Option<String>,
    pub ignore_rules_skipped: bool,
    pub model_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_label: Option<Label>,
    pub model_confidence: f32,
    /// Company tiers attempted, in order, with the outcome of each.
    pub tiers: Vec<String>,
    pub correlation_key: Option<String>,
}

/// One decision per message, handed to storage as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub message_id: String,
    pub thread_id: String,
    pub sender: String,
    pub sender_domain: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub classification: ClassificationResult,
    pub company: CompanyResolution,
    pub dates: StatusDates,
    pub correlation: CorrelationDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<DecisionTrace>,
}

// ── Batch outcome ───────────────────────────────────────────────────

/// Run-level counters, for observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub processed: u64,
    pub ignored: u64,
    pub company_found: u64,
    /// Extraction or storage failures. Not counted as ignored.
    pub failed: u64,
}

/// A message that could not be processed. Reported, never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageFailure {
    pub message_id: String,
    pub stage: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub decisions: Vec<DecisionRecord>,
    pub failures: Vec<MessageFailure>,
    pub counters: RunCounters,
}
