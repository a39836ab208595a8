//! `Database` trait — the record store behind correlation and persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::alias::CanonicalName;
use crate::pipeline::types::{DecisionRecord, Label, ResolutionTier};

/// The most recent earlier decision for a sender or domain.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorMessage {
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub label: Label,
    /// Canonical company, if the prior decision resolved one.
    pub company: Option<String>,
    pub company_tier: ResolutionTier,
    pub company_confidence: f32,
}

impl PriorMessage {
    /// Prior view of a decision, for caches that sit in front of the store.
    pub fn from_record(record: &DecisionRecord) -> Self {
        Self {
            message_id: record.message_id.clone(),
            received_at: record.received_at,
            label: record.classification.label,
            company: Some(record.company.canonical.clone()).filter(|c| !c.is_empty()),
            company_tier: record.company.tier,
            company_confidence: record.company.confidence,
        }
    }

    /// Whether this decision sorts before `(at, message_id)` in processing
    /// order. A message never precedes itself.
    pub fn precedes(&self, at: DateTime<Utc>, message_id: &str) -> bool {
        self.message_id != message_id
            && (self.received_at, self.message_id.as_str()) < (at, message_id)
    }

    /// Later of two candidates in processing order. Ties keep `self`.
    pub fn latest(self, other: Self) -> Self {
        if (other.received_at, &other.message_id) > (self.received_at, &self.message_id) {
            other
        } else {
            self
        }
    }
}

/// A company identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted decision, summary columns plus the full JSON record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDecision {
    pub message_id: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub label: Label,
    pub company: Option<String>,
    pub record_json: String,
}

/// Backend-agnostic persistence used by the pipeline.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Correlation lookups ─────────────────────────────────────────

    /// Latest decision from `sender` that precedes message `message_id`
    /// received at `at`. Order is `(received_at, message_id)`, the same order
    /// a batch is processed in, so re-runs see the same prior.
    async fn latest_by_sender(
        &self,
        sender: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError>;

    /// Same as [`Database::latest_by_sender`], keyed by sender domain.
    async fn latest_by_domain(
        &self,
        domain: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError>;

    // ── Companies ───────────────────────────────────────────────────

    /// Return the company with this canonical name, creating it if needed.
    /// The flag is `true` when a new row was created.
    async fn find_or_create_company(
        &self,
        name: &CanonicalName,
    ) -> Result<(CompanyRecord, bool), DatabaseError>;

    /// Look a company up by name, case-insensitively.
    async fn get_company(&self, name: &str) -> Result<Option<CompanyRecord>, DatabaseError>;

    /// All companies, ordered by name.
    async fn list_companies(&self) -> Result<Vec<CompanyRecord>, DatabaseError>;

    // ── Decisions ───────────────────────────────────────────────────

    /// Insert or replace the decision for `record.message_id`.
    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DatabaseError>;

    async fn get_decision(&self, message_id: &str) -> Result<Option<StoredDecision>, DatabaseError>;

    async fn count_decisions(&self) -> Result<usize, DatabaseError>;
}

/// Case-insensitive identity key for company names.
pub(crate) fn company_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
