//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 UTC with fixed nanosecond precision and a `Z` suffix, so text
//! comparison orders them exactly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::alias::CanonicalName;
use crate::pipeline::types::{DecisionRecord, Label, ResolutionTier};
use crate::store::migrations;
use crate::store::traits::{CompanyRecord, Database, PriorMessage, StoredDecision, company_key};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn latest_where(
        &self,
        column: &str,
        value: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PRIOR_COLUMNS} FROM decisions
                     WHERE {column} = ?1 AND message_id != ?3
                       AND (received_at < ?2 OR (received_at = ?2 AND message_id < ?3))
                     ORDER BY received_at DESC, message_id DESC LIMIT 1"
                ),
                params![value, format_datetime(at), message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_by_{column}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_prior(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_by_{column}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn format_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_label(s: &str) -> Result<Label, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("label column: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const PRIOR_COLUMNS: &str = "message_id, received_at, label, company, company_tier, company_confidence";

const COMPANY_COLUMNS: &str = "id, name, created_at";

const DECISION_COLUMNS: &str = "message_id, sender, received_at, label, company, record";

fn row_to_prior(row: &libsql::Row) -> Result<PriorMessage, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("prior row parse: {e}"));
    let received: String = row.get(1).map_err(parse)?;
    let label: String = row.get(2).map_err(parse)?;
    let tier: i64 = row.get(4).map_err(parse)?;
    let confidence: f64 = row.get(5).map_err(parse)?;
    Ok(PriorMessage {
        message_id: row.get(0).map_err(parse)?,
        received_at: parse_datetime(&received),
        label: parse_label(&label)?,
        company: row.get::<String>(3).ok().filter(|c| !c.is_empty()),
        company_tier: u8::try_from(tier)
            .ok()
            .and_then(ResolutionTier::from_u8)
            .unwrap_or(ResolutionTier::None),
        company_confidence: confidence as f32,
    })
}

fn row_to_company(row: &libsql::Row) -> Result<CompanyRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("company row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let created: String = row.get(2).map_err(parse)?;
    Ok(CompanyRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| DatabaseError::Serialization(format!("company id '{id}': {e}")))?,
        name: row.get(1).map_err(parse)?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_decision(row: &libsql::Row) -> Result<StoredDecision, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("decision row parse: {e}"));
    let received: String = row.get(2).map_err(parse)?;
    let label: String = row.get(3).map_err(parse)?;
    Ok(StoredDecision {
        message_id: row.get(0).map_err(parse)?,
        sender: row.get(1).map_err(parse)?,
        received_at: parse_datetime(&received),
        label: parse_label(&label)?,
        company: row.get::<String>(4).ok().filter(|c| !c.is_empty()),
        record_json: row.get(5).map_err(parse)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Correlation lookups ─────────────────────────────────────────

    async fn latest_by_sender(
        &self,
        sender: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError> {
        self.latest_where("sender", sender, at, message_id).await
    }

    async fn latest_by_domain(
        &self,
        domain: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError> {
        self.latest_where("sender_domain", domain, at, message_id).await
    }

    // ── Companies ───────────────────────────────────────────────────

    async fn find_or_create_company(
        &self,
        name: &CanonicalName,
    ) -> Result<(CompanyRecord, bool), DatabaseError> {
        if let Some(existing) = self.get_company(name.as_str()).await? {
            return Ok((existing, false));
        }

        let id = Uuid::new_v4();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO companies (id, name, name_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name_key) DO NOTHING",
                params![
                    id.to_string(),
                    name.as_str(),
                    company_key(name.as_str()),
                    format_datetime(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_or_create_company: {e}")))?;

        let record = self.get_company(name.as_str()).await?.ok_or_else(|| {
            DatabaseError::Constraint(format!("company '{name}' missing after insert"))
        })?;
        if inserted > 0 {
            debug!(id = %record.id, name = %record.name, "Company created");
        }
        Ok((record, inserted > 0))
    }

    async fn get_company(&self, name: &str) -> Result<Option<CompanyRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE name_key = ?1"),
                params![company_key(name)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_company: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_company(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_company: {e}"))),
        }
    }

    async fn list_companies(&self) -> Result<Vec<CompanyRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies ORDER BY name ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_companies: {e}")))?;

        let mut companies = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_company(&row) {
                Ok(company) => companies.push(company),
                Err(e) => tracing::warn!("Skipping company row: {e}"),
            }
        }
        Ok(companies)
    }

    // ── Decisions ───────────────────────────────────────────────────

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DatabaseError> {
        let record_json = serde_json::to_string(record)
            .map_err(|e| DatabaseError::Serialization(format!("record_decision: {e}")))?;
        let overrides = serde_json::to_string(&record.classification.overrides)
            .map_err(|e| DatabaseError::Serialization(format!("record_decision: {e}")))?;
        let company = Some(record.company.canonical.as_str()).filter(|c| !c.is_empty());

        self.conn()
            .execute(
                "INSERT INTO decisions (message_id, thread_id, sender, sender_domain, subject,
                    received_at, label, confidence, source, overrides, company, company_tier,
                    company_confidence, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(message_id) DO UPDATE SET
                    thread_id = excluded.thread_id,
                    sender = excluded.sender,
                    sender_domain = excluded.sender_domain,
                    subject = excluded.subject,
                    received_at = excluded.received_at,
                    label = excluded.label,
                    confidence = excluded.confidence,
                    source = excluded.source,
                    overrides = excluded.overrides,
                    company = excluded.company,
                    company_tier = excluded.company_tier,
                    company_confidence = excluded.company_confidence,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![
                    record.message_id.as_str(),
                    record.thread_id.as_str(),
                    record.sender.as_str(),
                    record.sender_domain.as_str(),
                    record.subject.as_str(),
                    format_datetime(record.received_at),
                    record.classification.label.as_str(),
                    f64::from(record.classification.confidence),
                    record.classification.source.to_string(),
                    overrides,
                    opt_text(company),
                    i64::from(record.company.tier.as_u8()),
                    f64::from(record.company.confidence),
                    record_json,
                    format_datetime(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_decision: {e}")))?;

        debug!(id = %record.message_id, label = %record.classification.label, "Decision recorded");
        Ok(())
    }

    async fn get_decision(&self, message_id: &str) -> Result<Option<StoredDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_decision: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_decision(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_decision: {e}"))),
        }
    }

    async fn count_decisions(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM decisions", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_decisions: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_decisions: {e}")))?;
                Ok(usize::try_from(count).unwrap_or(0))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_decisions: {e}"))),
        }
    }
}
