//! In-memory `Database` for tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::alias::CanonicalName;
use crate::pipeline::types::DecisionRecord;
use crate::store::traits::{CompanyRecord, Database, PriorMessage, StoredDecision, company_key};

#[derive(Default)]
struct State {
    companies: HashMap<String, CompanyRecord>,
    decisions: HashMap<String, (PriorMessage, StoredDecision, String)>,
}

/// `Database` backed by hash maps behind a tokio `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn latest_where(
        &self,
        at: DateTime<Utc>,
        message_id: &str,
        matches: impl Fn(&StoredDecision, &str) -> bool,
    ) -> Option<PriorMessage> {
        let state = self.state.read().await;
        state
            .decisions
            .values()
            .filter(|(prior, stored, domain)| {
                prior.precedes(at, message_id) && matches(stored, domain.as_str())
            })
            .max_by(|(a, ..), (b, ..)| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.message_id.cmp(&b.message_id))
            })
            .map(|(prior, ..)| prior.clone())
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn latest_by_sender(
        &self,
        sender: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError> {
        Ok(self
            .latest_where(at, message_id, |stored, _| stored.sender == sender)
            .await)
    }

    async fn latest_by_domain(
        &self,
        domain: &str,
        at: DateTime<Utc>,
        message_id: &str,
    ) -> Result<Option<PriorMessage>, DatabaseError> {
        Ok(self
            .latest_where(at, message_id, |_, d| d == domain)
            .await)
    }

    async fn find_or_create_company(
        &self,
        name: &CanonicalName,
    ) -> Result<(CompanyRecord, bool), DatabaseError> {
        let key = company_key(name.as_str());
        let mut state = self.state.write().await;
        if let Some(existing) = state.companies.get(&key) {
            return Ok((existing.clone(), false));
        }
        let record = CompanyRecord {
            id: Uuid::new_v4(),
            name: name.as_str().to_string(),
            created_at: Utc::now(),
        };
        state.companies.insert(key, record.clone());
        Ok((record, true))
    }

    async fn get_company(&self, name: &str) -> Result<Option<CompanyRecord>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.companies.get(&company_key(name)).cloned())
    }

    async fn list_companies(&self) -> Result<Vec<CompanyRecord>, DatabaseError> {
        let state = self.state.read().await;
        let mut companies: Vec<CompanyRecord> = state.companies.values().cloned().collect();
        companies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(companies)
    }

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DatabaseError> {
        let record_json = serde_json::to_string(record)
            .map_err(|e| DatabaseError::Serialization(format!("record_decision: {e}")))?;
        let prior = PriorMessage::from_record(record);
        let stored = StoredDecision {
            message_id: record.message_id.clone(),
            sender: record.sender.clone(),
            received_at: record.received_at,
            label: record.classification.label,
            company: prior.company.clone(),
            record_json,
        };
        let mut state = self.state.write().await;
        state.decisions.insert(
            record.message_id.clone(),
            (prior, stored, record.sender_domain.clone()),
        );
        Ok(())
    }

    async fn get_decision(&self, message_id: &str) -> Result<Option<StoredDecision>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.decisions.get(message_id).map(|(_, stored, _)| stored.clone()))
    }

    async fn count_decisions(&self) -> Result<usize, DatabaseError> {
        Ok(self.state.read().await.decisions.len())
    }
}
