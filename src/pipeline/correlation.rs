//! Correlation engine — links a message to a recent prior conversation.
//!
//! Lookup order is sender first, then sender domain. Free-mail, ATS and
//! head-hunter domains are shared by unrelated senders and are never used
//! as a key. Same-batch predecessors are also held in [`BatchCache`]; a
//! lookup checks both and keeps the later prior, the store winning ties.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::patterns::PatternStore;
use crate::pipeline::types::{CorrelationDecision, CorrelationKey, DecisionRecord, RawMessage};
use crate::store::traits::{Database, PriorMessage};

/// Latest decision per correlation key within the current batch.
#[derive(Debug, Default)]
pub struct BatchCache {
    entries: HashMap<CorrelationKey, PriorMessage>,
}

impl BatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, key: &CorrelationKey, at: DateTime<Utc>, message_id: &str) -> Option<&PriorMessage> {
        self.entries
            .get(key)
            .filter(|prior| prior.precedes(at, message_id))
    }

    fn insert(&mut self, key: CorrelationKey, prior: PriorMessage) {
        let prior = match self.entries.remove(&key) {
            Some(existing) => existing.latest(prior),
            None => prior,
        };
        self.entries.insert(key, prior);
    }
}

/// Correlation outcome plus the prior message it was matched to.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub decision: CorrelationDecision,
    pub prior: Option<PriorMessage>,
}

impl Correlation {
    pub fn is_correlated(&self) -> bool {
        self.decision.is_correlated()
    }

    pub fn key(&self) -> Option<&CorrelationKey> {
        match &self.decision {
            CorrelationDecision::Existing { key, .. } => Some(key),
            CorrelationDecision::New { .. } => None,
        }
    }
}

pub struct CorrelationEngine<'a> {
    store: &'a dyn Database,
    patterns: &'a PatternStore,
    window_days: i64,
}

impl<'a> CorrelationEngine<'a> {
    pub fn new(store: &'a dyn Database, patterns: &'a PatternStore, window_days: i64) -> Self {
        Self {
            store,
            patterns,
            window_days,
        }
    }

    /// Keys this message can be correlated on, in lookup order.
    pub fn keys(&self, sender: &str, sender_domain: &str) -> Vec<CorrelationKey> {
        let mut keys = Vec::with_capacity(2);
        if !sender.is_empty() {
            keys.push(CorrelationKey::Sender(sender.to_string()));
        }
        if self.domain_is_key(sender_domain) {
            keys.push(CorrelationKey::SenderDomain(sender_domain.to_string()));
        }
        keys
    }

    fn domain_is_key(&self, domain: &str) -> bool {
        !domain.is_empty()
            && !self.patterns.is_generic_domain(domain)
            && self.patterns.ats_domain(domain).is_none()
            && !self.patterns.is_headhunter_domain(domain)
    }

    /// Find the latest prior message inside the window.
    pub async fn correlate(
        &self,
        message: &RawMessage,
        cache: &BatchCache,
    ) -> Result<Correlation, DatabaseError> {
        for key in self.keys(&message.sender, &message.sender_domain) {
            let Some(prior) = self.lookup(&key, message, cache).await? else {
                continue;
            };
            let age_days = (message.received_at - prior.received_at).num_days();
            if age_days > self.window_days {
                debug!(
                    id = %message.id,
                    key = %key,
                    age_days,
                    "Prior message outside correlation window"
                );
                continue;
            }

            debug!(
                id = %message.id,
                key = %key,
                prior = %prior.message_id,
                age_days,
                "Message correlated"
            );
            return Ok(Correlation {
                decision: CorrelationDecision::Existing {
                    key,
                    prior_message_id: prior.message_id.clone(),
                    age_days,
                    company: prior.company.clone(),
                    prior_label: prior.label,
                    window_days: self.window_days,
                },
                prior: Some(prior),
            });
        }

        Ok(Correlation {
            decision: CorrelationDecision::New {
                window_days: self.window_days,
            },
            prior: None,
        })
    }

    async fn lookup(
        &self,
        key: &CorrelationKey,
        message: &RawMessage,
        cache: &BatchCache,
    ) -> Result<Option<PriorMessage>, DatabaseError> {
        let stored = match key {
            CorrelationKey::Sender(sender) => {
                self.store
                    .latest_by_sender(sender, message.received_at, &message.id)
                    .await?
            }
            CorrelationKey::SenderDomain(domain) => {
                self.store
                    .latest_by_domain(domain, message.received_at, &message.id)
                    .await?
            }
        };
        let cached = cache.get(key, message.received_at, &message.id).cloned();
        Ok(match (stored, cached) {
            (Some(stored), Some(cached)) => Some(stored.latest(cached)),
            (stored, cached) => stored.or(cached),
        })
    }

    /// Make a stored decision visible to later messages in the batch.
    pub fn remember(&self, cache: &mut BatchCache, record: &DecisionRecord) {
        let prior = PriorMessage::from_record(record);
        for key in self.keys(&record.sender, &record.sender_domain) {
            cache.insert(key, prior.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    use crate::pipeline::types::{
        ClassificationResult, ClassificationSource, CompanyResolution, Label, ResolutionTier,
        StatusDates,
    };
    use crate::store::memory::MemoryStore;

    const DOC: &str = r#"{
        "ats_domains": ["greenhouse.io"],
        "headhunter_domains": ["randstad.com"],
        "labels": {"rejection": ["unfortunately"]}
    }"#;

    fn patterns() -> PatternStore {
        PatternStore::from_json(DOC).unwrap()
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 5, 9, 0, 0).unwrap()
    }

    fn message(id: &str, sender: &str, at: DateTime<Utc>) -> RawMessage {
        let domain = sender.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
        RawMessage {
            id: id.into(),
            sender: sender.into(),
            sender_domain: domain,
            subject: "Hello".into(),
            body: "Body".into(),
            html: None,
            headers: BTreeMap::new(),
            thread_id: id.into(),
            received_at: at,
        }
    }

    fn record(msg: &RawMessage, label: Label, company: &str) -> DecisionRecord {
        DecisionRecord {
            message_id: msg.id.clone(),
            thread_id: msg.thread_id.clone(),
            sender: msg.sender.clone(),
            sender_domain: msg.sender_domain.clone(),
            subject: msg.subject.clone(),
            received_at: msg.received_at,
            classification: ClassificationResult::new(label, 0.9, ClassificationSource::Model),
            company: CompanyResolution {
                raw_name: company.into(),
                canonical: company.into(),
                tier: ResolutionTier::Domain,
                confidence: 0.9,
                inherited: false,
                ats_fallback: None,
            },
            dates: StatusDates::default(),
            correlation: CorrelationDecision::New { window_days: 365 },
            trace: None,
        }
    }

    #[tokio::test]
    async fn no_prior_is_new() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let msg = message("m1", "jane@dragos.com", base());

        let result = engine.correlate(&msg, &BatchCache::new()).await.unwrap();
        assert_eq!(result.decision, CorrelationDecision::New { window_days: 365 });
        assert!(result.prior.is_none());
    }

    #[tokio::test]
    async fn sender_match_inherits_company() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let first = message("m1", "jane@dragos.com", base() - Duration::days(40));
        store.record_decision(&record(&first, Label::HeadHunter, "Dragos")).await.unwrap();

        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let msg = message("m2", "jane@dragos.com", base());
        let result = engine.correlate(&msg, &BatchCache::new()).await.unwrap();

        match &result.decision {
            CorrelationDecision::Existing { key, age_days, company, prior_label, .. } => {
                assert_eq!(key, &CorrelationKey::Sender("jane@dragos.com".into()));
                assert_eq!(*age_days, 40);
                assert_eq!(company.as_deref(), Some("Dragos"));
                assert_eq!(*prior_label, Label::HeadHunter);
            }
            other => panic!("expected existing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn domain_match_when_sender_differs() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let first = message("m1", "jane@dragos.com", base() - Duration::days(3));
        store.record_decision(&record(&first, Label::InterviewInvite, "Dragos")).await.unwrap();

        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let msg = message("m2", "sam@dragos.com", base());
        let result = engine.correlate(&msg, &BatchCache::new()).await.unwrap();
        assert_eq!(
            result.key(),
            Some(&CorrelationKey::SenderDomain("dragos.com".into()))
        );
    }

    #[tokio::test]
    async fn shared_domains_are_not_keys() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let engine = CorrelationEngine::new(&store, &patterns, 365);

        for sender in ["a@gmail.com", "a@greenhouse.io", "a@randstad.com"] {
            let keys = engine.keys(sender, sender.split('@').nth(1).unwrap());
            assert_eq!(keys, vec![CorrelationKey::Sender(sender.into())]);
        }
        assert!(engine.keys("", "").is_empty());
    }

    #[tokio::test]
    async fn prior_outside_window_is_new() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let first = message("m1", "jane@dragos.com", base() - Duration::days(400));
        store.record_decision(&record(&first, Label::HeadHunter, "Dragos")).await.unwrap();

        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let msg = message("m2", "jane@dragos.com", base());
        let result = engine.correlate(&msg, &BatchCache::new()).await.unwrap();
        assert!(!result.is_correlated());
    }

    #[tokio::test]
    async fn later_and_self_records_are_ignored() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let msg = message("m1", "jane@dragos.com", base());
        store.record_decision(&record(&msg, Label::HeadHunter, "Dragos")).await.unwrap();
        let later = message("m9", "jane@dragos.com", base() + Duration::days(1));
        store.record_decision(&record(&later, Label::Rejection, "Dragos")).await.unwrap();

        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let result = engine.correlate(&msg, &BatchCache::new()).await.unwrap();
        assert!(!result.is_correlated());
    }

    #[tokio::test]
    async fn batch_cache_is_consulted_first() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let mut cache = BatchCache::new();

        let first = message("m1", "jane@dragos.com", base());
        engine.remember(&mut cache, &record(&first, Label::HeadHunter, "Dragos"));
        assert_eq!(cache.len(), 2);

        let msg = message("m2", "jane@dragos.com", base() + Duration::hours(2));
        let result = engine.correlate(&msg, &cache).await.unwrap();
        assert_eq!(result.prior.unwrap().message_id, "m1");
    }

    #[tokio::test]
    async fn newer_stored_prior_beats_cached_one() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let engine = CorrelationEngine::new(&store, &patterns, 365);

        let x1 = message("x1", "jane@dragos.com", base());
        let x3 = message("x3", "jane@dragos.com", base() + Duration::days(10));
        store.record_decision(&record(&x1, Label::HeadHunter, "Dragos")).await.unwrap();
        store.record_decision(&record(&x3, Label::InterviewInvite, "Dragos")).await.unwrap();

        let mut cache = BatchCache::new();
        let x2 = message("x2", "jane@dragos.com", base() + Duration::days(5));
        engine.remember(&mut cache, &record(&x2, Label::HeadHunter, "Dragos"));

        let x4 = message("x4", "jane@dragos.com", base() + Duration::days(12));
        let result = engine.correlate(&x4, &cache).await.unwrap();
        match &result.decision {
            CorrelationDecision::Existing { prior_message_id, age_days, .. } => {
                assert_eq!(prior_message_id, "x3");
                assert_eq!(*age_days, 2);
            }
            other => panic!("expected existing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_instant_orders_by_message_id() {
        let store = MemoryStore::new();
        let patterns = patterns();
        let a = message("a", "jane@dragos.com", base());
        let b = message("b", "jane@dragos.com", base());
        store.record_decision(&record(&a, Label::HeadHunter, "Dragos")).await.unwrap();
        store.record_decision(&record(&b, Label::HeadHunter, "Dragos")).await.unwrap();

        let engine = CorrelationEngine::new(&store, &patterns, 365);
        let first = engine.correlate(&a, &BatchCache::new()).await.unwrap();
        assert!(!first.is_correlated());
        let second = engine.correlate(&b, &BatchCache::new()).await.unwrap();
        assert_eq!(second.prior.unwrap().message_id, "a");
    }
}
