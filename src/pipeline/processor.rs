//! Ingestion pipeline — turns provider messages into decision records.
//!
//! **Core invariant: one decision per message.** A message that fails at any
//! stage is reported in [`BatchOutcome::failures`] and the batch continues.
//!
//! Flow per message:
//! 1. Extract the canonical [`RawMessage`]
//! 2. Correlate against prior conversations (before ignore rules run)
//! 3. Rules and the statistical model, merged
//! 4. Provisional company, then classification overrides
//! 5. Final company (alias-resolved, persisted) and status dates
//! 6. Store the record and remember it for the rest of the batch

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::alias::resolve_alias;
use crate::pipeline::classifier::{MessageClassifier, OverrideContext, StatisticalClassifier};
use crate::pipeline::company::{CompanyResolver, ResolvedCompany};
use crate::pipeline::correlation::{BatchCache, Correlation, CorrelationEngine};
use crate::pipeline::dates::StatusDateExtractor;
use crate::pipeline::extract::{ProviderMessage, extract};
use crate::pipeline::patterns::{PatternHandle, PatternStore};
use crate::pipeline::rules::RuleEngine;
use crate::pipeline::types::{
    BatchOutcome, CompanyResolution, DecisionRecord, DecisionTrace, Label, MessageFailure,
    RawMessage,
};
use crate::store::traits::Database;

/// Pipeline stage names used in failure reports.
const STAGE_EXTRACT: &str = "extract";
const STAGE_CORRELATE: &str = "correlate";
const STAGE_COMPANY: &str = "company";
const STAGE_STORE: &str = "store";

struct StageFailure {
    stage: &'static str,
    error: PipelineError,
}

impl StageFailure {
    fn new(stage: &'static str, error: impl Into<PipelineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

/// Per-run state shared by every message of a batch.
struct Run<'a> {
    patterns: &'a PatternStore,
    rules: RuleEngine<'a>,
    correlation: CorrelationEngine<'a>,
    cache: BatchCache,
}

/// The orchestrator. Collaborators are injected; nothing here does network I/O.
pub struct IngestionPipeline {
    store: Arc<dyn Database>,
    patterns: Arc<PatternHandle>,
    classifier: MessageClassifier,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Database>,
        patterns: Arc<PatternHandle>,
        model: Arc<dyn StatisticalClassifier>,
        config: PipelineConfig,
    ) -> Self {
        let classifier = MessageClassifier::new(model, config.min_model_confidence);
        Self {
            store,
            patterns,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process a single message as a batch of one.
    pub async fn process(&self, message: ProviderMessage) -> Result<DecisionRecord, PipelineError> {
        let raw = extract(&message)?;
        let patterns = self.patterns.snapshot();
        let mut run = self.start_run(&patterns);
        self.decide(&raw, &mut run).await.map_err(|f| f.error)
    }

    /// Process a batch in arrival order.
    ///
    /// Messages are extracted first and then sorted by `received_at`, so a
    /// follow-up in the same batch always sees its predecessor. The pattern
    /// snapshot is taken once; a concurrent reload affects the next batch.
    pub async fn process_batch(&self, messages: Vec<ProviderMessage>) -> BatchOutcome {
        let count = messages.len();
        info!(count, "Processing message batch");

        let mut outcome = BatchOutcome::default();
        let mut extracted = Vec::with_capacity(count);
        for message in &messages {
            match extract(message) {
                Ok(raw) => extracted.push(raw),
                Err(e) => {
                    error!(id = %message.id_hint(), error = %e, "Failed to extract message");
                    outcome.failures.push(MessageFailure {
                        message_id: message.id_hint().to_string(),
                        stage: STAGE_EXTRACT.into(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        extracted.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let patterns = self.patterns.snapshot();
        let mut run = self.start_run(&patterns);

        for raw in &extracted {
            match self.decide(raw, &mut run).await {
                Ok(record) => {
                    outcome.counters.processed += 1;
                    if record.classification.label == Label::Noise {
                        outcome.counters.ignored += 1;
                    }
                    if record.company.is_resolved() {
                        outcome.counters.company_found += 1;
                    }
                    outcome.decisions.push(record);
                }
                Err(failure) => {
                    error!(
                        id = %raw.id,
                        stage = failure.stage,
                        error = %failure.error,
                        "Failed to process message in batch"
                    );
                    outcome.failures.push(MessageFailure {
                        message_id: raw.id.clone(),
                        stage: failure.stage.into(),
                        reason: failure.error.to_string(),
                    });
                }
            }
        }
        outcome.counters.failed = outcome.failures.len() as u64;

        info!(
            processed = outcome.counters.processed,
            ignored = outcome.counters.ignored,
            company_found = outcome.counters.company_found,
            failed = outcome.counters.failed,
            total = count,
            "Batch processing complete"
        );
        outcome
    }

    fn start_run<'a>(&'a self, patterns: &'a PatternStore) -> Run<'a> {
        Run {
            patterns,
            rules: RuleEngine::new(patterns),
            correlation: CorrelationEngine::new(
                self.store.as_ref(),
                patterns,
                self.config.correlation_window_days,
            ),
            cache: BatchCache::new(),
        }
    }

    async fn decide(&self, raw: &RawMessage, run: &mut Run<'_>) -> Result<DecisionRecord, StageFailure> {
        debug!(
            id = %raw.id,
            sender = %raw.sender,
            subject = %raw.subject,
            "Processing message"
        );

        let correlation = run
            .correlation
            .correlate(raw, &run.cache)
            .await
            .map_err(|e| StageFailure::new(STAGE_CORRELATE, e))?;

        let rules = run.rules.evaluate(raw, correlation.is_correlated());
        let signal = self.classifier.predict(raw).await;
        let mut classification = MessageClassifier::merge(rules.label.as_ref(), &signal);

        let provisional = CompanyResolver::new(
            run.patterns,
            self.classifier.model().as_ref(),
            self.config.company_confidence_floor,
        )
        .resolve(raw, rules.company.as_ref())
        .await;

        self.classifier.apply_overrides(
            &mut classification,
            &OverrideContext {
                message: raw,
                patterns: run.patterns,
                provisional: &provisional.resolution,
                correlation: &correlation.decision,
                min_model_confidence: self.classifier.min_model_confidence(),
            },
        );

        let company = self
            .final_company(raw, classification.label, &correlation, &provisional, run.patterns)
            .await
            .map_err(|e| StageFailure::new(STAGE_COMPANY, e))?;

        let dates = StatusDateExtractor::new(run.patterns).extract(classification.label, raw);

        let trace = self.config.debug.then(|| DecisionTrace {
            label_rule: rules.label.as_ref().map(|hit| hit.rule_id.clone()),
            company_rule: rules.company.as_ref().map(|hit| hit.rule_id.clone()),
            ignore_rules_skipped: rules.ignore_skipped,
            model_available: signal.available,
            model_label: signal.prediction.as_ref().map(|p| p.label),
            model_confidence: signal.confidence(),
            tiers: provisional.attempts.clone(),
            correlation_key: correlation.key().map(ToString::to_string),
        });
        if let Some(trace) = &trace {
            debug!(id = %raw.id, trace = ?trace, overrides = ?classification.overrides, "Decision trace");
        }

        let record = DecisionRecord {
            message_id: raw.id.clone(),
            thread_id: raw.thread_id.clone(),
            sender: raw.sender.clone(),
            sender_domain: raw.sender_domain.clone(),
            subject: raw.subject.clone(),
            received_at: raw.received_at,
            classification,
            company,
            dates,
            correlation: correlation.decision,
            trace,
        };

        self.store
            .record_decision(&record)
            .await
            .map_err(|e| StageFailure::new(STAGE_STORE, e))?;
        run.correlation.remember(&mut run.cache, &record);

        info!(
            id = %record.message_id,
            label = %record.classification.label,
            source = %record.classification.source,
            company = %record.company.canonical,
            "Message classified"
        );
        Ok(record)
    }

    /// Company written to the record. Noise abstains; correlated messages
    /// inherit the prior company when it has one.
    async fn final_company(
        &self,
        raw: &RawMessage,
        label: Label,
        correlation: &Correlation,
        provisional: &ResolvedCompany,
        patterns: &PatternStore,
    ) -> Result<CompanyResolution, PipelineError> {
        if label == Label::Noise {
            return Ok(CompanyResolution::abstain());
        }

        let inherited = correlation.prior.as_ref().and_then(|prior| {
            let name = prior.company.as_deref()?;
            let canonical = resolve_alias(name, &patterns.aliases)?;
            Some((prior, canonical))
        });

        let (resolution, canonical) = match inherited {
            Some((prior, canonical)) => (
                CompanyResolution {
                    raw_name: prior.company.clone().unwrap_or_default(),
                    canonical: canonical.as_str().to_string(),
                    tier: prior.company_tier,
                    confidence: prior.company_confidence,
                    inherited: true,
                    ats_fallback: None,
                },
                Some(canonical),
            ),
            None => (provisional.resolution.clone(), provisional.canonical.clone()),
        };

        if let Some(name) = &canonical {
            let (company, created) = self.store.find_or_create_company(name).await?;
            if created {
                info!(id = %raw.id, company = %company.name, company_id = %company.id, "New company");
            }
        }
        Ok(resolution)
    }
}
